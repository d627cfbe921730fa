//! Request model and delivery types.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::DynamicImage;

use crate::key::CacheKey;
use crate::size::{ImageSize, ScaleMode};

/// Identifier correlating a `load` call with its delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The surface a bitmap is loaded for.
///
/// Implemented by the excluded UI-binding layer; the pipeline only reads the
/// current pixel size and scale mode at submit time and hands the target back
/// in the delivered [`ImageEvent`].
pub trait DisplayTarget: Send + Sync {
    /// Current size in pixels. `None`, or a size with a zero dimension,
    /// makes the pipeline fall back to the configured maximum decode size.
    fn size(&self) -> Option<ImageSize>;

    /// How the bitmap should be fitted to this target.
    fn scale_mode(&self) -> ScaleMode {
        ScaleMode::Contain
    }
}

/// Provenance of a delivered bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedFrom {
    /// Fetched over the network for this request.
    Network,
    /// Served from the disk store.
    DiskCache,
}

impl std::fmt::Display for LoadedFrom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => f.write_str("network"),
            Self::DiskCache => f.write_str("disk"),
        }
    }
}

/// One load request, immutable for its lifetime.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Correlation id handed back in the delivered event.
    pub id: RequestId,
    /// The resource locator as submitted.
    pub locator: String,
    /// Locator-only disk store key.
    pub cache_key: CacheKey,
    /// Resolved target size (display size or fallback).
    pub target_size: ImageSize,
    /// Resolved scale mode.
    pub scale_mode: ScaleMode,
}

impl LoadRequest {
    /// Key used to coalesce identical in-flight work. Unlike the disk key it
    /// includes the target size and mode, since those shape the result.
    #[must_use]
    pub fn correlation_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.cache_key, self.target_size, self.scale_mode
        )
    }
}

/// Delivered once per `load` call, even on total failure, so the consumer
/// can always render a placeholder or no-op.
pub struct ImageEvent {
    /// The id returned by the originating `load` call.
    pub request_id: RequestId,
    /// The locator that was requested.
    pub locator: String,
    /// The target the request was issued for.
    pub target: Arc<dyn DisplayTarget>,
    /// The decoded bitmap, or `None` when no image could be produced.
    pub bitmap: Option<Arc<DynamicImage>>,
    /// Where the bitmap came from (best-effort on failure).
    pub loaded_from: LoadedFrom,
}

impl std::fmt::Debug for ImageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageEvent")
            .field("request_id", &self.request_id)
            .field("locator", &self.locator)
            .field("bitmap", &self.bitmap.as_ref().map(|b| (b.width(), b.height())))
            .field("loaded_from", &self.loaded_from)
            .finish_non_exhaustive()
    }
}
