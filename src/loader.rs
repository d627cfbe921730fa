//! Loader facade and process-wide lifecycle.
//!
//! [`ImageLoader`] is the instance API: build one with a validated
//! [`LoaderConfig`] and a delivery channel, call [`ImageLoader::load`] per
//! request. The free functions [`init`], [`global`], [`load`] and
//! [`shutdown`] manage one process-wide loader behind an explicit
//! init/teardown barrier for callers that want the configured pipeline to be
//! reachable from anywhere.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;
use crate::decode::Decoder;
use crate::engine::DispatchEngine;
use crate::error::{ConfigError, ConfigResult, EngineError, StoreResult};
use crate::key::CacheKey;
use crate::request::{DisplayTarget, ImageEvent, LoadRequest, RequestId};
use crate::source::StreamSource;
use crate::store::DiskStore;
use crate::task::PipelineContext;

/// The configured loading pipeline.
pub struct ImageLoader {
    engine: DispatchEngine,
    ctx: Arc<PipelineContext>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("config", &self.ctx.config)
            .finish_non_exhaustive()
    }
}

impl ImageLoader {
    /// Builds a loader. Delivered [`ImageEvent`]s arrive on `events`; the
    /// receiving side is the caller's designated delivery context.
    ///
    /// # Errors
    /// Returns [`ConfigError`] for an invalid configuration, an HTTP client
    /// that cannot be built, or a cache directory that cannot be
    /// initialized. The last is fatal: without a disk store the subsystem
    /// is not usable.
    pub async fn new(
        config: LoaderConfig,
        events: mpsc::UnboundedSender<ImageEvent>,
    ) -> ConfigResult<Self> {
        config.validate()?;

        let store = DiskStore::open(
            config.cache_dir.clone(),
            config.max_cache_bytes,
            config.max_cache_entries,
        )
        .await
        .map_err(|source| ConfigError::StoreInit {
            path: config.cache_dir.clone(),
            source,
        })?;

        let source = StreamSource::new(config.connect_timeout, config.read_timeout)?;
        let ctx = Arc::new(PipelineContext {
            store: Arc::new(store),
            decoder: Decoder::new(source.clone()),
            source,
            config: Arc::new(config),
            stop: Arc::new(AtomicBool::new(false)),
        });
        let engine = DispatchEngine::new(Arc::clone(&ctx), events);

        info!(cache_dir = %ctx.config.cache_dir.display(), "image loader ready");
        Ok(Self {
            engine,
            ctx,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Enqueues a load for `locator` on behalf of `target` and returns
    /// immediately. The result, possibly an absent bitmap, is delivered
    /// exactly once on the event channel, tagged with the returned id.
    ///
    /// The target's current size decides the decode size; zero or unknown
    /// dimensions fall back to the configured maximum decode size.
    ///
    /// # Errors
    /// Returns [`EngineError::ShutDown`] after [`ImageLoader::shutdown`].
    pub fn load(
        &self,
        locator: impl Into<String>,
        target: Arc<dyn DisplayTarget>,
    ) -> Result<RequestId, EngineError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }
        let locator = locator.into();
        let target_size = target
            .size()
            .filter(|size| !size.is_degenerate())
            .unwrap_or(self.ctx.config.max_decode_size);

        let request = LoadRequest {
            id: RequestId::next(),
            cache_key: CacheKey::from_locator(&locator),
            target_size,
            scale_mode: target.scale_mode(),
            locator,
        };
        let id = request.id;
        debug!(id = %id, locator = %request.locator, size = %target_size, "submitting load");
        self.engine.submit(request, target);
        Ok(id)
    }

    /// Deletes every disk store entry, keeping the store usable.
    ///
    /// # Errors
    /// Propagates store errors; in-flight loads may observe misses afterward.
    pub async fn clear_disk_cache(&self) -> StoreResult<()> {
        self.ctx.store.clear().await
    }

    /// Closes the disk store and stops accepting loads. In-flight copies are
    /// aborted best-effort. Subsequent `load` calls fail fast.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.engine.shutdown();
        info!("image loader shut down");
    }
}

static GLOBAL: RwLock<Option<Arc<ImageLoader>>> = RwLock::new(None);

/// Initializes the process-wide loader.
///
/// Safe to call from any thread; exactly one initialization wins. A repeat
/// call warns and returns the existing instance unchanged.
///
/// # Errors
/// Propagates [`ImageLoader::new`] errors. A failed `init` leaves the
/// process-wide loader absent, so [`load`] keeps failing fast.
pub async fn init(
    config: LoaderConfig,
    events: mpsc::UnboundedSender<ImageEvent>,
) -> ConfigResult<Arc<ImageLoader>> {
    if let Some(existing) = GLOBAL.read().clone() {
        warn!("image loader already initialized, ignoring repeat init");
        return Ok(existing);
    }

    let loader = Arc::new(ImageLoader::new(config, events).await?);

    let mut slot = GLOBAL.write();
    if let Some(existing) = slot.clone() {
        // Lost the race to a concurrent init; the newcomer is discarded.
        warn!("image loader already initialized, ignoring repeat init");
        loader.shutdown();
        return Ok(existing);
    }
    *slot = Some(Arc::clone(&loader));
    Ok(loader)
}

/// Returns the process-wide loader.
///
/// # Errors
/// Returns [`EngineError::NotInitialized`] before [`init`] or after
/// [`shutdown`].
pub fn global() -> Result<Arc<ImageLoader>, EngineError> {
    GLOBAL.read().clone().ok_or(EngineError::NotInitialized)
}

/// Enqueues a load on the process-wide loader. See [`ImageLoader::load`].
///
/// # Errors
/// Fails fast when the loader is absent or shut down.
pub fn load(
    locator: impl Into<String>,
    target: Arc<dyn DisplayTarget>,
) -> Result<RequestId, EngineError> {
    global()?.load(locator, target)
}

/// Shuts down and removes the process-wide loader, if any.
pub fn shutdown() {
    if let Some(loader) = GLOBAL.write().take() {
        loader.shutdown();
    }
}
