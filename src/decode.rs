//! Decode pipeline: byte stream in, correctly-sized bitmap out.
//!
//! The pipeline buffers the stream, runs a bounds-only metadata pass, computes
//! an integer downsample factor from the target size, decodes under a global
//! raster-dimension ceiling and finally fits the raster to the target. Failure
//! at any step yields `None`, never an error value; callers treat absence as
//! "could not produce an image".

use std::io::Cursor;
use std::sync::Arc;

use image::DynamicImage;
use tracing::{debug, trace, warn};

use crate::size::{ImageSize, ScaleMode, clamp_to_max_dimension, sample_size};
use crate::source::StreamSource;

/// Immutable parameters for one decode call.
#[derive(Debug, Clone)]
pub struct DecodeSpec {
    /// Locator to read pixels from (network or `file://`).
    pub locator: String,
    /// Requested output size.
    pub target: ImageSize,
    /// How the raster is fitted to the target.
    pub mode: ScaleMode,
    /// Ceiling on either dimension of the decoded raster.
    pub max_raster_dimension: u32,
}

/// Decodes locators into bitmaps at bounded sizes.
#[derive(Debug, Clone)]
pub struct Decoder {
    source: StreamSource,
}

impl Decoder {
    /// Creates a decoder reading through `source`.
    #[must_use]
    pub fn new(source: StreamSource) -> Self {
        Self { source }
    }

    /// Produces a bitmap for `spec`, or `None` if the stream cannot be
    /// opened or no raster can be decoded.
    pub async fn decode(&self, spec: &DecodeSpec) -> Option<Arc<DynamicImage>> {
        let stream = match self.source.open(&spec.locator).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(locator = %spec.locator, error = %e, "no stream for decode");
                return None;
            }
        };
        // Buffering gives the pixel pass a rewindable view of the same bytes
        // the bounds pass saw, instead of a second fetch.
        let bytes = match stream.read_to_end().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(locator = %spec.locator, error = %e, "stream failed during decode");
                return None;
            }
        };

        let target = spec.target;
        let mode = spec.mode;
        let max_dimension = spec.max_raster_dimension;
        let locator = spec.locator.clone();

        let joined = tokio::task::spawn_blocking(move || {
            decode_buffer(&bytes, target, mode, max_dimension)
        })
        .await;

        match joined {
            Ok(Some(bitmap)) => {
                trace!(locator = %locator, size = %ImageSize::new(bitmap.width(), bitmap.height()), "decoded");
                Some(Arc::new(bitmap))
            }
            Ok(None) => {
                debug!(locator = %locator, "no raster decoded");
                None
            }
            Err(e) => {
                warn!(locator = %locator, error = %e, "decode task panicked");
                None
            }
        }
    }
}

/// The CPU-bound portion of the pipeline.
fn decode_buffer(
    bytes: &[u8],
    target: ImageSize,
    mode: ScaleMode,
    max_dimension: u32,
) -> Option<DynamicImage> {
    // Bounds-only pass: header metadata, no pixel allocation.
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let (src_width, src_height) = reader.into_dimensions().ok()?;
    let src = ImageSize::new(src_width, src_height);

    let scale = sample_size(src, target, mode);
    let scale = clamp_to_max_dimension(scale, src, max_dimension);

    // Rewind over the buffered bytes for the pixel pass.
    let decoded = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .decode()
        .ok()?;

    let subsampled = if scale > 1 {
        decoded.thumbnail(
            (src.width / scale).max(1),
            (src.height / scale).max(1),
        )
    } else {
        decoded
    };

    Some(fit_to_target(subsampled, target, mode))
}

/// Fits the decoded raster to exactly the requested target. May discard
/// pixels (crop) but never upscales beyond the decoded resolution.
fn fit_to_target(bitmap: DynamicImage, target: ImageSize, mode: ScaleMode) -> DynamicImage {
    let width = bitmap.width();
    let height = bitmap.height();
    match mode {
        ScaleMode::Crop => {
            let crop_width = target.width.min(width).max(1);
            let crop_height = target.height.min(height).max(1);
            if crop_width == width && crop_height == height {
                bitmap
            } else {
                let x = (width - crop_width) / 2;
                let y = (height - crop_height) / 2;
                bitmap.crop_imm(x, y, crop_width, crop_height)
            }
        }
        ScaleMode::Contain => {
            if width > target.width || height > target.height {
                bitmap.thumbnail(target.width.max(1), target.height.max(1))
            } else {
                bitmap
            }
        }
    }
}
