//! Image dimensions and downsample math.

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl ImageSize {
    /// Creates a size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if either dimension is zero.
    #[must_use]
    pub const fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// How a decoded bitmap is fitted to the display target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
    /// Keep full resolution during decode, center-crop to the target.
    Crop,
    /// Downsample so the result fits within the target.
    #[default]
    Contain,
}

impl std::fmt::Display for ScaleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crop => f.write_str("crop"),
            Self::Contain => f.write_str("contain"),
        }
    }
}

/// Fallback ceiling for a single raster dimension. Decoding is never allowed
/// to allocate a raster wider or taller than this, whatever the source claims.
pub const DEFAULT_MAX_RASTER_DIMENSION: u32 = 2048;

/// Computes the integer downsample factor applied while decoding.
///
/// In [`ScaleMode::Crop`] the factor is always 1; cropping happens after the
/// full-resolution decode. In [`ScaleMode::Contain`] the factor is the larger
/// of the rounded width and height ratios, clamped to a minimum of 1.
#[must_use]
pub fn sample_size(src: ImageSize, target: ImageSize, mode: ScaleMode) -> u32 {
    match mode {
        ScaleMode::Crop => 1,
        ScaleMode::Contain => {
            if target.is_degenerate() {
                return 1;
            }
            if src.width > target.width || src.height > target.height {
                let width_ratio = (src.width as f32 / target.width as f32).round() as u32;
                let height_ratio = (src.height as f32 / target.height as f32).round() as u32;
                width_ratio.max(height_ratio).max(1)
            } else {
                1
            }
        }
    }
}

/// Raises `scale` until `src / scale` fits within `max_dimension` on both
/// axes. Guards decodes of pathological inputs against allocation failure.
#[must_use]
pub fn clamp_to_max_dimension(scale: u32, src: ImageSize, max_dimension: u32) -> u32 {
    let max_dimension = max_dimension.max(1);
    let needed = src
        .width
        .div_ceil(max_dimension)
        .max(src.height.div_ceil(max_dimension));
    scale.max(needed).max(1)
}
