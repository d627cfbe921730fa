//! Loader configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::size::{DEFAULT_MAX_RASTER_DIMENSION, ImageSize};

/// Default cap on total cached bytes (100 MB).
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 100 * 1024 * 1024;

/// Default cap on the number of cached entries.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 200;

/// Default connect timeout for network locators.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default read timeout for network locators.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Default number of workers per bounded lane.
pub const DEFAULT_LANE_WORKERS: usize = 3;

/// Default maximum dimensions a blob is re-encoded to after a network commit.
pub const DEFAULT_CACHE_IMAGE_SIZE: ImageSize = ImageSize::new(480, 800);

/// Immutable configuration for the loading pipeline.
///
/// Built once, validated by [`LoaderConfig::validate`], and shared read-only
/// across all lanes afterwards.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Directory backing the disk store.
    pub cache_dir: PathBuf,
    /// Cap on total cached bytes; 0 means unbounded.
    pub max_cache_bytes: u64,
    /// Cap on cached entry count; 0 means unbounded.
    pub max_cache_entries: usize,
    /// Connect timeout for network locators.
    pub connect_timeout: Duration,
    /// Read timeout for network locators.
    pub read_timeout: Duration,
    /// Whether fetched blobs are persisted to the disk store.
    pub cache_on_disk: bool,
    /// When set, a freshly committed blob is re-decoded at these dimensions
    /// and re-encoded in place, trading one decode for disk footprint.
    pub max_cache_image_size: Option<ImageSize>,
    /// Decode size used when a display target reports zero or unknown size.
    pub max_decode_size: ImageSize,
    /// Ceiling on either dimension of any decoded raster.
    pub max_raster_dimension: u32,
    /// Workers in the cache-hit lane.
    pub cache_lane_workers: usize,
    /// Workers in the network lane.
    pub network_lane_workers: usize,
}

impl LoaderConfig {
    /// Creates a configuration with the defaults the original ships with.
    #[must_use]
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            cache_on_disk: true,
            max_cache_image_size: Some(DEFAULT_CACHE_IMAGE_SIZE),
            max_decode_size: DEFAULT_CACHE_IMAGE_SIZE,
            max_raster_dimension: DEFAULT_MAX_RASTER_DIMENSION,
            cache_lane_workers: DEFAULT_LANE_WORKERS,
            network_lane_workers: DEFAULT_LANE_WORKERS,
        }
    }

    /// Sets the cache bounds. Zero means unbounded for either value.
    #[must_use]
    pub fn with_cache_bounds(mut self, max_bytes: u64, max_entries: usize) -> Self {
        self.max_cache_bytes = max_bytes;
        self.max_cache_entries = max_entries;
        self
    }

    /// Sets the network timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    /// Disables persisting fetched blobs to disk.
    #[must_use]
    pub fn without_disk_caching(mut self) -> Self {
        self.cache_on_disk = false;
        self
    }

    /// Sets or clears the cache-side re-encode dimensions.
    #[must_use]
    pub fn with_cache_image_size(mut self, size: Option<ImageSize>) -> Self {
        self.max_cache_image_size = size;
        self
    }

    /// Sets the fallback decode size for targets with unknown dimensions.
    #[must_use]
    pub fn with_max_decode_size(mut self, size: ImageSize) -> Self {
        self.max_decode_size = size;
        self
    }

    /// Sets the per-lane worker counts.
    #[must_use]
    pub fn with_lane_workers(mut self, cache: usize, network: usize) -> Self {
        self.cache_lane_workers = cache;
        self.network_lane_workers = network;
        self
    }

    /// Rejects configurations the pipeline cannot run with.
    ///
    /// # Errors
    /// Returns [`ConfigError`] for an empty cache directory, a zero timeout,
    /// or a zero-sized worker lane.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingCacheDir);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout { name: "connect" });
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout { name: "read" });
        }
        if self.cache_lane_workers == 0 || self.network_lane_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = LoaderConfig::new("/tmp/pixload-test");
        assert!(config.validate().is_ok());
        assert!(config.cache_on_disk);
        assert_eq!(config.max_cache_bytes, DEFAULT_MAX_CACHE_BYTES);
        assert_eq!(config.max_cache_entries, DEFAULT_MAX_CACHE_ENTRIES);
    }

    #[test]
    fn empty_cache_dir_rejected() {
        let config = LoaderConfig::new("");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCacheDir)
        ));
    }

    #[test]
    fn zero_timeout_rejected() {
        let config =
            LoaderConfig::new("/tmp/x").with_timeouts(Duration::ZERO, Duration::from_secs(1));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroTimeout { name: "connect" })
        ));
    }

    #[test]
    fn zero_workers_rejected() {
        let config = LoaderConfig::new("/tmp/x").with_lane_workers(0, 3);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWorkers)));
    }

    #[test]
    fn zero_bounds_allowed_as_unbounded() {
        let config = LoaderConfig::new("/tmp/x").with_cache_bounds(0, 0);
        assert!(config.validate().is_ok());
    }
}
