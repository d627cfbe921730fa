//! Error taxonomy for the loading pipeline.
//!
//! Only configuration and store-initialization failures are surfaced to the
//! caller as hard errors. Everything that can go wrong while serving a single
//! request is contained inside the load task and ends as an absent-bitmap
//! delivery.

use std::path::PathBuf;

/// Result alias for configuration and initialization.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result alias for disk store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result alias for stream source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Fatal errors raised while configuring or initializing the loader.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The cache directory was not provided.
    #[error("cache directory must not be empty")]
    MissingCacheDir,
    /// A timeout was configured as zero.
    #[error("{name} timeout must be non-zero")]
    ZeroTimeout {
        /// Which timeout was invalid ("connect" or "read").
        name: &'static str,
    },
    /// A worker lane was configured with zero workers.
    #[error("lane worker count must be at least 1")]
    ZeroWorkers,
    /// The backing directory for the disk store could not be initialized.
    /// Without a disk store the loading subsystem must not be usable.
    #[error("failed to initialize disk store at {path}: {source}")]
    StoreInit {
        /// The directory that could not be initialized.
        path: PathBuf,
        /// The underlying store error.
        source: StoreError,
    },
    /// The HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Errors raised by the stream source when resolving a locator.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The locator's scheme is not one of http, https or file. This is a
    /// programming or configuration error for the request, never transient.
    #[error("unsupported scheme in locator: {0}")]
    UnsupportedScheme(String),
    /// The server answered with a non-2xx status.
    #[error("http status {status} for {locator}")]
    HttpStatus {
        /// The response status code.
        status: u16,
        /// The locator that was requested.
        locator: String,
    },
    /// Connect, read or body error from the HTTP client.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// Local file I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the disk store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An operation was attempted after `close()`.
    #[error("disk store is closed")]
    Closed,
    /// File I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Re-encoding a bitmap for the cache failed.
    #[error("encode error: {0}")]
    Encode(#[from] image::ImageError),
}

/// Errors raised by the engine facade lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// `load` was called before `init`.
    #[error("image loader is not initialized")]
    NotInitialized,
    /// `load` was called after `shutdown`.
    #[error("image loader has been shut down")]
    ShutDown,
}
