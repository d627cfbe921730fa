//! pixload - an async image loading and disk caching pipeline.
//!
//! Loads remotely- or locally-addressed images, decodes them to bounded-size
//! bitmaps and persists a disk-backed copy so repeat requests for the same
//! locator are served from local storage instead of the network.
//!
//! The pipeline routes each request over one of three lanes: an unbounded
//! distributor that probes the disk store, plus bounded cache-hit and
//! network worker lanes. Results are delivered exactly once per request on a
//! caller-owned channel, with an absent bitmap on failure so the consumer
//! can always render a placeholder.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Loader configuration and defaults.
pub mod config;
/// Decode pipeline: bounds pass, downsampling, final fit.
pub mod decode;
/// Error taxonomy.
pub mod error;
/// Cache key generation.
pub mod key;
/// Loader facade and process-wide lifecycle.
pub mod loader;
/// Request model and delivery types.
pub mod request;
/// Image dimensions and downsample math.
pub mod size;
/// Locator resolution into byte streams.
pub mod source;
/// Bounded LRU disk store.
pub mod store;

mod engine;
mod task;

pub use config::LoaderConfig;
pub use decode::{DecodeSpec, Decoder};
pub use error::{ConfigError, EngineError, SourceError, StoreError};
pub use key::CacheKey;
pub use loader::ImageLoader;
pub use request::{DisplayTarget, ImageEvent, LoadedFrom, RequestId};
pub use size::{ImageSize, ScaleMode};
pub use source::{ImageStream, Scheme, StreamSource};
pub use store::{CacheEntry, DiskStore};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
