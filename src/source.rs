//! Stream source: resolves a locator to a length-aware byte stream.
//!
//! Locators are classified by scheme prefix. Network locators go through a
//! shared HTTP client with independent connect and read timeouts; file
//! locators open the local path directly. Each `open` produces an independent
//! stream, so the source is safe to use concurrently from every lane.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use crate::error::{ConfigResult, SourceError, SourceResult};

/// Chunk granularity for local file reads (32 KiB).
const FILE_CHUNK_SIZE: usize = 32 * 1024;

/// Supported locator schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `http://`
    Http,
    /// `https://`
    Https,
    /// `file://`
    File,
    /// Anything else; opening such a locator fails immediately.
    Unknown,
}

impl Scheme {
    /// Classifies a locator by prefix.
    #[must_use]
    pub fn of(locator: &str) -> Self {
        if locator.starts_with("https://") {
            Self::Https
        } else if locator.starts_with("http://") {
            Self::Http
        } else if locator.starts_with("file://") {
            Self::File
        } else {
            Self::Unknown
        }
    }

    /// Wraps an absolute path into a `file://` locator.
    #[must_use]
    pub fn wrap_file(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    /// Strips the `file://` prefix from a locator.
    #[must_use]
    pub fn crop_file(locator: &str) -> &str {
        locator.strip_prefix("file://").unwrap_or(locator)
    }
}

/// Resolves locators to readable streams.
#[derive(Debug, Clone)]
pub struct StreamSource {
    client: reqwest::Client,
}

impl StreamSource {
    /// Builds a source with the given network timeouts.
    ///
    /// # Errors
    /// Returns [`crate::error::ConfigError::HttpClient`] if the client cannot
    /// be constructed.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> ConfigResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Opens an independent byte stream for a locator.
    ///
    /// # Errors
    /// Returns [`SourceError::UnsupportedScheme`] for unknown schemes,
    /// [`SourceError::HttpStatus`] for non-2xx responses (the error body is
    /// drained and discarded first), and I/O or network errors otherwise.
    pub async fn open(&self, locator: &str) -> SourceResult<ImageStream> {
        match Scheme::of(locator) {
            Scheme::Http | Scheme::Https => self.open_network(locator).await,
            Scheme::File => Self::open_file(locator).await,
            Scheme::Unknown => Err(SourceError::UnsupportedScheme(locator.to_string())),
        }
    }

    async fn open_network(&self, locator: &str) -> SourceResult<ImageStream> {
        let mut response = self.client.get(locator).send().await?;
        let status = response.status();
        if !status.is_success() {
            // Drain the error body so the connection can be reused.
            while let Ok(Some(_)) = response.chunk().await {}
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                locator: locator.to_string(),
            });
        }
        let len = response.content_length();
        debug!(locator, len, "opened network stream");
        Ok(ImageStream {
            len,
            body: Body::Http(response),
        })
    }

    async fn open_file(locator: &str) -> SourceResult<ImageStream> {
        let path = PathBuf::from(Scheme::crop_file(locator));
        let file = tokio::fs::File::open(&path).await?;
        let len = file.metadata().await.map(|m| m.len()).ok();
        trace!(path = %path.display(), len, "opened file stream");
        Ok(ImageStream {
            len,
            body: Body::File(file),
        })
    }
}

/// A length-aware byte stream produced by [`StreamSource::open`].
pub struct ImageStream {
    len: Option<u64>,
    body: Body,
}

enum Body {
    Http(reqwest::Response),
    File(tokio::fs::File),
}

impl ImageStream {
    /// Total byte length, when known (content length or file size).
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    /// Reads the next chunk, or `None` at end of stream.
    ///
    /// # Errors
    /// Propagates network or file read errors.
    pub async fn chunk(&mut self) -> SourceResult<Option<Bytes>> {
        match &mut self.body {
            Body::Http(response) => Ok(response.chunk().await?),
            Body::File(file) => {
                let mut buf = vec![0u8; FILE_CHUNK_SIZE];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    Ok(None)
                } else {
                    buf.truncate(n);
                    Ok(Some(Bytes::from(buf)))
                }
            }
        }
    }

    /// Drains the stream into a single buffer.
    ///
    /// # Errors
    /// Propagates network or file read errors.
    pub async fn read_to_end(mut self) -> SourceResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len.unwrap_or(0).min(16 * 1024 * 1024) as usize);
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Overrides the reported length, leaving the actual bytes untouched.
    #[cfg(test)]
    pub(crate) fn with_reported_len(mut self, len: u64) -> Self {
        self.len = Some(len);
        self
    }
}

impl std::fmt::Debug for ImageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.body {
            Body::Http(_) => "http",
            Body::File(_) => "file",
        };
        f.debug_struct("ImageStream")
            .field("kind", &kind)
            .field("len", &self.len)
            .finish()
    }
}
