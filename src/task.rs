//! Per-request orchestration: disk lookup, optional fetch + persist +
//! cache-side resize, final decode.
//!
//! A task contains every per-request failure. Whatever goes wrong, `run`
//! returns, and the engine always completes the delivery step, with an
//! absent bitmap when no image could be produced.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::DynamicImage;
use tracing::{debug, warn};

use crate::config::LoaderConfig;
use crate::decode::{DecodeSpec, Decoder};
use crate::request::{LoadRequest, LoadedFrom};
use crate::size::{ImageSize, ScaleMode};
use crate::source::StreamSource;
use crate::store::DiskStore;

/// Shared read-only collaborators handed to every task.
pub(crate) struct PipelineContext {
    pub store: Arc<DiskStore>,
    pub source: StreamSource,
    pub decoder: Decoder,
    pub config: Arc<LoaderConfig>,
    /// Set on shutdown; aborts in-flight network-to-disk copies best-effort.
    pub stop: Arc<AtomicBool>,
}

/// The unit of work for one request.
pub(crate) struct LoadTask {
    ctx: Arc<PipelineContext>,
    request: LoadRequest,
}

impl LoadTask {
    pub(crate) fn new(ctx: Arc<PipelineContext>, request: LoadRequest) -> Self {
        Self { ctx, request }
    }

    /// Runs the task to completion and reports the bitmap plus provenance.
    pub(crate) async fn run(self) -> (Option<Arc<DynamicImage>>, LoadedFrom) {
        let request = &self.request;

        // CHECK_DISK: a present, non-empty, decodable blob short-circuits
        // the network entirely.
        if let Some(entry) = self.ctx.store.get(&request.cache_key)
            && entry.len > 0
        {
            debug!(key = %request.cache_key, path = %entry.path.display(), "cached blob found");
            if let Some(bitmap) = self
                .decode_at(entry.locator(), request.target_size, request.scale_mode)
                .await
            {
                return (Some(bitmap), LoadedFrom::DiskCache);
            }
            warn!(key = %request.cache_key, "cached blob undecodable, falling back to network");
        }

        // FETCH_NETWORK: persist first when caching is on, then decode from
        // the committed copy; otherwise decode straight off the source.
        let mut decode_locator = request.locator.clone();
        if self.ctx.config.cache_on_disk
            && self.fetch_and_persist().await
            && let Some(entry) = self.ctx.store.get(&request.cache_key)
        {
            decode_locator = entry.locator();
        }

        let bitmap = self
            .decode_at(decode_locator, request.target_size, request.scale_mode)
            .await;
        (bitmap, LoadedFrom::Network)
    }

    async fn decode_at(
        &self,
        locator: String,
        target: ImageSize,
        mode: ScaleMode,
    ) -> Option<Arc<DynamicImage>> {
        let spec = DecodeSpec {
            locator,
            target,
            mode,
            max_raster_dimension: self.ctx.config.max_raster_dimension,
        };
        self.ctx.decoder.decode(&spec).await
    }

    /// Streams the source into the store. On commit, optionally re-encodes
    /// the blob at the cache-side maximum dimensions. Returns whether a
    /// committed copy exists.
    async fn fetch_and_persist(&self) -> bool {
        let request = &self.request;
        let mut stream = match self.ctx.source.open(&request.locator).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(locator = %request.locator, error = %e, "fetch failed");
                return false;
            }
        };

        let stop = Arc::clone(&self.ctx.stop);
        let listener = move |_copied: u64, _total: Option<u64>| !stop.load(Ordering::Relaxed);
        let committed = match self
            .ctx
            .store
            .put(&request.cache_key, &mut stream, Some(&listener))
            .await
        {
            Ok(committed) => committed,
            Err(e) => {
                warn!(key = %request.cache_key, error = %e, "persist failed");
                false
            }
        };

        if committed && let Some(max) = self.ctx.config.max_cache_image_size {
            self.resize_for_cache(max).await;
        }
        committed
    }

    /// Decodes the just-committed blob at the cache's maximum dimensions and
    /// writes it back, trading one extra decode+encode for a smaller footprint.
    async fn resize_for_cache(&self, max: ImageSize) {
        let Some(entry) = self.ctx.store.get(&self.request.cache_key) else {
            return;
        };
        let Some(bitmap) = self.decode_at(entry.locator(), max, ScaleMode::Crop).await else {
            return;
        };
        if let Err(e) = self.ctx.store.put_bitmap(&self.request.cache_key, bitmap).await {
            warn!(key = %self.request.cache_key, error = %e, "cache-side resize failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CacheKey;
    use crate::request::RequestId;
    use crate::source::Scheme;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn context(dir: &TempDir, config: LoaderConfig) -> Arc<PipelineContext> {
        let store = Arc::new(
            DiskStore::open(
                dir.path().to_path_buf(),
                config.max_cache_bytes,
                config.max_cache_entries,
            )
            .await
            .expect("store"),
        );
        let source =
            StreamSource::new(Duration::from_secs(1), Duration::from_secs(1)).expect("client");
        Arc::new(PipelineContext {
            store,
            decoder: Decoder::new(source.clone()),
            source,
            config: Arc::new(config),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    fn request_for(locator: &str) -> LoadRequest {
        LoadRequest {
            id: RequestId::next(),
            locator: locator.to_string(),
            cache_key: CacheKey::from_locator(locator),
            target_size: ImageSize::new(100, 100),
            scale_mode: ScaleMode::Contain,
        }
    }

    fn write_png(width: u32, height: u32) -> tempfile::NamedTempFile {
        let tmp = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .expect("tempfile");
        image::DynamicImage::new_rgb8(width, height)
            .save_with_format(tmp.path(), image::ImageFormat::Png)
            .expect("save");
        tmp
    }

    #[tokio::test]
    async fn cold_load_persists_and_reports_network() {
        let cache = TempDir::new().unwrap();
        let ctx = context(&cache, LoaderConfig::new(cache.path())).await;
        let png = write_png(64, 48);
        let request = request_for(&Scheme::wrap_file(png.path()));
        let key = request.cache_key.clone();

        let (bitmap, from) = LoadTask::new(Arc::clone(&ctx), request).run().await;

        assert!(bitmap.is_some());
        assert_eq!(from, LoadedFrom::Network);
        assert!(ctx.store.get(&key).is_some());
    }

    #[tokio::test]
    async fn warm_load_reports_disk_cache() {
        let cache = TempDir::new().unwrap();
        let ctx = context(&cache, LoaderConfig::new(cache.path())).await;
        let png = write_png(64, 48);
        let locator = Scheme::wrap_file(png.path());

        let (_, first) = LoadTask::new(Arc::clone(&ctx), request_for(&locator))
            .run()
            .await;
        assert_eq!(first, LoadedFrom::Network);

        // Source gone; only the cached copy can serve this.
        drop(png);
        let (bitmap, second) = LoadTask::new(Arc::clone(&ctx), request_for(&locator))
            .run()
            .await;
        assert!(bitmap.is_some());
        assert_eq!(second, LoadedFrom::DiskCache);
    }

    #[tokio::test]
    async fn unsupported_scheme_yields_absent() {
        let cache = TempDir::new().unwrap();
        let ctx = context(&cache, LoaderConfig::new(cache.path())).await;
        let request = request_for("ftp://x/y.jpg");
        let key = request.cache_key.clone();

        let (bitmap, from) = LoadTask::new(Arc::clone(&ctx), request).run().await;

        assert!(bitmap.is_none());
        assert_eq!(from, LoadedFrom::Network);
        assert!(ctx.store.get(&key).is_none());
    }

    #[tokio::test]
    async fn undecodable_cached_blob_falls_back_to_source() {
        let cache = TempDir::new().unwrap();
        let ctx = context(&cache, LoaderConfig::new(cache.path())).await;
        let png = write_png(64, 48);
        let locator = Scheme::wrap_file(png.path());
        let request = request_for(&locator);

        // Poison the cache entry for this locator.
        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut garbage, b"not pixels").unwrap();
        let mut stream = ctx
            .source
            .open(&Scheme::wrap_file(garbage.path()))
            .await
            .unwrap();
        assert!(ctx.store.put(&request.cache_key, &mut stream, None).await.unwrap());

        let (bitmap, from) = LoadTask::new(Arc::clone(&ctx), request).run().await;
        assert!(bitmap.is_some());
        assert_eq!(from, LoadedFrom::Network);
    }

    #[tokio::test]
    async fn committed_blob_is_resized_for_cache() {
        let cache = TempDir::new().unwrap();
        let config = LoaderConfig::new(cache.path())
            .with_cache_image_size(Some(ImageSize::new(8, 8)));
        let ctx = context(&cache, config).await;
        let png = write_png(64, 48);
        let request = request_for(&Scheme::wrap_file(png.path()));
        let key = request.cache_key.clone();

        let _ = LoadTask::new(Arc::clone(&ctx), request).run().await;

        let entry = ctx.store.get(&key).expect("committed");
        let stored = image::ImageReader::open(&entry.path)
            .expect("open stored blob")
            .with_guessed_format()
            .expect("guess format")
            .decode()
            .expect("decode stored blob");
        assert!(stored.width() <= 8);
        assert!(stored.height() <= 8);
    }

    #[tokio::test]
    async fn caching_disabled_decodes_straight_from_source() {
        let cache = TempDir::new().unwrap();
        let config = LoaderConfig::new(cache.path()).without_disk_caching();
        let ctx = context(&cache, config).await;
        let png = write_png(64, 48);
        let request = request_for(&Scheme::wrap_file(png.path()));
        let key = request.cache_key.clone();

        let (bitmap, from) = LoadTask::new(Arc::clone(&ctx), request).run().await;

        assert!(bitmap.is_some());
        assert_eq!(from, LoadedFrom::Network);
        assert!(ctx.store.get(&key).is_none());
    }
}
