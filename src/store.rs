//! Capacity-bounded persistent key→blob store with LRU eviction.
//!
//! Entries are committed atomically: bytes are streamed into a staging file
//! inside the cache directory and renamed over the final path only on full
//! success, so a concurrent reader observes either the previous committed
//! blob or the new one, never a partial write.
//!
//! Recency is tracked by an in-memory index rebuilt from the directory scan
//! at open time (file mtime as the initial order) and kept in sync on every
//! get and put. Eviction runs synchronously inside the write path and never
//! evicts the entry being written.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, trace, warn};

use crate::error::{StoreError, StoreResult};
use crate::key::CacheKey;
use crate::source::{ImageStream, Scheme};

/// Extension of committed entries.
const ENTRY_EXT: &str = "img";

/// Extension of staging files; stray ones are swept at open.
const STAGING_EXT: &str = "tmp";

/// Per-chunk progress probe used during `put`. Receives bytes copied so far
/// and the total when known; returning `false` aborts the copy and the
/// pending write. Honored between chunks, best-effort.
pub type CopyListener = dyn Fn(u64, Option<u64>) -> bool + Send + Sync;

/// Read-only handle to a committed cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The entry's key.
    pub key: CacheKey,
    /// Path of the committed blob.
    pub path: PathBuf,
    /// Committed byte length.
    pub len: u64,
}

impl CacheEntry {
    /// The entry's path as a `file://` locator.
    #[must_use]
    pub fn locator(&self) -> String {
        Scheme::wrap_file(&self.path)
    }
}

struct StoreState {
    /// Recency order plus byte size per key. Capacity-unbounded; the byte and
    /// count bounds are enforced explicitly so both can trigger eviction.
    index: LruCache<String, u64>,
    total_bytes: u64,
    closed: bool,
}

/// Disk-backed LRU blob store.
pub struct DiskStore {
    dir: PathBuf,
    max_bytes: u64,
    max_entries: usize,
    staging_seq: AtomicU64,
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("dir", &self.dir)
            .field("max_bytes", &self.max_bytes)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

impl DiskStore {
    /// Opens (or creates) a store in `dir` with the given bounds.
    ///
    /// A zero bound means unbounded. Existing committed entries are indexed
    /// by modification time; leftover staging files are removed.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] if the directory cannot be initialized.
    /// That failure is fatal to the loading subsystem.
    pub async fn open(dir: PathBuf, max_bytes: u64, max_entries: usize) -> StoreResult<Self> {
        let max_bytes = if max_bytes == 0 { u64::MAX } else { max_bytes };
        let max_entries = if max_entries == 0 {
            usize::MAX
        } else {
            max_entries
        };

        tokio::fs::create_dir_all(&dir).await?;

        let mut found: Vec<(String, u64, std::time::SystemTime)> = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == STAGING_EXT) {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            if !path.extension().is_some_and(|ext| ext == ENTRY_EXT) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(meta) = entry.metadata().await {
                let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
                found.push((key.to_string(), meta.len(), modified));
            }
        }

        // Oldest first, so the scan leaves the most recent entry at the MRU end.
        found.sort_by_key(|(_, _, modified)| *modified);

        let mut index = LruCache::unbounded();
        let mut total_bytes = 0u64;
        for (key, len, _) in found {
            total_bytes += len;
            index.push(key, len);
        }

        debug!(
            dir = %dir.display(),
            entries = index.len(),
            total_bytes,
            "opened disk store"
        );

        let store = Self {
            dir,
            max_bytes,
            max_entries,
            staging_seq: AtomicU64::new(0),
            state: Mutex::new(StoreState {
                index,
                total_bytes,
                closed: false,
            }),
        };

        // The scan itself may exceed the configured bounds.
        let victims = {
            let mut state = store.state.lock();
            store.evict_locked(&mut state, None)
        };
        store.remove_victims(victims).await;

        Ok(store)
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.{ENTRY_EXT}"))
    }

    fn staging_path(&self, key: &CacheKey) -> PathBuf {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{key}.{seq}.{STAGING_EXT}"))
    }

    /// Returns a handle to the committed blob for `key`, promoting its
    /// recency, or `None` on a miss. Never exposes an uncommitted write.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        {
            let mut state = self.state.lock();
            if state.closed {
                error!("get on closed disk store");
                return None;
            }
            state.index.get(key.as_str()).copied()?;
        }
        let path = self.entry_path(key);
        match std::fs::metadata(&path) {
            Ok(meta) => {
                trace!(key = %key, "disk store hit");
                Some(CacheEntry {
                    key: key.clone(),
                    path,
                    len: meta.len(),
                })
            }
            Err(_) => {
                // Indexed but gone from disk, e.g. a clear raced this lookup.
                let mut state = self.state.lock();
                if let Some(len) = state.index.pop(key.as_str()) {
                    state.total_bytes = state.total_bytes.saturating_sub(len);
                }
                trace!(key = %key, "disk store entry vanished");
                None
            }
        }
    }

    /// Streams `stream` into a staging file and commits it under `key`.
    ///
    /// The stream stays open and owned by the caller. Returns `Ok(true)` only
    /// when every byte was copied and the rename committed; a read or write
    /// failure, a short read against the stream's reported length, or a
    /// `false` from `listener` aborts the write, discards the staging file
    /// and returns `Ok(false)`. The previously committed blob, if any, is
    /// left untouched.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after `close()`.
    pub async fn put(
        &self,
        key: &CacheKey,
        stream: &mut ImageStream,
        listener: Option<&CopyListener>,
    ) -> StoreResult<bool> {
        self.ensure_open()?;

        let staging = self.staging_path(key);
        let mut file = match tokio::fs::File::create(&staging).await {
            Ok(file) => file,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to create staging file");
                return Ok(false);
            }
        };

        let total = stream.len();
        let mut copied = 0u64;
        let mut aborted = false;

        loop {
            match stream.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        warn!(key = %key, error = %e, "write failed during copy");
                        aborted = true;
                        break;
                    }
                    copied += chunk.len() as u64;
                    if listener.is_some_and(|probe| !probe(copied, total)) {
                        debug!(key = %key, copied, "copy cancelled by listener");
                        aborted = true;
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(key = %key, error = %e, copied, "source stream failed during copy");
                    aborted = true;
                    break;
                }
            }
        }

        if !aborted && total.is_some_and(|expected| copied < expected) {
            warn!(key = %key, copied, expected = total, "short read, discarding");
            aborted = true;
        }
        if !aborted && let Err(e) = file.flush().await {
            warn!(key = %key, error = %e, "flush failed");
            aborted = true;
        }
        drop(file);

        if aborted {
            let _ = tokio::fs::remove_file(&staging).await;
            return Ok(false);
        }

        self.commit(key, &staging, copied).await
    }

    /// Re-encodes a bitmap as PNG (lossless) and commits it under `key`,
    /// replacing any previous blob.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after `close()`, [`StoreError::Encode`]
    /// if PNG encoding fails and [`StoreError::Io`] on write failure.
    pub async fn put_bitmap(
        &self,
        key: &CacheKey,
        bitmap: Arc<image::DynamicImage>,
    ) -> StoreResult<()> {
        self.ensure_open()?;

        let encoded = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            bitmap.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)?;
            Ok::<_, image::ImageError>(buf)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        let staging = self.staging_path(key);
        if let Err(e) = tokio::fs::write(&staging, &encoded).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        self.commit(key, &staging, encoded.len() as u64).await?;
        Ok(())
    }

    /// Renames the staging file over the final path and updates accounting.
    async fn commit(&self, key: &CacheKey, staging: &PathBuf, len: u64) -> StoreResult<bool> {
        let path = self.entry_path(key);
        if let Err(e) = tokio::fs::rename(staging, &path).await {
            warn!(key = %key, error = %e, "commit rename failed");
            let _ = tokio::fs::remove_file(staging).await;
            return Ok(false);
        }

        let victims = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::Closed);
            }
            if let Some(previous) = state.index.push(key.as_str().to_string(), len) {
                // push returns the displaced value when the key already existed
                state.total_bytes = state.total_bytes.saturating_sub(previous.1);
            }
            state.total_bytes += len;
            self.evict_locked(&mut state, Some(key.as_str()))
        };

        debug!(key = %key, len, evicted = victims.len(), "committed entry");
        self.remove_victims(victims).await;
        Ok(true)
    }

    /// Deletes all entries and reinitializes with the same bounds.
    ///
    /// In-flight operations that started before the clear may afterwards
    /// observe a miss or an uncommitted write; that is accepted, non-fatal.
    ///
    /// # Errors
    /// Returns [`StoreError::Closed`] after `close()` and [`StoreError::Io`]
    /// if the directory cannot be read.
    pub async fn clear(&self) -> StoreResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::Closed);
            }
            state.index.clear();
            state.total_bytes = 0;
        }

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_ours = path
                .extension()
                .is_some_and(|ext| ext == ENTRY_EXT || ext == STAGING_EXT);
            if is_ours && let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove entry");
            }
        }
        debug!(dir = %self.dir.display(), "cleared disk store");
        Ok(())
    }

    /// Marks the store closed. Subsequent operations are a programming error
    /// and fail with [`StoreError::Closed`] (or a logged miss for `get`).
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.index.clear();
        state.total_bytes = 0;
        debug!(dir = %self.dir.display(), "closed disk store");
    }

    /// Number of committed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    /// True when no entries are committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total committed bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.state.lock().closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Pops LRU entries until both bounds hold, skipping `protect` (the entry
    /// being written). Returns the victims; the caller deletes their files
    /// outside the lock.
    fn evict_locked(&self, state: &mut StoreState, protect: Option<&str>) -> Vec<String> {
        let mut victims = Vec::new();
        while state.total_bytes > self.max_bytes || state.index.len() > self.max_entries {
            let candidate_is_protected = match state.index.peek_lru() {
                Some((key, _)) => protect.is_some_and(|p| p == key),
                None => break,
            };
            if candidate_is_protected {
                // Only the just-written entry remains; it is never evicted.
                break;
            }
            let Some((key, len)) = state.index.pop_lru() else {
                break;
            };
            state.total_bytes = state.total_bytes.saturating_sub(len);
            victims.push(key);
        }
        victims
    }

    async fn remove_victims(&self, victims: Vec<String>) {
        for key in victims {
            let path = self.dir.join(format!("{key}.{ENTRY_EXT}"));
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(key, error = %e, "failed to remove evicted entry");
            } else {
                debug!(key, "evicted entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StreamSource;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn source() -> StreamSource {
        StreamSource::new(Duration::from_secs(1), Duration::from_secs(1)).expect("client")
    }

    async fn stream_for(data: &[u8]) -> (ImageStream, tempfile::NamedTempFile) {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(data).expect("write");
        let stream = source()
            .open(&Scheme::wrap_file(tmp.path()))
            .await
            .expect("open");
        (stream, tmp)
    }

    async fn put_blob(store: &DiskStore, key: &CacheKey, data: &[u8]) -> bool {
        let (mut stream, _tmp) = stream_for(data).await;
        store.put(key, &mut stream, None).await.expect("put")
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 0, 0).await.unwrap();
        let key = CacheKey::from_locator("http://x/a.jpg");

        assert!(put_blob(&store, &key, b"blob bytes").await);

        let entry = store.get(&key).expect("hit");
        assert_eq!(entry.len, 10);
        assert_eq!(std::fs::read(&entry.path).unwrap(), b"blob bytes");
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), 10);
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 0, 0).await.unwrap();
        assert!(store.get(&CacheKey::from_locator("http://x/none.jpg")).is_none());
    }

    #[tokio::test]
    async fn count_bound_evicts_least_recent() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 0, 2).await.unwrap();
        let a = CacheKey::from_locator("a");
        let b = CacheKey::from_locator("b");
        let c = CacheKey::from_locator("c");

        assert!(put_blob(&store, &a, b"aaaa").await);
        assert!(put_blob(&store, &b, b"bbbb").await);
        assert!(put_blob(&store, &c, b"cccc").await);

        assert!(store.get(&a).is_none());
        assert!(store.get(&b).is_some());
        assert!(store.get(&c).is_some());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn get_promotes_recency() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 0, 2).await.unwrap();
        let a = CacheKey::from_locator("a");
        let b = CacheKey::from_locator("b");
        let c = CacheKey::from_locator("c");

        assert!(put_blob(&store, &a, b"aaaa").await);
        assert!(put_blob(&store, &b, b"bbbb").await);
        // Touch a so b becomes least recent.
        assert!(store.get(&a).is_some());
        assert!(put_blob(&store, &c, b"cccc").await);

        assert!(store.get(&a).is_some());
        assert!(store.get(&b).is_none());
        assert!(store.get(&c).is_some());
    }

    #[tokio::test]
    async fn byte_bound_evicts() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 10, 0).await.unwrap();
        let a = CacheKey::from_locator("a");
        let b = CacheKey::from_locator("b");

        assert!(put_blob(&store, &a, b"123456").await);
        assert!(put_blob(&store, &b, b"654321").await);

        // 12 bytes total exceeds the 10 byte bound; a goes.
        assert!(store.get(&a).is_none());
        assert!(store.get(&b).is_some());
        assert!(store.total_bytes() <= 10);
    }

    #[tokio::test]
    async fn oversized_entry_is_never_self_evicted() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 4, 0).await.unwrap();
        let key = CacheKey::from_locator("big");

        assert!(put_blob(&store, &key, b"way more than four").await);
        // The freshly written entry survives even though it exceeds the bound.
        assert!(store.get(&key).is_some());
    }

    #[tokio::test]
    async fn cancelled_copy_aborts_and_preserves_previous() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 0, 0).await.unwrap();
        let key = CacheKey::from_locator("k");

        assert!(put_blob(&store, &key, b"committed v1").await);

        let (mut stream, _tmp) = stream_for(b"partial v2").await;
        let cancel: Box<CopyListener> = Box::new(|_, _| false);
        let committed = store.put(&key, &mut stream, Some(&cancel)).await.unwrap();
        assert!(!committed);

        let entry = store.get(&key).expect("previous value survives");
        assert_eq!(std::fs::read(&entry.path).unwrap(), b"committed v1");
        // No staging residue.
        let residue = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .count();
        assert_eq!(residue, 0);
    }

    #[tokio::test]
    async fn get_during_put_sees_only_previous_blob() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DiskStore::open(dir.path().to_path_buf(), 0, 0).await.unwrap());
        let key = CacheKey::from_locator("k");

        assert!(put_blob(&store, &key, b"previous").await);

        // Spans several read chunks so the copy is observed mid-flight.
        let replacement = vec![7u8; 3 * 32 * 1024 + 11];
        let (mut stream, _tmp) = stream_for(&replacement).await;

        // The listener runs between chunks with no store lock held, standing
        // in for a concurrent reader while the staging file grows.
        let observed = Arc::new(Mutex::new(Vec::new()));
        let reader_store = Arc::clone(&store);
        let reader_key = key.clone();
        let reader_log = Arc::clone(&observed);
        let probe: Box<CopyListener> = Box::new(move |_, _| {
            let entry = reader_store.get(&reader_key).expect("previous blob stays visible");
            reader_log
                .lock()
                .push(std::fs::read(&entry.path).expect("previous blob stays readable"));
            true
        });

        assert!(store.put(&key, &mut stream, Some(&probe)).await.unwrap());

        let mid_copy = observed.lock();
        assert!(!mid_copy.is_empty());
        for bytes in mid_copy.iter() {
            assert_eq!(bytes.as_slice(), b"previous");
        }
        drop(mid_copy);

        let entry = store.get(&key).expect("new blob committed");
        assert_eq!(std::fs::read(&entry.path).unwrap(), replacement);
    }

    #[tokio::test]
    async fn short_read_is_not_committed() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 0, 0).await.unwrap();
        let key = CacheKey::from_locator("short");

        let (stream, _tmp) = stream_for(b"only ten b").await;
        let mut stream = stream.with_reported_len(1000);
        let committed = store.put(&key, &mut stream, None).await.unwrap();
        assert!(!committed);
        assert!(store.get(&key).is_none());
    }

    #[tokio::test]
    async fn overwrite_replaces_without_double_count() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 0, 0).await.unwrap();
        let key = CacheKey::from_locator("k");

        assert!(put_blob(&store, &key, b"first").await);
        assert!(put_blob(&store, &key, b"second!").await);

        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), 7);
        let entry = store.get(&key).unwrap();
        assert_eq!(std::fs::read(&entry.path).unwrap(), b"second!");
    }

    #[tokio::test]
    async fn put_bitmap_round_trips_dimensions() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 0, 0).await.unwrap();
        let key = CacheKey::from_locator("bitmap");

        let bitmap = Arc::new(image::DynamicImage::new_rgb8(64, 48));
        store.put_bitmap(&key, bitmap).await.expect("put_bitmap");

        let entry = store.get(&key).expect("hit");
        let decoded = image::ImageReader::open(&entry.path)
            .expect("open")
            .with_guessed_format()
            .expect("guess format")
            .decode()
            .expect("decode");
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 48);
    }

    #[tokio::test]
    async fn clear_empties_and_stays_usable() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 0, 0).await.unwrap();
        let a = CacheKey::from_locator("a");
        let b = CacheKey::from_locator("b");

        assert!(put_blob(&store, &a, b"aa").await);
        assert!(put_blob(&store, &b, b"bb").await);
        store.clear().await.expect("clear");

        assert_eq!(store.len(), 0);
        assert_eq!(store.total_bytes(), 0);
        assert!(store.get(&a).is_none());

        // Same bounds, still writable.
        assert!(put_blob(&store, &a, b"aa").await);
        assert!(store.get(&a).is_some());
    }

    #[tokio::test]
    async fn close_fails_subsequent_operations() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path().to_path_buf(), 0, 0).await.unwrap();
        let key = CacheKey::from_locator("k");
        assert!(put_blob(&store, &key, b"data").await);

        store.close();
        assert!(store.get(&key).is_none());
        let (mut stream, _tmp) = stream_for(b"more").await;
        assert!(matches!(
            store.put(&key, &mut stream, None).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.clear().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn reopen_rebuilds_index_from_disk() {
        let dir = TempDir::new().unwrap();
        let key = CacheKey::from_locator("persist");
        {
            let store = DiskStore::open(dir.path().to_path_buf(), 0, 0).await.unwrap();
            assert!(put_blob(&store, &key, b"durable").await);
        }
        let store = DiskStore::open(dir.path().to_path_buf(), 0, 0).await.unwrap();
        let entry = store.get(&key).expect("survives reopen");
        assert_eq!(entry.len, 7);
        assert_eq!(store.total_bytes(), 7);
    }
}
