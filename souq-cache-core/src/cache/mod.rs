//! On-device image cache for catalogue and offer artwork.
//!
//! Maps remote image URLs to locally downloaded files. Lookups go through a
//! small in-memory map, then the persisted metadata snapshot, and only then
//! the network; concurrent requests for the same URL share a single download.
//! The disk footprint is kept under a soft budget by priority-aware eviction,
//! and entries expire after a fixed retention window.
//!
//! Caching is strictly best-effort: every public operation degrades to
//! serving the original remote URL instead of surfacing an error.

use crate::error::CacheError;
use crate::storage::{DiskFileStore, FileStore, JsonFileStore, KeyValueStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod filename;
mod memory_lookup;

use filename::cache_filename;
use memory_lookup::MemoryLookup;

const METADATA_KEY: &str = "image_cache_metadata";
const DEFAULT_MAX_SIZE_MB: u64 = 100;
const DEFAULT_RETENTION_DAYS: i64 = 30;
const DEFAULT_LOOKUP_CAPACITY: usize = 50;
const DEFAULT_PREFETCH_CONCURRENCY: usize = 3;
// Eviction drains to 80% of the budget so one new entry does not
// immediately re-trigger the sweep.
const EVICTION_TARGET_NUMERATOR: u64 = 8;
const EVICTION_TARGET_DENOMINATOR: u64 = 10;

/// Eviction precedence hint. `Low` entries go first, `High` entries are
/// never removed by the size sweep. Lookup behavior is unaffected.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum ImagePriority {
    Low,
    #[default]
    Normal,
    High,
}

/// One cached download. At most one entry exists per URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedImageEntry {
    pub url: String,
    pub local_path: PathBuf,
    pub cached_at: OffsetDateTime,
    pub last_accessed: OffsetDateTime,
    pub size_bytes: u64,
    pub priority: ImagePriority,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataSnapshot {
    entries: HashMap<String, CachedImageEntry>,
    total_size_bytes: u64,
    last_updated: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    pub cache_dir: PathBuf,
    pub max_size_bytes: u64,
    pub retention: Duration,
    pub memory_lookup_capacity: usize,
    pub prefetch_concurrency: usize,
}

impl ImageCacheConfig {
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        ImageCacheConfig {
            cache_dir,
            max_size_bytes: DEFAULT_MAX_SIZE_MB * 1024 * 1024,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
            memory_lookup_capacity: DEFAULT_LOOKUP_CAPACITY,
            prefetch_concurrency: DEFAULT_PREFETCH_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityCounts {
    pub low: usize,
    pub normal: usize,
    pub high: usize,
}

/// Diagnostics snapshot, see [`ImageCache::stats`].
#[derive(Debug, Clone)]
pub struct ImageCacheStats {
    pub item_count: usize,
    pub total_size_bytes: u64,
    pub by_priority: PriorityCounts,
    pub supported: bool,
}

struct CacheState {
    entries: HashMap<String, CachedImageEntry>,
    lookup: MemoryLookup,
}

/// Handle to the image cache. Cheap to clone; all clones share state.
/// Construct one per process at startup and pass it to consumers.
#[derive(Clone)]
pub struct ImageCache {
    files: Arc<dyn FileStore>,
    store: Arc<dyn KeyValueStore>,
    config: Arc<ImageCacheConfig>,
    supported: bool,
    state: Arc<Mutex<CacheState>>,
    in_flight: Arc<Mutex<HashMap<String, watch::Receiver<Option<String>>>>>,
    // Serializes whole-snapshot metadata writes so concurrent resolves
    // cannot interleave two half-written snapshots.
    persist_gate: Arc<tokio::sync::Mutex<()>>,
}

impl ImageCache {
    /// Create a cache over the given providers.
    ///
    /// If the cache directory cannot be created the cache runs in
    /// pass-through mode for the process lifetime: `resolve` returns the
    /// original URL and nothing is stored. Construction never fails.
    pub async fn new(
        files: Arc<dyn FileStore>,
        store: Arc<dyn KeyValueStore>,
        config: ImageCacheConfig,
    ) -> Self {
        let supported = match files.create_dir_all(&config.cache_dir).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    cache_dir = %config.cache_dir.display(),
                    error = %e,
                    "Local file storage unavailable, images will be served from their original URLs"
                );
                false
            }
        };

        let entries = if supported {
            load_snapshot(store.as_ref()).await
        } else {
            HashMap::new()
        };

        info!(
            entries = entries.len(),
            cache_dir = %config.cache_dir.display(),
            supported,
            "Image cache initialized"
        );

        let lookup = MemoryLookup::new(config.memory_lookup_capacity);
        let cache = ImageCache {
            files,
            store,
            config: Arc::new(config),
            supported,
            state: Arc::new(Mutex::new(CacheState { entries, lookup })),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            persist_gate: Arc::new(tokio::sync::Mutex::new(())),
        };

        if cache.supported {
            let sweeper = cache.clone();
            tokio::spawn(async move { sweeper.sweep_expired().await });
        }

        cache
    }

    /// Production wiring: filesystem provider with an HTTP client, JSON
    /// metadata files under the platform cache directory.
    pub async fn with_defaults() -> Result<Self, CacheError> {
        let base_dir = directories::ProjectDirs::from("", "", "souq-cache")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("souq-cache"));

        let files: Arc<dyn FileStore> = Arc::new(DiskFileStore::new()?);
        let store: Arc<dyn KeyValueStore> =
            Arc::new(JsonFileStore::new(base_dir.join("metadata")).await?);
        let config = ImageCacheConfig::with_cache_dir(base_dir.join("images"));

        Ok(Self::new(files, store, config).await)
    }

    /// Resolve a remote image URL to a local path, downloading and caching it
    /// on first access. Falls back to returning `url` unchanged whenever
    /// caching cannot help (unsupported storage, download or filesystem
    /// failure), never an error.
    ///
    /// Concurrent calls for the same URL share a single download.
    pub async fn resolve(&self, url: &str, priority: ImagePriority) -> String {
        if !self.supported {
            return url.to_string();
        }

        {
            let state = self.state.lock().unwrap();
            if let Some(path) = state.lookup.get(url) {
                debug!(url = %url, "Image cache memory HIT");
                return path.to_string();
            }
        }

        // Join an in-flight download for this URL, or register one. The
        // download itself runs on its own task, so a caller that drops this
        // future (dismissed screen, aborted task) neither cancels the work
        // nor strands the registration.
        let mut rx = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(rx) = in_flight.get(url) {
                debug!(url = %url, "Joining in-flight download");
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                in_flight.insert(url.to_string(), rx.clone());
                let cache = self.clone();
                let owned_url = url.to_string();
                tokio::spawn(async move {
                    let resolved = cache.resolve_uncached(&owned_url, priority).await;
                    let _ = tx.send(Some(resolved));
                    cache.in_flight.lock().unwrap().remove(&owned_url);
                });
                rx
            }
        };

        loop {
            let published = rx.borrow_and_update().clone();
            if let Some(path) = published {
                return path;
            }
            if rx.changed().await.is_err() {
                // The download task died without publishing a result. Drop
                // the dead registration so the next caller starts afresh.
                let mut in_flight = self.in_flight.lock().unwrap();
                if in_flight.get(url).is_some_and(|cur| cur.same_channel(&rx)) {
                    in_flight.remove(url);
                }
                return url.to_string();
            }
        }
    }

    async fn resolve_uncached(&self, url: &str, priority: ImagePriority) -> String {
        let known = {
            let state = self.state.lock().unwrap();
            state.entries.get(url).cloned()
        };

        if let Some(entry) = known {
            if self.entry_expired(&entry) {
                debug!(url = %url, cached_at = %entry.cached_at, "Cached image expired");
                self.drop_entry(url).await;
            } else if self.files.stat(&entry.local_path).await.is_some() {
                let path = entry.local_path.to_string_lossy().to_string();
                {
                    let mut state = self.state.lock().unwrap();
                    state.lookup.insert(url, path.clone());
                    if let Some(live) = state.entries.get_mut(url) {
                        live.last_accessed = OffsetDateTime::now_utc();
                    }
                }
                debug!(url = %url, "Image cache disk HIT");
                self.spawn_persist();
                return path;
            } else {
                debug!(
                    url = %url,
                    file = %entry.local_path.display(),
                    "Cached image file missing, discarding entry"
                );
                self.drop_entry(url).await;
            }
        }

        match self.download_and_record(url, priority).await {
            Ok(path) => path,
            Err(e) => {
                warn!(url = %url, error = %e, "Image download failed, serving original URL");
                url.to_string()
            }
        }
    }

    async fn download_and_record(
        &self,
        url: &str,
        priority: ImagePriority,
    ) -> Result<String, CacheError> {
        let dest = self.config.cache_dir.join(cache_filename(url));
        let outcome = self.files.download(url, &dest).await?;
        if !outcome.is_success() {
            return Err(CacheError::Storage(format!(
                "download returned status {}",
                outcome.status
            )));
        }

        let size_bytes = self.files.stat(&dest).await.unwrap_or(0);
        let now = OffsetDateTime::now_utc();
        let path = dest.to_string_lossy().to_string();
        let entry = CachedImageEntry {
            url: url.to_string(),
            local_path: dest,
            cached_at: now,
            last_accessed: now,
            size_bytes,
            priority,
        };

        {
            let mut state = self.state.lock().unwrap();
            state.entries.insert(url.to_string(), entry);
            state.lookup.insert(url, path.clone());
        }

        debug!(url = %url, size_bytes, path = %path, "Image cached to disk");
        self.spawn_persist();
        self.spawn_enforce_max_size();
        Ok(path)
    }

    /// Remove one cached image: its file, metadata record and memory-lookup
    /// slot. No-op when the URL is not cached.
    pub async fn invalidate(&self, url: &str) {
        if !self.supported {
            return;
        }

        let removed = {
            let mut state = self.state.lock().unwrap();
            state.lookup.remove(url);
            state.entries.remove(url)
        };

        let Some(entry) = removed else { return };
        if let Err(e) = self.files.remove(&entry.local_path).await {
            debug!(file = %entry.local_path.display(), error = %e, "Failed to remove cached image file");
        }
        self.persist().await;
        debug!(url = %url, "Invalidated cached image");
    }

    /// Delete the entire cache directory, recreate it empty and drop all
    /// in-memory state.
    pub async fn clear(&self) {
        if !self.supported {
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.entries.clear();
            state.lookup.clear();
        }

        if let Err(e) = self.files.remove_dir_all(&self.config.cache_dir).await {
            warn!(cache_dir = %self.config.cache_dir.display(), error = %e, "Failed to remove cache directory");
        }
        if let Err(e) = self.files.create_dir_all(&self.config.cache_dir).await {
            warn!(cache_dir = %self.config.cache_dir.display(), error = %e, "Failed to recreate cache directory");
        }

        self.persist().await;
        info!("Cleared all cached images");
    }

    /// Warm the cache for a batch of URLs at `High` priority, at most
    /// `prefetch_concurrency` downloads at a time. Per-URL failures are
    /// logged and swallowed.
    pub async fn prefetch(&self, urls: &[String]) {
        if !self.supported || urls.is_empty() {
            return;
        }

        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.config.prefetch_concurrency.max(1),
        ));
        let mut handles = Vec::with_capacity(urls.len());
        for url in urls {
            let cache = self.clone();
            let url = url.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                cache.resolve(&url, ImagePriority::High).await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Prefetch task panicked");
            }
        }
        debug!(urls = urls.len(), "Prefetch batch complete");
    }

    pub fn stats(&self) -> ImageCacheStats {
        let state = self.state.lock().unwrap();
        let mut by_priority = PriorityCounts::default();
        for entry in state.entries.values() {
            match entry.priority {
                ImagePriority::Low => by_priority.low += 1,
                ImagePriority::Normal => by_priority.normal += 1,
                ImagePriority::High => by_priority.high += 1,
            }
        }
        ImageCacheStats {
            item_count: state.entries.len(),
            total_size_bytes: state.entries.values().map(|e| e.size_bytes).sum(),
            by_priority,
            supported: self.supported,
        }
    }

    /// Force a metadata snapshot write (e.g. before shutdown). Failures are
    /// logged, never returned.
    pub async fn persist(&self) {
        if !self.supported {
            return;
        }
        if let Err(e) = self.persist_snapshot().await {
            warn!(error = %e, "Failed to persist image cache metadata");
        }
    }

    fn spawn_persist(&self) {
        let cache = self.clone();
        tokio::spawn(async move { cache.persist().await });
    }

    async fn persist_snapshot(&self) -> Result<(), CacheError> {
        let _gate = self.persist_gate.lock().await;
        let snapshot = {
            let state = self.state.lock().unwrap();
            MetadataSnapshot {
                entries: state.entries.clone(),
                total_size_bytes: state.entries.values().map(|e| e.size_bytes).sum(),
                last_updated: OffsetDateTime::now_utc(),
            }
        };
        let json = serde_json::to_string(&snapshot)?;
        self.store.set_item(METADATA_KEY, &json).await?;
        debug!(entries = snapshot.entries.len(), "Saved image cache metadata");
        Ok(())
    }

    fn spawn_enforce_max_size(&self) {
        let cache = self.clone();
        tokio::spawn(async move { cache.enforce_max_size().await });
    }

    /// Evict entries until total size is back at 80% of the budget, lowest
    /// priority first, oldest first within a priority. `High` entries are
    /// only ever removed via `invalidate`/`clear`, so eviction may stop
    /// early and leave the cache over target.
    async fn enforce_max_size(&self) {
        let target =
            self.config.max_size_bytes * EVICTION_TARGET_NUMERATOR / EVICTION_TARGET_DENOMINATOR;

        let victims = {
            let mut state = self.state.lock().unwrap();
            let mut total: u64 = state.entries.values().map(|e| e.size_bytes).sum();
            if total <= self.config.max_size_bytes {
                return;
            }

            let mut candidates: Vec<(String, ImagePriority, OffsetDateTime)> = state
                .entries
                .values()
                .filter(|e| e.priority != ImagePriority::High)
                .map(|e| (e.url.clone(), e.priority, e.cached_at))
                .collect();
            candidates.sort_by_key(|(_, priority, cached_at)| (*priority, *cached_at));

            let mut victims = Vec::new();
            for (url, _, _) in candidates {
                if total <= target {
                    break;
                }
                let Some(entry) = state.entries.remove(&url) else {
                    continue;
                };
                state.lookup.remove(&url);
                total -= entry.size_bytes;
                victims.push(entry);
            }

            if total > target {
                debug!(
                    total_size_bytes = total,
                    target, "Eviction stopped early, remaining entries are high priority"
                );
            }
            victims
        };

        if victims.is_empty() {
            return;
        }

        info!(
            evicted = victims.len(),
            size_freed_kb = victims.iter().map(|e| e.size_bytes).sum::<u64>() / 1024,
            "Evicted cache entries over size budget"
        );
        for entry in &victims {
            if let Err(e) = self.files.remove(&entry.local_path).await {
                debug!(file = %entry.local_path.display(), error = %e, "Failed to remove evicted image file");
            }
        }
        self.persist().await;
    }

    /// Drop entries past the retention window and entries whose backing file
    /// has vanished. Runs once at construction, off the caller's path.
    async fn sweep_expired(&self) {
        let now = OffsetDateTime::now_utc();
        let entries: Vec<(String, PathBuf, OffsetDateTime)> = {
            let state = self.state.lock().unwrap();
            state
                .entries
                .values()
                .map(|e| (e.url.clone(), e.local_path.clone(), e.cached_at))
                .collect()
        };

        let mut dropped = 0usize;
        for (url, path, cached_at) in entries {
            if now - cached_at > self.config.retention {
                self.drop_entry(&url).await;
                dropped += 1;
            } else if self.files.stat(&path).await.is_none() {
                let mut state = self.state.lock().unwrap();
                state.lookup.remove(&url);
                state.entries.remove(&url);
                dropped += 1;
            }
        }

        if dropped > 0 {
            info!(dropped, "Expiration sweep removed stale cache entries");
            self.persist().await;
        }
    }

    /// Remove an entry and its file without persisting; callers persist once
    /// they are done mutating.
    async fn drop_entry(&self, url: &str) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.lookup.remove(url);
            state.entries.remove(url)
        };
        if let Some(entry) = removed {
            if let Err(e) = self.files.remove(&entry.local_path).await {
                debug!(file = %entry.local_path.display(), error = %e, "Failed to remove cached image file");
            }
        }
    }

    fn entry_expired(&self, entry: &CachedImageEntry) -> bool {
        OffsetDateTime::now_utc() - entry.cached_at > self.config.retention
    }
}

async fn load_snapshot(store: &dyn KeyValueStore) -> HashMap<String, CachedImageEntry> {
    match store.get_item(METADATA_KEY).await {
        Ok(Some(json)) => match serde_json::from_str::<MetadataSnapshot>(&json) {
            Ok(snapshot) => snapshot.entries,
            Err(e) => {
                warn!(error = %e, "Corrupt image cache metadata, starting empty");
                HashMap::new()
            }
        },
        Ok(None) => {
            debug!("No existing image cache metadata found");
            HashMap::new()
        }
        Err(e) => {
            warn!(error = %e, "Failed to read image cache metadata, starting empty");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DownloadOutcome;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const URL: &str = "https://cdn.example.com/flyers/page01.jpg";

    #[derive(Default)]
    struct MockFiles {
        disk: Mutex<HashMap<PathBuf, u64>>,
        sizes: Mutex<HashMap<String, u64>>,
        downloads: AtomicUsize,
        fail_downloads: AtomicBool,
        fail_mkdir: bool,
        download_delay_ms: u64,
    }

    impl MockFiles {
        fn with_size(self, url: &str, size: u64) -> Self {
            self.sizes.lock().unwrap().insert(url.to_string(), size);
            self
        }

        fn download_count(&self) -> usize {
            self.downloads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FileStore for MockFiles {
        async fn exists(&self, path: &Path) -> bool {
            self.disk.lock().unwrap().contains_key(path)
        }

        async fn create_dir_all(&self, _path: &Path) -> Result<(), CacheError> {
            if self.fail_mkdir {
                Err(CacheError::Storage("no local file storage".to_string()))
            } else {
                Ok(())
            }
        }

        async fn download(&self, url: &str, dest: &Path) -> Result<DownloadOutcome, CacheError> {
            if self.download_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.download_delay_ms)).await;
            }
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if self.fail_downloads.load(Ordering::SeqCst) {
                return Err(CacheError::Storage("network down".to_string()));
            }
            let size = self.sizes.lock().unwrap().get(url).copied().unwrap_or(1024);
            self.disk.lock().unwrap().insert(dest.to_path_buf(), size);
            Ok(DownloadOutcome {
                status: 200,
                path: dest.to_path_buf(),
            })
        }

        async fn remove(&self, path: &Path) -> Result<(), CacheError> {
            self.disk.lock().unwrap().remove(path);
            Ok(())
        }

        async fn remove_dir_all(&self, path: &Path) -> Result<(), CacheError> {
            self.disk.lock().unwrap().retain(|p, _| !p.starts_with(path));
            Ok(())
        }

        async fn stat(&self, path: &Path) -> Option<u64> {
            self.disk.lock().unwrap().get(path).copied()
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        items: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl KeyValueStore for MemoryStore {
        async fn get_item(&self, key: &str) -> Result<Option<String>, CacheError> {
            Ok(self.items.lock().unwrap().get(key).cloned())
        }

        async fn set_item(&self, key: &str, value: &str) -> Result<(), CacheError> {
            self.items
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn remove_item(&self, key: &str) -> Result<(), CacheError> {
            self.items.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn test_config() -> ImageCacheConfig {
        ImageCacheConfig::with_cache_dir(PathBuf::from("/cache/images"))
    }

    async fn test_cache(files: Arc<MockFiles>) -> ImageCache {
        ImageCache::new(files, Arc::new(MemoryStore::default()), test_config()).await
    }

    #[tokio::test]
    async fn test_resolve_downloads_once_then_serves_from_cache() {
        let files = Arc::new(MockFiles::default());
        let cache = test_cache(files.clone()).await;

        let path = cache.resolve(URL, ImagePriority::Normal).await;
        assert!(path.starts_with("/cache/images/"));
        assert!(path.ends_with("page01.jpg"));
        assert_eq!(files.download_count(), 1);

        let again = cache.resolve(URL, ImagePriority::Normal).await;
        assert_eq!(again, path);
        assert_eq!(files.download_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_download() {
        let files = Arc::new(MockFiles {
            download_delay_ms: 50,
            ..MockFiles::default()
        });
        let cache = test_cache(files.clone()).await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.resolve(URL, ImagePriority::Normal).await },
            ));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(files.download_count(), 1);
        assert!(results.iter().all(|p| p == &results[0]));
        assert!(results[0].starts_with("/cache/images/"));
    }

    #[tokio::test]
    async fn test_aborted_resolve_still_populates_cache() {
        let files = Arc::new(MockFiles {
            download_delay_ms: 50,
            ..MockFiles::default()
        });
        let cache = test_cache(files.clone()).await;

        let handle = tokio::spawn({
            let cache = cache.clone();
            async move { cache.resolve(URL, ImagePriority::Normal).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        // The download keeps running on its own task; once it lands, later
        // resolves get the cached path instead of the remote URL.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let resolved = cache.resolve(URL, ImagePriority::Normal).await;
        assert_ne!(resolved, URL);
        assert!(resolved.starts_with("/cache/images/"));
        assert_eq!(files.download_count(), 1);

        let again = cache.resolve(URL, ImagePriority::Normal).await;
        assert_eq!(again, resolved);
        assert_eq!(files.download_count(), 1);
    }

    #[tokio::test]
    async fn test_download_failure_falls_back_to_original_url() {
        let files = Arc::new(MockFiles::default());
        files.fail_downloads.store(true, Ordering::SeqCst);
        let cache = test_cache(files.clone()).await;

        let resolved = cache.resolve(URL, ImagePriority::Normal).await;
        assert_eq!(resolved, URL);

        // Failures are not cached; the next resolve retries.
        files.fail_downloads.store(false, Ordering::SeqCst);
        let resolved = cache.resolve(URL, ImagePriority::Normal).await;
        assert_ne!(resolved, URL);
        assert_eq!(files.download_count(), 2);
    }

    #[tokio::test]
    async fn test_pass_through_when_storage_unsupported() {
        let files = Arc::new(MockFiles {
            fail_mkdir: true,
            ..MockFiles::default()
        });
        let cache = test_cache(files.clone()).await;

        assert_eq!(cache.resolve(URL, ImagePriority::High).await, URL);
        assert_eq!(
            cache.resolve("https://x/anything else", ImagePriority::Low).await,
            "https://x/anything else"
        );
        assert_eq!(files.download_count(), 0);
        assert!(!cache.stats().supported);
    }

    #[tokio::test]
    async fn test_survives_restart_via_persisted_metadata() {
        let files = Arc::new(MockFiles::default());
        let store = Arc::new(MemoryStore::default());

        let cache = ImageCache::new(files.clone(), store.clone(), test_config()).await;
        let path = cache.resolve(URL, ImagePriority::Normal).await;
        cache.persist().await;

        // New instance over the same providers loads the snapshot and does
        // not re-download.
        let cache = ImageCache::new(files.clone(), store.clone(), test_config()).await;
        let again = cache.resolve(URL, ImagePriority::Normal).await;
        assert_eq!(again, path);
        assert_eq!(files.download_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_re_downloaded() {
        let files = Arc::new(MockFiles::default());
        let store = Arc::new(MemoryStore::default());

        // Seed a snapshot with an entry past the retention window whose file
        // is still on disk.
        let old = OffsetDateTime::now_utc() - Duration::days(31);
        let local_path = PathBuf::from("/cache/images").join(cache_filename(URL));
        files.disk.lock().unwrap().insert(local_path.clone(), 512);
        let mut entries = HashMap::new();
        entries.insert(
            URL.to_string(),
            CachedImageEntry {
                url: URL.to_string(),
                local_path,
                cached_at: old,
                last_accessed: old,
                size_bytes: 512,
                priority: ImagePriority::Normal,
            },
        );
        let snapshot = MetadataSnapshot {
            entries,
            total_size_bytes: 512,
            last_updated: old,
        };
        store
            .set_item(METADATA_KEY, &serde_json::to_string(&snapshot).unwrap())
            .await
            .unwrap();

        let cache = ImageCache::new(files.clone(), store, test_config()).await;
        let resolved = cache.resolve(URL, ImagePriority::Normal).await;
        assert!(resolved.starts_with("/cache/images/"));
        assert_eq!(files.download_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_invalidates_entry() {
        let files = Arc::new(MockFiles::default());
        let cache = test_cache(files.clone()).await;

        cache.resolve(URL, ImagePriority::Normal).await;
        assert_eq!(files.download_count(), 1);

        // Simulate external deletion, then defeat the memory fast path the
        // way a process restart would.
        files.disk.lock().unwrap().clear();
        cache.state.lock().unwrap().lookup.clear();

        cache.resolve(URL, ImagePriority::Normal).await;
        assert_eq!(files.download_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_removes_exactly_one_entry() {
        let other = "https://cdn.example.com/flyers/page02.jpg";
        let files = Arc::new(MockFiles::default());
        let cache = test_cache(files.clone()).await;

        cache.resolve(URL, ImagePriority::Normal).await;
        cache.resolve(other, ImagePriority::Normal).await;
        assert_eq!(files.download_count(), 2);

        cache.invalidate(URL).await;
        assert_eq!(cache.stats().item_count, 1);

        // Invalidated URL re-downloads, the other one does not.
        cache.resolve(URL, ImagePriority::Normal).await;
        cache.resolve(other, ImagePriority::Normal).await;
        assert_eq!(files.download_count(), 3);

        // Invalidating an unknown URL is a no-op.
        cache.invalidate("https://x/never-cached.jpg").await;
        assert_eq!(cache.stats().item_count, 2);
    }

    #[tokio::test]
    async fn test_clear_empties_cache_and_directory() {
        let files = Arc::new(MockFiles::default());
        let cache = test_cache(files.clone()).await;

        cache.resolve(URL, ImagePriority::Normal).await;
        cache
            .resolve("https://cdn.example.com/flyers/page02.jpg", ImagePriority::High)
            .await;
        assert_eq!(cache.stats().item_count, 2);

        cache.clear().await;
        assert_eq!(cache.stats().item_count, 0);
        assert!(files.disk.lock().unwrap().is_empty());

        cache.resolve(URL, ImagePriority::Normal).await;
        assert_eq!(files.download_count(), 3);
    }

    #[tokio::test]
    async fn test_eviction_oldest_first_down_to_target() {
        // Budget of 100 bytes: A(60) then B(50) pushes the total to 110,
        // eviction removes A (oldest at equal priority), leaving 50 <= 80.
        let url_a = "https://cdn.example.com/flyers/a.jpg";
        let url_b = "https://cdn.example.com/flyers/b.jpg";
        let files = Arc::new(
            MockFiles::default()
                .with_size(url_a, 60)
                .with_size(url_b, 50),
        );
        let mut config = test_config();
        config.max_size_bytes = 100;
        let cache = ImageCache::new(files.clone(), Arc::new(MemoryStore::default()), config).await;

        cache.resolve(url_a, ImagePriority::Normal).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.resolve(url_b, ImagePriority::Normal).await;

        cache.enforce_max_size().await;

        let stats = cache.stats();
        assert_eq!(stats.item_count, 1);
        assert_eq!(stats.total_size_bytes, 50);
        assert!(cache.state.lock().unwrap().entries.contains_key(url_b));
        assert!(!cache.state.lock().unwrap().entries.contains_key(url_a));
    }

    #[tokio::test]
    async fn test_eviction_removes_low_before_normal() {
        let url_normal = "https://cdn.example.com/flyers/n.jpg";
        let url_low = "https://cdn.example.com/flyers/l.jpg";
        let url_new = "https://cdn.example.com/flyers/new.jpg";
        let files = Arc::new(
            MockFiles::default()
                .with_size(url_normal, 40)
                .with_size(url_low, 40)
                .with_size(url_new, 40),
        );
        let mut config = test_config();
        config.max_size_bytes = 100;
        let cache = ImageCache::new(files.clone(), Arc::new(MemoryStore::default()), config).await;

        // The normal entry is older than the low one; low still goes first.
        cache.resolve(url_normal, ImagePriority::Normal).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.resolve(url_low, ImagePriority::Low).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.resolve(url_new, ImagePriority::Normal).await;

        cache.enforce_max_size().await;

        let state = cache.state.lock().unwrap();
        assert!(!state.entries.contains_key(url_low));
        assert!(state.entries.contains_key(url_normal));
        assert!(state.entries.contains_key(url_new));
    }

    #[tokio::test]
    async fn test_high_priority_entries_are_never_evicted() {
        let url_high_a = "https://cdn.example.com/flyers/ha.jpg";
        let url_high_b = "https://cdn.example.com/flyers/hb.jpg";
        let url_normal = "https://cdn.example.com/flyers/n.jpg";
        let files = Arc::new(
            MockFiles::default()
                .with_size(url_high_a, 60)
                .with_size(url_high_b, 50)
                .with_size(url_normal, 30),
        );
        let mut config = test_config();
        config.max_size_bytes = 100;
        let cache = ImageCache::new(files.clone(), Arc::new(MemoryStore::default()), config).await;

        cache.resolve(url_high_a, ImagePriority::High).await;
        cache.resolve(url_high_b, ImagePriority::High).await;
        cache.resolve(url_normal, ImagePriority::Normal).await;

        cache.enforce_max_size().await;

        // The normal entry went, but eviction stopped rather than touch the
        // high-priority pair, even though 110 > 80.
        let stats = cache.stats();
        assert_eq!(stats.item_count, 2);
        assert_eq!(stats.total_size_bytes, 110);
        assert_eq!(stats.by_priority.high, 2);
        assert_eq!(stats.by_priority.normal, 0);
    }

    #[tokio::test]
    async fn test_corrupt_metadata_starts_empty() {
        let files = Arc::new(MockFiles::default());
        let store = Arc::new(MemoryStore::default());
        store.set_item(METADATA_KEY, "{not json").await.unwrap();

        let cache = ImageCache::new(files.clone(), store, test_config()).await;
        assert_eq!(cache.stats().item_count, 0);

        // Still fully functional afterwards.
        let path = cache.resolve(URL, ImagePriority::Normal).await;
        assert!(path.starts_with("/cache/images/"));
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_entries_on_startup() {
        let files = Arc::new(MockFiles::default());
        let store = Arc::new(MemoryStore::default());

        let old = OffsetDateTime::now_utc() - Duration::days(45);
        let fresh = OffsetDateTime::now_utc();
        let old_path = PathBuf::from("/cache/images/old.jpg");
        let fresh_path = PathBuf::from("/cache/images/fresh.jpg");
        files.disk.lock().unwrap().insert(old_path.clone(), 100);
        files.disk.lock().unwrap().insert(fresh_path.clone(), 100);

        let mut entries = HashMap::new();
        for (url, path, at) in [
            ("https://x/old.jpg", &old_path, old),
            ("https://x/fresh.jpg", &fresh_path, fresh),
        ] {
            entries.insert(
                url.to_string(),
                CachedImageEntry {
                    url: url.to_string(),
                    local_path: path.clone(),
                    cached_at: at,
                    last_accessed: at,
                    size_bytes: 100,
                    priority: ImagePriority::Normal,
                },
            );
        }
        let snapshot = MetadataSnapshot {
            entries,
            total_size_bytes: 200,
            last_updated: fresh,
        };
        store
            .set_item(METADATA_KEY, &serde_json::to_string(&snapshot).unwrap())
            .await
            .unwrap();

        let cache = ImageCache::new(files.clone(), store, test_config()).await;
        cache.sweep_expired().await;

        let stats = cache.stats();
        assert_eq!(stats.item_count, 1);
        assert!(!files.disk.lock().unwrap().contains_key(&old_path));
        assert!(files.disk.lock().unwrap().contains_key(&fresh_path));
    }

    #[tokio::test]
    async fn test_prefetch_caches_batch_at_high_priority() {
        let urls: Vec<String> = (0..8)
            .map(|i| format!("https://cdn.example.com/flyers/page{:02}.jpg", i))
            .collect();
        let files = Arc::new(MockFiles {
            download_delay_ms: 5,
            ..MockFiles::default()
        });
        let cache = test_cache(files.clone()).await;

        cache.prefetch(&urls).await;

        assert_eq!(files.download_count(), urls.len());
        let stats = cache.stats();
        assert_eq!(stats.item_count, urls.len());
        assert_eq!(stats.by_priority.high, urls.len());

        // Already-cached URLs are not fetched again.
        cache.prefetch(&urls).await;
        assert_eq!(files.download_count(), urls.len());
    }

    #[tokio::test]
    async fn test_stats_reports_counts_and_sizes() {
        let url_low = "https://x/low.jpg";
        let url_high = "https://x/high.jpg";
        let files = Arc::new(
            MockFiles::default()
                .with_size(url_low, 300)
                .with_size(url_high, 700),
        );
        let cache = test_cache(files.clone()).await;

        cache.resolve(url_low, ImagePriority::Low).await;
        cache.resolve(url_high, ImagePriority::High).await;

        let stats = cache.stats();
        assert!(stats.supported);
        assert_eq!(stats.item_count, 2);
        assert_eq!(stats.total_size_bytes, 1000);
        assert_eq!(
            stats.by_priority,
            PriorityCounts {
                low: 1,
                normal: 0,
                high: 1
            }
        );
    }

    #[tokio::test]
    async fn test_unsafe_url_resolves_to_hashed_filename() {
        let unsafe_url = "https://x/a-very-long-unsafe-name-with-spaces?query=1";
        let files = Arc::new(MockFiles::default());
        let cache = test_cache(files.clone()).await;

        let path = cache.resolve(unsafe_url, ImagePriority::Normal).await;
        assert!(path.starts_with("/cache/images/"));
        assert!(!path.contains(' '));
        assert!(!path.contains('?'));
        assert!(path.ends_with(".jpg"));
    }
}
