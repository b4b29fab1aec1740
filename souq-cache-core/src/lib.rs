//! Caching core for the souq catalogue app.
//!
//! Two pieces:
//!
//! - [`ImageCache`]: maps remote catalogue/offer image URLs to locally
//!   downloaded files, with a bounded disk budget, priority-aware eviction,
//!   a fixed retention window and de-duplication of concurrent downloads.
//! - [`TtlCache`]: a generic TTL key/value cache for API payloads with
//!   hit/miss statistics.
//!
//! Both sit behind injectable provider traits ([`FileStore`],
//! [`KeyValueStore`]) and are strictly best-effort: when storage or the
//! network fails the image cache hands back the original remote URL and the
//! TTL cache reports a miss. Nothing here ever propagates an error into UI
//! code.

pub mod cache;
pub mod error;
pub mod storage;
pub mod ttl_cache;

pub use cache::{
    CachedImageEntry, ImageCache, ImageCacheConfig, ImageCacheStats, ImagePriority, PriorityCounts,
};
pub use error::CacheError;
pub use storage::{DiskFileStore, DownloadOutcome, FileStore, JsonFileStore, KeyValueStore};
pub use ttl_cache::{TtlCache, TtlCacheStats};
