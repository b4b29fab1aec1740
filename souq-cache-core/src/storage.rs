//! Provider contracts the caches are built against, plus their production
//! implementations.
//!
//! The caches never touch the filesystem or the network directly; they go
//! through `FileStore` and `KeyValueStore` so the platform integration can be
//! swapped out (and mocked in tests).

use crate::error::CacheError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

const USER_AGENT: &str = "souq-cache-core/0.1";
const ACCEPT: &str = "*/*";

/// Result of a `FileStore::download` call.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub status: u16,
    pub path: PathBuf,
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Filesystem + download provider.
///
/// A non-2xx `download` status is reported in the outcome rather than as an
/// error; callers treat both the same way (fall back to the remote URL).
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;

    async fn create_dir_all(&self, path: &Path) -> Result<(), CacheError>;

    /// Fetch `url` and write the body to `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<DownloadOutcome, CacheError>;

    async fn remove(&self, path: &Path) -> Result<(), CacheError>;

    async fn remove_dir_all(&self, path: &Path) -> Result<(), CacheError>;

    /// Size of the file at `path`, or `None` if it does not exist.
    async fn stat(&self, path: &Path) -> Option<u64>;
}

/// String key/value persistence provider. One JSON blob per key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_item(&self, key: &str, value: &str) -> Result<(), CacheError>;

    async fn remove_item(&self, key: &str) -> Result<(), CacheError>;
}

/// Production `FileStore` backed by the local filesystem and an HTTP client.
#[derive(Debug)]
pub struct DiskFileStore {
    client: reqwest::Client,
}

impl DiskFileStore {
    pub fn new() -> Result<Self, CacheError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static(USER_AGENT),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(ACCEPT),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(DiskFileStore { client })
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn create_dir_all(&self, path: &Path) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(path).await.map_err(CacheError::Io)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<DownloadOutcome, CacheError> {
        debug!(url = %url, dest = %dest.display(), "Downloading to local file");
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();

        if !response.status().is_success() {
            return Ok(DownloadOutcome {
                status,
                path: dest.to_path_buf(),
            });
        }

        let bytes = response.bytes().await?;
        tokio::fs::write(dest, &bytes).await.map_err(CacheError::Io)?;

        Ok(DownloadOutcome {
            status,
            path: dest.to_path_buf(),
        })
    }

    async fn remove(&self, path: &Path) -> Result<(), CacheError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    async fn stat(&self, path: &Path) -> Option<u64> {
        tokio::fs::metadata(path)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }
}

/// Production `KeyValueStore` storing one JSON file per key under a
/// directory. Keys are hashed so any string is a valid storage key.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub async fn new(dir: PathBuf) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(&dir).await.map_err(CacheError::Io)?;
        Ok(JsonFileStore { dir })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let hash = hasher.finalize();
        self.dir.join(format!("{:x}.json", hash))
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, CacheError> {
        match tokio::fs::read_to_string(self.key_to_path(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), CacheError> {
        tokio::fs::write(self.key_to_path(key), value)
            .await
            .map_err(CacheError::Io)
    }

    async fn remove_item(&self, key: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.key_to_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }
}
