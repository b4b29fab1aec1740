use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    Network(reqwest::Error),
    Json(serde_json::Error),
    Io(std::io::Error),
    Storage(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Network(e) => write!(f, "Network error: {}", e),
            CacheError::Json(e) => write!(f, "JSON parsing error: {}", e),
            CacheError::Io(e) => write!(f, "IO error: {}", e),
            CacheError::Storage(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Network(err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Json(err)
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err)
    }
}
