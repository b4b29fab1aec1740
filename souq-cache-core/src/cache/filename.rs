//! Deterministic local filenames for remote image URLs.
//!
//! The URL's last path segment is used directly when it is short and
//! filesystem-safe; anything else falls back to a hash of the full URL so the
//! same URL always lands on the same file.

use sha2::{Digest, Sha256};

const MAX_BASENAME_LEN: usize = 50;
const DEFAULT_EXTENSION: &str = "jpg";

pub(crate) fn cache_filename(url: &str) -> String {
    let basename = url.rsplit('/').next().unwrap_or("");
    if is_safe_basename(basename) {
        return basename.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let hash = hasher.finalize();
    format!("{:x}.{}", hash, guess_extension(url))
}

fn is_safe_basename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_BASENAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Best-effort extension guess from the query-stripped URL.
fn guess_extension(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    match without_query.rsplit_once('.') {
        Some((_, ext))
            if !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext
        }
        _ => DEFAULT_EXTENSION,
    }
}
