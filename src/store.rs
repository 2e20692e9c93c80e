//! Path-addressed local cache for fetched artifacts
//!
//! Every URL maps to exactly one file under the cache directory. A cached file
//! is returned as-is without touching the network; callers re-hash and
//! re-attest it, so a stale or tampered cache entry fails verification rather
//! than being trusted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hash;
use crate::transport::Transport;

/// Hex characters of the URL digest used as the cache key prefix (128 bits)
const KEY_DIGEST_LEN: usize = 32;

pub struct ContentStore {
    dir: PathBuf,
    transport: Arc<dyn Transport>,
    /// Per-key locks so concurrent resolves of one URL download it once
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContentStore {
    pub fn new(dir: impl Into<PathBuf>, transport: Arc<dyn Transport>) -> Self {
        Self {
            dir: dir.into(),
            transport,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local path that `url` resolves to, whether or not it is cached yet
    pub fn cached_path(&self, url: &str) -> PathBuf {
        self.dir.join(cache_key(url))
    }

    /// Return the local copy of `url`, downloading it first on a cache miss.
    ///
    /// Downloads stream into a temporary file in the cache directory which is
    /// renamed into place once complete, so a reader never observes a
    /// partially written entry.
    pub async fn resolve(&self, url: &str) -> Result<PathBuf> {
        let key = cache_key(url);
        let path = self.dir.join(&key);

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if tokio::fs::try_exists(&path).await? {
            debug!(url, path = %path.display(), "using cached file");
            return Ok(path);
        }

        info!(url, "fetching");
        self.download(url, &path).await.map_err(|e| match e {
            Error::Io(io) => Error::Fetch {
                url: url.to_string(),
                reason: format!("failed to write {}: {}", path.display(), io),
            },
            other => other,
        })?;

        Ok(path)
    }

    async fn download(&self, url: &str, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let partial = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&self.dir)?;
        let mut file = tokio::fs::File::from_std(partial.reopen()?);

        let bytes = self.transport.download(url, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        partial.persist(path).map_err(|e| Error::Io(e.error))?;
        debug!(url, bytes, path = %path.display(), "cached");
        Ok(())
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inflight.entry(key.to_string()).or_default().clone()
    }
}

/// Derive the cache file name for a URL.
///
/// The name is a digest of the full URL (so distinct paths and query strings
/// never collide) followed by a sanitised copy of the last path segment for
/// readability. Only `[A-Za-z0-9._-]` survive sanitising and leading dots are
/// stripped, so the key can never escape the cache directory.
pub fn cache_key(url: &str) -> String {
    let digest = hash::digest_bytes(url.as_bytes());

    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    let segment = without_query.rsplit('/').next().unwrap_or_default();
    let sanitised: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let name = sanitised.trim_start_matches('.');

    if name.is_empty() {
        format!("{}-blob", &digest[..KEY_DIGEST_LEN])
    } else {
        format!("{}-{}", &digest[..KEY_DIGEST_LEN], name)
    }
}
