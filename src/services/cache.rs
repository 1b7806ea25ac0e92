//! File-backed cache of upstream search responses.
//!
//! One JSON file per parameter-set hash, each carrying its write time.
//! Entries expire after a TTL and the entry count is capped, oldest first.
//! Repeated identical searches inside the TTL window never hit the API.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::models::SearchResponse;
use crate::services::SearchClient;

/// On-disk shape of one cached response.
#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
    cached_at: DateTime<Utc>,
    response: SearchResponse,
}

/// Summary of the cache contents, for the maintenance report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub expired: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// TTL'd response cache over a directory of JSON files.
pub struct ResponseCache {
    dir: PathBuf,
    ttl: chrono::Duration,
    max_entries: usize,
    index: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl ResponseCache {
    /// Open (or create) the cache directory and index its entries.
    ///
    /// Timestamps for pre-existing files come from file modification time;
    /// a file the index cannot stat is skipped, not fatal.
    pub fn open(dir: impl AsRef<Path>, ttl: chrono::Duration, max_entries: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut index = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            index.insert(key.to_string(), DateTime::<Utc>::from(modified));
        }

        if !index.is_empty() {
            log::debug!("Indexed {} cached responses from {}", index.len(), dir.display());
        }

        Ok(Self {
            dir,
            ttl,
            max_entries,
            index: Mutex::new(index),
        })
    }

    /// Look up a fresh cached response for `params`.
    ///
    /// Expired entries miss but stay on disk until [`ResponseCache::purge_expired`];
    /// an unreadable or corrupt entry is dropped and misses.
    pub fn get(&self, params: &BTreeMap<String, String>) -> Option<SearchResponse> {
        let key = cache_key(params);
        let now = Utc::now();

        {
            let index = self.lock_index();
            let cached_at = *index.get(&key)?;
            if now - cached_at >= self.ttl {
                log::debug!("Cache expired for {}", &key[..8]);
                return None;
            }
        }

        match self.read_entry(&key) {
            Ok(cached) => {
                log::debug!("Cache hit for {}", &key[..8]);
                Some(cached.response)
            }
            Err(e) => {
                log::warn!("Dropping unreadable cache entry {}: {}", &key[..8], e);
                self.remove_entry(&key);
                None
            }
        }
    }

    /// Store a response for `params`, evicting the oldest entries past the cap.
    pub fn put(&self, params: &BTreeMap<String, String>, response: &SearchResponse) -> Result<()> {
        let key = cache_key(params);
        let now = Utc::now();

        let cached = CachedResponse {
            cached_at: now,
            response: response.clone(),
        };
        let bytes = serde_json::to_vec(&cached)?;
        std::fs::write(self.entry_path(&key), bytes)?;

        let mut index = self.lock_index();
        index.insert(key.clone(), now);
        log::debug!("Cached response for {} ({} records)", &key[..8], response.items.len());

        while index.len() > self.max_entries {
            let Some(oldest) = index
                .iter()
                .min_by_key(|(_, t)| **t)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            index.remove(&oldest);
            let _ = std::fs::remove_file(self.entry_path(&oldest));
            log::debug!("Evicted oldest cache entry {}", &oldest[..8]);
        }

        Ok(())
    }

    /// Delete every entry past its TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut index = self.lock_index();

        let expired: Vec<String> = index
            .iter()
            .filter(|(_, cached_at)| now - **cached_at >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            index.remove(key);
            let _ = std::fs::remove_file(self.entry_path(key));
        }
        expired.len()
    }

    /// Delete everything. Returns how many entries were removed.
    pub fn clear(&self) -> usize {
        let mut index = self.lock_index();
        let keys: Vec<String> = index.keys().cloned().collect();
        for key in &keys {
            let _ = std::fs::remove_file(self.entry_path(key));
        }
        index.clear();
        keys.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let index = self.lock_index();
        CacheStats {
            entries: index.len(),
            expired: index.values().filter(|t| now - **t >= self.ttl).count(),
            oldest: index.values().min().copied(),
            newest: index.values().max().copied(),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn read_entry(&self, key: &str) -> Result<CachedResponse> {
        let bytes = std::fs::read(self.entry_path(key))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn remove_entry(&self, key: &str) {
        let _ = std::fs::remove_file(self.entry_path(key));
        self.lock_index().remove(key);
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, DateTime<Utc>>> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Stable key over the full parameter set.
fn cache_key(params: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in params {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"&");
    }
    hex::encode(hasher.finalize())
}

/// [`SearchClient`] decorator that serves repeated searches from the cache.
///
/// A failed cache write is logged and the live response returned anyway.
pub struct CachingClient {
    inner: Arc<dyn SearchClient>,
    cache: ResponseCache,
}

impl CachingClient {
    pub fn new(inner: Arc<dyn SearchClient>, cache: ResponseCache) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl SearchClient for CachingClient {
    async fn search(
        &self,
        params: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<SearchResponse> {
        if let Some(hit) = self.cache.get(params) {
            return Ok(hit);
        }

        let response = self.inner.search(params, timeout).await?;
        if let Err(e) = self.cache.put(params, &response) {
            log::warn!("Failed to cache response: {}", e);
        }
        Ok(response)
    }
}
