//! Upload URL Cache
//!
//! Memoizes the time-limited write credentials handed out by the
//! coordination API so that many queue items sharing a content hash do not
//! refetch, and so a credential is never used close enough to its expiry to
//! lapse mid-transfer. Credentials are valid for a fixed TTL from issuance;
//! a safety buffer is subtracted when judging freshness.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::host::UploadCoordinator;

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct UrlCacheConfig {
    /// Credential lifetime from issuance.
    pub ttl: ChronoDuration,
    /// Margin subtracted from the TTL when judging freshness, so a
    /// credential cannot expire mid-transfer.
    pub safety_buffer: ChronoDuration,
}

impl Default for UrlCacheConfig {
    fn default() -> Self {
        Self {
            ttl: ChronoDuration::minutes(90),
            safety_buffer: ChronoDuration::minutes(30),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedUrl {
    url: String,
    fetched_at: DateTime<Utc>,
}

impl CachedUrl {
    fn is_valid_at(&self, now: DateTime<Utc>, config: &UrlCacheConfig) -> bool {
        self.fetched_at + config.ttl - config.safety_buffer > now
    }
}

/// TTL-bound cache of content hash → presigned upload URL.
pub struct UploadUrlCache {
    coordinator: Arc<dyn UploadCoordinator>,
    entries: RwLock<HashMap<String, CachedUrl>>,
    config: UrlCacheConfig,
}

impl UploadUrlCache {
    pub fn new(coordinator: Arc<dyn UploadCoordinator>, config: UrlCacheConfig) -> Self {
        Self {
            coordinator,
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Resolve upload URLs for a batch of hashes.
    ///
    /// Cached-and-fresh entries are answered locally; the rest go out as a
    /// single coordinator request. If that request fails the affected
    /// hashes are simply absent from the returned map: they could not
    /// start this cycle and will be retried later.
    pub async fn get_batch(&self, hashes: &[String]) -> HashMap<String, String> {
        let now = Utc::now();
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();

        {
            let entries = self.entries.read().await;
            for hash in hashes {
                match entries.get(hash) {
                    Some(entry) if entry.is_valid_at(now, &self.config) => {
                        resolved.insert(hash.clone(), entry.url.clone());
                    }
                    _ => missing.push(hash.clone()),
                }
            }
        }

        if missing.is_empty() {
            return resolved;
        }

        debug!(
            "URL cache: {} cached, fetching {} fresh credentials",
            resolved.len(),
            missing.len()
        );

        match self.coordinator.get_upload_urls(&missing).await {
            Ok(fresh) => {
                let mut entries = self.entries.write().await;
                // Stale entries for the refetched hashes are dropped even if
                // the coordinator declined to grant a new credential.
                for hash in &missing {
                    entries.remove(hash);
                }
                for (hash, url) in fresh {
                    entries.insert(
                        hash.clone(),
                        CachedUrl {
                            url: url.clone(),
                            fetched_at: now,
                        },
                    );
                    resolved.insert(hash, url);
                }
            }
            Err(e) => {
                warn!(
                    "URL batch fetch failed for {} hashes, items skipped this cycle: {}",
                    missing.len(),
                    e
                );
            }
        }

        resolved
    }

    /// Resolve a single hash. Convenience wrapper over [`get_batch`](Self::get_batch).
    pub async fn get(&self, content_hash: &str) -> Option<String> {
        let hashes = [content_hash.to_string()];
        self.get_batch(&hashes).await.remove(content_hash)
    }

    /// Drop the entry for a hash. Called when an item completes or
    /// permanently fails so the cache stays bounded by in-flight work.
    pub async fn remove(&self, content_hash: &str) {
        self.entries.write().await.remove(content_hash);
    }

    /// Number of cached credentials.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn insert_raw(&self, hash: &str, url: &str, fetched_at: DateTime<Utc>) {
        self.entries.write().await.insert(
            hash.to_string(),
            CachedUrl {
                url: url.to_string(),
                fetched_at,
            },
        );
    }
}
