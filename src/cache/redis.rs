//! Redis cache backend.
//!
//! Entries are stored as JSON strings. Pattern eviction walks the keyspace
//! with `SCAN MATCH` and deletes each page, so it never blocks the server
//! the way `KEYS` would.

use super::{CacheBackend, CacheEntry};
use crate::utils::error::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

const SCAN_PAGE: usize = 200;

/// Redis implementation of [`CacheBackend`].
///
/// The [`ConnectionManager`] reconnects on its own, so a Redis restart only
/// costs the writes attempted while it was down.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connects to `url` (e.g. <redis://127.0.0.1:6379/0>).
    ///
    /// # Errors
    ///
    /// Returns `IndexerError::CacheError` if the URL is invalid or the first
    /// connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(entry)?;
        let () = conn.set(key, payload).await?;
        Ok(())
    }

    async fn evict(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::debug!(pattern, removed, "Evicted cache keys");
        Ok(removed)
    }
}
