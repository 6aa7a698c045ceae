//! Cache backends for derived aggregates.
//!
//! The cache mirrors values that can always be recomputed from the store
//! (tip, supply, counters, leaderboard). Every entry carries the version it
//! was written under so readers can discard entries from before a rewind.

use crate::utils::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// A cached value and the generation it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub version: u64,
}

/// Key-value store used as the cache side channel.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<()>;

    /// Deletes every key matching a glob `pattern` (`*` wildcard only) and
    /// returns how many were removed.
    async fn evict(&self, pattern: &str) -> Result<u64>;
}

/// Glob match with `*` as the only wildcard, as used by Redis `SCAN MATCH`
/// for the patterns the indexer writes.
#[must_use]
pub fn glob_matches(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // no wildcard at all
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::glob_matches;

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("explorer:*", "explorer:tip"));
        assert!(glob_matches("explorer:leaderboard:*", "explorer:leaderboard:aleo1x"));
        assert!(!glob_matches("explorer:leaderboard:*", "explorer:tip"));
        assert!(glob_matches("explorer:tip", "explorer:tip"));
        assert!(!glob_matches("explorer:tip", "explorer:tip2"));
        assert!(glob_matches("a*c*e", "abcde"));
        assert!(!glob_matches("a*c*e", "abcdf"));
    }
}
