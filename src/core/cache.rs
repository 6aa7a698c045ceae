//! Cache invalidation driven by commits and rewinds.
//!
//! The cache is a side channel kept off the commit path. The sync loop hands
//! each commit and rewind to a [`CacheQueue`], which never waits: a single
//! worker task applies the updates in order, each bounded by a short deadline,
//! and failures are logged and swallowed. A full queue drops the update.
//!
//! Every entry is stamped with the invalidator's generation. A rewind bumps
//! the generation before its eviction is queued, and a commit captures the
//! generation when it is queued. Reads ignore entries from an older
//! generation and recompute them from the store, so neither a failed eviction
//! nor a refresh that lands late is ever served after a rewind.

use crate::cache::{CacheBackend, CacheEntry};
use crate::storage::{CommitSummary, ProverTotal, Store};
use crate::types::BlockHash;
use crate::utils::error::{IndexerError, Result};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

/// Entries kept in the cached leaderboard list.
pub const LEADERBOARD_SIZE: usize = 50;

/// Updates buffered for the worker before new ones are dropped.
pub const CACHE_QUEUE_CAPACITY: usize = 1024;

const CACHE_TIMEOUT: Duration = Duration::from_secs(2);

/// Key layout under a common prefix.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    prefix: String,
}

impl CacheKeys {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn tip(&self) -> String {
        format!("{}:tip", self.prefix)
    }

    #[must_use]
    pub fn stats(&self) -> String {
        format!("{}:stats", self.prefix)
    }

    #[must_use]
    pub fn leaderboard(&self) -> String {
        format!("{}:leaderboard", self.prefix)
    }

    #[must_use]
    pub fn prover(&self, address: &str) -> String {
        format!("{}:prover:{address}", self.prefix)
    }

    /// Every height-dependent key.
    #[must_use]
    pub fn all(&self) -> String {
        format!("{}:*", self.prefix)
    }
}

/// Cached view of the indexed tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSnapshot {
    pub height: u64,
    pub hash: BlockHash,
    pub total_supply: u64,
}

/// Leaderboard row as served to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub address: String,
    pub solutions: u64,
    pub total_reward: u64,
    /// The address is a known pledge address.
    pub pledged: bool,
}

/// Keeps cached aggregates consistent with the store.
pub struct CacheInvalidator {
    backend: Arc<dyn CacheBackend>,
    store: Arc<dyn Store>,
    keys: CacheKeys,
    generation: AtomicU64,
    pledges: HashSet<String>,
    timeout: Duration,
}

impl CacheInvalidator {
    /// The generation starts at the current wall-clock millisecond so entries
    /// written by an earlier process are treated as stale.
    #[must_use]
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        store: Arc<dyn Store>,
        prefix: impl Into<String>,
        pledge_addresses: impl IntoIterator<Item = String>,
    ) -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        Self {
            backend,
            store,
            keys: CacheKeys::new(prefix),
            generation: AtomicU64::new(seed),
            pledges: pledge_addresses.into_iter().collect(),
            timeout: CACHE_TIMEOUT,
        }
    }

    /// Overrides the deadline applied to every cache round trip.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    /// Version stamped on entries written now.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn leaderboard_entry(&self, total: ProverTotal) -> LeaderboardEntry {
        LeaderboardEntry {
            pledged: self.pledges.contains(&total.address),
            address: total.address,
            solutions: total.solutions,
            total_reward: total.total_reward,
        }
    }

    async fn put<T: Serialize + Sync>(&self, key: &str, value: &T, version: u64) -> Result<()> {
        let entry = CacheEntry {
            value: serde_json::to_value(value)?,
            version,
        };
        tokio::time::timeout(self.timeout, self.backend.set(key, &entry))
            .await
            .map_err(|_| IndexerError::CacheError(format!("set {key} timed out")))?
    }

    /// Current-generation value under `key`, if any.
    async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let entry = tokio::time::timeout(self.timeout, self.backend.get(key))
            .await
            .map_err(|_| IndexerError::CacheError(format!("get {key} timed out")))??;

        match entry {
            Some(entry) if entry.version == self.generation() => {
                Ok(Some(serde_json::from_value(entry.value)?))
            }
            _ => Ok(None),
        }
    }

    async fn refresh(&self, summary: &CommitSummary, version: u64) -> Result<()> {
        let tip = TipSnapshot {
            height: summary.height,
            hash: summary.hash,
            total_supply: summary.total_supply,
        };
        self.put(&self.keys.tip(), &tip, version).await?;

        let stats = self.store.chain_stats().await?;
        self.put(&self.keys.stats(), &stats, version).await?;

        if summary.provers.is_empty() {
            return Ok(());
        }

        for address in &summary.provers {
            if let Some(total) = self.store.prover_total(address).await? {
                let entry = self.leaderboard_entry(total);
                self.put(&self.keys.prover(address), &entry, version).await?;
            }
        }

        let board: Vec<LeaderboardEntry> = self
            .store
            .prover_leaderboard(LEADERBOARD_SIZE)
            .await?
            .into_iter()
            .map(|total| self.leaderboard_entry(total))
            .collect();
        self.put(&self.keys.leaderboard(), &board, version).await
    }

    /// Starts a new generation. Entries written before are ignored from now
    /// on. Returns the new generation.
    pub fn invalidate(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Refreshes the tip, counters and the leaderboard entries touched by a
    /// committed block, stamped with `version`. Never fails.
    pub async fn apply_commit(&self, summary: &CommitSummary, version: u64) {
        match tokio::time::timeout(self.timeout, self.refresh(summary, version)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(height = summary.height, error = %err, "Cache refresh failed");
            }
            Err(_) => tracing::warn!(height = summary.height, "Cache refresh timed out"),
        }
    }

    /// Evicts every height-dependent entry after a rewind to `from_height`.
    /// Never fails.
    pub async fn evict(&self, from_height: Option<u64>, generation: u64) {
        let evicted = tokio::time::timeout(self.timeout, self.backend.evict(&self.keys.all())).await;
        match evicted {
            Ok(Ok(removed)) => {
                tracing::info!(?from_height, generation, removed, "Cache evicted after rewind");
            }
            Ok(Err(err)) => tracing::warn!(
                ?from_height,
                generation,
                error = %err,
                "Cache eviction failed, stale entries are ignored by version"
            ),
            Err(_) => tracing::warn!(?from_height, generation, "Cache eviction timed out"),
        }
    }

    /// Tip as seen by readers: the cached snapshot when it belongs to the
    /// current generation, otherwise recomputed from the store and re-cached.
    ///
    /// # Errors
    ///
    /// Only store failures are returned; cache failures fall back to the store.
    pub async fn tip(&self) -> Result<Option<TipSnapshot>> {
        match self.fetch::<TipSnapshot>(&self.keys.tip()).await {
            Ok(Some(tip)) => return Ok(Some(tip)),
            Ok(None) => {}
            Err(err) => tracing::debug!(error = %err, "Cache read failed, using store"),
        }

        let Some(cursor) = self.store.read_cursor().await? else {
            return Ok(None);
        };
        let tip = TipSnapshot {
            height: cursor.height,
            hash: cursor.hash,
            total_supply: self.store.supply_at(cursor.height).await?.unwrap_or_default(),
        };

        if let Err(err) = self.put(&self.keys.tip(), &tip, self.generation()).await {
            tracing::debug!(error = %err, "Cache write-back failed");
        }
        Ok(Some(tip))
    }

    /// Top provers, read through the cache like [`tip`](Self::tip).
    pub async fn leaderboard(&self) -> Result<Vec<LeaderboardEntry>> {
        match self
            .fetch::<Vec<LeaderboardEntry>>(&self.keys.leaderboard())
            .await
        {
            Ok(Some(board)) => return Ok(board),
            Ok(None) => {}
            Err(err) => tracing::debug!(error = %err, "Cache read failed, using store"),
        }

        let board: Vec<LeaderboardEntry> = self
            .store
            .prover_leaderboard(LEADERBOARD_SIZE)
            .await?
            .into_iter()
            .map(|total| self.leaderboard_entry(total))
            .collect();

        if let Err(err) = self
            .put(&self.keys.leaderboard(), &board, self.generation())
            .await
        {
            tracing::debug!(error = %err, "Cache write-back failed");
        }
        Ok(board)
    }
}

/// Update waiting for the cache worker.
enum CacheEvent {
    Commit {
        summary: CommitSummary,
        version: u64,
    },
    Rewind {
        from_height: Option<u64>,
        generation: u64,
    },
    Flush(oneshot::Sender<()>),
}

impl CacheEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Commit { .. } => "commit",
            Self::Rewind { .. } => "rewind",
            Self::Flush(_) => "flush",
        }
    }
}

/// Non-blocking handle to the cache worker.
///
/// The worker stops once every handle is dropped and the queue is drained.
#[derive(Clone)]
pub struct CacheQueue {
    invalidator: Arc<CacheInvalidator>,
    events: mpsc::Sender<CacheEvent>,
}

impl CacheQueue {
    /// Spawns the worker on the current runtime.
    #[must_use]
    pub fn spawn(invalidator: Arc<CacheInvalidator>) -> Self {
        let (events, receiver) = mpsc::channel(CACHE_QUEUE_CAPACITY);
        tokio::spawn(run_worker(Arc::clone(&invalidator), receiver));
        Self {
            invalidator,
            events,
        }
    }

    #[must_use]
    pub fn invalidator(&self) -> &Arc<CacheInvalidator> {
        &self.invalidator
    }

    /// Queues a refresh for a committed block under the current generation.
    pub fn on_commit(&self, summary: CommitSummary) {
        let version = self.invalidator.generation();
        self.enqueue(CacheEvent::Commit { summary, version });
    }

    /// Starts a new generation right away and queues the eviction.
    pub fn on_rewind(&self, from_height: Option<u64>) {
        let generation = self.invalidator.invalidate();
        self.enqueue(CacheEvent::Rewind {
            from_height,
            generation,
        });
    }

    fn enqueue(&self, event: CacheEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(kind = event.kind(), "Cache queue full, update dropped");
            }
            Err(TrySendError::Closed(event)) => {
                tracing::warn!(kind = event.kind(), "Cache worker stopped, update dropped");
            }
        }
    }

    /// Waits until every update queued so far has been applied.
    pub async fn flush(&self) {
        let (done, applied) = oneshot::channel();
        if self.events.send(CacheEvent::Flush(done)).await.is_ok() {
            let _ = applied.await;
        }
    }
}

async fn run_worker(invalidator: Arc<CacheInvalidator>, mut events: mpsc::Receiver<CacheEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            CacheEvent::Commit { summary, version } => {
                invalidator.apply_commit(&summary, version).await;
            }
            CacheEvent::Rewind {
                from_height,
                generation,
            } => invalidator.evict(from_height, generation).await,
            CacheEvent::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Cache worker stopped");
}
