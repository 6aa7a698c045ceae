//! The sync loop: fetch, check linkage, commit, refresh the cache, repeat.
//!
//! [`SyncLoop`] is an explicit state machine driven one [`step`](SyncLoop::step)
//! at a time. Exactly one step advances the cursor at any moment; blocks
//! fetched ahead are committed strictly in height order and dropped when a
//! divergence is detected. Waiting goes through the injected [`Clock`], and
//! [`run`](SyncLoop::run) only honors cancellation between steps, never in
//! the middle of a commit or rewind.
//!
//! ```text
//!   CatchingUp <──> Live
//!       │  ^          │
//!       v  │          v
//!   ReorgRecovery <───┘        any ──> Paused ──(cooldown)──> CatchingUp
//!       │
//!       └──(divergence too deep)──> Halted
//! ```

use crate::config::{IndexerConfig, SyncConfig};
use crate::core::cache::{CacheInvalidator, CacheQueue};
use crate::core::fetcher::{FetchOutcome, Fetcher};
use crate::core::indexer::Indexer;
use crate::core::reorg::{Linkage, ReorgDetector};
use crate::storage::CommitOutcome;
use crate::types::ChainCursor;
use crate::utils::error::{IndexerError, Result};
use crate::utils::logging;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use crate::utils::clock::{Clock, TokioClock};

/// Sync loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// Behind the peer by at least the live threshold; fetching in batches.
    #[default]
    CatchingUp,
    /// Close to the peer tip; polling for new blocks.
    Live,
    /// Waiting out the cooldown after a persistent failure.
    Paused,
    /// Searching for the common ancestor and rewinding onto it.
    ReorgRecovery,
    /// The divergence exceeded the configured depth. Terminal.
    Halted,
}

impl SyncState {
    /// Check if a transition to the target state is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        match self {
            SyncState::Halted => false,
            _ if matches!(target, SyncState::Paused | SyncState::Halted) => true,
            SyncState::CatchingUp => {
                matches!(target, SyncState::Live | SyncState::ReorgRecovery)
            }
            SyncState::Live => {
                matches!(target, SyncState::CatchingUp | SyncState::ReorgRecovery)
            }
            SyncState::Paused | SyncState::ReorgRecovery => {
                matches!(target, SyncState::CatchingUp)
            }
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CatchingUp => "CATCHING_UP",
            Self::Live => "LIVE",
            Self::Paused => "PAUSED",
            Self::ReorgRecovery => "REORG_RECOVERY",
            Self::Halted => "HALTED",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health snapshot published after every step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub cursor: Option<ChainCursor>,
    /// Last tip height reported by the peer.
    pub peer_tip: Option<u64>,
    /// Blocks between the cursor and the peer tip.
    pub lag: Option<u64>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// Whether the index is close enough to the peer to serve reads.
    #[must_use]
    pub fn is_synced(&self, max_lag: u64) -> bool {
        self.state != SyncState::Halted && self.lag.is_some_and(|lag| lag <= max_lag)
    }
}

/// What a single step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Blocks `from..=to` were committed.
    Committed { from: u64, to: u64 },
    /// The next height is not available from the peer yet.
    Waiting,
    /// The peer disagrees with the stored chain at `anchor`; the next step
    /// runs the recovery.
    Diverged { anchor: u64 },
    /// Everything above `ancestor` was removed.
    Rewound {
        ancestor: Option<u64>,
        removed_blocks: u64,
    },
    /// A failure moved the loop into PAUSED.
    Paused { error: String },
    /// Still paused for `remaining`.
    Cooling { remaining: Duration },
    /// The cooldown elapsed; catching up again from the cursor.
    Resumed,
}

/// Orchestrates fetcher, reorg detector, indexer and cache invalidator.
pub struct SyncLoop {
    config: SyncConfig,
    start_height: u64,
    fetcher: Fetcher,
    detector: ReorgDetector,
    indexer: Indexer,
    cache: CacheQueue,
    clock: Arc<dyn Clock>,
    cursor: Option<ChainCursor>,
    state: SyncState,
    paused_until: Option<Instant>,
    reorg_anchor: Option<u64>,
    peer_tip: Option<u64>,
    last_error: Option<String>,
    status: watch::Sender<SyncStatus>,
}

impl SyncLoop {
    /// Spawns the cache worker, so this must run inside a Tokio runtime.
    #[must_use]
    pub fn new(
        config: &IndexerConfig,
        fetcher: Fetcher,
        detector: ReorgDetector,
        indexer: Indexer,
        invalidator: Arc<CacheInvalidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            config: config.sync.clone(),
            start_height: config.start_height,
            fetcher,
            detector,
            indexer,
            cache: CacheQueue::spawn(invalidator),
            clock,
            cursor: None,
            state: SyncState::CatchingUp,
            paused_until: None,
            reorg_anchor: None,
            peer_tip: None,
            last_error: None,
            status,
        }
    }

    /// Receiver for the status published after every step.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state
    }

    #[must_use]
    pub fn cursor(&self) -> Option<ChainCursor> {
        self.cursor
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            state: self.state,
            cursor: self.cursor,
            peer_tip: self.peer_tip,
            lag: self.lag(),
            last_error: self.last_error.clone(),
        }
    }

    /// Waits until every queued cache update has been applied.
    pub async fn flush_cache(&self) {
        self.cache.flush().await;
    }

    fn next_height(&self) -> u64 {
        ChainCursor::next_height_or(self.cursor.as_ref(), self.start_height)
    }

    fn lag(&self) -> Option<u64> {
        self.peer_tip
            .map(|tip| tip.saturating_add(1).saturating_sub(self.next_height()))
    }

    fn publish(&self) {
        self.status.send_replace(self.status());
    }

    fn transition(&mut self, next: SyncState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid sync transition {} -> {next}",
            self.state
        );
        tracing::info!(from = %self.state, to = %next, "Sync state changed");
        self.state = next;
    }

    /// Loads the durable cursor and checks the linkage of the stored tip
    /// region.
    ///
    /// # Errors
    ///
    /// Returns the store error if the cursor cannot be read.
    pub async fn restore(&mut self) -> Result<Option<ChainCursor>> {
        let store = self.indexer.store().clone();
        self.cursor = store.read_cursor().await?;

        match self.cursor {
            Some(cursor) => {
                let from = cursor.height.saturating_sub(self.detector.max_depth());
                match store.find_linkage_break(from, cursor.height).await {
                    Ok(Some(height)) => tracing::error!(
                        height,
                        tip = cursor.height,
                        "Stored chain is not linked, blocks above the break need a rewind"
                    ),
                    Ok(None) => {}
                    Err(err) => tracing::warn!(error = %err, "Linkage check failed"),
                }
                tracing::info!(height = cursor.height, hash = %cursor.hash, "Resuming from cursor");
            }
            None => tracing::info!(start_height = self.start_height, "Store is empty"),
        }

        self.publish();
        Ok(self.cursor)
    }

    /// Runs one step of the state machine.
    ///
    /// Fetch, decode and persistence failures move the loop into PAUSED and
    /// are reported as [`StepOutcome::Paused`].
    ///
    /// # Errors
    ///
    /// Only `ChainDivergenceTooDeep`, after which the loop is HALTED and
    /// every further step fails.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        let result = match self.state {
            SyncState::Halted => {
                return Err(IndexerError::InternalError(
                    "sync loop is halted".to_string(),
                ));
            }
            SyncState::Paused => Ok(self.cool_down()),
            SyncState::ReorgRecovery => self.recover().await,
            SyncState::CatchingUp | SyncState::Live => self.advance().await,
        };

        let outcome = match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.fail(err),
        };
        self.publish();
        outcome
    }

    fn fail(&mut self, err: IndexerError) -> Result<StepOutcome> {
        self.last_error = Some(err.to_string());

        if matches!(err, IndexerError::ChainDivergenceTooDeep { .. }) {
            logging::log_error("reorg recovery", &err.to_string());
            self.transition(SyncState::Halted);
            return Err(err);
        }

        let cooldown = self.config.pause_cooldown();
        tracing::warn!(
            error = %err,
            height = self.next_height(),
            cooldown_ms = cooldown.as_millis() as u64,
            "Pausing sync"
        );
        self.paused_until = Some(self.clock.now() + cooldown);
        self.reorg_anchor = None;
        self.transition(SyncState::Paused);

        Ok(StepOutcome::Paused {
            error: err.to_string(),
        })
    }

    fn cool_down(&mut self) -> StepOutcome {
        let now = self.clock.now();
        if let Some(until) = self.paused_until.filter(|until| *until > now) {
            return StepOutcome::Cooling {
                remaining: until - now,
            };
        }

        self.paused_until = None;
        self.transition(SyncState::CatchingUp);
        StepOutcome::Resumed
    }

    async fn advance(&mut self) -> Result<StepOutcome> {
        let tip = self.fetcher.tip_height().await?;
        self.peer_tip = Some(tip);

        let lag = self.lag().unwrap_or_default();
        if lag < self.config.live_lag_threshold {
            self.transition(SyncState::Live);
        } else {
            self.transition(SyncState::CatchingUp);
        }

        if let Some(cursor) = self.cursor.filter(|c| tip <= c.height) {
            return self.revalidate(tip, cursor).await;
        }

        let next = self.next_height();
        if next > tip {
            return Ok(StepOutcome::Waiting);
        }

        let count = (tip - next + 1).min(self.config.batch_size as u64);
        let started = self.clock.now();
        let blocks = self.fetcher.fetch_range(next, count).await?;
        if blocks.is_empty() {
            return Ok(StepOutcome::Waiting);
        }

        let mut committed = None;
        for block in blocks {
            match self.detector.classify(&block, self.cursor.as_ref()).await? {
                Linkage::Extend => {}
                Linkage::AlreadyIndexed => continue,
                Linkage::Diverged { anchor } => {
                    // blocks fetched ahead are dropped with the iterator
                    self.enter_recovery(anchor);
                    return Ok(match committed {
                        Some((from, to)) => StepOutcome::Committed { from, to },
                        None => StepOutcome::Diverged { anchor },
                    });
                }
            }

            match self.indexer.commit(&block).await? {
                CommitOutcome::Committed(summary) => {
                    logging::log_block(
                        summary.height,
                        &summary.hash.to_string(),
                        summary.transactions,
                    );
                    self.cursor = Some(ChainCursor::new(block.height, block.hash));
                    self.last_error = None;
                    self.cache.on_commit(summary);
                }
                CommitOutcome::AlreadyCommitted => {
                    self.cursor = self.indexer.store().read_cursor().await?;
                }
            }

            committed = Some(committed.map_or((block.height, block.height), |(from, _)| {
                (from, block.height)
            }));
        }

        match committed {
            Some((from, to)) => {
                let elapsed = self.clock.now().saturating_duration_since(started);
                logging::log_batch(
                    (to - from + 1) as usize,
                    count as usize,
                    elapsed.as_millis() as u64,
                );
                Ok(StepOutcome::Committed { from, to })
            }
            None => Ok(StepOutcome::Waiting),
        }
    }

    /// Nothing new on the peer: compare its block at the peer tip with the
    /// stored one, so a replaced tip is noticed.
    async fn revalidate(&mut self, tip: u64, cursor: ChainCursor) -> Result<StepOutcome> {
        tracing::trace!(tip, cursor = cursor.height, "Revalidating peer tip");

        let FetchOutcome::Block(block) = self.fetcher.fetch(tip).await? else {
            return Ok(StepOutcome::Waiting);
        };

        match self.detector.classify(&block, Some(&cursor)).await? {
            Linkage::Diverged { anchor } => {
                self.enter_recovery(anchor);
                Ok(StepOutcome::Diverged { anchor })
            }
            Linkage::Extend | Linkage::AlreadyIndexed => Ok(StepOutcome::Waiting),
        }
    }

    fn enter_recovery(&mut self, anchor: u64) {
        tracing::warn!(anchor, "Chain divergence detected");
        self.reorg_anchor = Some(anchor);
        self.transition(SyncState::ReorgRecovery);
    }

    async fn recover(&mut self) -> Result<StepOutcome> {
        let Some(anchor) = self.reorg_anchor else {
            self.transition(SyncState::CatchingUp);
            return Ok(StepOutcome::Resumed);
        };

        let ancestor = self
            .detector
            .find_common_ancestor(anchor, &self.fetcher)
            .await?;
        let summary = self.indexer.rewind(ancestor).await?;

        self.cursor = summary.cursor;
        self.reorg_anchor = None;
        self.cache.on_rewind(ancestor.map(|h| h + 1));

        tracing::warn!(
            ?ancestor,
            removed_blocks = summary.removed_blocks,
            "Reorganization handled"
        );
        self.transition(SyncState::CatchingUp);

        Ok(StepOutcome::Rewound {
            ancestor,
            removed_blocks: summary.removed_blocks,
        })
    }

    fn delay_after(&self, outcome: &StepOutcome) -> Duration {
        match outcome {
            StepOutcome::Committed { .. } => self.config.catch_up_poll(),
            StepOutcome::Waiting => self.config.live_poll(),
            StepOutcome::Paused { .. } => self.config.pause_cooldown(),
            StepOutcome::Cooling { remaining } => *remaining,
            StepOutcome::Diverged { .. } | StepOutcome::Rewound { .. } | StepOutcome::Resumed => {
                Duration::ZERO
            }
        }
    }

    /// Restores the cursor and steps until `cancel` fires or the loop halts.
    ///
    /// # Errors
    ///
    /// - The store error if the cursor cannot be restored.
    /// - `ChainDivergenceTooDeep` when the loop halts.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.restore().await?;
        tracing::info!(next_height = self.next_height(), "Sync loop started");

        while !cancel.is_cancelled() {
            let outcome = self.step().await?;
            let delay = self.delay_after(&outcome);

            let clock = Arc::clone(&self.clock);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = clock.sleep(delay) => {}
            }
        }

        tracing::info!(cursor = ?self.cursor.map(|c| c.height), "Sync loop stopped");
        Ok(())
    }
}
