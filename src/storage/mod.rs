//! Storage for indexed chain data.
//!
//! The relational store is the sole durable owner of blocks, transactions,
//! transitions, rewards, balances and program mappings. Every block commit
//! and every rewind is one atomic unit that also rewrites the chain cursor,
//! so readers only ever observe a linked prefix of the chain.
//!
//! Two backends implement [`Store`]:
//! - [`PgStore`]: `PostgreSQL` through `sqlx`, used in production.
//! - [`MemoryStore`]: in-process, used by tests and dry runs.

use crate::core::indexer::BlockRows;
use crate::types::{Block, BlockHash, ChainCursor, PuzzleReward, StakeReward};
use crate::utils::error::{IndexerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Result of a block commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The block was written and the cursor now points at it.
    Committed(CommitSummary),
    /// The same `(height, hash)` was already stored; nothing changed.
    AlreadyCommitted,
}

/// What a successful commit touched, consumed by the cache invalidator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub height: u64,
    pub hash: BlockHash,
    pub transactions: usize,
    pub total_supply: u64,
    /// Distinct prover addresses rewarded in this block.
    pub provers: Vec<String>,
}

impl CommitSummary {
    #[must_use]
    pub fn from_rows(rows: &BlockRows) -> Self {
        let mut provers: Vec<String> = rows
            .puzzle_rewards
            .iter()
            .map(|r| r.address.clone())
            .collect();
        provers.sort();
        provers.dedup();

        Self {
            height: rows.block.height,
            hash: rows.block.hash,
            transactions: rows.block.transactions.len(),
            total_supply: rows.total_supply,
            provers,
        }
    }
}

/// Result of a rewind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewindSummary {
    /// Number of block rows deleted.
    pub removed_blocks: u64,
    /// Cursor after the rewind; `None` when everything was removed.
    pub cursor: Option<ChainCursor>,
}

/// Chain-wide aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChainStats {
    pub tip_height: Option<u64>,
    pub block_count: u64,
    pub transaction_count: u64,
    pub total_supply: Option<u64>,
}

/// Cumulative prover earnings, one leaderboard entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProverTotal {
    pub address: String,
    pub solutions: u64,
    pub total_reward: u64,
}

/// Abstract interface for the relational store.
///
/// `commit_block` and `rewind_to` are the only writers. Both are atomic and
/// both rewrite the cursor in the same unit of work.
#[async_trait]
pub trait Store: Send + Sync {
    /// Creates the schema if it does not exist.
    async fn initialize(&self) -> Result<()>;

    /// Returns the durable cursor, `None` while nothing is indexed.
    async fn read_cursor(&self) -> Result<Option<ChainCursor>>;

    /// Hash of the stored block at `height`.
    async fn read_block_hash(&self, height: u64) -> Result<Option<BlockHash>>;

    /// Persists one block and everything derived from it.
    ///
    /// Re-committing a stored `(height, hash)` returns
    /// [`CommitOutcome::AlreadyCommitted`]. A block that does not extend the
    /// cursor fails with `IndexerError::LinkageViolation`.
    async fn commit_block(&self, rows: &BlockRows) -> Result<CommitOutcome>;

    /// Deletes every row derived from heights strictly greater than
    /// `ancestor` and moves the cursor onto it. `None` removes everything.
    async fn rewind_to(&self, ancestor: Option<u64>) -> Result<RewindSummary>;

    async fn chain_stats(&self) -> Result<ChainStats>;

    /// First height in `(from, to]` whose parent hash does not match the
    /// stored block below it.
    async fn find_linkage_break(&self, from: u64, to: u64) -> Result<Option<u64>>;

    /// Total supply recorded with the block at `height`.
    async fn supply_at(&self, height: u64) -> Result<Option<u64>>;

    async fn stake_rewards_at(&self, height: u64) -> Result<Vec<StakeReward>>;

    async fn puzzle_rewards_at(&self, height: u64) -> Result<Vec<PuzzleReward>>;

    /// Prover totals ordered by reward, highest first.
    async fn prover_leaderboard(&self, limit: usize) -> Result<Vec<ProverTotal>>;

    async fn prover_total(&self, address: &str) -> Result<Option<ProverTotal>>;

    /// Net balance tracked for `address` (rewards in, fees out).
    async fn balance(&self, address: &str) -> Result<Option<i64>>;

    /// Current value of a mapping key.
    async fn mapping_value(&self, program_id: &str, mapping: &str, key: &str)
    -> Result<Option<String>>;

    /// Value of a mapping key as of the end of block `height`.
    async fn mapping_value_at(
        &self,
        program_id: &str,
        mapping: &str,
        key: &str,
        height: u64,
    ) -> Result<Option<String>>;

    /// Number of calls recorded for `program_id` across all blocks.
    async fn program_call_count(&self, program_id: &str) -> Result<u64>;
}

/// Verifies that `block` extends `cursor`. Any block extends an empty store.
pub(crate) fn check_extends(cursor: Option<&ChainCursor>, block: &Block) -> Result<()> {
    match cursor {
        None => Ok(()),
        Some(c) if block.height == c.next_height() && block.previous_hash == c.hash => Ok(()),
        Some(c) => Err(IndexerError::LinkageViolation {
            height: block.height,
            expected: format!("{}@{}", c.hash, c.height),
            found: format!(
                "{}@{}",
                block.previous_hash,
                block.height.saturating_sub(1)
            ),
        }),
    }
}
