//! Block to relational rows, and the atomic commit of those rows.
//!
//! [`derive_rows`] is pure: it turns a decoded [`Block`] and the supply of its
//! parent into everything the store writes for that height (staking and
//! prover rewards, balance deltas, program call counts, mapping changes and
//! the new total supply). [`Indexer`] wraps the store commit with a deadline
//! and a bounded number of retries.

use crate::config::{IndexerConfig, RetryConfig};
use crate::storage::{CommitOutcome, RewindSummary, Store};
use crate::types::{Block, FinalizeOperation, PuzzleReward, StakeReward, TransactionStatus};
use crate::utils::clock::Clock;
use crate::utils::error::{IndexerError, Result};
use crate::utils::retry::{is_persistence, with_retry};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Net balance movement of one address within one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceChange {
    pub address: String,
    pub delta: i64,
}

/// Calls to one program function within one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramCall {
    pub program_id: String,
    pub function_name: String,
    pub calls: u64,
}

/// A finalize operation together with the transaction that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingChange {
    pub transaction_id: String,
    pub operation: FinalizeOperation,
}

/// Everything persisted for one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRows {
    pub block: Block,
    pub stake_rewards: Vec<StakeReward>,
    pub puzzle_rewards: Vec<PuzzleReward>,
    pub balance_changes: Vec<BalanceChange>,
    pub program_calls: Vec<ProgramCall>,
    /// Finalize operations of accepted transactions, in execution order.
    pub mapping_changes: Vec<MappingChange>,
    pub total_supply: u64,
}

fn share(total: u64, part: u64, whole: u128) -> u64 {
    if whole == 0 {
        return 0;
    }
    // part <= whole, so the quotient never exceeds `total`
    u64::try_from(u128::from(total) * u128::from(part) / whole).unwrap_or(total)
}

/// Splits the block reward between committee members by stake.
///
/// Stakes are summed per address first; zero rewards are dropped. The result
/// is ordered by address, one entry per address.
#[must_use]
pub fn staking_rewards(block: &Block) -> Vec<StakeReward> {
    let mut stakes: BTreeMap<&str, u64> = BTreeMap::new();
    for staker in &block.stakers {
        let entry = stakes.entry(staker.address.as_str()).or_default();
        *entry = entry.saturating_add(staker.stake);
    }
    let total_stake: u128 = stakes.values().map(|s| u128::from(*s)).sum();

    stakes
        .into_iter()
        .filter_map(|(address, stake)| {
            let amount = share(block.block_reward, stake, total_stake);
            (amount > 0).then(|| StakeReward {
                height: block.height,
                address: address.to_string(),
                amount,
            })
        })
        .collect()
}

/// Splits the puzzle reward between accepted solutions by target.
#[must_use]
pub fn puzzle_rewards(block: &Block) -> Vec<PuzzleReward> {
    let total_target: u128 = block.solutions.iter().map(|s| u128::from(s.target)).sum();

    block
        .solutions
        .iter()
        .map(|solution| PuzzleReward {
            height: block.height,
            solution_id: solution.id.clone(),
            address: solution.address.clone(),
            target: solution.target,
            amount: share(block.puzzle_reward, solution.target, total_target),
        })
        .collect()
}

/// Derives every row stored for `block`.
///
/// `parent_supply` is the total supply after the previous block (the
/// configured genesis supply for the first indexed block).
///
/// # Errors
///
/// Returns `IndexerError::DecodingError` when an amount does not fit the
/// signed 64-bit range used by the store.
pub fn derive_rows(block: &Block, parent_supply: u64) -> Result<BlockRows> {
    let stake_rewards = staking_rewards(block);
    let puzzle_rewards = puzzle_rewards(block);

    let mut deltas: BTreeMap<String, i128> = BTreeMap::new();
    for reward in &stake_rewards {
        *deltas.entry(reward.address.clone()).or_default() += i128::from(reward.amount);
    }
    for reward in &puzzle_rewards {
        *deltas.entry(reward.address.clone()).or_default() += i128::from(reward.amount);
    }

    let mut calls: BTreeMap<(&str, &str), u64> = BTreeMap::new();
    let mut mapping_changes = Vec::new();

    for tx in &block.transactions {
        if let Some(payer) = &tx.fee_payer {
            if tx.fee > 0 {
                *deltas.entry(payer.clone()).or_default() -= i128::from(tx.fee);
            }
        }

        // rejected transactions only pay their fee
        if tx.status == TransactionStatus::Rejected {
            continue;
        }

        for transition in &tx.transitions {
            *calls
                .entry((
                    transition.program_id.as_str(),
                    transition.function_name.as_str(),
                ))
                .or_default() += 1;
        }

        mapping_changes.extend(tx.finalize.iter().cloned().map(|operation| MappingChange {
            transaction_id: tx.id.clone(),
            operation,
        }));
    }

    let balance_changes = deltas
        .into_iter()
        .filter(|(_, delta)| *delta != 0)
        .map(|(address, delta)| {
            i64::try_from(delta)
                .map(|delta| BalanceChange {
                    address: address.clone(),
                    delta,
                })
                .map_err(|_| {
                    IndexerError::DecodingError(format!(
                        "balance delta {delta} for {address} at height {} is out of range",
                        block.height
                    ))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let program_calls = calls
        .into_iter()
        .map(|((program_id, function_name), calls)| ProgramCall {
            program_id: program_id.to_string(),
            function_name: function_name.to_string(),
            calls,
        })
        .collect();

    let supply = i128::from(parent_supply) + i128::from(block.block_reward)
        + i128::from(block.puzzle_reward)
        - i128::from(block.total_fees());
    let total_supply = u64::try_from(supply.max(0)).map_err(|_| {
        IndexerError::DecodingError(format!(
            "total supply {supply} at height {} is out of range",
            block.height
        ))
    })?;

    Ok(BlockRows {
        block: block.clone(),
        stake_rewards,
        puzzle_rewards,
        balance_changes,
        program_calls,
        mapping_changes,
        total_supply,
    })
}

/// Commits blocks and rewinds through the store.
///
/// A commit is retried on store failures up to the configured budget, each
/// attempt bounded by the persistence timeout. It is never skipped: when the
/// budget runs out the error reaches the sync loop, which pauses.
pub struct Indexer {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    timeout: Duration,
    genesis_supply: u64,
}

impl Indexer {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &IndexerConfig) -> Self {
        let retry = RetryConfig {
            max_retries: config.sync.persistence_retries,
            ..config.retry.clone()
        };
        Self {
            store,
            clock,
            retry,
            timeout: config.sync.persistence_timeout(),
            genesis_supply: config.genesis_supply,
        }
    }

    /// Access to the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn parent_supply(&self, height: u64) -> Result<u64> {
        if height == 0 {
            return Ok(self.genesis_supply);
        }
        Ok(self
            .store
            .supply_at(height - 1)
            .await?
            .unwrap_or(self.genesis_supply))
    }

    /// Persists `block` and advances the durable cursor onto it.
    ///
    /// # Errors
    ///
    /// - `LinkageViolation` if the block does not extend the stored chain.
    /// - `RetryExhausted` once the persistence retries are spent.
    #[tracing::instrument(skip_all, fields(height = block.height, hash = %block.hash))]
    pub async fn commit(&self, block: &Block) -> Result<CommitOutcome> {
        let parent_supply = self.parent_supply(block.height).await?;
        let rows = derive_rows(block, parent_supply)?;

        let (store, rows, timeout) = (&self.store, &rows, self.timeout);
        let outcome = with_retry(
            &self.retry,
            self.clock.as_ref(),
            "commit_block",
            is_persistence,
            || async move {
                tokio::time::timeout(timeout, store.commit_block(rows))
                    .await
                    .map_err(|_| {
                        IndexerError::Timeout(format!("commit of block {}", rows.block.height))
                    })?
            },
        )
        .await?;

        match &outcome {
            CommitOutcome::Committed(summary) => tracing::debug!(
                transactions = summary.transactions,
                total_supply = summary.total_supply,
                "Block committed"
            ),
            CommitOutcome::AlreadyCommitted => {
                tracing::debug!("Block already committed, skipping");
            }
        }

        Ok(outcome)
    }

    /// Removes everything above `ancestor` in one atomic unit.
    #[tracing::instrument(skip(self))]
    pub async fn rewind(&self, ancestor: Option<u64>) -> Result<RewindSummary> {
        let (store, timeout) = (&self.store, self.timeout);
        let summary = with_retry(
            &self.retry,
            self.clock.as_ref(),
            "rewind",
            is_persistence,
            || async move {
                tokio::time::timeout(timeout, store.rewind_to(ancestor))
                    .await
                    .map_err(|_| IndexerError::Timeout("rewind".to_string()))?
            },
        )
        .await?;

        tracing::info!(
            removed_blocks = summary.removed_blocks,
            cursor = ?summary.cursor.map(|c| c.height),
            "Rewind committed"
        );
        Ok(summary)
    }
}
