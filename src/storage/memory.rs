//! In-memory store.
//!
//! Keeps the derived rows of every indexed height in a `BTreeMap` keyed by
//! height, plus the folded state (balances, current mapping values) that the
//! relational backend keeps in its own tables. Useful for unit tests,
//! integration tests and dry runs against a live peer.

use super::{
    ChainStats, CommitOutcome, CommitSummary, ProverTotal, RewindSummary, Store, check_extends,
};
use crate::core::indexer::BlockRows;
use crate::types::{BlockHash, ChainCursor, FinalizeOperation, PuzzleReward, StakeReward};
use crate::utils::error::{IndexerError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::Mutex;

type MappingKey = (String, String, String);

#[derive(Debug, Clone)]
struct HistoryEntry {
    height: u64,
    key: MappingKey,
    /// `None` records a removal.
    value: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<u64, BlockRows>,
    balances: HashMap<String, i64>,
    mappings: HashMap<(String, String), u64>,
    mapping_values: HashMap<MappingKey, String>,
    mapping_history: Vec<HistoryEntry>,
    cursor: Option<ChainCursor>,
}

impl MemoryState {
    fn apply_mapping_change(&mut self, height: u64, operation: &FinalizeOperation) {
        match operation {
            FinalizeOperation::InitializeMapping {
                program_id,
                mapping,
            } => {
                self.mappings
                    .entry((program_id.clone(), mapping.clone()))
                    .or_insert(height);
            }
            FinalizeOperation::UpdateKeyValue {
                program_id,
                mapping,
                key,
                value,
            } => {
                let key = (program_id.clone(), mapping.clone(), key.clone());
                self.mapping_values.insert(key.clone(), value.clone());
                self.mapping_history.push(HistoryEntry {
                    height,
                    key,
                    value: Some(value.clone()),
                });
            }
            FinalizeOperation::RemoveKeyValue {
                program_id,
                mapping,
                key,
            } => {
                let key = (program_id.clone(), mapping.clone(), key.clone());
                self.mapping_values.remove(&key);
                self.mapping_history.push(HistoryEntry {
                    height,
                    key,
                    value: None,
                });
            }
        }
    }

    fn latest_value(&self, key: &MappingKey, max_height: Option<u64>) -> Option<String> {
        self.mapping_history
            .iter()
            .rev()
            .filter(|h| max_height.is_none_or(|max| h.height <= max))
            .find(|h| &h.key == key)
            .and_then(|h| h.value.clone())
    }

    fn prover_totals(&self) -> BTreeMap<&str, ProverTotal> {
        let mut totals: BTreeMap<&str, ProverTotal> = BTreeMap::new();
        for reward in self.rows.values().flat_map(|r| r.puzzle_rewards.iter()) {
            let entry = totals
                .entry(reward.address.as_str())
                .or_insert_with(|| ProverTotal {
                    address: reward.address.clone(),
                    solutions: 0,
                    total_reward: 0,
                });
            entry.solutions += 1;
            entry.total_reward = entry.total_reward.saturating_add(reward.amount);
        }
        totals
    }
}

/// In-memory implementation of [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of blocks currently stored.
    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    /// Returns `true` if no blocks are stored.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.rows.is_empty()
    }

    /// Heights currently stored, ascending.
    pub async fn heights(&self) -> Vec<u64> {
        self.state.lock().await.rows.keys().copied().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn read_cursor(&self) -> Result<Option<ChainCursor>> {
        Ok(self.state.lock().await.cursor)
    }

    async fn read_block_hash(&self, height: u64) -> Result<Option<BlockHash>> {
        Ok(self
            .state
            .lock()
            .await
            .rows
            .get(&height)
            .map(|r| r.block.hash))
    }

    async fn commit_block(&self, rows: &BlockRows) -> Result<CommitOutcome> {
        let mut state = self.state.lock().await;
        let block = &rows.block;

        if let Some(existing) = state.rows.get(&block.height) {
            if existing.block.hash == block.hash {
                return Ok(CommitOutcome::AlreadyCommitted);
            }
            return Err(IndexerError::LinkageViolation {
                height: block.height,
                expected: existing.block.hash.to_string(),
                found: block.hash.to_string(),
            });
        }

        check_extends(state.cursor.as_ref(), block)?;

        // validation is done; nothing below can fail
        for change in &rows.balance_changes {
            let balance = state.balances.entry(change.address.clone()).or_default();
            *balance = balance.saturating_add(change.delta);
        }
        for change in &rows.mapping_changes {
            state.apply_mapping_change(block.height, &change.operation);
        }
        state.rows.insert(block.height, rows.clone());
        state.cursor = Some(ChainCursor::new(block.height, block.hash));

        Ok(CommitOutcome::Committed(CommitSummary::from_rows(rows)))
    }

    async fn rewind_to(&self, ancestor: Option<u64>) -> Result<RewindSummary> {
        let mut state = self.state.lock().await;

        let first_removed = match ancestor {
            None => 0,
            Some(height) => match height.checked_add(1) {
                Some(next) => next,
                None => {
                    return Ok(RewindSummary {
                        removed_blocks: 0,
                        cursor: state.cursor,
                    });
                }
            },
        };

        let removed = state.rows.split_off(&first_removed);

        let mut touched: BTreeSet<MappingKey> = BTreeSet::new();
        for rows in removed.values() {
            for change in &rows.balance_changes {
                let balance = state.balances.entry(change.address.clone()).or_default();
                *balance = balance.saturating_sub(change.delta);
            }
        }
        for entry in &state.mapping_history {
            if entry.height >= first_removed {
                touched.insert(entry.key.clone());
            }
        }

        state.mapping_history.retain(|h| h.height < first_removed);
        state.mappings.retain(|_, height| *height < first_removed);
        for key in touched {
            match state.latest_value(&key, None) {
                Some(value) => {
                    state.mapping_values.insert(key, value);
                }
                None => {
                    state.mapping_values.remove(&key);
                }
            }
        }

        state.cursor = state
            .rows
            .last_key_value()
            .map(|(height, rows)| ChainCursor::new(*height, rows.block.hash));

        Ok(RewindSummary {
            removed_blocks: removed.len() as u64,
            cursor: state.cursor,
        })
    }

    async fn chain_stats(&self) -> Result<ChainStats> {
        let state = self.state.lock().await;
        let tip = state.rows.last_key_value();
        Ok(ChainStats {
            tip_height: tip.map(|(height, _)| *height),
            block_count: state.rows.len() as u64,
            transaction_count: state
                .rows
                .values()
                .map(|r| r.block.transactions.len() as u64)
                .sum(),
            total_supply: tip.map(|(_, rows)| rows.total_supply),
        })
    }

    async fn find_linkage_break(&self, from: u64, to: u64) -> Result<Option<u64>> {
        if from >= to {
            return Ok(None);
        }
        let state = self.state.lock().await;
        let mut parent: Option<(u64, BlockHash)> = None;
        for (height, rows) in state.rows.range(from..=to) {
            if let Some((parent_height, parent_hash)) = parent {
                if parent_height + 1 == *height && rows.block.previous_hash != parent_hash {
                    return Ok(Some(*height));
                }
            }
            parent = Some((*height, rows.block.hash));
        }
        Ok(None)
    }

    async fn supply_at(&self, height: u64) -> Result<Option<u64>> {
        Ok(self
            .state
            .lock()
            .await
            .rows
            .get(&height)
            .map(|r| r.total_supply))
    }

    async fn stake_rewards_at(&self, height: u64) -> Result<Vec<StakeReward>> {
        Ok(self
            .state
            .lock()
            .await
            .rows
            .get(&height)
            .map(|r| r.stake_rewards.clone())
            .unwrap_or_default())
    }

    async fn puzzle_rewards_at(&self, height: u64) -> Result<Vec<PuzzleReward>> {
        Ok(self
            .state
            .lock()
            .await
            .rows
            .get(&height)
            .map(|r| r.puzzle_rewards.clone())
            .unwrap_or_default())
    }

    async fn prover_leaderboard(&self, limit: usize) -> Result<Vec<ProverTotal>> {
        let state = self.state.lock().await;
        let mut totals: Vec<ProverTotal> = state.prover_totals().into_values().collect();
        totals.sort_by(|a, b| {
            b.total_reward
                .cmp(&a.total_reward)
                .then_with(|| a.address.cmp(&b.address))
        });
        totals.truncate(limit);
        Ok(totals)
    }

    async fn prover_total(&self, address: &str) -> Result<Option<ProverTotal>> {
        let state = self.state.lock().await;
        Ok(state.prover_totals().remove(address))
    }

    async fn balance(&self, address: &str) -> Result<Option<i64>> {
        Ok(self.state.lock().await.balances.get(address).copied())
    }

    async fn mapping_value(
        &self,
        program_id: &str,
        mapping: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let key = (program_id.to_string(), mapping.to_string(), key.to_string());
        Ok(self.state.lock().await.mapping_values.get(&key).cloned())
    }

    async fn mapping_value_at(
        &self,
        program_id: &str,
        mapping: &str,
        key: &str,
        height: u64,
    ) -> Result<Option<String>> {
        let key = (program_id.to_string(), mapping.to_string(), key.to_string());
        Ok(self.state.lock().await.latest_value(&key, Some(height)))
    }

    async fn program_call_count(&self, program_id: &str) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .flat_map(|r| r.program_calls.iter())
            .filter(|c| c.program_id == program_id)
            .map(|c| c.calls)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::indexer::derive_rows;
    use crate::types::{Block, Transaction, TransactionKind, TransactionStatus};

    fn block(height: u64, tag: u8, parent: BlockHash, ops: Vec<FinalizeOperation>) -> Block {
        Block {
            height,
            hash: BlockHash([tag; 32]),
            previous_hash: parent,
            timestamp: 1_700_000_000 + height as i64,
            transactions: vec![Transaction {
                id: format!("at1{height}-{tag}"),
                kind: TransactionKind::Execute,
                status: TransactionStatus::Accepted,
                fee: 10,
                fee_payer: Some("aleo1payer".into()),
                reject_reason: None,
                transitions: vec![],
                finalize: ops,
            }],
            block_reward: 0,
            puzzle_reward: 0,
            stakers: vec![],
            solutions: vec![],
        }
    }

    fn update(value: &str) -> FinalizeOperation {
        FinalizeOperation::UpdateKeyValue {
            program_id: "token.aleo".into(),
            mapping: "balances".into(),
            key: "aleo1k".into(),
            value: value.into(),
        }
    }

    #[tokio::test]
    async fn test_commit_rejects_unlinked_block() {
        let store = MemoryStore::new();
        let b0 = block(0, 1, BlockHash::ZERO, vec![]);
        store.commit_block(&derive_rows(&b0, 0).unwrap()).await.unwrap();

        let orphan = block(1, 2, BlockHash([9; 32]), vec![]);
        let err = store
            .commit_block(&derive_rows(&orphan, 0).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::LinkageViolation { height: 1, .. }));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_rewind_restores_mapping_and_balance() {
        let store = MemoryStore::new();
        let b0 = block(0, 1, BlockHash::ZERO, vec![update("1u64")]);
        let b1 = block(1, 2, b0.hash, vec![update("2u64")]);
        let b2 = block(
            2,
            3,
            b1.hash,
            vec![FinalizeOperation::RemoveKeyValue {
                program_id: "token.aleo".into(),
                mapping: "balances".into(),
                key: "aleo1k".into(),
            }],
        );
        for b in [&b0, &b1, &b2] {
            store.commit_block(&derive_rows(b, 0).unwrap()).await.unwrap();
        }

        assert_eq!(
            store.mapping_value("token.aleo", "balances", "aleo1k").await.unwrap(),
            None
        );
        assert_eq!(
            store
                .mapping_value_at("token.aleo", "balances", "aleo1k", 1)
                .await
                .unwrap(),
            Some("2u64".into())
        );
        assert_eq!(store.balance("aleo1payer").await.unwrap(), Some(-30));

        let summary = store.rewind_to(Some(0)).await.unwrap();
        assert_eq!(summary.removed_blocks, 2);
        assert_eq!(summary.cursor, Some(ChainCursor::new(0, b0.hash)));
        assert_eq!(
            store.mapping_value("token.aleo", "balances", "aleo1k").await.unwrap(),
            Some("1u64".into())
        );
        assert_eq!(store.balance("aleo1payer").await.unwrap(), Some(-10));
    }

    #[tokio::test]
    async fn test_rewind_everything() {
        let store = MemoryStore::new();
        let b0 = block(5, 1, BlockHash::ZERO, vec![]);
        store.commit_block(&derive_rows(&b0, 0).unwrap()).await.unwrap();

        let summary = store.rewind_to(None).await.unwrap();
        assert_eq!(summary.removed_blocks, 1);
        assert_eq!(summary.cursor, None);
        assert!(store.is_empty().await);
        assert_eq!(store.read_cursor().await.unwrap(), None);
    }
}
