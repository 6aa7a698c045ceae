//! Shared doubles for the integration tests: a scripted peer whose chain can
//! be forked at will, a manual clock and a cache that always fails.

#![allow(dead_code)]

use async_trait::async_trait;
use explorer_indexer::cache::{CacheBackend, CacheEntry, MemoryCache};
use explorer_indexer::config::{IndexerConfig, IndexerConfigBuilder, SyncConfig};
use explorer_indexer::core::{
    CacheInvalidator, Clock, Fetcher, Indexer, JsonBlockDecoder, Peer, ReorgDetector, SyncLoop,
};
use explorer_indexer::storage::MemoryStore;
use explorer_indexer::types::{
    Block, BlockHash, FinalizeOperation, PuzzleSolution, Staker, Transaction, TransactionKind,
    TransactionStatus, Transition,
};
use explorer_indexer::{IndexerError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const PROVER: &str = "aleo1prover";
pub const VALIDATOR: &str = "aleo1validator";
pub const DELEGATOR: &str = "aleo1delegator";
pub const PAYER: &str = "aleo1payer";

/// Hash of the block at `height` on chain `fork`.
pub fn hash_of(fork: u8, height: u64) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[0] = fork;
    bytes[1..9].copy_from_slice(&height.to_be_bytes());
    bytes[31] = 0xaa;
    BlockHash(bytes)
}

/// A block with one transaction, two stakers and one accepted solution.
pub fn make_block(fork: u8, height: u64, previous_hash: BlockHash) -> Block {
    Block {
        height,
        hash: hash_of(fork, height),
        previous_hash,
        timestamp: 1_700_000_000 + height as i64,
        transactions: vec![Transaction {
            id: format!("at1{fork}x{height}"),
            kind: TransactionKind::Execute,
            status: TransactionStatus::Accepted,
            fee: 10,
            fee_payer: Some(PAYER.to_string()),
            reject_reason: None,
            transitions: vec![Transition {
                id: format!("au1{fork}x{height}"),
                program_id: "credits.aleo".to_string(),
                function_name: "transfer_public".to_string(),
                inputs: vec![],
                outputs: vec![],
            }],
            finalize: vec![FinalizeOperation::UpdateKeyValue {
                program_id: "credits.aleo".to_string(),
                mapping: "account".to_string(),
                key: PAYER.to_string(),
                value: format!("{fork}x{height}u64"),
            }],
        }],
        block_reward: 900,
        puzzle_reward: 100,
        stakers: vec![
            Staker {
                address: VALIDATOR.to_string(),
                stake: 2,
            },
            Staker {
                address: DELEGATOR.to_string(),
                stake: 1,
            },
        ],
        solutions: vec![PuzzleSolution {
            id: format!("puzzle{fork}x{height}"),
            address: PROVER.to_string(),
            target: 5,
        }],
    }
}

/// Peer serving a scripted chain.
#[derive(Default)]
pub struct ScriptedPeer {
    blocks: Mutex<BTreeMap<u64, Block>>,
    failures_left: AtomicU32,
    block_calls: AtomicU32,
}

impl ScriptedPeer {
    /// Linear chain `0..=tip` on fork 0.
    pub fn linear(tip: u64) -> Self {
        let peer = Self::default();
        peer.extend(0, tip);
        peer
    }

    /// Extends the current chain on `fork` up to `tip`.
    pub fn extend(&self, fork: u8, tip: u64) {
        let mut blocks = self.blocks.lock().unwrap();
        let start = blocks.keys().next_back().map_or(0, |h| h + 1);
        for height in start..=tip {
            let parent = blocks
                .get(&height.wrapping_sub(1))
                .map_or(BlockHash::ZERO, |b| b.hash);
            blocks.insert(height, make_block(fork, height, parent));
        }
    }

    /// Replaces every block from `from` upward with a new branch on `fork`
    /// ending at `tip`.
    pub fn fork_from(&self, from: u64, tip: u64, fork: u8) {
        self.blocks.lock().unwrap().split_off(&from);
        self.extend(fork, tip);
    }

    /// Drops every block above `tip`.
    pub fn truncate(&self, tip: u64) {
        self.blocks.lock().unwrap().split_off(&(tip + 1));
    }

    /// The next `n` `get_block` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn block_calls(&self) -> u32 {
        self.block_calls.load(Ordering::SeqCst)
    }

    pub fn hash_at(&self, height: u64) -> Option<BlockHash> {
        self.blocks.lock().unwrap().get(&height).map(|b| b.hash)
    }
}

#[async_trait]
impl Peer for ScriptedPeer {
    async fn get_block(&self, height: u64) -> Result<Option<Vec<u8>>> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(IndexerError::PeerError("connection reset".to_string()));
        }

        let block = self.blocks.lock().unwrap().get(&height).cloned();
        Ok(block.map(|b| serde_json::to_vec(&b).unwrap()))
    }

    async fn get_tip_height(&self) -> Result<u64> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default())
    }
}

/// Clock that only moves when told to. Sleeping advances it.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Cache whose every call fails.
pub struct FailingCache;

#[async_trait]
impl CacheBackend for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
        Err(IndexerError::CacheError("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _entry: &CacheEntry) -> Result<()> {
        Err(IndexerError::CacheError("connection refused".to_string()))
    }

    async fn evict(&self, _pattern: &str) -> Result<u64> {
        Err(IndexerError::CacheError("connection refused".to_string()))
    }
}

pub fn config(sync: SyncConfig) -> IndexerConfig {
    IndexerConfigBuilder::new()
        .with_database("postgresql://localhost/explorer_test")
        .with_peer("http://127.0.0.1:3030", "testnet")
        .with_genesis_supply(1_000_000)
        .with_pledge_addresses([PROVER])
        .with_sync(sync)
        .build()
        .unwrap()
}

/// Everything a sync loop needs, wired over in-memory doubles.
pub struct Harness {
    pub config: IndexerConfig,
    pub store: Arc<MemoryStore>,
    pub peer: Arc<ScriptedPeer>,
    pub clock: Arc<ManualClock>,
    pub cache: Arc<MemoryCache>,
    pub invalidator: Arc<CacheInvalidator>,
}

impl Harness {
    pub fn new(peer: ScriptedPeer, sync: SyncConfig) -> Self {
        Self::with_store(peer, sync, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(peer: ScriptedPeer, sync: SyncConfig, store: Arc<MemoryStore>) -> Self {
        let config = config(sync);
        let cache = Arc::new(MemoryCache::new());
        let invalidator = Arc::new(CacheInvalidator::new(
            cache.clone(),
            store.clone(),
            "explorer",
            config.pledge_addresses.clone(),
        ));
        Self {
            config,
            store,
            peer: Arc::new(peer),
            clock: Arc::new(ManualClock::new()),
            cache,
            invalidator,
        }
    }

    pub fn fetcher(&self) -> Fetcher {
        Fetcher::new(
            self.peer.clone(),
            Arc::new(JsonBlockDecoder::new()),
            self.clock.clone(),
            &self.config,
        )
    }

    pub fn indexer(&self) -> Indexer {
        Indexer::new(self.store.clone(), self.clock.clone(), &self.config)
    }

    pub fn sync_loop(&self) -> SyncLoop {
        SyncLoop::new(
            &self.config,
            self.fetcher(),
            ReorgDetector::new(self.store.clone(), self.config.sync.max_reorg_depth),
            self.indexer(),
            self.invalidator.clone(),
            self.clock.clone(),
        )
    }
}
