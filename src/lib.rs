//! `explorer-indexer` - block synchronization and indexing for a proof-based
//! chain explorer.
//!
//! The crate follows one trusted peer, decodes its blocks, detects and repairs
//! reorganizations, and keeps a denormalized relational index (blocks,
//! transactions, transitions, program calls, staking and prover rewards,
//! balances, program mappings) together with a cache of hot aggregates.
//!
//! # Quick Start
//!
//! ```no_run
//! use explorer_indexer::cache::MemoryCache;
//! use explorer_indexer::core::{
//!     CacheInvalidator, Fetcher, HttpPeer, Indexer, JsonBlockDecoder, ReorgDetector, SyncLoop,
//!     TokioClock,
//! };
//! use explorer_indexer::storage::{PgStore, Store};
//! use explorer_indexer::IndexerConfigBuilder;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = IndexerConfigBuilder::new()
//!         .with_database("postgresql://localhost/explorer")
//!         .with_peer("http://127.0.0.1:3030", "mainnet")
//!         .build()?;
//!
//!     let store: Arc<dyn Store> = Arc::new(PgStore::new(&config.database_url).await?);
//!     store.initialize().await?;
//!
//!     let clock = Arc::new(TokioClock);
//!     let peer = HttpPeer::new(&config.peer.url, &config.peer.network, config.sync.request_timeout())?;
//!     let fetcher = Fetcher::new(Arc::new(peer), Arc::new(JsonBlockDecoder::new()), clock.clone(), &config);
//!     let detector = ReorgDetector::new(store.clone(), config.sync.max_reorg_depth);
//!     let indexer = Indexer::new(store.clone(), clock.clone(), &config);
//!     let invalidator = Arc::new(CacheInvalidator::new(
//!         Arc::new(MemoryCache::new()),
//!         store,
//!         "explorer",
//!         config.pledge_addresses.clone(),
//!     ));
//!
//!     let sync = SyncLoop::new(&config, fetcher, detector, indexer, invalidator, clock);
//!     sync.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! 1. **Peer** - raw block payloads and the tip height over HTTP
//! 2. **Decoder** - payload to [`types::Block`]
//! 3. **Fetcher** - timeouts, retries with backoff, concurrent prefetch
//! 4. **Reorg detector** - linkage checks and the common ancestor search
//! 5. **Indexer** - derived rows, one atomic commit per block
//! 6. **Cache invalidator** - refresh on commit, evict on rewind, applied by a background worker
//! 7. **Sync loop** - the state machine driving all of the above

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub use config::{IndexerConfig, IndexerConfigBuilder};
pub use crate::core::sync::{SyncLoop, SyncState, SyncStatus};
pub use storage::{MemoryStore, PgStore, Store};
pub use utils::error::{IndexerError, Result};

pub mod cache;
pub mod config;
pub mod core;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod utils;
