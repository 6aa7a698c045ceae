//! Explorer indexer binary.
//!
//! Reads the configuration from the environment, connects to Postgres, the
//! cache and the peer, then runs the sync loop until Ctrl+C or a fatal
//! divergence.

use explorer_indexer::cache::{CacheBackend, MemoryCache, RedisCache};
use explorer_indexer::core::{
    CacheInvalidator, Fetcher, HttpPeer, Indexer, JsonBlockDecoder, ReorgDetector, SyncLoop,
    TokioClock,
};
use explorer_indexer::storage::{PgStore, Store};
use explorer_indexer::telemetry::{TelemetryConfig, init_telemetry};
use explorer_indexer::utils::logging::{self, LogLevel};
use explorer_indexer::{IndexerConfig, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry(&TelemetryConfig::from_env());

    let config = IndexerConfig::from_env()?;
    logging::log_startup(
        &config.peer.network,
        &config.peer.url,
        &config.database_url,
        config.start_height,
    );

    let store: Arc<dyn Store> = Arc::new(PgStore::new(&config.database_url).await?);
    store.initialize().await?;
    logging::log(LogLevel::Success, "Database schema ready");

    let (backend, prefix): (Arc<dyn CacheBackend>, String) = match &config.cache {
        Some(cache) => (Arc::new(RedisCache::connect(&cache.url).await?), cache.prefix.clone()),
        None => {
            logging::log(
                LogLevel::Warning,
                "REDIS_URL not set, caching aggregates in process memory",
            );
            (Arc::new(MemoryCache::new()), "explorer".to_string())
        }
    };

    let clock = Arc::new(TokioClock);
    let peer = HttpPeer::new(
        &config.peer.url,
        &config.peer.network,
        config.sync.request_timeout(),
    )?;
    let fetcher = Fetcher::new(
        Arc::new(peer),
        Arc::new(JsonBlockDecoder::new()),
        clock.clone(),
        &config,
    );
    let detector = ReorgDetector::new(store.clone(), config.sync.max_reorg_depth);
    let indexer = Indexer::new(store.clone(), clock.clone(), &config);
    let invalidator = Arc::new(CacheInvalidator::new(
        backend,
        store,
        prefix,
        config.pledge_addresses.clone(),
    ));

    let sync = SyncLoop::new(&config, fetcher, detector, indexer, invalidator, clock);

    let mut status = sync.subscribe();
    let max_lag = config.sync.max_sync_lag;
    tokio::spawn(async move {
        let mut last = None;
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            if last != Some(snapshot.state) {
                tracing::info!(
                    state = %snapshot.state,
                    lag = ?snapshot.lag,
                    synced = snapshot.is_synced(max_lag),
                    "Sync status"
                );
                last = Some(snapshot.state);
            }
        }
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing the current block");
            shutdown.cancel();
        }
    });

    sync.run(cancel).await
}
