//! Block fetching module.
//!
//! The [`Fetcher`] asks the peer for blocks by height and decodes them. Peer
//! calls carry a deadline and transient failures are retried with backoff;
//! once the retry budget is spent the failure surfaces as a `PeerError` and
//! the sync loop pauses. A height the peer does not have yet is not an error:
//! it is reported as [`FetchOutcome::NotYetAvailable`].

use crate::config::{IndexerConfig, RetryConfig};
use crate::core::decoder::BlockDecoder;
use crate::core::peer::Peer;
use crate::types::Block;
use crate::utils::clock::Clock;
use crate::utils::error::{IndexerError, Result};
use crate::utils::retry::{is_transient, with_retry};
use futures_util::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Result of asking for one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Block(Block),
    /// The peer has not produced this height yet.
    NotYetAvailable,
}

/// Block fetcher for retrieving and decoding blocks from the peer.
///
/// # Example
///
/// ```no_run
/// # use explorer_indexer::core::decoder::JsonBlockDecoder;
/// # use explorer_indexer::core::fetcher::{FetchOutcome, Fetcher};
/// # use explorer_indexer::core::peer::HttpPeer;
/// # use explorer_indexer::core::sync::TokioClock;
/// # use explorer_indexer::IndexerConfig;
/// # use std::sync::Arc;
/// # async fn example(config: IndexerConfig) -> explorer_indexer::Result<()> {
/// let peer = HttpPeer::new(&config.peer.url, &config.peer.network, config.sync.request_timeout())?;
/// let fetcher = Fetcher::new(
///     Arc::new(peer),
///     Arc::new(JsonBlockDecoder::new()),
///     Arc::new(TokioClock),
///     &config,
/// );
///
/// if let FetchOutcome::Block(block) = fetcher.fetch(42).await? {
///     println!("block 42 has {} transactions", block.transactions.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct Fetcher {
    peer: Arc<dyn Peer>,
    decoder: Arc<dyn BlockDecoder>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    timeout: Duration,
}

impl Fetcher {
    #[must_use]
    pub fn new(
        peer: Arc<dyn Peer>,
        decoder: Arc<dyn BlockDecoder>,
        clock: Arc<dyn Clock>,
        config: &IndexerConfig,
    ) -> Self {
        Self {
            peer,
            decoder,
            clock,
            retry: config.retry.clone(),
            timeout: config.sync.request_timeout(),
        }
    }

    /// Runs one peer call under the request deadline and the retry policy.
    async fn call<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.timeout;
        let op = &op;
        let result = with_retry(
            &self.retry,
            self.clock.as_ref(),
            operation,
            is_transient,
            || async move {
                tokio::time::timeout(timeout, op())
                    .await
                    .map_err(|_| IndexerError::Timeout(format!("{operation} after {timeout:?}")))?
            },
        )
        .await;

        result.map_err(|err| match err {
            IndexerError::RetryExhausted {
                attempts,
                last_error,
            } => IndexerError::PeerError(format!(
                "{operation} failed after {attempts} attempts: {last_error}"
            )),
            other => other,
        })
    }

    /// Fetches and decodes the block at `height`.
    ///
    /// # Errors
    ///
    /// - `PeerError` once transient failures exhaust the retry budget.
    /// - `DecodingError` if the payload does not decode, or decodes to a
    ///   different height.
    pub async fn fetch(&self, height: u64) -> Result<FetchOutcome> {
        let peer = &self.peer;
        let raw = self
            .call("get_block", || async move { peer.get_block(height).await })
            .await?;

        let Some(raw) = raw else {
            tracing::trace!(height, "Block not yet available");
            return Ok(FetchOutcome::NotYetAvailable);
        };

        let block = self.decoder.decode(&raw)?;
        if block.height != height {
            return Err(IndexerError::DecodingError(format!(
                "requested block {height}, peer returned block {}",
                block.height
            )));
        }

        Ok(FetchOutcome::Block(block))
    }

    /// Fetches up to `count` consecutive blocks starting at `start`
    /// concurrently.
    ///
    /// The result is in height order and stops before the first height that
    /// is not available or failed. A failure is only returned when it hits
    /// `start` itself; later failures resurface when those heights are
    /// fetched again.
    pub async fn fetch_range(&self, start: u64, count: u64) -> Result<Vec<Block>> {
        let heights = (0..count.max(1)).map_while(|offset| start.checked_add(offset));
        let results = join_all(heights.map(|height| self.fetch(height))).await;

        let mut blocks = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(FetchOutcome::Block(block)) => blocks.push(block),
                Ok(FetchOutcome::NotYetAvailable) => break,
                Err(err) if blocks.is_empty() => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        height = start + blocks.len() as u64,
                        error = %err,
                        "Prefetch stopped early"
                    );
                    break;
                }
            }
        }

        Ok(blocks)
    }

    /// Current tip height reported by the peer.
    pub async fn tip_height(&self) -> Result<u64> {
        let peer = &self.peer;
        self.call("get_tip_height", || async move { peer.get_tip_height().await })
            .await
    }
}
