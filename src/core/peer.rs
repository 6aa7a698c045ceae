//! Upstream peer access.
//!
//! The pipeline trusts exactly one peer. [`HttpPeer`] talks to its REST layer:
//!
//! ```text
//! GET {url}/{network}/block/{height}         raw block payload, 404 when absent
//! GET {url}/{network}/block/height/latest    tip height as a bare integer
//! ```

use crate::utils::error::{IndexerError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Source of raw block payloads.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Raw payload of the block at `height`, `None` if the peer does not have
    /// it yet.
    async fn get_block(&self, height: u64) -> Result<Option<Vec<u8>>>;

    /// Height of the peer's current tip.
    async fn get_tip_height(&self) -> Result<u64>;
}

/// Peer reached over HTTP.
///
/// # Example
///
/// ```no_run
/// # use explorer_indexer::core::peer::{HttpPeer, Peer};
/// # use std::time::Duration;
/// # async fn example() -> explorer_indexer::Result<()> {
/// let peer = HttpPeer::new("http://127.0.0.1:3030", "mainnet", Duration::from_secs(10))?;
/// let tip = peer.get_tip_height().await?;
/// let raw = peer.get_block(tip).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpPeer {
    client: Client,
    base: String,
}

impl HttpPeer {
    /// Creates a client rooted at `{url}/{network}`.
    ///
    /// # Errors
    ///
    /// Returns `RequestError` if the HTTP client cannot be built.
    pub fn new(url: &str, network: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: format!("{}/{}", url.trim_end_matches('/'), network),
        })
    }

    /// Base URL every endpoint hangs off.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn status_error(url: &str, status: StatusCode) -> IndexerError {
        IndexerError::PeerError(format!("GET {url} returned HTTP status {status}"))
    }
}

#[async_trait]
impl Peer for HttpPeer {
    async fn get_block(&self, height: u64) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/block/{height}", self.base);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::status_error(&url, status));
        }

        let body = response.bytes().await?;
        Ok(Some(body.to_vec()))
    }

    async fn get_tip_height(&self) -> Result<u64> {
        let url = format!("{}/block/height/latest", self.base);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::status_error(&url, status));
        }

        let body = response.text().await?;
        body.trim()
            .trim_matches('"')
            .parse::<u64>()
            .map_err(|e| IndexerError::PeerError(format!("invalid tip height '{body}': {e}")))
    }
}
