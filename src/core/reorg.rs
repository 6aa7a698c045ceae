//! Divergence detection between the peer's chain and the indexed chain.
//!
//! [`ReorgDetector::classify`] decides what a fetched block means relative to
//! the cursor. When the chains disagree, [`ReorgDetector::find_common_ancestor`]
//! walks backward from the anchor comparing the peer's hash with the stored
//! hash at each height, up to the configured depth.

use crate::core::fetcher::{FetchOutcome, Fetcher};
use crate::storage::Store;
use crate::types::{Block, ChainCursor};
use crate::utils::error::{IndexerError, Result};
use std::sync::Arc;

/// How a fetched block relates to the indexed chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// The block is the next one and links onto the cursor.
    Extend,
    /// The same block is already stored, or it lies below the indexed range.
    AlreadyIndexed,
    /// The peer disagrees with the stored chain at `anchor`.
    Diverged { anchor: u64 },
}

/// Compares fetched blocks with the store and locates common ancestors.
pub struct ReorgDetector {
    store: Arc<dyn Store>,
    max_depth: u64,
}

impl ReorgDetector {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, max_depth: u64) -> Self {
        Self { store, max_depth }
    }

    #[must_use]
    pub fn max_depth(&self) -> u64 {
        self.max_depth
    }

    /// Classifies `block` against `cursor`.
    ///
    /// # Errors
    ///
    /// Returns `InternalError` for a block above the next expected height,
    /// which the sync loop never requests.
    pub async fn classify(&self, block: &Block, cursor: Option<&ChainCursor>) -> Result<Linkage> {
        let Some(cursor) = cursor else {
            return Ok(Linkage::Extend);
        };

        if block.height == cursor.next_height() {
            if block.previous_hash == cursor.hash {
                return Ok(Linkage::Extend);
            }
            tracing::warn!(
                height = block.height,
                expected = %cursor.hash,
                found = %block.previous_hash,
                "Parent hash mismatch at tip"
            );
            return Ok(Linkage::Diverged {
                anchor: cursor.height,
            });
        }

        if block.height > cursor.height {
            return Err(IndexerError::InternalError(format!(
                "block {} skips ahead of cursor {}",
                block.height, cursor.height
            )));
        }

        match self.store.read_block_hash(block.height).await? {
            Some(stored) if stored == block.hash => Ok(Linkage::AlreadyIndexed),
            Some(stored) => {
                tracing::warn!(
                    height = block.height,
                    stored = %stored,
                    peer = %block.hash,
                    "Stored block differs from peer"
                );
                Ok(Linkage::Diverged {
                    anchor: block.height,
                })
            }
            None => Ok(Linkage::AlreadyIndexed),
        }
    }

    /// Highest height at or below `anchor` where the peer and the store agree.
    ///
    /// Up to `max_depth` blocks above the ancestor may be rewound, so the
    /// deepest height compared is `anchor - max_depth`. `None` means the
    /// search left the indexed range without a match (the store started above
    /// genesis) and everything must be rewound.
    ///
    /// Genesis is the root every chain shares. A peer that disagrees at
    /// height 0 is on another network, which no rewind can repair.
    ///
    /// # Errors
    ///
    /// - `ChainDivergenceTooDeep` if no height within `max_depth` blocks of
    ///   the anchor agrees, or if the peer's genesis differs.
    /// - Fetch and store errors are propagated unchanged.
    #[tracing::instrument(skip(self, fetcher))]
    pub async fn find_common_ancestor(&self, anchor: u64, fetcher: &Fetcher) -> Result<Option<u64>> {
        let mut height = anchor;

        loop {
            if anchor - height > self.max_depth {
                return Err(IndexerError::ChainDivergenceTooDeep {
                    anchor,
                    max_depth: self.max_depth,
                });
            }

            let Some(stored) = self.store.read_block_hash(height).await? else {
                tracing::info!(height, "Search left the indexed range");
                return Ok(None);
            };

            let agrees = match fetcher.fetch(height).await? {
                FetchOutcome::Block(peer_block) => peer_block.hash == stored,
                FetchOutcome::NotYetAvailable => false,
            };

            if agrees {
                tracing::info!(ancestor = height, depth = anchor - height, "Common ancestor found");
                return Ok(Some(height));
            }

            if height == 0 {
                tracing::error!(anchor, "Peer disagrees at genesis");
                return Err(IndexerError::ChainDivergenceTooDeep {
                    anchor,
                    max_depth: self.max_depth,
                });
            }
            height -= 1;
        }
    }
}
