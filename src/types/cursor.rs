//! Chain cursor: the durable pointer to the last indexed block.

use super::block::BlockHash;
use serde::{Deserialize, Serialize};

/// Last successfully indexed height and its block hash.
///
/// The cursor is an owned value handed to each pipeline stage; the durable
/// copy lives in the store and is rewritten inside every commit and rewind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCursor {
    pub height: u64,
    pub hash: BlockHash,
}

impl ChainCursor {
    #[must_use]
    pub fn new(height: u64, hash: BlockHash) -> Self {
        Self { height, hash }
    }

    /// Height the pipeline should fetch next.
    #[must_use]
    pub fn next_height(&self) -> u64 {
        self.height.saturating_add(1)
    }

    /// Next height to fetch given an optional cursor and the configured
    /// start height used while nothing has been indexed yet.
    #[must_use]
    pub fn next_height_or(cursor: Option<&Self>, start_height: u64) -> u64 {
        cursor.map_or(start_height, Self::next_height)
    }
}
