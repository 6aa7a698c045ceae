//! Chain data model shared by every stage of the pipeline.
//!
//! The decoder produces [`Block`] values, the indexer turns them into rows,
//! and the sync loop tracks progress with a [`ChainCursor`].

pub mod block;
pub mod cursor;

pub use block::{
    Block, BlockHash, FinalizeOperation, PuzzleReward, PuzzleSolution, StakeReward, Staker,
    Transaction, TransactionKind, TransactionStatus, Transition, HASH_LEN,
};
pub use cursor::ChainCursor;
