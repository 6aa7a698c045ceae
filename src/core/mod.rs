pub mod cache;
pub mod decoder;
pub mod fetcher;
pub mod indexer;
pub mod peer;
pub mod reorg;
pub mod sync;

pub use cache::{CacheInvalidator, CacheKeys, CacheQueue, LeaderboardEntry, TipSnapshot};
pub use decoder::{BlockDecoder, JsonBlockDecoder};
pub use fetcher::{FetchOutcome, Fetcher};
pub use indexer::{BlockRows, Indexer, derive_rows};
pub use peer::{HttpPeer, Peer};
pub use reorg::{Linkage, ReorgDetector};
pub use sync::{Clock, StepOutcome, SyncLoop, SyncState, SyncStatus, TokioClock};
