//! Error types for indexer operations.
//!
//! This module defines a comprehensive error enumeration using `thiserror`
//! to provide clear, actionable error reporting throughout the pipeline.

use thiserror::Error;

/// Custom error type for indexer operations.
///
/// This error type covers all failure modes of the pipeline, from
/// configuration issues to runtime failures talking to the peer, the
/// relational store and the cache.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Errors encountered during database operations.
    ///
    /// This variant automatically wraps `sqlx::Error` using the `#[from]` attribute,
    /// allowing seamless error propagation with the `?` operator.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Errors while decoding raw block bytes supplied by the peer.
    ///
    /// Data from the trusted peer that fails to decode indicates a protocol
    /// mismatch, so the height is not retried automatically.
    #[error("Decoding error: {0}")]
    DecodingError(String),

    /// Errors returned by the upstream peer (5xx, malformed tip response).
    #[error("Peer error: {0}")]
    PeerError(String),

    /// Transport-level failures reaching the peer.
    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    /// A fetch or persistence call did not finish within its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Errors from the cache backend. Never fatal for the pipeline.
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Errors related to configuration.
    ///
    /// This includes missing environment variables, invalid configuration values,
    /// or failures in parsing configuration data.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Errors from environment variable operations.
    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] std::env::VarError),

    /// JSON (de)serialization failures outside of block decoding.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A block would break the parent-hash chain of the stored blocks.
    #[error("Linkage violation at height {height}: expected parent {expected}, found {found}")]
    LinkageViolation {
        height: u64,
        expected: String,
        found: String,
    },

    /// The rewind search walked further back than the configured limit
    /// without finding a block both sides agree on.
    #[error(
        "Chain divergence deeper than {max_depth} blocks (search anchored at height {anchor})"
    )]
    ChainDivergenceTooDeep { anchor: u64, max_depth: u64 },

    /// All retry attempts were exhausted on a transient error.
    ///
    /// Contains the number of attempts made and the last error message.
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Total number of attempts (initial call + retries).
        attempts: u32,
        /// String representation of the last error.
        last_error: String,
    },

    /// Generic errors for operations that don't fit other categories.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<redis::RedisError> for IndexerError {
    fn from(err: redis::RedisError) -> Self {
        IndexerError::CacheError(err.to_string())
    }
}

/// Type alias for Results using `IndexerError`.
pub type Result<T> = std::result::Result<T, IndexerError>;
