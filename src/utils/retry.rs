//! Configurable retry logic for transient failures.
//!
//! This module provides:
//! - [`compute_backoff`]: exponential-backoff delay calculator with optional jitter.
//! - [`is_transient`] / [`is_persistence`]: classify an [`IndexerError`] as retryable.
//! - [`with_retry`]: central retry loop shared by the fetcher and the indexer.

use crate::config::RetryConfig;
use crate::utils::clock::Clock;
use crate::utils::error::{IndexerError, Result};
use std::future::Future;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Computes the delay before the next retry.
///
/// `attempt` is 1-indexed: `attempt = 1` is the delay before the first retry,
/// `attempt = 2` before the second, etc.
///
/// Formula: `delay = initial_backoff_ms * backoff_multiplier^(attempt - 1)`,
/// capped at `max_backoff_ms`, then ±25 % jitter if enabled.
#[must_use]
pub fn compute_backoff(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let base = cfg.initial_backoff_ms as f64 * cfg.backoff_multiplier.powi(exponent);
    let capped = base.min(cfg.max_backoff_ms as f64);

    let ms = if cfg.jitter {
        // jitter factor in [0.75, 1.25], derived from the sub-second clock
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let factor = 0.75 + f64::from(nanos % 1_000_000) / 1_000_000.0 * 0.5;
        capped * factor
    } else {
        capped
    };

    Duration::from_millis(ms as u64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Error classification
// ─────────────────────────────────────────────────────────────────────────────

/// Returns `true` if `err` is a transient peer failure that is safe to retry.
///
/// | Error variant            | Retried | Reason                                    |
/// |--------------------------|---------|-------------------------------------------|
/// | `PeerError`              | ✅      | HTTP 5xx / 429 from the peer              |
/// | `RequestError`           | ✅      | Connection reset, refused, DNS blip       |
/// | `Timeout`                | ✅      | Request deadline exceeded                 |
/// | `InternalError`          | ✅      | tokio task join noise                     |
/// | `DecodingError`          | ❌      | Bad data will not self-heal               |
/// | `DatabaseError`          | ❌      | Retried separately, see [`is_persistence`]|
/// | `ConfigError`            | ❌      | Programmer error                          |
/// | `RetryExhausted`         | ❌      | Already exhausted                         |
#[must_use]
pub fn is_transient(err: &IndexerError) -> bool {
    matches!(
        err,
        IndexerError::PeerError(_)
            | IndexerError::RequestError(_)
            | IndexerError::Timeout(_)
            | IndexerError::InternalError(_)
    )
}

/// Returns `true` if `err` is a store failure worth another commit attempt.
///
/// Linkage violations are excluded: retrying cannot fix a block that does not
/// extend the stored chain.
#[must_use]
pub fn is_persistence(err: &IndexerError) -> bool {
    matches!(
        err,
        IndexerError::DatabaseError(_) | IndexerError::Timeout(_)
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry loop
// ─────────────────────────────────────────────────────────────────────────────

/// Calls `op()` repeatedly until it succeeds, the error is not `retryable`,
/// or `config.max_retries` retries have been spent.
///
/// Exhaustion is reported as [`IndexerError::RetryExhausted`] carrying the
/// total number of calls made and the last error.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    clock: &dyn Clock,
    operation: &str,
    retryable: fn(&IndexerError) -> bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(val) => return Ok(val),
            Err(err) => {
                if !retryable(&err) {
                    return Err(err);
                }

                attempt += 1;

                if attempt > config.max_retries {
                    tracing::warn!(
                        operation,
                        attempts = attempt,
                        error = %err,
                        "Retry budget exhausted"
                    );
                    return Err(IndexerError::RetryExhausted {
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }

                let delay = compute_backoff(config, attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );

                clock.sleep(delay).await;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
