//! Shared utilities: errors, retry, logging wrappers and the clock.

pub mod clock;
pub mod error;
pub mod logging;
pub mod retry;
