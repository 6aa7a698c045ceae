// ── Submodules ────────────────────────────────────────────────────────────────

/// Telemetry configuration.
pub mod config;

/// Global subscriber initialisation.
pub mod subscriber;

// ── Re-exports ────────────────────────────────────────────────────────────────

pub use config::TelemetryConfig;
pub use subscriber::init_telemetry;
