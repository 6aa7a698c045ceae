use super::config::TelemetryConfig;
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static TELEMETRY_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber once per process.
///
/// `RUST_LOG` wins over `config.log_filter`. Later calls are no-ops. The fmt
/// layer writes synchronously, so there is nothing to flush on exit.
pub fn init_telemetry(config: &TelemetryConfig) {
    TELEMETRY_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

        let fmt_layer = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_ansi(config.enable_console_colors);

        // a test harness may already own the global subscriber
        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .is_ok();

        tracing::debug!(service = %config.service_name, installed, "Telemetry initialised");
    });
}
