/// Configuration for the telemetry subsystem.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup span.
    pub service_name: String,
    /// Minimum log level filter (e.g. "info", "explorer_indexer=debug,sqlx=warn").
    pub log_filter: String,
    /// Whether to enable ANSI-colored console output.
    pub enable_console_colors: bool,
    /// Whether to include target module in output.
    pub show_target: bool,
    /// Whether to include thread IDs.
    pub show_thread_ids: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "explorer-indexer".into(),
            log_filter: "info,sqlx=warn".into(),
            enable_console_colors: true,
            show_target: true,
            show_thread_ids: false,
        }
    }
}

impl TelemetryConfig {
    /// Reads `LOG_FILTER` and `NO_COLOR` on top of the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(filter) = std::env::var("LOG_FILTER") {
            config.log_filter = filter;
        }
        if std::env::var("NO_COLOR").is_ok() {
            config.enable_console_colors = false;
        }
        config
    }
}
