//! Telemetry initialization and configuration.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Once;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Configuration for the telemetry system.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub json_logs: bool,
    pub default_level: Option<String>,
    pub log_directives: Vec<String>,
}

impl TelemetryConfig {
    /// Create a new configuration with the given service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Emit logs as JSON lines instead of human-readable text.
    pub fn with_json_logs(mut self) -> Self {
        self.json_logs = true;
        self
    }

    /// Set the default log level (e.g. "debug", "info").
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = Some(level.into());
        self
    }

    /// Add a custom tracing directive (e.g. "conduit_providers=debug").
    pub fn with_log_directive(mut self, directive: impl Into<String>) -> Self {
        self.log_directives.push(directive.into());
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - `SERVICE_NAME`: service name (default: "conduit-gateway")
    /// - `LOG_LEVEL`: default level (default: "info")
    /// - `LOG_FORMAT`: "json" for JSON lines
    pub fn from_env() -> Self {
        let service_name =
            std::env::var("SERVICE_NAME").unwrap_or_else(|_| "conduit-gateway".to_string());
        let default_level = std::env::var("LOG_LEVEL").ok();
        let json_logs = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

        Self {
            service_name,
            json_logs,
            default_level,
            log_directives: Vec::new(),
        }
    }
}

/// Initialize the tracing subscriber. Safe to call more than once; only the
/// first call installs.
pub fn init_telemetry(config: TelemetryConfig) {
    INIT.call_once(|| {
        let level = config.default_level.as_deref().unwrap_or("info");
        let mut filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
        for directive in &config.log_directives {
            if let Ok(parsed) = directive.parse() {
                filter = filter.add_directive(parsed);
            }
        }

        if config.json_logs {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }

        tracing::info!(service = %config.service_name, "telemetry initialized");
    });
}

/// Install the Prometheus recorder and return its handle. The scrape
/// endpoint formatting is owned by the embedding service.
pub fn install_prometheus_exporter() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install prometheus recorder: {e}"))
}
