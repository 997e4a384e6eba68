//! Observability for the gateway: tracing initialization, metric
//! recorders, the request-trace store, and the deduplicated alert manager.

pub mod alerts;
pub mod init;
pub mod metric;
pub mod trace_store;

pub use alerts::{Alert, AlertChannel, AlertKind, AlertManager, AlertSeverity};
pub use init::{TelemetryConfig, init_telemetry, install_prometheus_exporter};
pub use metric::RequestMetrics;
pub use trace_store::{TraceQuery, TraceStore};
