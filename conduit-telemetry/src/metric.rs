//! Metric names and recording helpers. All recording goes through the
//! `metrics` facade; the exporter is installed once at startup.

use conduit_core::{OperationType, TraceStatus};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::time::Duration;

pub const REQUESTS_TOTAL: &str = "requests_total";
pub const REALTIME_SESSIONS_TOTAL: &str = "realtime_sessions_total";
pub const COST_DOLLARS: &str = "cost_dollars";
pub const REQUEST_DURATION_SECONDS: &str = "request_duration_seconds";
pub const REQUEST_SIZE_BYTES: &str = "request_size_bytes";
pub const REALTIME_LATENCY_SECONDS: &str = "realtime_latency_seconds";
pub const CONFIDENCE_SCORE: &str = "confidence_score";
pub const WORD_ERROR_RATE: &str = "word_error_rate";
pub const ACTIVE_OPERATIONS: &str = "active_operations";
pub const CACHE_HIT_RATIO: &str = "cache_hit_ratio";
pub const PROVIDER_ERROR_RATE: &str = "provider_error_rate";
pub const PROVIDER_UPTIME_RATIO: &str = "provider_uptime_ratio";
pub const REDIS_MEMORY_BYTES: &str = "redis_memory_bytes";

fn status_label(status: TraceStatus) -> &'static str {
    match status {
        TraceStatus::Ok => "success",
        TraceStatus::Error => "error",
        TraceStatus::Cancelled => "cancelled",
    }
}

/// Per-request recording surface used by the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestMetrics;

impl RequestMetrics {
    pub fn record_request(
        &self,
        operation: OperationType,
        provider: &str,
        status: TraceStatus,
        duration: Duration,
    ) {
        let labels = [
            ("operation", operation.as_str().to_string()),
            ("provider", provider.to_string()),
            ("status", status_label(status).to_string()),
        ];
        metrics::counter!(REQUESTS_TOTAL, &labels).increment(1);
        metrics::histogram!(
            REQUEST_DURATION_SECONDS,
            "operation" => operation.as_str().to_string(),
            "provider" => provider.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_request_error(&self, operation: OperationType, provider: &str, code: &str) {
        metrics::counter!(
            REQUESTS_TOTAL,
            "operation" => operation.as_str().to_string(),
            "provider" => provider.to_string(),
            "status" => code.to_string()
        )
        .increment(1);
    }

    pub fn record_request_size(&self, operation: OperationType, bytes: usize) {
        metrics::histogram!(
            REQUEST_SIZE_BYTES,
            "operation" => operation.as_str().to_string()
        )
        .record(bytes as f64);
    }

    /// Cost counters only ever grow; the decimal is widened to f64 at the
    /// recording boundary, never inside billing.
    pub fn record_cost(&self, operation: OperationType, cost: Decimal) {
        if let Some(value) = cost.to_f64() {
            metrics::counter!(
                COST_DOLLARS,
                "operation" => operation.as_str().to_string()
            )
            .increment((value * 1e6) as u64);
        }
    }

    pub fn record_realtime_session(&self, provider: &str) {
        metrics::counter!(
            REALTIME_SESSIONS_TOTAL,
            "provider" => provider.to_string()
        )
        .increment(1);
    }

    pub fn record_realtime_latency(&self, provider: &str, latency: Duration) {
        metrics::histogram!(
            REALTIME_LATENCY_SECONDS,
            "provider" => provider.to_string()
        )
        .record(latency.as_secs_f64());
    }

    pub fn operation_started(&self, operation: OperationType) {
        metrics::gauge!(
            ACTIVE_OPERATIONS,
            "operation" => operation.as_str().to_string()
        )
        .increment(1.0);
    }

    pub fn operation_finished(&self, operation: OperationType) {
        metrics::gauge!(
            ACTIVE_OPERATIONS,
            "operation" => operation.as_str().to_string()
        )
        .decrement(1.0);
    }

    pub fn set_cache_hit_ratio(&self, region: &str, ratio: f64) {
        metrics::gauge!(CACHE_HIT_RATIO, "region" => region.to_string()).set(ratio);
    }

    pub fn set_provider_error_rate(&self, provider: &str, rate: f64) {
        metrics::gauge!(PROVIDER_ERROR_RATE, "provider" => provider.to_string()).set(rate);
    }

    pub fn set_provider_uptime_ratio(&self, provider: &str, ratio: f64) {
        metrics::gauge!(PROVIDER_UPTIME_RATIO, "provider" => provider.to_string()).set(ratio);
    }

    pub fn set_redis_memory_bytes(&self, bytes: f64) {
        metrics::gauge!(REDIS_MEMORY_BYTES).set(bytes);
    }
}
