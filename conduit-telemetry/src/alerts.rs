//! Deduplicated alerting with webhook and Slack channels.
//!
//! A repeated alert inside the dedup window updates the existing entry in
//! place (count and last-seen) instead of firing again. Channel dispatch is
//! best-effort and never blocks the raising path.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    InstanceNotReporting,
    HighAggregationLatency,
    HighRedisMemory,
    LowActiveInstances,
    RedisConnectionFailure,
    StatisticsDrift,
    HighRecordingLatency,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::InstanceNotReporting => "instance_not_reporting",
            AlertKind::HighAggregationLatency => "high_aggregation_latency",
            AlertKind::HighRedisMemory => "high_redis_memory",
            AlertKind::LowActiveInstances => "low_active_instances",
            AlertKind::RedisConnectionFailure => "redis_connection_failure",
            AlertKind::StatisticsDrift => "statistics_drift",
            AlertKind::HighRecordingLatency => "high_recording_latency",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub context: HashMap<String, String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
}

/// Where alerts go once raised.
#[derive(Debug, Clone)]
pub enum AlertChannel {
    Webhook {
        url: String,
        min_severities: Vec<AlertSeverity>,
    },
    Slack {
        url: String,
        min_severities: Vec<AlertSeverity>,
    },
}

impl AlertChannel {
    fn accepts(&self, severity: AlertSeverity) -> bool {
        match self {
            AlertChannel::Webhook { min_severities, .. }
            | AlertChannel::Slack { min_severities, .. } => min_severities.contains(&severity),
        }
    }
}

pub struct AlertManager {
    dedup_window: Duration,
    active: Mutex<HashMap<(AlertKind, String), Alert>>,
    channels: Vec<AlertChannel>,
    http: reqwest::Client,
}

impl AlertManager {
    pub fn new(channels: Vec<AlertChannel>) -> Arc<Self> {
        Arc::new(Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
            active: Mutex::new(HashMap::new()),
            channels,
            http: reqwest::Client::new(),
        })
    }

    /// Channels from `CONDUIT_ALERT_WEBHOOK_URL` (Error, Critical) and
    /// `CONDUIT_SLACK_WEBHOOK_URL` (Warning, Error, Critical).
    pub fn from_env() -> Arc<Self> {
        let mut channels = Vec::new();
        if let Ok(url) = std::env::var("CONDUIT_ALERT_WEBHOOK_URL") {
            channels.push(AlertChannel::Webhook {
                url,
                min_severities: vec![AlertSeverity::Error, AlertSeverity::Critical],
            });
        }
        if let Ok(url) = std::env::var("CONDUIT_SLACK_WEBHOOK_URL") {
            channels.push(AlertChannel::Slack {
                url,
                min_severities: vec![
                    AlertSeverity::Warning,
                    AlertSeverity::Error,
                    AlertSeverity::Critical,
                ],
            });
        }
        Self::new(channels)
    }

    #[cfg(test)]
    fn with_window(channels: Vec<AlertChannel>, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            dedup_window: window,
            active: Mutex::new(HashMap::new()),
            channels,
            http: reqwest::Client::new(),
        })
    }

    /// Raise an alert. `dedup_key` distinguishes instances of the same kind
    /// (e.g. the region in drift alerts). Returns true when the alert was
    /// newly fired rather than folded into an active one.
    pub fn raise(
        self: &Arc<Self>,
        kind: AlertKind,
        severity: AlertSeverity,
        dedup_key: impl Into<String>,
        message: impl Into<String>,
        context: HashMap<String, String>,
    ) -> bool {
        let dedup_key = dedup_key.into();
        let message = message.into();
        let now = Utc::now();
        let is_new = {
            let mut active = self.active.lock();
            match active.get_mut(&(kind, dedup_key.clone())) {
                Some(existing)
                    if (now - existing.last_seen).to_std().unwrap_or_default()
                        < self.dedup_window =>
                {
                    existing.last_seen = now;
                    existing.count += 1;
                    existing.message = message.clone();
                    existing.context = context.clone();
                    false
                }
                _ => {
                    active.insert(
                        (kind, dedup_key.clone()),
                        Alert {
                            kind,
                            severity,
                            message: message.clone(),
                            context: context.clone(),
                            first_seen: now,
                            last_seen: now,
                            count: 1,
                        },
                    );
                    true
                }
            }
        };

        if is_new {
            tracing::warn!(
                kind = kind.as_str(),
                severity = ?severity,
                %message,
                "alert raised"
            );
            self.dispatch(kind, severity, message, context);
        }
        is_new
    }

    /// Snapshot of currently active (non-expired) alerts.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let now = Utc::now();
        self.active
            .lock()
            .values()
            .filter(|a| {
                (now - a.last_seen).to_std().unwrap_or_default() < self.dedup_window
            })
            .cloned()
            .collect()
    }

    fn dispatch(
        self: &Arc<Self>,
        kind: AlertKind,
        severity: AlertSeverity,
        message: String,
        context: HashMap<String, String>,
    ) {
        for channel in &self.channels {
            if !channel.accepts(severity) {
                continue;
            }
            let http = self.http.clone();
            let channel = channel.clone();
            let message = message.clone();
            let context = context.clone();
            tokio::spawn(async move {
                let result = match &channel {
                    AlertChannel::Webhook { url, .. } => {
                        http.post(url)
                            .json(&serde_json::json!({
                                "kind": kind.as_str(),
                                "severity": severity,
                                "message": message,
                                "context": context,
                            }))
                            .send()
                            .await
                    }
                    AlertChannel::Slack { url, .. } => {
                        http.post(url)
                            .json(&serde_json::json!({
                                "text": format!("[{:?}] {}: {}", severity, kind.as_str(), message),
                            }))
                            .send()
                            .await
                    }
                };
                if let Err(e) = result {
                    tracing::debug!(error = %e, "alert channel dispatch failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_within_window_updates_in_place() {
        let manager = AlertManager::new(vec![]);
        let fired = manager.raise(
            AlertKind::StatisticsDrift,
            AlertSeverity::Warning,
            "region-a",
            "drift 50%",
            HashMap::new(),
        );
        assert!(fired);

        let fired_again = manager.raise(
            AlertKind::StatisticsDrift,
            AlertSeverity::Warning,
            "region-a",
            "drift 50%",
            HashMap::new(),
        );
        assert!(!fired_again);

        let active = manager.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].count, 2);
    }

    #[tokio::test]
    async fn distinct_dedup_keys_fire_separately() {
        let manager = AlertManager::new(vec![]);
        assert!(manager.raise(
            AlertKind::StatisticsDrift,
            AlertSeverity::Warning,
            "region-a",
            "drift",
            HashMap::new(),
        ));
        assert!(manager.raise(
            AlertKind::StatisticsDrift,
            AlertSeverity::Warning,
            "region-b",
            "drift",
            HashMap::new(),
        ));
        assert_eq!(manager.active_alerts().len(), 2);
    }

    #[tokio::test]
    async fn expired_alert_refires() {
        let manager = AlertManager::with_window(vec![], Duration::from_millis(0));
        assert!(manager.raise(
            AlertKind::RedisConnectionFailure,
            AlertSeverity::Error,
            "global",
            "down",
            HashMap::new(),
        ));
        assert!(manager.raise(
            AlertKind::RedisConnectionFailure,
            AlertSeverity::Error,
            "global",
            "down",
            HashMap::new(),
        ));
    }

    #[test]
    fn severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::Error);
        assert!(AlertSeverity::Error > AlertSeverity::Warning);
    }
}
