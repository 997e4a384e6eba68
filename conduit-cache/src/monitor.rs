//! Statistics health monitor. A background loop validates the distributed
//! tier, the instance census, per-region accuracy, and recording
//! performance, raising deduplicated alerts on violation.

use crate::distributed::DistributedCache;
use crate::manager::CacheManager;
use crate::stats::RegionCounters;
use conduit_telemetry::{AlertKind, AlertManager, AlertSeverity};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub check_period: Duration,
    /// Soft bound on distributed ping latency.
    pub ping_latency_bound: Duration,
    pub drift_threshold: f64,
    pub aggregation_latency_threshold: Duration,
    pub recording_p99_threshold: Duration,
    pub memory_pressure_bytes: u64,
    pub min_active_instances: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_period: Duration::from_secs(30),
            ping_latency_bound: Duration::from_millis(100),
            drift_threshold: 0.01,
            aggregation_latency_threshold: Duration::from_millis(500),
            recording_p99_threshold: Duration::from_millis(5),
            memory_pressure_bytes: 1 << 30,
            min_active_instances: 1,
        }
    }
}

pub struct StatsHealthMonitor {
    manager: Arc<CacheManager>,
    alerts: Arc<AlertManager>,
    config: MonitorConfig,
}

impl StatsHealthMonitor {
    pub fn new(
        manager: Arc<CacheManager>,
        alerts: Arc<AlertManager>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            manager,
            alerts,
            config,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.check_period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => self.run_checks_once().await,
                }
            }
        });
    }

    /// One full pass over the health checks. Public so tests can drive the
    /// loop deterministically.
    pub async fn run_checks_once(&self) {
        let Some(distributed) = self.manager.distributed().cloned() else {
            return;
        };

        if !self.check_connectivity(distributed.as_ref()).await {
            return;
        }
        self.check_census(distributed.as_ref()).await;
        self.check_accuracy_and_performance(distributed.as_ref())
            .await;
        self.check_recording_latency();
        self.check_memory(distributed.as_ref()).await;
    }

    async fn check_connectivity(&self, distributed: &dyn DistributedCache) -> bool {
        match distributed.ping().await {
            Ok(latency) => {
                self.manager.clear_degraded();
                if latency > self.config.ping_latency_bound {
                    tracing::warn!(
                        latency_ms = latency.as_millis() as u64,
                        "distributed ping above soft bound"
                    );
                }
                true
            }
            Err(e) => {
                self.manager.mark_degraded();
                self.alerts.raise(
                    AlertKind::RedisConnectionFailure,
                    AlertSeverity::Critical,
                    "global",
                    format!("distributed tier unreachable: {e}"),
                    HashMap::new(),
                );
                false
            }
        }
    }

    async fn check_census(&self, distributed: &dyn DistributedCache) {
        let (known, live) = match (
            distributed.known_instances().await,
            distributed.live_instances().await,
        ) {
            (Ok(known), Ok(live)) => (known, live),
            _ => return,
        };

        for instance in &known {
            if !live.contains(instance) {
                self.alerts.raise(
                    AlertKind::InstanceNotReporting,
                    AlertSeverity::Warning,
                    instance.clone(),
                    format!("instance {instance} has no recent heartbeat"),
                    HashMap::from([("instance".to_string(), instance.clone())]),
                );
            }
        }

        if live.len() < self.config.min_active_instances {
            self.alerts.raise(
                AlertKind::LowActiveInstances,
                AlertSeverity::Error,
                "global",
                format!(
                    "{} active instances, expected at least {}",
                    live.len(),
                    self.config.min_active_instances
                ),
                HashMap::from([("active".to_string(), live.len().to_string())]),
            );
        }
    }

    async fn check_accuracy_and_performance(&self, distributed: &dyn DistributedCache) {
        let regions = match distributed.known_regions().await {
            Ok(regions) => regions,
            Err(_) => return,
        };

        let started = Instant::now();
        for region in &regions {
            let per_instance = match distributed.read_instance_stats(region).await {
                Ok(stats) => stats,
                Err(_) => continue,
            };
            let sum = RegionCounters::sum(per_instance.values().copied());
            let Some(stored) = distributed.read_aggregate(region).await.ok().flatten() else {
                continue;
            };

            let total = sum.total_ops();
            if total == 0 {
                continue;
            }
            let drift = sum.total_ops().abs_diff(stored.total_ops()) as f64 / total as f64;
            if drift > self.config.drift_threshold {
                self.alerts.raise(
                    AlertKind::StatisticsDrift,
                    AlertSeverity::Warning,
                    region.clone(),
                    format!("region {region} drift {:.0}%", drift * 100.0),
                    HashMap::from([
                        ("region".to_string(), region.clone()),
                        ("drift".to_string(), format!("{:.4}", drift)),
                        ("sum".to_string(), sum.total_ops().to_string()),
                        ("aggregated".to_string(), stored.total_ops().to_string()),
                    ]),
                );
            }
        }

        let aggregation_latency = started.elapsed();
        if aggregation_latency > self.config.aggregation_latency_threshold {
            self.alerts.raise(
                AlertKind::HighAggregationLatency,
                AlertSeverity::Warning,
                "global",
                format!(
                    "aggregation pass took {} ms",
                    aggregation_latency.as_millis()
                ),
                HashMap::new(),
            );
        }
    }

    fn check_recording_latency(&self) {
        let p99 = self.manager.stats().recording_latency_p99();
        if p99 > self.config.recording_p99_threshold {
            self.alerts.raise(
                AlertKind::HighRecordingLatency,
                AlertSeverity::Warning,
                "global",
                format!("stat recording P99 {} µs", p99.as_micros()),
                HashMap::new(),
            );
        }
    }

    async fn check_memory(&self, distributed: &dyn DistributedCache) {
        if let Ok(bytes) = distributed.memory_usage_bytes().await {
            conduit_telemetry::RequestMetrics.set_redis_memory_bytes(bytes as f64);
            if bytes > self.config.memory_pressure_bytes {
                self.alerts.raise(
                    AlertKind::HighRedisMemory,
                    AlertSeverity::Error,
                    "global",
                    format!("distributed memory at {bytes} bytes"),
                    HashMap::from([("bytes".to_string(), bytes.to_string())]),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::CacheManager;
    use crate::region::RegionConfig;
    use crate::stats::StatsCollector;
    use crate::testutil::FakeDistributed;

    fn setup(fake: Arc<FakeDistributed>) -> (StatsHealthMonitor, Arc<AlertManager>) {
        let manager = CacheManager::new(
            vec![RegionConfig::model_capabilities()],
            Some(fake),
            StatsCollector::new("monitor-test"),
        );
        let alerts = AlertManager::new(vec![]);
        let monitor = StatsHealthMonitor::new(manager, Arc::clone(&alerts), MonitorConfig::default());
        (monitor, alerts)
    }

    #[tokio::test]
    async fn drift_alert_fires_once_and_updates_in_place() {
        let fake = Arc::new(FakeDistributed::new());
        fake.set_instances(vec!["a", "b", "c"], vec!["a", "b", "c"]);
        for instance in ["a", "b", "c"] {
            fake.set_instance_stats(
                "region-x",
                instance,
                RegionCounters {
                    hits: 100,
                    ..Default::default()
                },
            );
        }
        // Stored aggregate is stale: 150 vs a live sum of 300.
        fake.aggregates.insert(
            "region-x".to_string(),
            RegionCounters {
                hits: 150,
                ..Default::default()
            },
        );

        let (monitor, alerts) = setup(fake);
        monitor.run_checks_once().await;
        let active = alerts.active_alerts();
        let drift: Vec<_> = active
            .iter()
            .filter(|a| a.kind == AlertKind::StatisticsDrift)
            .collect();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].count, 1);
        assert_eq!(drift[0].context.get("drift").unwrap(), "0.5000");

        // Identical second poll updates the existing alert in place.
        monitor.run_checks_once().await;
        let active = alerts.active_alerts();
        let drift: Vec<_> = active
            .iter()
            .filter(|a| a.kind == AlertKind::StatisticsDrift)
            .collect();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].count, 2);
    }

    #[tokio::test]
    async fn accurate_aggregate_raises_nothing() {
        let fake = Arc::new(FakeDistributed::new());
        fake.set_instances(vec!["a"], vec!["a"]);
        fake.set_instance_stats(
            "region-x",
            "a",
            RegionCounters {
                hits: 100,
                ..Default::default()
            },
        );
        fake.aggregates.insert(
            "region-x".to_string(),
            RegionCounters {
                hits: 100,
                ..Default::default()
            },
        );

        let (monitor, alerts) = setup(fake);
        monitor.run_checks_once().await;
        assert!(
            alerts
                .active_alerts()
                .iter()
                .all(|a| a.kind != AlertKind::StatisticsDrift)
        );
    }

    #[tokio::test]
    async fn missing_instance_raises_census_alert() {
        let fake = Arc::new(FakeDistributed::new());
        fake.set_instances(vec!["a", "b"], vec!["a"]);

        let (monitor, alerts) = setup(fake);
        monitor.run_checks_once().await;
        assert!(
            alerts
                .active_alerts()
                .iter()
                .any(|a| a.kind == AlertKind::InstanceNotReporting)
        );
    }

    #[tokio::test]
    async fn connection_failure_marks_degraded() {
        let fake = Arc::new(FakeDistributed::new());
        fake.fail_everything();

        let (monitor, alerts) = setup(fake);
        monitor.run_checks_once().await;
        assert!(
            alerts
                .active_alerts()
                .iter()
                .any(|a| a.kind == AlertKind::RedisConnectionFailure)
        );
    }
}
