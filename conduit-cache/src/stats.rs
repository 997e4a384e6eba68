//! Per-instance cache statistics and cross-instance aggregation.
//!
//! Every recorded operation increments local atomics; a background loop
//! flushes them into the distributed tier keyed by instance, sums across
//! instances, and stores the aggregate. The health monitor later replays
//! the sum and checks it against the stored aggregate for drift.

use crate::distributed::{DistributedCache, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Raw counters for one `(region, instance)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionCounters {
    pub hits: u64,
    pub misses: u64,
    pub get_time_micros: u64,
    pub get_ops: u64,
    pub memory_bytes: u64,
}

impl RegionCounters {
    pub fn total_ops(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_ops();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn avg_get_time(&self) -> Duration {
        if self.get_ops == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.get_time_micros / self.get_ops)
        }
    }

    pub fn sum(counters: impl IntoIterator<Item = Self>) -> Self {
        counters.into_iter().fold(Self::default(), |mut acc, c| {
            acc.hits += c.hits;
            acc.misses += c.misses;
            acc.get_time_micros += c.get_time_micros;
            acc.get_ops += c.get_ops;
            acc.memory_bytes += c.memory_bytes;
            acc
        })
    }
}

/// Reported snapshot for one region on one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub region: String,
    pub instance: String,
    pub hits: u64,
    pub misses: u64,
    pub avg_get_time_ms: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct AggregatedStats {
    pub region: String,
    pub per_instance: HashMap<String, RegionCounters>,
    pub total: RegionCounters,
}

impl AggregatedStats {
    /// Relative drift of a previously stored aggregate against the live
    /// per-instance sum: `|sum - stored| / sum`. Zero when the sum is zero.
    pub fn drift_against(&self, stored: &RegionCounters) -> f64 {
        let sum = self.total.total_ops();
        if sum == 0 {
            return 0.0;
        }
        let stored_ops = stored.total_ops();
        (sum.abs_diff(stored_ops)) as f64 / sum as f64
    }
}

#[derive(Default)]
struct AtomicCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    get_time_micros: AtomicU64,
    get_ops: AtomicU64,
    memory_bytes: AtomicU64,
}

impl AtomicCounters {
    fn snapshot(&self) -> RegionCounters {
        RegionCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            get_time_micros: self.get_time_micros.load(Ordering::Relaxed),
            get_ops: self.get_ops.load(Ordering::Relaxed),
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
        }
    }
}

const RECORDING_LATENCY_WINDOW: usize = 4096;

pub struct StatsCollector {
    instance_id: String,
    regions: DashMap<String, Arc<AtomicCounters>>,
    /// Recent recording latencies (micros) for the P99 health probe.
    recording_latencies: Mutex<VecDeque<u64>>,
}

impl StatsCollector {
    pub fn new(instance_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.into(),
            regions: DashMap::new(),
            recording_latencies: Mutex::new(VecDeque::with_capacity(RECORDING_LATENCY_WINDOW)),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn counters(&self, region: &str) -> Arc<AtomicCounters> {
        self.regions
            .entry(region.to_string())
            .or_insert_with(|| Arc::new(AtomicCounters::default()))
            .clone()
    }

    pub fn record_hit(&self, region: &str, get_time: Duration) {
        let start = std::time::Instant::now();
        let counters = self.counters(region);
        counters.hits.fetch_add(1, Ordering::Relaxed);
        counters
            .get_time_micros
            .fetch_add(get_time.as_micros() as u64, Ordering::Relaxed);
        counters.get_ops.fetch_add(1, Ordering::Relaxed);
        self.note_recording_latency(start.elapsed());
    }

    pub fn record_miss(&self, region: &str, get_time: Duration) {
        let start = std::time::Instant::now();
        let counters = self.counters(region);
        counters.misses.fetch_add(1, Ordering::Relaxed);
        counters
            .get_time_micros
            .fetch_add(get_time.as_micros() as u64, Ordering::Relaxed);
        counters.get_ops.fetch_add(1, Ordering::Relaxed);
        self.note_recording_latency(start.elapsed());
    }

    pub fn set_memory_bytes(&self, region: &str, bytes: u64) {
        self.counters(region)
            .memory_bytes
            .store(bytes, Ordering::Relaxed);
    }

    fn note_recording_latency(&self, latency: Duration) {
        let mut window = self.recording_latencies.lock();
        if window.len() == RECORDING_LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency.as_micros() as u64);
    }

    /// P99 of recent recording latencies.
    pub fn recording_latency_p99(&self) -> Duration {
        let window = self.recording_latencies.lock();
        if window.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<u64> = window.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.99).ceil() as usize - 1;
        Duration::from_micros(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn snapshot(&self, region: &str) -> RegionCounters {
        self.regions
            .get(region)
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    pub fn region_names(&self) -> Vec<String> {
        self.regions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn local_snapshots(&self) -> Vec<CacheStatsSnapshot> {
        self.regions
            .iter()
            .map(|entry| {
                let counters = entry.value().snapshot();
                CacheStatsSnapshot {
                    region: entry.key().clone(),
                    instance: self.instance_id.clone(),
                    hits: counters.hits,
                    misses: counters.misses,
                    avg_get_time_ms: counters.avg_get_time().as_secs_f64() * 1000.0,
                    memory_bytes: counters.memory_bytes,
                }
            })
            .collect()
    }

    /// Flush local counters for all regions into the distributed tier.
    pub async fn flush(&self, distributed: &dyn DistributedCache) -> Result<()> {
        let snapshots: Vec<(String, RegionCounters)> = self
            .regions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        for (region, counters) in snapshots {
            distributed
                .write_stats(&self.instance_id, &region, &counters)
                .await?;
        }
        Ok(())
    }

    /// Sum per-instance counters for one region and store the aggregate.
    pub async fn aggregate(
        &self,
        distributed: &dyn DistributedCache,
        region: &str,
    ) -> Result<AggregatedStats> {
        let per_instance = distributed.read_instance_stats(region).await?;
        let total = RegionCounters::sum(per_instance.values().copied());
        distributed.write_aggregate(region, &total).await?;
        Ok(AggregatedStats {
            region: region.to_string(),
            per_instance,
            total,
        })
    }
}
