//! Unified cache operations across the memory and distributed tiers.

use crate::distributed::{DistributedCache, InvalidationEvent};
use crate::memory::MemoryTier;
use crate::region::{EvictionPolicy, RegionConfig};
use crate::stats::StatsCollector;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const HEARTBEAT_TTL: Duration = Duration::from_secs(90);
const FLUSH_PERIOD: Duration = Duration::from_secs(10);

type InFlightMap = DashMap<String, Arc<Mutex<()>>>;

/// Removes the in-flight marker on every exit path, including panics.
struct LoadGuard<'a> {
    map: &'a InFlightMap,
    key: String,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

#[derive(Debug, Clone)]
pub struct CacheHealth {
    pub distributed_configured: bool,
    pub degraded: bool,
}

pub struct CacheManager {
    instance_id: String,
    regions: DashMap<String, RegionConfig>,
    memory: MemoryTier,
    distributed: Option<Arc<dyn DistributedCache>>,
    degraded: AtomicBool,
    stats: Arc<StatsCollector>,
    in_flight: InFlightMap,
}

impl CacheManager {
    pub fn new(
        region_configs: Vec<RegionConfig>,
        distributed: Option<Arc<dyn DistributedCache>>,
        stats: Arc<StatsCollector>,
    ) -> Arc<Self> {
        let regions = DashMap::new();
        for config in region_configs {
            regions.insert(config.name.clone(), config);
        }
        Arc::new(Self {
            instance_id: stats.instance_id().to_string(),
            regions,
            memory: MemoryTier::new(),
            distributed,
            degraded: AtomicBool::new(false),
            stats,
            in_flight: DashMap::new(),
        })
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub fn distributed(&self) -> Option<&Arc<dyn DistributedCache>> {
        self.distributed.as_ref()
    }

    pub fn health(&self) -> CacheHealth {
        CacheHealth {
            distributed_configured: self.distributed.is_some(),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }

    pub fn region_config(&self, region: &str) -> RegionConfig {
        self.regions
            .get(region)
            .map(|c| c.clone())
            .unwrap_or_else(|| RegionConfig::new(region))
    }

    /// Atomically swap a region's policy. Entries already written keep
    /// their existing expiries.
    pub fn update_region_config(&self, config: RegionConfig) {
        self.regions.insert(config.name.clone(), config);
    }

    fn distributed_usable(&self, config: &RegionConfig) -> bool {
        config.use_distributed
            && self.distributed.is_some()
            && !self.degraded.load(Ordering::Relaxed)
    }

    fn note_distributed_failure(&self, context: &str, error: impl std::fmt::Display) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(%error, context, "distributed cache unavailable, memory-only mode");
        }
    }

    /// Called by the health monitor when a ping succeeds again.
    pub fn clear_degraded(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!("distributed cache recovered");
        }
    }

    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    /// Tier lookup without statistics recording; the public entry points
    /// decide what a hit or miss means for their flow.
    async fn lookup<T: DeserializeOwned>(&self, region: &str, key: &str) -> Option<T> {
        let config = self.region_config(region);

        if config.use_memory {
            if let Some(value) = self.memory.get(region, key) {
                if let Ok(typed) = serde_json::from_value::<T>(value) {
                    return Some(typed);
                }
                // Type mismatch: discard and fall through as a miss.
                self.memory.remove(region, key);
            }
        }

        if let Some(distributed) = self
            .distributed
            .as_ref()
            .filter(|_| self.distributed_usable(&config))
        {
            match distributed.get(region, key).await {
                Ok(Some(value)) => {
                    if let Ok(typed) = serde_json::from_value::<T>(value.clone()) {
                        if config.use_memory {
                            self.memory.set(
                                region,
                                key,
                                value,
                                config.default_ttl,
                                config.max_entries,
                                config.eviction,
                            );
                        }
                        return Some(typed);
                    }
                }
                Ok(None) => {}
                Err(e) => self.note_distributed_failure("get", e),
            }
        }

        None
    }

    /// Read through both tiers. Distributed hits are promoted into memory
    /// per region policy; undecodable values count as misses.
    pub async fn get<T: DeserializeOwned>(&self, region: &str, key: &str) -> Option<T> {
        let start = Instant::now();
        match self.lookup(region, key).await {
            Some(value) => {
                self.stats.record_hit(region, start.elapsed());
                Some(value)
            }
            None => {
                self.stats.record_miss(region, start.elapsed());
                None
            }
        }
    }

    /// Write through to the tiers the region policy selects. `hint`
    /// overrides the region's eviction policy for this write only.
    pub async fn set<T: Serialize>(
        &self,
        region: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        hint: Option<EvictionPolicy>,
    ) {
        let config = self.region_config(region);
        let ttl = config.effective_ttl(ttl);
        let Ok(json) = serde_json::to_value(value) else {
            return;
        };

        if config.use_memory {
            let policy = hint.unwrap_or(config.eviction);
            self.memory
                .set(region, key, json.clone(), ttl, config.max_entries, policy);
            self.stats
                .set_memory_bytes(region, self.memory.memory_usage_bytes(region) as u64);
        }

        if let Some(distributed) = self.distributed.as_ref().filter(|_| self.distributed_usable(&config)) {
            if let Err(e) = distributed.set(region, key, &json, ttl).await {
                self.note_distributed_failure("set", e);
            }
        }
    }

    /// Remove locally and broadcast to peers. Duplicate invalidations are
    /// harmless.
    pub async fn invalidate(&self, region: &str, key: &str) {
        self.memory.remove(region, key);

        let config = self.region_config(region);
        if config.use_distributed {
            if let Some(distributed) = &self.distributed {
                if let Err(e) = distributed.remove(region, key).await {
                    self.note_distributed_failure("invalidate", e);
                }
                let event = InvalidationEvent {
                    region: region.to_string(),
                    key: key.to_string(),
                    origin_instance: self.instance_id.clone(),
                };
                if let Err(e) = distributed.publish_invalidation(&event).await {
                    self.note_distributed_failure("publish_invalidation", e);
                }
            }
        }
    }

    /// Read-through load with dog-pile suppression: concurrent misses on
    /// one key coalesce onto a single loader; late waiters observe the
    /// loaded value (recorded as hits) or surface the loader's error on
    /// their own retry. Exactly one miss is recorded per cold load.
    pub async fn get_or_load<T, F, Fut, E>(
        &self,
        region: &str,
        key: &str,
        loader: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        if let Some(value) = self.lookup::<T>(region, key).await {
            self.stats.record_hit(region, start.elapsed());
            return Ok(value);
        }

        let flight_key = format!("{region}\u{1}{key}");
        let lock = self
            .in_flight
            .entry(flight_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _permit = lock.lock().await;
        let _guard = LoadGuard {
            map: &self.in_flight,
            key: flight_key,
        };

        // A winner may have populated the cache while we waited.
        if let Some(value) = self.lookup::<T>(region, key).await {
            self.stats.record_hit(region, start.elapsed());
            return Ok(value);
        }

        self.stats.record_miss(region, start.elapsed());
        let loaded = loader().await?;
        self.set(region, key, &loaded, None, None).await;
        Ok(loaded)
    }

    /// Spawn the background loops: invalidation subscription, heartbeat,
    /// and stats flush. Idle until cancelled.
    pub fn spawn_background(self: &Arc<Self>, shutdown: CancellationToken) {
        let Some(distributed) = self.distributed.clone() else {
            return;
        };

        // Invalidation subscriber: drop local copies on peer events.
        {
            let manager = Arc::clone(self);
            let distributed = distributed.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut stream = match distributed.subscribe_invalidations().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        manager.note_distributed_failure("subscribe", e);
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = stream.next() => {
                            let Some(event) = event else { break };
                            if event.origin_instance != manager.instance_id {
                                manager.memory.remove(&event.region, &event.key);
                                tracing::debug!(
                                    region = %event.region,
                                    "peer invalidation applied"
                                );
                            }
                        }
                    }
                }
            });
        }

        // Heartbeat + stats flush.
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(FLUSH_PERIOD);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tick.tick() => {
                            let stats = Arc::clone(&manager.stats);
                            if let Err(e) = distributed
                                .register_instance(stats.instance_id(), HEARTBEAT_TTL)
                                .await
                            {
                                manager.note_distributed_failure("heartbeat", e);
                                continue;
                            }
                            if let Err(e) = stats.flush(distributed.as_ref()).await {
                                manager.note_distributed_failure("stats_flush", e);
                                continue;
                            }
                            for region in stats.region_names() {
                                if let Err(e) = stats.aggregate(distributed.as_ref(), &region).await {
                                    manager.note_distributed_failure("stats_aggregate", e);
                                }
                                let snapshot = stats.snapshot(&region);
                                conduit_telemetry::RequestMetrics
                                    .set_cache_hit_ratio(&region, snapshot.hit_ratio());
                            }
                            manager.clear_degraded();
                        }
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::regions;
    use crate::testutil::FakeDistributed;
    use std::sync::atomic::AtomicUsize;

    fn manager_with(
        distributed: Option<Arc<dyn DistributedCache>>,
    ) -> Arc<CacheManager> {
        CacheManager::new(
            vec![RegionConfig::model_capabilities()],
            distributed,
            StatsCollector::new("test-instance"),
        )
    }

    #[tokio::test]
    async fn set_then_get_within_ttl() {
        let manager = manager_with(None);
        manager
            .set(regions::MODEL_CAPABILITIES, "k", &"v".to_string(), None, None)
            .await;
        let got: Option<String> = manager.get(regions::MODEL_CAPABILITIES, "k").await;
        assert_eq!(got.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn invalidate_then_get_is_miss() {
        let manager = manager_with(None);
        manager
            .set(regions::MODEL_CAPABILITIES, "k", &1u32, None, None)
            .await;
        manager.invalidate(regions::MODEL_CAPABILITIES, "k").await;
        let got: Option<u32> = manager.get(regions::MODEL_CAPABILITIES, "k").await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn type_mismatch_treated_as_miss() {
        let manager = manager_with(None);
        manager
            .set(regions::MODEL_CAPABILITIES, "k", &"text".to_string(), None, None)
            .await;
        let got: Option<u64> = manager.get(regions::MODEL_CAPABILITIES, "k").await;
        assert!(got.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_coalesce_onto_one_loader() {
        let manager = manager_with(None);
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let manager = Arc::clone(&manager);
            let loads = Arc::clone(&loads);
            handles.push(tokio::spawn(async move {
                manager
                    .get_or_load::<String, _, _, std::convert::Infallible>(
                        regions::MODEL_CAPABILITIES,
                        "gpt-4o",
                        || async {
                            loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok("caps".to_string())
                        },
                    )
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "caps");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let snap = manager.stats().snapshot(regions::MODEL_CAPABILITIES);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.hits, 49);
    }

    #[tokio::test]
    async fn distributed_outage_degrades_without_failing() {
        let fake = Arc::new(FakeDistributed::new());
        fake.fail_everything();
        let manager = manager_with(Some(fake));

        manager
            .set(regions::MODEL_CAPABILITIES, "k", &"v".to_string(), None, None)
            .await;
        let got: Option<String> = manager.get(regions::MODEL_CAPABILITIES, "k").await;
        // Memory tier still serves; the manager reports degradation.
        assert_eq!(got.as_deref(), Some("v"));
        assert!(manager.health().degraded);
    }

    #[tokio::test]
    async fn distributed_hit_promotes_into_memory() {
        let fake = Arc::new(FakeDistributed::new());
        fake.seed(
            regions::MODEL_CAPABILITIES,
            "k",
            serde_json::json!("remote"),
        );
        let manager = manager_with(Some(fake.clone()));

        let got: Option<String> = manager.get(regions::MODEL_CAPABILITIES, "k").await;
        assert_eq!(got.as_deref(), Some("remote"));

        // Second read is served from memory even if the remote disappears.
        fake.clear();
        let got: Option<String> = manager.get(regions::MODEL_CAPABILITIES, "k").await;
        assert_eq!(got.as_deref(), Some("remote"));
    }

    #[tokio::test]
    async fn invalidation_publishes_and_peers_drop_local_copies() {
        let fake = Arc::new(FakeDistributed::new());
        let manager = manager_with(Some(fake.clone() as Arc<dyn DistributedCache>));
        manager.spawn_background(tokio_util::sync::CancellationToken::new());
        // Let the subscriber task register its channel.
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager
            .set(regions::MODEL_CAPABILITIES, "k", &"v".to_string(), None, None)
            .await;
        manager.invalidate(regions::MODEL_CAPABILITIES, "k").await;
        let published = fake.published.lock().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, "k");

        // A peer's invalidation removes our local copy.
        manager
            .set(regions::MODEL_CAPABILITIES, "k2", &"v2".to_string(), None, None)
            .await;
        fake.clear();
        fake.emit_invalidation(InvalidationEvent {
            region: regions::MODEL_CAPABILITIES.to_string(),
            key: "k2".to_string(),
            origin_instance: "someone-else".to_string(),
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let got: Option<String> = manager.get(regions::MODEL_CAPABILITIES, "k2").await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn region_config_swap_applies_to_new_writes() {
        let manager = manager_with(None);
        let mut config = manager.region_config(regions::MODEL_CAPABILITIES);
        config.max_entries = Some(1);
        config.eviction = EvictionPolicy::None;
        manager.update_region_config(config);

        manager
            .set(regions::MODEL_CAPABILITIES, "a", &1u32, None, None)
            .await;
        manager
            .set(regions::MODEL_CAPABILITIES, "b", &2u32, None, None)
            .await;
        let a: Option<u32> = manager.get(regions::MODEL_CAPABILITIES, "a").await;
        let b: Option<u32> = manager.get(regions::MODEL_CAPABILITIES, "b").await;
        assert_eq!(a, Some(1));
        assert!(b.is_none());
    }
}
