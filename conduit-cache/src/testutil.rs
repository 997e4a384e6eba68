//! Shared test double for the distributed tier.

use crate::distributed::{
    CacheError, DistributedCache, InvalidationEvent, InvalidationStream, Result,
};
use crate::stats::RegionCounters;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct FakeDistributed {
    entries: DashMap<String, serde_json::Value>,
    fail: AtomicBool,
    pub published: Mutex<Vec<InvalidationEvent>>,
    pub instance_stats: DashMap<(String, String), RegionCounters>,
    pub aggregates: DashMap<String, RegionCounters>,
    pub known: Mutex<Vec<String>>,
    pub live: Mutex<Vec<String>>,
    pub ping_latency: Mutex<Duration>,
    pub memory_bytes: Mutex<u64>,
    invalidation_tx: Mutex<Option<tokio::sync::mpsc::Sender<InvalidationEvent>>>,
}

impl FakeDistributed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_everything(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.fail.store(false, Ordering::SeqCst);
    }

    pub fn seed(&self, region: &str, key: &str, value: serde_json::Value) {
        self.entries.insert(format!("{region}:{key}"), value);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn set_instances(&self, known: Vec<&str>, live: Vec<&str>) {
        *self.known.lock() = known.into_iter().map(String::from).collect();
        *self.live.lock() = live.into_iter().map(String::from).collect();
    }

    pub fn set_instance_stats(&self, region: &str, instance: &str, counters: RegionCounters) {
        self.instance_stats
            .insert((region.to_string(), instance.to_string()), counters);
    }

    /// Push a peer invalidation into an active subscription.
    pub async fn emit_invalidation(&self, event: InvalidationEvent) {
        let tx = self.invalidation_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DistributedCache for FakeDistributed {
    async fn get(&self, region: &str, key: &str) -> Result<Option<serde_json::Value>> {
        self.check()?;
        Ok(self.entries.get(&format!("{region}:{key}")).map(|v| v.clone()))
    }

    async fn set(
        &self,
        region: &str,
        key: &str,
        value: &serde_json::Value,
        _ttl: Duration,
    ) -> Result<()> {
        self.check()?;
        self.entries
            .insert(format!("{region}:{key}"), value.clone());
        Ok(())
    }

    async fn remove(&self, region: &str, key: &str) -> Result<()> {
        self.check()?;
        self.entries.remove(&format!("{region}:{key}"));
        Ok(())
    }

    async fn publish_invalidation(&self, event: &InvalidationEvent) -> Result<()> {
        self.check()?;
        self.published.lock().push(event.clone());
        Ok(())
    }

    async fn subscribe_invalidations(&self) -> Result<InvalidationStream> {
        self.check()?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        *self.invalidation_tx.lock() = Some(tx);
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn ping(&self) -> Result<Duration> {
        self.check()?;
        Ok(*self.ping_latency.lock())
    }

    async fn register_instance(&self, instance: &str, _heartbeat_ttl: Duration) -> Result<()> {
        self.check()?;
        let mut known = self.known.lock();
        if !known.iter().any(|i| i == instance) {
            known.push(instance.to_string());
        }
        let mut live = self.live.lock();
        if !live.iter().any(|i| i == instance) {
            live.push(instance.to_string());
        }
        Ok(())
    }

    async fn known_instances(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.known.lock().clone())
    }

    async fn live_instances(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.live.lock().clone())
    }

    async fn write_stats(
        &self,
        instance: &str,
        region: &str,
        counters: &RegionCounters,
    ) -> Result<()> {
        self.check()?;
        self.instance_stats
            .insert((region.to_string(), instance.to_string()), *counters);
        Ok(())
    }

    async fn read_instance_stats(
        &self,
        region: &str,
    ) -> Result<HashMap<String, RegionCounters>> {
        self.check()?;
        Ok(self
            .instance_stats
            .iter()
            .filter(|e| e.key().0 == region)
            .map(|e| (e.key().1.clone(), *e.value()))
            .collect())
    }

    async fn known_regions(&self) -> Result<Vec<String>> {
        self.check()?;
        let mut regions: Vec<String> = self
            .instance_stats
            .iter()
            .map(|e| e.key().0.clone())
            .collect();
        regions.sort();
        regions.dedup();
        Ok(regions)
    }

    async fn write_aggregate(&self, region: &str, counters: &RegionCounters) -> Result<()> {
        self.check()?;
        self.aggregates.insert(region.to_string(), *counters);
        Ok(())
    }

    async fn read_aggregate(&self, region: &str) -> Result<Option<RegionCounters>> {
        self.check()?;
        Ok(self.aggregates.get(region).map(|c| *c))
    }

    async fn memory_usage_bytes(&self) -> Result<u64> {
        self.check()?;
        Ok(*self.memory_bytes.lock())
    }
}

/// Arc alias used by tests that need trait-object coercion.
pub type SharedFake = Arc<FakeDistributed>;
