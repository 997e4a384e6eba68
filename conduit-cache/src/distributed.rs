//! Distributed tier contract and its Redis implementation. Everything
//! multi-instance lives behind this trait: shared entries, invalidation
//! pub/sub, per-instance stat counters, heartbeats, and the stored
//! aggregate the health monitor validates against.

use crate::stats::RegionCounters;
use async_trait::async_trait;
use futures::stream::Stream;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;

const INVALIDATION_CHANNEL: &str = "conduit:cache:invalidations";
const INSTANCE_SET: &str = "conduit:stats:instances";
const REGION_SET: &str = "conduit:stats:regions";

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("distributed tier unavailable: {0}")]
    Unavailable(String),
}

/// Invalidation published on every local invalidate. Delivery is
/// at-least-once; consumers drop their local copy idempotently and ignore
/// their own events by origin id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub region: String,
    pub key: String,
    pub origin_instance: String,
}

pub type InvalidationStream = Pin<Box<dyn Stream<Item = InvalidationEvent> + Send>>;

#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, region: &str, key: &str) -> Result<Option<serde_json::Value>>;
    async fn set(
        &self,
        region: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()>;
    async fn remove(&self, region: &str, key: &str) -> Result<()>;

    async fn publish_invalidation(&self, event: &InvalidationEvent) -> Result<()>;
    async fn subscribe_invalidations(&self) -> Result<InvalidationStream>;

    /// Round-trip latency probe.
    async fn ping(&self) -> Result<Duration>;

    /// Register this instance and refresh its heartbeat.
    async fn register_instance(&self, instance: &str, heartbeat_ttl: Duration) -> Result<()>;
    async fn known_instances(&self) -> Result<Vec<String>>;
    async fn live_instances(&self) -> Result<Vec<String>>;

    async fn write_stats(
        &self,
        instance: &str,
        region: &str,
        counters: &RegionCounters,
    ) -> Result<()>;
    async fn read_instance_stats(&self, region: &str)
    -> Result<HashMap<String, RegionCounters>>;
    async fn known_regions(&self) -> Result<Vec<String>>;

    async fn write_aggregate(&self, region: &str, counters: &RegionCounters) -> Result<()>;
    async fn read_aggregate(&self, region: &str) -> Result<Option<RegionCounters>>;

    /// Reported memory use of the backing store.
    async fn memory_usage_bytes(&self) -> Result<u64>;
}

/// Redis-backed distributed tier.
pub struct RedisCache {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    fn entry_key(region: &str, key: &str) -> String {
        format!("conduit:cache:{region}:{key}")
    }

    fn stats_key(region: &str, instance: &str) -> String {
        format!("conduit:stats:{region}:{instance}")
    }

    fn aggregate_key(region: &str) -> String {
        format!("conduit:stats:agg:{region}")
    }

    fn heartbeat_key(instance: &str) -> String {
        format!("conduit:stats:heartbeat:{instance}")
    }
}

#[async_trait]
impl DistributedCache for RedisCache {
    async fn get(&self, region: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::entry_key(region, key)).await?;
        match raw {
            // A payload that fails to parse is discarded as a miss.
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        region: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value)?;
        let secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(Self::entry_key(region, key), payload, secs).await?;
        Ok(())
    }

    async fn remove(&self, region: &str, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::entry_key(region, key)).await?;
        Ok(())
    }

    async fn publish_invalidation(&self, event: &InvalidationEvent) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(event)?;
        let _: () = conn.publish(INVALIDATION_CHANNEL, payload).await?;
        Ok(())
    }

    async fn subscribe_invalidations(&self) -> Result<InvalidationStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(INVALIDATION_CHANNEL).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<InvalidationEvent>(256);
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = futures::StreamExt::next(&mut messages).await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                match serde_json::from_str::<InvalidationEvent>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "malformed invalidation event dropped")
                    }
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn ping(&self) -> Result<Duration> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(start.elapsed())
    }

    async fn register_instance(&self, instance: &str, heartbeat_ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(INSTANCE_SET, instance).await?;
        let _: () = conn
            .set_ex(
                Self::heartbeat_key(instance),
                "1",
                heartbeat_ttl.as_secs().max(1),
            )
            .await?;
        Ok(())
    }

    async fn known_instances(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(INSTANCE_SET).await?)
    }

    async fn live_instances(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let known: Vec<String> = conn.smembers(INSTANCE_SET).await?;
        let mut live = Vec::with_capacity(known.len());
        for instance in known {
            let alive: bool = conn.exists(Self::heartbeat_key(&instance)).await?;
            if alive {
                live.push(instance);
            }
        }
        Ok(live)
    }

    async fn write_stats(
        &self,
        instance: &str,
        region: &str,
        counters: &RegionCounters,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(REGION_SET, region).await?;
        let _: () = conn
            .hset_multiple(
                Self::stats_key(region, instance),
                &[
                    ("hits", counters.hits),
                    ("misses", counters.misses),
                    ("get_time_micros", counters.get_time_micros),
                    ("get_ops", counters.get_ops),
                    ("memory_bytes", counters.memory_bytes),
                ],
            )
            .await?;
        Ok(())
    }

    async fn read_instance_stats(
        &self,
        region: &str,
    ) -> Result<HashMap<String, RegionCounters>> {
        let mut conn = self.conn.clone();
        let instances: Vec<String> = conn.smembers(INSTANCE_SET).await?;
        let mut out = HashMap::with_capacity(instances.len());
        for instance in instances {
            let raw: HashMap<String, u64> =
                conn.hgetall(Self::stats_key(region, &instance)).await?;
            if raw.is_empty() {
                continue;
            }
            out.insert(
                instance,
                RegionCounters {
                    hits: raw.get("hits").copied().unwrap_or(0),
                    misses: raw.get("misses").copied().unwrap_or(0),
                    get_time_micros: raw.get("get_time_micros").copied().unwrap_or(0),
                    get_ops: raw.get("get_ops").copied().unwrap_or(0),
                    memory_bytes: raw.get("memory_bytes").copied().unwrap_or(0),
                },
            );
        }
        Ok(out)
    }

    async fn known_regions(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(REGION_SET).await?)
    }

    async fn write_aggregate(&self, region: &str, counters: &RegionCounters) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(counters)?;
        let _: () = conn.set(Self::aggregate_key(region), payload).await?;
        Ok(())
    }

    async fn read_aggregate(&self, region: &str) -> Result<Option<RegionCounters>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::aggregate_key(region)).await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    async fn memory_usage_bytes(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let info: String = redis::cmd("INFO").arg("memory").query_async(&mut conn).await?;
        Ok(info
            .lines()
            .find_map(|line| line.strip_prefix("used_memory:"))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0))
    }
}
