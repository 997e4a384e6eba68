//! Region policies. A region is a named namespace carrying its own TTL
//! bounds, tier selection, capacity, and eviction policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Well-known region names.
pub mod regions {
    pub const MODEL_CAPABILITIES: &str = "model_capabilities";
    pub const PROVIDER_RESPONSES: &str = "provider_responses";
    pub const PROVIDER_HEALTH: &str = "provider_health";
    pub const VIRTUAL_KEYS: &str = "virtual_keys";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub use_memory: bool,
    pub use_distributed: bool,
    /// Entry cap for the memory tier; `None` means unbounded.
    pub max_entries: Option<usize>,
    pub eviction: EvictionPolicy,
    pub priority: i32,
    pub detailed_stats: bool,
}

impl RegionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_ttl: Duration::from_secs(300),
            max_ttl: Duration::from_secs(3600),
            use_memory: true,
            use_distributed: true,
            max_entries: Some(10_000),
            eviction: EvictionPolicy::Lru,
            priority: 0,
            detailed_stats: false,
        }
    }

    /// The model-capabilities region: 15-minute TTL, memory + distributed.
    pub fn model_capabilities() -> Self {
        Self {
            default_ttl: Duration::from_secs(900),
            max_ttl: Duration::from_secs(3600),
            detailed_stats: true,
            ..Self::new(regions::MODEL_CAPABILITIES)
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_max_ttl(mut self, max: Duration) -> Self {
        self.max_ttl = max;
        self
    }

    pub fn with_max_entries(mut self, max: Option<usize>) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_eviction(mut self, policy: EvictionPolicy) -> Self {
        self.eviction = policy;
        self
    }

    pub fn memory_only(mut self) -> Self {
        self.use_distributed = false;
        self
    }

    pub fn distributed_only(mut self) -> Self {
        self.use_memory = false;
        self
    }

    /// Requested TTL defaulted and clamped by the region's max.
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.default_ttl).min(self.max_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_defaults_and_clamps() {
        let config = RegionConfig::new("r")
            .with_ttl(Duration::from_secs(60))
            .with_max_ttl(Duration::from_secs(120));

        assert_eq!(config.effective_ttl(None), Duration::from_secs(60));
        assert_eq!(
            config.effective_ttl(Some(Duration::from_secs(90))),
            Duration::from_secs(90)
        );
        assert_eq!(
            config.effective_ttl(Some(Duration::from_secs(600))),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn capability_region_ttl_is_fifteen_minutes() {
        assert_eq!(
            RegionConfig::model_capabilities().default_ttl,
            Duration::from_secs(900)
        );
    }
}
