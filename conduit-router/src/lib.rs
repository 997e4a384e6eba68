//! Resolves a logical model alias to a concrete `(provider, model, key)`
//! tuple using mappings, priorities, circuit state, and a failover
//! exclusion set.

pub mod circuit;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};

use conduit_core::store::GatewayStore;
use conduit_core::{
    CapabilityFlags, GatewayError, MappingId, ModelMapping, Provider, ProviderId, ProviderKey,
    Result, sanitize_for_log,
};
use std::collections::HashSet;
use std::sync::Arc;

pub const DEFAULT_MAX_FAILOVER_ATTEMPTS: u32 = 3;

/// One routable tuple.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub provider: Provider,
    pub mapping: ModelMapping,
    pub key: ProviderKey,
}

impl RouteTarget {
    /// Identity used in the failover exclusion set.
    pub fn exclusion_key(&self) -> (ProviderId, MappingId) {
        (self.provider.id.clone(), self.mapping.id.clone())
    }
}

pub struct Router {
    store: Arc<dyn GatewayStore>,
    circuit: Arc<CircuitBreaker>,
    max_failover_attempts: u32,
}

impl Router {
    pub fn new(store: Arc<dyn GatewayStore>, circuit: Arc<CircuitBreaker>) -> Arc<Self> {
        let max_failover_attempts = std::env::var("CONDUIT_MAX_FAILOVER_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_FAILOVER_ATTEMPTS);
        Arc::new(Self {
            store,
            circuit,
            max_failover_attempts,
        })
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    /// Total attempts the pipeline may make: the first call plus failover.
    pub fn max_attempts(&self) -> u32 {
        1 + self.max_failover_attempts
    }

    /// Resolve the first usable `(provider, provider_model_id, key)` for
    /// the alias, skipping excluded tuples and open circuits.
    pub async fn resolve(
        &self,
        alias: &str,
        required: &CapabilityFlags,
        exclusions: &HashSet<(ProviderId, MappingId)>,
    ) -> Result<RouteTarget> {
        let mut mappings = self.store.mappings_for_alias(alias).await?;
        if mappings.is_empty() {
            return Err(GatewayError::ModelNotFound(alias.to_string()));
        }
        mappings.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.id.as_ref().cmp(b.id.as_ref()))
        });

        for mapping in mappings {
            if !mapping.capabilities.satisfies(required) {
                continue;
            }
            if exclusions.contains(&(mapping.provider_id.clone(), mapping.id.clone())) {
                continue;
            }

            let Some(provider) = self.store.get_provider(&mapping.provider_id).await? else {
                continue;
            };
            if !provider.enabled {
                continue;
            }

            let mut keys = self.store.keys_for_provider(&provider.id).await?;
            if keys.is_empty() {
                continue;
            }
            keys.sort_by(|a, b| {
                b.is_primary
                    .cmp(&a.is_primary)
                    .then_with(|| a.id.as_ref().cmp(b.id.as_ref()))
            });

            if !self.circuit.admit(&provider.id) {
                tracing::debug!(
                    provider = %provider.id,
                    alias = %sanitize_for_log(alias),
                    "circuit open, provider skipped"
                );
                continue;
            }

            let key = keys.remove(0);
            return Ok(RouteTarget {
                provider,
                mapping,
                key,
            });
        }

        Err(GatewayError::NoProviderAvailable {
            alias: alias.to_string(),
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{MemoryStore, ProviderKeyId, ProviderType};
    use secrecy::SecretString;

    fn provider(id: &str, enabled: bool) -> Provider {
        Provider {
            id: ProviderId::from(id.to_string()),
            name: id.to_string(),
            provider_type: ProviderType::Groq,
            base_url: None,
            enabled,
        }
    }

    fn key(id: &str, provider: &str, primary: bool) -> ProviderKey {
        ProviderKey {
            id: ProviderKeyId::from(id.to_string()),
            provider_id: ProviderId::from(provider.to_string()),
            api_key: SecretString::from("sk-test".to_string()),
            base_url_override: None,
            organization: None,
            is_primary: primary,
            enabled: true,
            account_group: None,
        }
    }

    fn mapping(id: &str, alias: &str, provider: &str, priority: i32) -> ModelMapping {
        ModelMapping {
            id: MappingId::from(id.to_string()),
            model_alias: alias.to_string(),
            provider_id: ProviderId::from(provider.to_string()),
            provider_model_id: format!("{alias}-upstream"),
            capabilities: CapabilityFlags::chat_only(),
            priority,
            enabled: true,
        }
    }

    fn router(store: Arc<MemoryStore>) -> Arc<Router> {
        Router::new(store, Arc::new(CircuitBreaker::default()))
    }

    #[tokio::test]
    async fn highest_priority_mapping_wins() {
        let store = MemoryStore::new();
        store.add_provider(provider("p1", true));
        store.add_provider(provider("p2", true));
        store.add_key(key("k1", "p1", true));
        store.add_key(key("k2", "p2", true));
        store.add_mapping(mapping("m1", "alias", "p1", 10));
        store.add_mapping(mapping("m2", "alias", "p2", 20));

        let target = router(store)
            .resolve("alias", &CapabilityFlags::chat_only(), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(target.provider.id, ProviderId::from("p2".to_string()));
    }

    #[tokio::test]
    async fn primary_key_preferred() {
        let store = MemoryStore::new();
        store.add_provider(provider("p1", true));
        store.add_key(key("k-b", "p1", false));
        store.add_key(key("k-a", "p1", true));
        store.add_mapping(mapping("m1", "alias", "p1", 1));

        let target = router(store)
            .resolve("alias", &CapabilityFlags::chat_only(), &HashSet::new())
            .await
            .unwrap();
        assert!(target.key.is_primary);
    }

    #[tokio::test]
    async fn unknown_alias_is_model_not_found() {
        let store = MemoryStore::new();
        let err = router(store)
            .resolve("missing", &CapabilityFlags::chat_only(), &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn capability_mismatch_drops_mapping() {
        let store = MemoryStore::new();
        store.add_provider(provider("p1", true));
        store.add_key(key("k1", "p1", true));
        store.add_mapping(mapping("m1", "alias", "p1", 1));

        let mut required = CapabilityFlags::chat_only();
        required.vision = true;
        let err = router(store)
            .resolve("alias", &required, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoProviderAvailable { .. }));
    }

    #[tokio::test]
    async fn exclusion_set_moves_to_next_mapping() {
        let store = MemoryStore::new();
        store.add_provider(provider("p1", true));
        store.add_provider(provider("p2", true));
        store.add_key(key("k1", "p1", true));
        store.add_key(key("k2", "p2", true));
        store.add_mapping(mapping("m1", "alias", "p1", 20));
        store.add_mapping(mapping("m2", "alias", "p2", 10));

        let router = router(store);
        let first = router
            .resolve("alias", &CapabilityFlags::chat_only(), &HashSet::new())
            .await
            .unwrap();
        let mut exclusions = HashSet::new();
        exclusions.insert(first.exclusion_key());

        let second = router
            .resolve("alias", &CapabilityFlags::chat_only(), &exclusions)
            .await
            .unwrap();
        assert_ne!(second.provider.id, first.provider.id);
    }

    #[tokio::test]
    async fn open_circuit_skips_provider() {
        let store = MemoryStore::new();
        store.add_provider(provider("p1", true));
        store.add_provider(provider("p2", true));
        store.add_key(key("k1", "p1", true));
        store.add_key(key("k2", "p2", true));
        store.add_mapping(mapping("m1", "alias", "p1", 20));
        store.add_mapping(mapping("m2", "alias", "p2", 10));

        let circuit = Arc::new(CircuitBreaker::new(CircuitConfig {
            failure_threshold: 1,
            cooldown: std::time::Duration::from_secs(300),
        }));
        circuit.record_failure(&ProviderId::from("p1".to_string()));

        let router = Router::new(store, circuit);
        let target = router
            .resolve("alias", &CapabilityFlags::chat_only(), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(target.provider.id, ProviderId::from("p2".to_string()));
    }

    #[tokio::test]
    async fn provider_without_keys_is_skipped() {
        let store = MemoryStore::new();
        store.add_provider(provider("p1", true));
        store.add_mapping(mapping("m1", "alias", "p1", 1));

        let err = router(store)
            .resolve("alias", &CapabilityFlags::chat_only(), &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoProviderAvailable { .. }));
    }
}
