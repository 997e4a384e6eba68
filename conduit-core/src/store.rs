//! Read/write interfaces onto persisted state. The storage engine itself
//! is external; the gateway consumes these traits and publishes an
//! invalidation on every mutation it performs (the group debit).

use crate::entities::{
    GroupId, MappingId, ModelCost, ModelMapping, Provider, ProviderId, ProviderKey, ProviderKeyId,
    ProviderType, VirtualKey, VirtualKeyGroup, VirtualKeyId,
};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which default model is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Transcription,
    Tts,
    Realtime,
    Chat,
}

/// Persisted model metadata consumed by the capability service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_alias: String,
    pub context_window: u32,
    pub supports_chat: bool,
    pub supports_vision: bool,
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub supports_audio_transcription: bool,
    pub supports_text_to_speech: bool,
    pub supports_realtime_audio: bool,
    pub supported_formats: Vec<String>,
    pub supported_languages: Vec<String>,
}

/// Read/write facade over the persistence layer.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn get_provider(&self, id: &ProviderId) -> Result<Option<Provider>>;

    /// Enabled mappings for an alias. Callers sort by `(priority DESC, id ASC)`.
    async fn mappings_for_alias(&self, alias: &str) -> Result<Vec<ModelMapping>>;

    /// All enabled mappings, for model listing.
    async fn enabled_mappings(&self) -> Result<Vec<ModelMapping>>;

    /// Enabled keys for a provider. Callers sort by `(is_primary DESC, id ASC)`.
    async fn keys_for_provider(&self, provider_id: &ProviderId) -> Result<Vec<ProviderKey>>;

    /// Highest-priority cost rule attached to a mapping.
    async fn cost_for_mapping(&self, mapping_id: &MappingId) -> Result<Option<ModelCost>>;

    async fn virtual_key_by_hash(&self, token_hash: &str) -> Result<Option<VirtualKey>>;

    async fn get_group(&self, id: &GroupId) -> Result<Option<VirtualKeyGroup>>;

    /// Write back a mutated group. The ledger serializes callers; the store
    /// only persists.
    async fn put_group(&self, group: VirtualKeyGroup) -> Result<()>;

    async fn model_metadata(&self, alias: &str) -> Result<Option<ModelMetadata>>;

    /// Configured default model for `(provider, kind)`. There are no
    /// hard-coded fallbacks anywhere else.
    async fn default_model(
        &self,
        provider: ProviderType,
        kind: ModelKind,
    ) -> Result<Option<String>>;
}

/// In-memory store used by tests and single-node deployments without a
/// database.
#[derive(Default)]
pub struct MemoryStore {
    providers: DashMap<ProviderId, Provider>,
    mappings: DashMap<MappingId, ModelMapping>,
    keys: DashMap<ProviderKeyId, ProviderKey>,
    costs: DashMap<String, ModelCost>,
    virtual_keys: DashMap<VirtualKeyId, VirtualKey>,
    groups: DashMap<GroupId, VirtualKeyGroup>,
    metadata: DashMap<String, ModelMetadata>,
    defaults: DashMap<(ProviderType, ModelKind), String>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_provider(&self, provider: Provider) {
        self.providers.insert(provider.id.clone(), provider);
    }

    pub fn add_mapping(&self, mapping: ModelMapping) {
        self.mappings.insert(mapping.id.clone(), mapping);
    }

    pub fn add_key(&self, key: ProviderKey) {
        self.keys.insert(key.id.clone(), key);
    }

    pub fn add_cost(&self, cost: ModelCost) {
        self.costs.insert(cost.name.clone(), cost);
    }

    pub fn add_virtual_key(&self, key: VirtualKey) {
        self.virtual_keys.insert(key.id.clone(), key);
    }

    pub fn add_group(&self, group: VirtualKeyGroup) {
        self.groups.insert(group.id.clone(), group);
    }

    pub fn add_metadata(&self, meta: ModelMetadata) {
        self.metadata.insert(meta.model_alias.clone(), meta);
    }

    pub fn set_default_model(
        &self,
        provider: ProviderType,
        kind: ModelKind,
        model: impl Into<String>,
    ) {
        self.defaults.insert((provider, kind), model.into());
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn get_provider(&self, id: &ProviderId) -> Result<Option<Provider>> {
        Ok(self.providers.get(id).map(|p| p.clone()))
    }

    async fn mappings_for_alias(&self, alias: &str) -> Result<Vec<ModelMapping>> {
        Ok(self
            .mappings
            .iter()
            .filter(|m| m.enabled && m.model_alias == alias)
            .map(|m| m.clone())
            .collect())
    }

    async fn enabled_mappings(&self) -> Result<Vec<ModelMapping>> {
        Ok(self
            .mappings
            .iter()
            .filter(|m| m.enabled)
            .map(|m| m.clone())
            .collect())
    }

    async fn keys_for_provider(&self, provider_id: &ProviderId) -> Result<Vec<ProviderKey>> {
        Ok(self
            .keys
            .iter()
            .filter(|k| k.enabled && &k.provider_id == provider_id)
            .map(|k| k.clone())
            .collect())
    }

    async fn cost_for_mapping(&self, mapping_id: &MappingId) -> Result<Option<ModelCost>> {
        let mut matching: Vec<ModelCost> = self
            .costs
            .iter()
            .filter(|c| c.mapping_ids.contains(mapping_id))
            .map(|c| c.clone())
            .collect();
        matching.sort_by_key(|c| std::cmp::Reverse(c.priority));
        Ok(matching.into_iter().next())
    }

    async fn virtual_key_by_hash(&self, token_hash: &str) -> Result<Option<VirtualKey>> {
        Ok(self
            .virtual_keys
            .iter()
            .find(|k| k.token_hash == token_hash)
            .map(|k| k.clone()))
    }

    async fn get_group(&self, id: &GroupId) -> Result<Option<VirtualKeyGroup>> {
        Ok(self.groups.get(id).map(|g| g.clone()))
    }

    async fn put_group(&self, group: VirtualKeyGroup) -> Result<()> {
        if !self.groups.contains_key(&group.id) {
            return Err(GatewayError::Internal(format!(
                "unknown group {}",
                group.id
            )));
        }
        self.groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn model_metadata(&self, alias: &str) -> Result<Option<ModelMetadata>> {
        Ok(self.metadata.get(alias).map(|m| m.clone()))
    }

    async fn default_model(
        &self,
        provider: ProviderType,
        kind: ModelKind,
    ) -> Result<Option<String>> {
        Ok(self.defaults.get(&(provider, kind)).map(|m| m.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::CapabilityFlags;

    fn mapping(id: &str, alias: &str, priority: i32, enabled: bool) -> ModelMapping {
        ModelMapping {
            id: MappingId::from(id.to_string()),
            model_alias: alias.to_string(),
            provider_id: ProviderId::from("p1".to_string()),
            provider_model_id: "real-model".to_string(),
            capabilities: CapabilityFlags::chat_only(),
            priority,
            enabled,
        }
    }

    #[tokio::test]
    async fn disabled_mappings_filtered() {
        let store = MemoryStore::new();
        store.add_mapping(mapping("m1", "alias", 10, true));
        store.add_mapping(mapping("m2", "alias", 20, false));

        let found = store.mappings_for_alias("alias").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, MappingId::from("m1".to_string()));
    }

    #[tokio::test]
    async fn cost_lookup_prefers_priority() {
        let store = MemoryStore::new();
        let mid = MappingId::from("m1".to_string());
        for (name, priority) in [("low", 1), ("high", 9)] {
            store.add_cost(ModelCost {
                name: name.to_string(),
                mapping_ids: vec![mid.clone()],
                pricing_model: crate::entities::PricingModel::Standard,
                input_cost_per_million: rust_decimal::Decimal::ONE,
                output_cost_per_million: rust_decimal::Decimal::ONE,
                per_second_rate: None,
                per_character_rate: None,
                per_image_rate: None,
                priority,
            });
        }
        let cost = store.cost_for_mapping(&mid).await.unwrap().unwrap();
        assert_eq!(cost.name, "high");
    }
}
