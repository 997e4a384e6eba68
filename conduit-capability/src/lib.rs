//! Read facade over persisted model metadata. Every accessor reads through
//! the `model_capabilities` cache region (15-minute TTL); an unknown model
//! is an error, never a boolean default.

use conduit_cache::{CacheManager, regions};
use conduit_core::store::{GatewayStore, ModelKind, ModelMetadata};
use conduit_core::{GatewayError, ProviderType, Result};
use std::sync::Arc;

pub struct CapabilityService {
    store: Arc<dyn GatewayStore>,
    cache: Arc<CacheManager>,
}

impl CapabilityService {
    pub fn new(store: Arc<dyn GatewayStore>, cache: Arc<CacheManager>) -> Arc<Self> {
        Arc::new(Self { store, cache })
    }

    async fn metadata(&self, model: &str) -> Result<ModelMetadata> {
        let store = Arc::clone(&self.store);
        let alias = model.to_string();
        let loaded: Option<ModelMetadata> = self
            .cache
            .get_or_load(regions::MODEL_CAPABILITIES, model, || async move {
                store.model_metadata(&alias).await
            })
            .await?;

        loaded.ok_or_else(|| GatewayError::UnknownCapability {
            model: model.to_string(),
            capability: "metadata".to_string(),
        })
    }

    pub async fn supports_chat(&self, model: &str) -> Result<bool> {
        Ok(self.metadata(model).await?.supports_chat)
    }

    pub async fn supports_vision(&self, model: &str) -> Result<bool> {
        Ok(self.metadata(model).await?.supports_vision)
    }

    pub async fn supports_tools(&self, model: &str) -> Result<bool> {
        Ok(self.metadata(model).await?.supports_tools)
    }

    pub async fn supports_streaming(&self, model: &str) -> Result<bool> {
        Ok(self.metadata(model).await?.supports_streaming)
    }

    pub async fn supports_audio_transcription(&self, model: &str) -> Result<bool> {
        Ok(self.metadata(model).await?.supports_audio_transcription)
    }

    pub async fn supports_text_to_speech(&self, model: &str) -> Result<bool> {
        Ok(self.metadata(model).await?.supports_text_to_speech)
    }

    pub async fn supports_realtime_audio(&self, model: &str) -> Result<bool> {
        Ok(self.metadata(model).await?.supports_realtime_audio)
    }

    pub async fn supported_formats(&self, model: &str) -> Result<Vec<String>> {
        Ok(self.metadata(model).await?.supported_formats)
    }

    pub async fn supported_languages(&self, model: &str) -> Result<Vec<String>> {
        Ok(self.metadata(model).await?.supported_languages)
    }

    /// Context window used to cap budget estimates when `max_tokens` is
    /// unset.
    pub async fn context_window(&self, model: &str) -> Result<u32> {
        Ok(self.metadata(model).await?.context_window)
    }

    /// Configured default model for `(provider, kind)`. There are no
    /// hard-coded fallbacks: an unconfigured default is `None`.
    pub async fn default_model(
        &self,
        provider: ProviderType,
        kind: ModelKind,
    ) -> Result<Option<String>> {
        let store = Arc::clone(&self.store);
        let cache_key = format!("default:{provider}:{kind:?}");
        self.cache
            .get_or_load(regions::MODEL_CAPABILITIES, &cache_key, || async move {
                store.default_model(provider, kind).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_cache::{RegionConfig, StatsCollector};
    use conduit_core::MemoryStore;

    fn metadata(alias: &str) -> ModelMetadata {
        ModelMetadata {
            model_alias: alias.to_string(),
            context_window: 128_000,
            supports_chat: true,
            supports_vision: true,
            supports_tools: true,
            supports_streaming: true,
            supports_audio_transcription: false,
            supports_text_to_speech: false,
            supports_realtime_audio: false,
            supported_formats: vec!["json".to_string()],
            supported_languages: vec!["en".to_string()],
        }
    }

    fn service(store: Arc<MemoryStore>) -> Arc<CapabilityService> {
        let cache = CacheManager::new(
            vec![RegionConfig::model_capabilities()],
            None,
            StatsCollector::new("cap-test"),
        );
        CapabilityService::new(store, cache)
    }

    #[tokio::test]
    async fn accessors_reflect_metadata() {
        let store = MemoryStore::new();
        store.add_metadata(metadata("gpt-4o"));
        let service = service(store);

        assert!(service.supports_chat("gpt-4o").await.unwrap());
        assert!(service.supports_vision("gpt-4o").await.unwrap());
        assert!(!service.supports_text_to_speech("gpt-4o").await.unwrap());
        assert_eq!(service.context_window("gpt-4o").await.unwrap(), 128_000);
    }

    #[tokio::test]
    async fn unknown_model_is_an_error_not_a_default() {
        let store = MemoryStore::new();
        let service = service(store);

        let err = service.supports_chat("nope").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownCapability { .. }));
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let store = MemoryStore::new();
        store.add_metadata(metadata("gpt-4o"));
        let service = service(Arc::clone(&store));

        assert!(service.supports_chat("gpt-4o").await.unwrap());
        // Mutating the store is invisible until the cached entry expires.
        store.add_metadata(ModelMetadata {
            supports_chat: false,
            ..metadata("gpt-4o")
        });
        assert!(service.supports_chat("gpt-4o").await.unwrap());
    }

    #[tokio::test]
    async fn default_model_comes_only_from_configuration() {
        let store = MemoryStore::new();
        store.set_default_model(ProviderType::Openai, ModelKind::Transcription, "whisper-1");
        let service = service(store);

        assert_eq!(
            service
                .default_model(ProviderType::Openai, ModelKind::Transcription)
                .await
                .unwrap()
                .as_deref(),
            Some("whisper-1")
        );
        assert!(
            service
                .default_model(ProviderType::Groq, ModelKind::Tts)
                .await
                .unwrap()
                .is_none()
        );
    }
}
