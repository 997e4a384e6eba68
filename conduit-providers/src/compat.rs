//! The OpenAI-compatible family: Groq, Cerebras, SambaNova, Fireworks,
//! MiniMax, and arbitrary `openai-compatible` deployments. Same wire,
//! different hosts and capability surfaces.

use crate::http::AuthStyle;
use crate::openai::{EndpointStyle, OpenAiCore, openai_chat_parameters};
use crate::{AuthCheck, ProviderCapabilities, ProviderClient};
use async_trait::async_trait;
use conduit_core::{
    ChatChunkStream, ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse,
    GatewayError, Provider, ProviderKey, ProviderType, Result,
};

pub const GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";
pub const CEREBRAS_API_BASE: &str = "https://api.cerebras.ai/v1";
pub const SAMBANOVA_API_BASE: &str = "https://api.sambanova.ai/v1";
pub const FIREWORKS_API_BASE: &str = "https://api.fireworks.ai/inference/v1";
pub const MINIMAX_API_BASE: &str = "https://api.minimax.io/v1";

fn default_base(provider_type: ProviderType) -> Option<&'static str> {
    match provider_type {
        ProviderType::Groq => Some(GROQ_API_BASE),
        ProviderType::Cerebras => Some(CEREBRAS_API_BASE),
        ProviderType::Sambanova => Some(SAMBANOVA_API_BASE),
        ProviderType::Fireworks => Some(FIREWORKS_API_BASE),
        ProviderType::Minimax => Some(MINIMAX_API_BASE),
        // A generic compatible endpoint has no well-known host.
        _ => None,
    }
}

pub struct OpenAiCompatibleClient {
    core: OpenAiCore,
}

impl OpenAiCompatibleClient {
    pub fn new(provider: &Provider, key: &ProviderKey) -> Result<Self> {
        let default = match default_base(provider.provider_type) {
            Some(base) => base,
            None => {
                if provider.base_url.is_none() && key.base_url_override.is_none() {
                    return Err(GatewayError::Configuration(format!(
                        "provider {} requires an explicit base URL",
                        provider.name
                    )));
                }
                ""
            }
        };
        let core = OpenAiCore::new(
            provider,
            key,
            default,
            AuthStyle::Bearer,
            EndpointStyle::OpenAi,
        )?;
        Ok(Self { core })
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    fn provider_type(&self) -> ProviderType {
        self.core.provider_type
    }

    fn provider_name(&self) -> &str {
        &self.core.provider_name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.core.chat(request).await
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatChunkStream> {
        self.core.chat_stream(request).await
    }

    async fn embeddings(&self, request: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        self.core.embeddings(request).await
    }

    async fn verify_authentication(&self) -> AuthCheck {
        self.core.verify_authentication().await
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        self.core.list_models().await
    }

    fn capabilities(&self, _model_id: Option<&str>) -> ProviderCapabilities {
        let function_calling = !matches!(self.core.provider_type, ProviderType::Sambanova);
        ProviderCapabilities {
            chat_parameters: openai_chat_parameters(),
            streaming: true,
            embeddings: matches!(
                self.core.provider_type,
                ProviderType::Fireworks | ProviderType::OpenaiCompatible
            ),
            vision: matches!(
                self.core.provider_type,
                ProviderType::Groq | ProviderType::Fireworks | ProviderType::OpenaiCompatible
            ),
            image_generation: false,
            function_calling,
            audio_transcription: matches!(self.core.provider_type, ProviderType::Groq),
            text_to_speech: matches!(self.core.provider_type, ProviderType::Minimax),
            realtime_audio: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{ProviderId, ProviderKeyId};
    use secrecy::SecretString;

    fn provider(provider_type: ProviderType, base_url: Option<&str>) -> Provider {
        Provider {
            id: ProviderId::from("p".to_string()),
            name: "compat".to_string(),
            provider_type,
            base_url: base_url.map(String::from),
            enabled: true,
        }
    }

    fn key() -> ProviderKey {
        ProviderKey {
            id: ProviderKeyId::from("k".to_string()),
            provider_id: ProviderId::from("p".to_string()),
            api_key: SecretString::from("sk".to_string()),
            base_url_override: None,
            organization: None,
            is_primary: true,
            enabled: true,
            account_group: None,
        }
    }

    #[test]
    fn groq_defaults_to_well_known_host() {
        let client =
            OpenAiCompatibleClient::new(&provider(ProviderType::Groq, None), &key()).unwrap();
        assert_eq!(
            client.core.url_for("chat/completions", "gemma2-9b-it"),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn generic_compatible_requires_base_url() {
        let err =
            OpenAiCompatibleClient::new(&provider(ProviderType::OpenaiCompatible, None), &key())
                .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));

        let ok = OpenAiCompatibleClient::new(
            &provider(ProviderType::OpenaiCompatible, Some("http://localhost:8000/v1")),
            &key(),
        );
        assert!(ok.is_ok());
    }
}
