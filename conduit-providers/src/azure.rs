//! Azure OpenAI dialect: the deployment lives in the path and the
//! credential travels in an `api-key` header; the payloads are otherwise
//! OpenAI wire.

use crate::http::AuthStyle;
use crate::openai::{EndpointStyle, OpenAiCore, openai_chat_parameters};
use crate::{AuthCheck, ProviderCapabilities, ProviderClient};
use async_trait::async_trait;
use bytes::Bytes;
use conduit_core::{
    AudioUsage, ChatChunkStream, ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse,
    GatewayError, ImageGenerationRequest, ImageGenerationResponse, Provider, ProviderKey,
    ProviderType, Result, TranscriptionRequest, TranscriptionResponse, TtsRequest,
};

pub struct AzureOpenAiClient {
    core: OpenAiCore,
}

impl AzureOpenAiClient {
    pub fn new(provider: &Provider, key: &ProviderKey) -> Result<Self> {
        if provider.base_url.is_none() && key.base_url_override.is_none() {
            return Err(GatewayError::Configuration(
                "azure-openai requires a resource endpoint base URL".to_string(),
            ));
        }
        let core = OpenAiCore::new(provider, key, "", AuthStyle::AzureApiKey, EndpointStyle::Azure)?;
        Ok(Self { core })
    }
}

#[async_trait]
impl ProviderClient for AzureOpenAiClient {
    fn provider_type(&self) -> ProviderType {
        ProviderType::AzureOpenai
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

    async fn generate_images(
        &self,
        request: ImageGenerationRequest,
    ) -> Result<ImageGenerationResponse> {
        self.core.generate_images(request).await
    }

    async fn transcribe(&self, request: TranscriptionRequest) -> Result<TranscriptionResponse> {
        self.core.transcribe(request).await
    }

    async fn speak(&self, request: TtsRequest) -> Result<(Bytes, AudioUsage)> {
        self.core.speak(request).await
    }

    /// Probes the deployments list, the Azure equivalent of the models
    /// endpoint.
    async fn verify_authentication(&self) -> AuthCheck {
        self.core.verify_authentication().await
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        self.core.list_models().await
    }

    fn capabilities(&self, _model_id: Option<&str>) -> ProviderCapabilities {
        ProviderCapabilities {
            chat_parameters: openai_chat_parameters(),
            streaming: true,
            embeddings: true,
            vision: true,
            image_generation: true,
            function_calling: true,
            audio_transcription: true,
            text_to_speech: true,
            realtime_audio: false,
        }
    }
}
