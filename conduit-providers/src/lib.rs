//! Provider clients: one dialect module per upstream type behind a single
//! trait. Shared behavior (HTTP configuration, endpoint derivation, stream
//! decoding, error classification) is composed from helper modules, not
//! inherited.

pub mod anthropic;
pub mod azure;
pub mod classify;
pub mod cohere;
pub mod compat;
pub mod elevenlabs;
pub mod http;
pub mod huggingface;
pub mod ollama;
pub mod openai;
pub mod replicate;
pub mod simulate;
pub mod sse;
pub mod ultravox;
pub mod vertex;

use async_trait::async_trait;
use bytes::Bytes;
use conduit_core::{
    AudioChunkStream, AudioUsage, ChatChunkStream, ChatRequest, ChatResponse, EmbeddingsRequest,
    EmbeddingsResponse, GatewayError, ImageGenerationRequest, ImageGenerationResponse, Provider,
    ProviderKey, ProviderType, Result, TranscriptionRequest, TranscriptionResponse, TtsRequest,
};
use std::sync::Arc;

/// Typed result of an authentication probe. Never an `Err`: failures are
/// carried in `ok` and `message`.
#[derive(Debug, Clone)]
pub struct AuthCheck {
    pub ok: bool,
    pub message: String,
    pub response_time_ms: u64,
}

impl AuthCheck {
    pub fn success(response_time_ms: u64) -> Self {
        Self {
            ok: true,
            message: "authentication verified".to_string(),
            response_time_ms,
        }
    }

    pub fn failure(message: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            ok: false,
            message: message.into(),
            response_time_ms,
        }
    }
}

/// Inclusive numeric bound reported in capability descriptions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range<T> {
    pub min: T,
    pub max: T,
}

/// Constraints the provider places on chat parameters.
#[derive(Debug, Clone, Default)]
pub struct ChatParameters {
    pub temperature: Option<Range<f64>>,
    pub max_tokens: Option<Range<u32>>,
    pub top_p: Option<Range<f64>>,
    pub top_k: Option<Range<u32>>,
    pub stop_sequences_max: Option<u32>,
    pub presence_penalty: Option<Range<f64>>,
    pub frequency_penalty: Option<Range<f64>>,
    pub logit_bias: bool,
    pub n_max: Option<u32>,
    pub user_field: bool,
    pub seed: bool,
    pub response_format: bool,
    /// Maximum number of tool definitions, when tools are supported.
    pub max_tools: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderCapabilities {
    pub chat_parameters: ChatParameters,
    pub streaming: bool,
    pub embeddings: bool,
    pub vision: bool,
    pub image_generation: bool,
    pub function_calling: bool,
    pub audio_transcription: bool,
    pub text_to_speech: bool,
    pub realtime_audio: bool,
}

/// The polymorphic provider surface. Operations a provider does not
/// support return `NotImplemented` via the defaults.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    fn provider_name(&self) -> &str;

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let _ = request;
        Err(GatewayError::NotImplemented(format!(
            "chat on {}",
            self.provider_type()
        )))
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatChunkStream> {
        let _ = request;
        Err(GatewayError::NotImplemented(format!(
            "streaming chat on {}",
            self.provider_type()
        )))
    }

    async fn embeddings(&self, request: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let _ = request;
        Err(GatewayError::NotImplemented(format!(
            "embeddings on {}",
            self.provider_type()
        )))
    }

    async fn generate_images(
        &self,
        request: ImageGenerationRequest,
    ) -> Result<ImageGenerationResponse> {
        let _ = request;
        Err(GatewayError::NotImplemented(format!(
            "image generation on {}",
            self.provider_type()
        )))
    }

    async fn transcribe(&self, request: TranscriptionRequest) -> Result<TranscriptionResponse> {
        let _ = request;
        Err(GatewayError::NotImplemented(format!(
            "transcription on {}",
            self.provider_type()
        )))
    }

    async fn speak(&self, request: TtsRequest) -> Result<(Bytes, AudioUsage)> {
        let _ = request;
        Err(GatewayError::NotImplemented(format!(
            "text-to-speech on {}",
            self.provider_type()
        )))
    }

    /// Streamed synthesis. Providers without native streaming simulate it
    /// by chunking the complete response (see [`simulate`]).
    async fn stream_speech(&self, request: TtsRequest) -> Result<AudioChunkStream> {
        let (audio, _usage) = self.speak(request).await?;
        Ok(simulate::simulated_audio_stream(audio))
    }

    /// Lightweight credential probe. Pure in `(api_key, base_url)`; never
    /// returns an error.
    async fn verify_authentication(&self) -> AuthCheck;

    async fn list_models(&self) -> Result<Vec<String>> {
        Err(GatewayError::NotImplemented(format!(
            "model listing on {}",
            self.provider_type()
        )))
    }

    fn capabilities(&self, model_id: Option<&str>) -> ProviderCapabilities;
}

/// Build the dialect client for a provider/key pair.
pub fn build_client(
    provider: &Provider,
    key: &ProviderKey,
) -> Result<Arc<dyn ProviderClient>> {
    let client: Arc<dyn ProviderClient> = match provider.provider_type {
        ProviderType::Openai => Arc::new(openai::OpenAiClient::new(provider, key)?),
        ProviderType::AzureOpenai => Arc::new(azure::AzureOpenAiClient::new(provider, key)?),
        ProviderType::Anthropic => Arc::new(anthropic::AnthropicClient::new(provider, key)?),
        ProviderType::Cohere => Arc::new(cohere::CohereClient::new(provider, key)?),
        ProviderType::Groq
        | ProviderType::Cerebras
        | ProviderType::Sambanova
        | ProviderType::Fireworks
        | ProviderType::Minimax
        | ProviderType::OpenaiCompatible => {
            Arc::new(compat::OpenAiCompatibleClient::new(provider, key)?)
        }
        ProviderType::Huggingface => Arc::new(huggingface::HuggingFaceClient::new(provider, key)?),
        ProviderType::Ollama => Arc::new(ollama::OllamaClient::new(provider, key)?),
        ProviderType::Vertex => Arc::new(vertex::VertexClient::new(provider, key)?),
        ProviderType::Replicate => Arc::new(replicate::ReplicateClient::new(provider, key)?),
        ProviderType::Elevenlabs => Arc::new(elevenlabs::ElevenLabsClient::new(provider, key)?),
        ProviderType::Ultravox => Arc::new(ultravox::UltravoxClient::new(provider, key)?),
    };
    Ok(client)
}
