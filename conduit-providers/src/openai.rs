//! OpenAI dialect. The canonical types are already OpenAI-shaped, so this
//! client mostly forwards, adding streaming usage accounting and the
//! shared multipart/audio surfaces. Azure and the OpenAI-compatible
//! family (Groq, Cerebras, SambaNova, Fireworks, MiniMax) reuse the core
//! through their own endpoint styles.

use crate::classify::{check_response, classify_transport_error};
use crate::http::{AuthStyle, build_http_client, join_url, operation_timeout};
use crate::sse::sse_data_stream;
use crate::{AuthCheck, ChatParameters, ProviderCapabilities, ProviderClient, Range};
use async_trait::async_trait;
use bytes::Bytes;
use conduit_core::{
    AudioUsage, ChatChunk, ChatChunkStream, ChatRequest, ChatResponse, EmbeddingsRequest,
    EmbeddingsResponse, GatewayError, ImageGenerationRequest, ImageGenerationResponse,
    OperationType, Provider, ProviderKey, ProviderType, Result, TimestampGranularity,
    TranscriptionFormat, TranscriptionRequest, TranscriptionResponse, TtsRequest, Usage,
};
use futures::StreamExt;
use serde::Deserialize;
use std::time::Instant;

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const AZURE_API_VERSION: &str = "2024-02-01";

/// How operation URLs are derived.
#[derive(Debug, Clone)]
pub(crate) enum EndpointStyle {
    /// `{base}/{op}`
    OpenAi,
    /// `{base}/openai/deployments/{model}/{op}?api-version=…`
    Azure,
}

#[derive(Debug, Deserialize)]
struct ModelsList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Option<Vec<conduit_core::TranscriptionSegment>>,
    #[serde(default)]
    words: Option<Vec<conduit_core::TranscriptionWord>>,
}

/// Shared implementation for every OpenAI-wire provider.
pub(crate) struct OpenAiCore {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) provider_name: String,
    pub(crate) provider_type: ProviderType,
    pub(crate) endpoints: EndpointStyle,
}

impl OpenAiCore {
    pub(crate) fn new(
        provider: &Provider,
        key: &ProviderKey,
        default_base: &str,
        style: AuthStyle,
        endpoints: EndpointStyle,
    ) -> Result<Self> {
        let base_url = key
            .base_url_override
            .clone()
            .or_else(|| provider.base_url.clone())
            .unwrap_or_else(|| default_base.to_string());
        if base_url.is_empty() {
            return Err(GatewayError::Configuration(format!(
                "provider {} requires a base URL",
                provider.name
            )));
        }
        Ok(Self {
            http: build_http_client(style, &key.api_key)?,
            base_url,
            provider_name: provider.name.clone(),
            provider_type: provider.provider_type,
            endpoints,
        })
    }

    pub(crate) fn url_for(&self, op: &str, model: &str) -> String {
        match &self.endpoints {
            EndpointStyle::OpenAi => join_url(&self.base_url, op),
            EndpointStyle::Azure => format!(
                "{}/openai/deployments/{}/{}?api-version={}",
                self.base_url.trim_end_matches('/'),
                model,
                op,
                AZURE_API_VERSION
            ),
        }
    }

    fn models_url(&self) -> String {
        match &self.endpoints {
            EndpointStyle::OpenAi => join_url(&self.base_url, "models"),
            EndpointStyle::Azure => format!(
                "{}/openai/deployments?api-version={}",
                self.base_url.trim_end_matches('/'),
                AZURE_API_VERSION
            ),
        }
    }

    pub(crate) async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let url = self.url_for("chat/completions", &request.model);
        let mut body = serde_json::to_value(&request)?;
        body["stream"] = serde_json::Value::Bool(false);

        let response = self
            .http
            .post(url)
            .timeout(operation_timeout(OperationType::Chat))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;

        let mut parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
        if parsed.usage.is_zero() {
            parsed.usage_estimated = true;
        }
        Ok(parsed)
    }

    pub(crate) async fn chat_stream(&self, request: ChatRequest) -> Result<ChatChunkStream> {
        let url = self.url_for("chat/completions", &request.model);
        let mut body = serde_json::to_value(&request)?;
        body["stream"] = serde_json::Value::Bool(true);
        body["stream_options"] = serde_json::json!({ "include_usage": true });

        let response = self
            .http
            .post(url)
            .timeout(operation_timeout(OperationType::Chat))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;

        let mut events = sse_data_stream(response.bytes_stream());
        Ok(Box::pin(async_stream::try_stream! {
            while let Some(event) = events.next().await {
                let event = event?;
                let chunk: ChatChunk = serde_json::from_str(&event)
                    .map_err(|e| GatewayError::ProviderCommunication(format!(
                        "malformed stream chunk: {e}"
                    )))?;
                yield chunk;
            }
        }))
    }

    pub(crate) async fn embeddings(&self, request: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let url = self.url_for("embeddings", &request.model);
        let response = self
            .http
            .post(url)
            .timeout(operation_timeout(OperationType::Embeddings))
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))
    }

    pub(crate) async fn generate_images(
        &self,
        request: ImageGenerationRequest,
    ) -> Result<ImageGenerationResponse> {
        let url = self.url_for("images/generations", &request.model);
        let response = self
            .http
            .post(url)
            .timeout(operation_timeout(OperationType::ImageGeneration))
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))
    }

    pub(crate) async fn transcribe(
        &self,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionResponse> {
        request.validate()?;
        let Some(audio) = request.audio_data.clone() else {
            return Err(GatewayError::InvalidRequest(
                "this provider requires inline audio data".to_string(),
            ));
        };
        let estimated_duration = request.estimated_duration_secs();

        let url = self.url_for("audio/transcriptions", &request.model);
        let file_name = request.file_name.clone().unwrap_or_else(|| "audio.wav".to_string());
        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec()).file_name(file_name),
            )
            .text("model", request.model.clone());

        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &request.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(temperature) = request.temperature {
            form = form.text("temperature", temperature.to_string());
        }
        let wire_format = match request.response_format {
            TranscriptionFormat::Json => "json",
            TranscriptionFormat::VerboseJson => "verbose_json",
            TranscriptionFormat::Text => "text",
            TranscriptionFormat::Srt => "srt",
            TranscriptionFormat::Vtt => "vtt",
        };
        form = form.text("response_format", wire_format);
        match request.timestamp_granularity {
            TimestampGranularity::Segment => {
                form = form.text("timestamp_granularities[]", "segment");
            }
            TimestampGranularity::Word => {
                form = form.text("timestamp_granularities[]", "word");
            }
            TimestampGranularity::None => {}
        }

        let response = self
            .http
            .post(url)
            .timeout(operation_timeout(OperationType::AudioTranscription))
            .multipart(form)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;

        let parsed = match request.response_format {
            TranscriptionFormat::Text | TranscriptionFormat::Srt | TranscriptionFormat::Vtt => {
                let text = response
                    .text()
                    .await
                    .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
                VerboseTranscription {
                    text,
                    language: None,
                    duration: None,
                    segments: None,
                    words: None,
                }
            }
            _ => response
                .json()
                .await
                .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?,
        };

        let audio_seconds = parsed.duration.unwrap_or(estimated_duration);
        Ok(TranscriptionResponse {
            text: parsed.text,
            language: parsed.language,
            duration: parsed.duration,
            segments: parsed.segments,
            words: parsed.words,
            alternatives: None,
            usage: AudioUsage {
                audio_seconds,
                character_count: 0,
            },
        })
    }

    pub(crate) async fn speak(&self, request: TtsRequest) -> Result<(Bytes, AudioUsage)> {
        request.validate()?;
        let model = request.model.clone().ok_or_else(|| {
            GatewayError::InvalidRequest("text-to-speech model must be specified".to_string())
        })?;
        let url = self.url_for("audio/speech", &model);

        let mut body = serde_json::json!({
            "model": model,
            "input": request.input,
            "voice": request.voice,
        });
        if let Some(format) = request.response_format {
            body["response_format"] = serde_json::to_value(format)?;
        }
        if let Some(speed) = request.speed {
            body["speed"] = serde_json::json!(speed);
        }

        let character_count = request.input.chars().count() as u64;
        let response = self
            .http
            .post(url)
            .timeout(operation_timeout(OperationType::TextToSpeech))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let audio = response
            .bytes()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
        Ok((
            audio,
            AudioUsage {
                audio_seconds: 0.0,
                character_count,
            },
        ))
    }

    pub(crate) async fn verify_authentication(&self) -> AuthCheck {
        let start = Instant::now();
        let result = self
            .http
            .get(self.models_url())
            .timeout(operation_timeout(OperationType::HealthCheck))
            .send()
            .await;
        let elapsed = start.elapsed().as_millis() as u64;
        match result {
            Ok(response) if response.status().is_success() => AuthCheck::success(elapsed),
            Ok(response) => AuthCheck::failure(
                format!("authentication probe returned {}", response.status()),
                elapsed,
            ),
            Err(e) => AuthCheck::failure(format!("authentication probe failed: {e}"), elapsed),
        }
    }

    pub(crate) async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(self.models_url())
            .timeout(operation_timeout(OperationType::ModelDiscovery))
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let list: ModelsList = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

/// Chat parameter constraints shared by the OpenAI wire family.
pub(crate) fn openai_chat_parameters() -> ChatParameters {
    ChatParameters {
        temperature: Some(Range { min: 0.0, max: 2.0 }),
        max_tokens: Some(Range { min: 1, max: 128_000 }),
        top_p: Some(Range { min: 0.0, max: 1.0 }),
        top_k: None,
        stop_sequences_max: Some(4),
        presence_penalty: Some(Range { min: -2.0, max: 2.0 }),
        frequency_penalty: Some(Range { min: -2.0, max: 2.0 }),
        logit_bias: true,
        n_max: Some(8),
        user_field: true,
        seed: true,
        response_format: true,
        max_tools: Some(128),
    }
}

pub struct OpenAiClient {
    core: OpenAiCore,
}

impl OpenAiClient {
    pub fn new(provider: &Provider, key: &ProviderKey) -> Result<Self> {
        let core = OpenAiCore::new(
            provider,
            key,
            OPENAI_API_BASE,
            AuthStyle::Bearer,
            EndpointStyle::OpenAi,
        )?;
        Ok(Self { core })
    }
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Openai
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
            realtime_audio: true,
        }
    }
}

/// Accumulate a canonical chunk stream's final usage, mirroring what the
/// streaming pump tracks per request.
pub async fn collect_stream_usage(mut stream: ChatChunkStream) -> Result<(Vec<ChatChunk>, Option<Usage>)> {
    let mut chunks = Vec::new();
    let mut usage = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(u) = chunk.usage {
            usage = Some(u);
        }
        chunks.push(chunk);
    }
    Ok((chunks, usage))
}
