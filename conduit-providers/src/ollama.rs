//! Ollama dialect. `/api/chat` with an `options` bag, NDJSON streaming
//! terminated by a `done` record, and nanosecond duration fields converted
//! to seconds at the boundary.

use crate::classify::{check_response, classify_transport_error};
use crate::http::{AuthStyle, build_http_client, join_url, operation_timeout};
use crate::sse::ndjson_stream;
use crate::{AuthCheck, ChatParameters, ProviderCapabilities, ProviderClient, Range};
use async_trait::async_trait;
use conduit_core::{
    ChatChunk, ChatChunkStream, ChatRequest, ChatResponse, EmbeddingInput, EmbeddingsRequest,
    EmbeddingsResponse, FinishReason, GatewayError, MessageContent, OperationType, Provider,
    ProviderKey, ProviderType, Result, Role, Usage,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const OLLAMA_API_BASE: &str = "http://localhost:11434";

const NANOS_PER_SECOND: f64 = 1e9;

#[derive(Debug, Serialize)]
struct WireChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireOptions>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Default, Serialize)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    #[serde(default)]
    message: Option<WireResponseMessage>,
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    /// Nanoseconds.
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_duration: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: String,
}

/// Nanosecond duration fields to seconds.
pub fn nanos_to_seconds(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_SECOND
}

fn to_wire(request: &ChatRequest, stream: bool) -> WireChatRequest {
    let messages = request
        .messages
        .iter()
        .map(|m| WireMessage {
            role: match m.role {
                Role::System => "system",
                Role::User | Role::Tool => "user",
                Role::Assistant => "assistant",
            },
            content: m
                .content
                .as_ref()
                .map(MessageContent::as_text)
                .unwrap_or_default(),
        })
        .collect();

    let options = WireOptions {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        num_predict: request.max_tokens,
        stop: request.stop.clone(),
        seed: request.seed,
    };
    let has_options = options.temperature.is_some()
        || options.top_p.is_some()
        || options.top_k.is_some()
        || options.num_predict.is_some()
        || options.stop.is_some()
        || options.seed.is_some();

    WireChatRequest {
        model: request.model.clone(),
        messages,
        stream,
        options: has_options.then_some(options),
    }
}

fn usage_from(wire: &WireChatResponse) -> (Usage, bool) {
    match (wire.prompt_eval_count, wire.eval_count) {
        (Some(prompt), Some(completion)) => (Usage::new(prompt, completion), false),
        _ => (Usage::default(), true),
    }
}

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    provider_name: String,
}

impl OllamaClient {
    pub fn new(provider: &Provider, key: &ProviderKey) -> Result<Self> {
        let base_url = key
            .base_url_override
            .clone()
            .or_else(|| provider.base_url.clone())
            .unwrap_or_else(|| OLLAMA_API_BASE.to_string());
        Ok(Self {
            // Local daemons ignore the bearer; sending it is harmless and
            // keeps the client uniform.
            http: build_http_client(AuthStyle::Bearer, &key.api_key)?,
            base_url,
            provider_name: provider.name.clone(),
        })
    }
}

#[async_trait]
impl ProviderClient for OllamaClient {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Ollama
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let model = request.model.clone();
        let wire = to_wire(&request, false);

        let response = self
            .http
            .post(join_url(&self.base_url, "api/chat"))
            .timeout(operation_timeout(OperationType::Chat))
            .json(&wire)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let parsed: WireChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;

        let (usage, estimated) = usage_from(&parsed);
        let text = parsed.message.map(|m| m.content).unwrap_or_default();
        if let Some(total) = parsed.total_duration {
            tracing::debug!(
                seconds = nanos_to_seconds(total),
                "ollama generation finished"
            );
        }
        let mut canonical = ChatResponse::assistant(model, text, usage);
        canonical.usage_estimated = estimated;
        Ok(canonical)
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatChunkStream> {
        let model = request.model.clone();
        let wire = to_wire(&request, true);

        let response = self
            .http
            .post(join_url(&self.base_url, "api/chat"))
            .timeout(operation_timeout(OperationType::Chat))
            .json(&wire)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;

        let mut lines = ndjson_stream(response.bytes_stream());
        let stream_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        Ok(Box::pin(async_stream::try_stream! {
            while let Some(line) = lines.next().await {
                let line = line?;
                let parsed: WireChatResponse = serde_json::from_str(&line)
                    .map_err(|e| GatewayError::ProviderCommunication(format!(
                        "malformed ollama frame: {e}"
                    )))?;

                if let Some(message) = &parsed.message {
                    if !message.content.is_empty() {
                        yield ChatChunk::delta(&model, &stream_id, message.content.clone());
                    }
                }
                if parsed.done {
                    let (usage, missing) = usage_from(&parsed);
                    yield ChatChunk::terminal(
                        &model,
                        &stream_id,
                        FinishReason::Stop,
                        if missing { None } else { Some(usage) },
                    );
                    return;
                }
            }
        }))
    }

    async fn embeddings(&self, request: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        #[derive(Serialize)]
        struct WireEmbedRequest {
            model: String,
            input: Vec<String>,
        }
        #[derive(Deserialize)]
        struct WireEmbedResponse {
            embeddings: Vec<Vec<f32>>,
            #[serde(default)]
            prompt_eval_count: Option<u32>,
        }

        let model = request.model.clone();
        let input = match request.input {
            EmbeddingInput::Single(text) => vec![text],
            EmbeddingInput::Batch(texts) => texts,
        };
        let response = self
            .http
            .post(join_url(&self.base_url, "api/embed"))
            .timeout(operation_timeout(OperationType::Embeddings))
            .json(&WireEmbedRequest {
                model: model.clone(),
                input,
            })
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let parsed: WireEmbedResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;

        let usage = Usage::new(parsed.prompt_eval_count.unwrap_or(0), 0);
        Ok(EmbeddingsResponse::new(model, parsed.embeddings, usage))
    }

    async fn verify_authentication(&self) -> AuthCheck {
        let start = Instant::now();
        let result = self
            .http
            .get(join_url(&self.base_url, "api/tags"))
            .timeout(operation_timeout(OperationType::HealthCheck))
            .send()
            .await;
        let elapsed = start.elapsed().as_millis() as u64;
        match result {
            Ok(response) if response.status().is_success() => AuthCheck::success(elapsed),
            Ok(response) => {
                AuthCheck::failure(format!("daemon returned {}", response.status()), elapsed)
            }
            Err(e) => AuthCheck::failure(format!("daemon unreachable: {e}"), elapsed),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Tags {
            models: Vec<Tag>,
        }
        #[derive(Deserialize)]
        struct Tag {
            name: String,
        }
        let response = self
            .http
            .get(join_url(&self.base_url, "api/tags"))
            .timeout(operation_timeout(OperationType::ModelDiscovery))
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let tags: Tags = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn capabilities(&self, _model_id: Option<&str>) -> ProviderCapabilities {
        ProviderCapabilities {
            chat_parameters: ChatParameters {
                temperature: Some(Range { min: 0.0, max: 2.0 }),
                max_tokens: Some(Range { min: 1, max: 128_000 }),
                top_p: Some(Range { min: 0.0, max: 1.0 }),
                top_k: Some(Range { min: 0, max: 100 }),
                stop_sequences_max: None,
                presence_penalty: None,
                frequency_penalty: None,
                logit_bias: false,
                n_max: Some(1),
                user_field: false,
                seed: true,
                response_format: true,
                max_tools: None,
            },
            streaming: true,
            embeddings: true,
            vision: true,
            image_generation: false,
            function_calling: false,
            audio_transcription: false,
            text_to_speech: false,
            realtime_audio: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::ChatMessage;

    #[test]
    fn options_bag_only_when_set() {
        let bare = ChatRequest::new("llama3", vec![ChatMessage::user("hi")]);
        assert!(to_wire(&bare, false).options.is_none());

        let mut tuned = ChatRequest::new("llama3", vec![ChatMessage::user("hi")]);
        tuned.temperature = Some(0.2);
        tuned.max_tokens = Some(64);
        let wire = to_wire(&tuned, true);
        let options = wire.options.unwrap();
        assert_eq!(options.temperature, Some(0.2));
        assert_eq!(options.num_predict, Some(64));
        assert!(wire.stream);
    }

    #[test]
    fn nanosecond_conversion() {
        assert!((nanos_to_seconds(2_500_000_000) - 2.5).abs() < f64::EPSILON);
        assert_eq!(nanos_to_seconds(0), 0.0);
    }

    #[test]
    fn done_frame_supplies_usage() {
        let frame: WireChatResponse = serde_json::from_str(
            r#"{"message":{"role":"assistant","content":""},"done":true,
                "prompt_eval_count":26,"eval_count":298,
                "total_duration":5191566416,"prompt_eval_duration":383809000,
                "eval_duration":4799921000}"#,
        )
        .unwrap();
        let (usage, missing) = usage_from(&frame);
        assert!(!missing);
        assert_eq!(usage, Usage::new(26, 298));
    }

    #[test]
    fn missing_counts_flag_estimation() {
        let frame: WireChatResponse =
            serde_json::from_str(r#"{"message":{"content":"hi"},"done":false}"#).unwrap();
        let (_, missing) = usage_from(&frame);
        assert!(missing);
    }
}
