//! Cohere dialect. Chat takes `message` plus `chat_history` with
//! `USER`/`CHATBOT`/`SYSTEM` roles; streaming is a sequence of
//! `event_type` objects ending with `stream-end`.

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

pub const COHERE_API_BASE: &str = "https://api.cohere.com";

/// Largest batch Cohere accepts per embed call.
const EMBED_BATCH_LIMIT: usize = 96;

#[derive(Debug, Serialize)]
struct WireChatRequest {
    model: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    chat_history: Vec<WireTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preamble: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireTurn {
    role: &'static str,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    #[serde(default)]
    generation_id: Option<String>,
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    meta: Option<WireMeta>,
}

#[derive(Debug, Deserialize)]
struct WireMeta {
    #[serde(default)]
    billed_units: Option<WireBilledUnits>,
}

#[derive(Debug, Default, Deserialize)]
struct WireBilledUnits {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    event_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    response: Option<WireChatResponse>,
}

#[derive(Debug, Serialize)]
struct WireEmbedRequest {
    model: String,
    texts: Vec<String>,
    input_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct WireEmbedResponse {
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    meta: Option<WireMeta>,
}

fn map_finish(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

fn to_wire(request: &ChatRequest) -> Result<WireChatRequest> {
    let mut preamble_parts = Vec::new();
    let mut turns: Vec<(Role, String)> = Vec::new();
    for message in &request.messages {
        let text = message
            .content
            .as_ref()
            .map(MessageContent::as_text)
            .unwrap_or_default();
        match message.role {
            Role::System => preamble_parts.push(text),
            Role::User | Role::Tool => turns.push((Role::User, text)),
            Role::Assistant => turns.push((Role::Assistant, text)),
        }
    }

    let message = match turns.pop() {
        Some((Role::User, text)) => text,
        Some(_) => {
            return Err(GatewayError::InvalidRequest(
                "cohere chat requires a trailing user message".to_string(),
            ));
        }
        None => {
            return Err(GatewayError::InvalidRequest(
                "cohere chat requires at least one user message".to_string(),
            ));
        }
    };

    let chat_history = turns
        .into_iter()
        .map(|(role, text)| WireTurn {
            role: match role {
                Role::Assistant => "CHATBOT",
                _ => "USER",
            },
            message: text,
        })
        .collect();

    Ok(WireChatRequest {
        model: request.model.clone(),
        message,
        chat_history,
        preamble: if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        },
        temperature: request.temperature,
        p: request.top_p,
        k: request.top_k,
        max_tokens: request.max_tokens,
        stop_sequences: request.stop.clone(),
        stream: request.stream,
    })
}

fn usage_from_meta(meta: Option<&WireMeta>) -> (Usage, bool) {
    match meta.and_then(|m| m.billed_units.as_ref()) {
        Some(units) => (Usage::new(units.input_tokens, units.output_tokens), false),
        None => (Usage::default(), true),
    }
}

pub struct CohereClient {
    http: reqwest::Client,
    base_url: String,
    provider_name: String,
}

impl CohereClient {
    pub fn new(provider: &Provider, key: &ProviderKey) -> Result<Self> {
        let base_url = key
            .base_url_override
            .clone()
            .or_else(|| provider.base_url.clone())
            .unwrap_or_else(|| COHERE_API_BASE.to_string());
        Ok(Self {
            http: build_http_client(AuthStyle::Bearer, &key.api_key)?,
            base_url,
            provider_name: provider.name.clone(),
        })
    }
}

#[async_trait]
impl ProviderClient for CohereClient {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Cohere
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let model = request.model.clone();
        let mut wire = to_wire(&request)?;
        wire.stream = false;

        let response = self
            .http
            .post(join_url(&self.base_url, "v1/chat"))
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

        let (usage, estimated) = usage_from_meta(parsed.meta.as_ref());
        let mut canonical = ChatResponse::assistant(model, parsed.text, usage);
        if let Some(id) = parsed.generation_id {
            canonical.id = id;
        }
        canonical.choices[0].finish_reason = Some(map_finish(parsed.finish_reason.as_deref()));
        canonical.usage_estimated = estimated;
        Ok(canonical)
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatChunkStream> {
        let model = request.model.clone();
        let mut wire = to_wire(&request)?;
        wire.stream = true;

        let response = self
            .http
            .post(join_url(&self.base_url, "v1/chat"))
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
                let event: StreamEvent = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    Err(_) => continue,
                };
                match event.event_type.as_str() {
                    "text-generation" => {
                        if let Some(text) = event.text {
                            yield ChatChunk::delta(&model, &stream_id, text);
                        }
                    }
                    "stream-end" => {
                        let (usage, missing) = usage_from_meta(
                            event.response.as_ref().and_then(|r| r.meta.as_ref()),
                        );
                        let finish = map_finish(
                            event
                                .finish_reason
                                .as_deref()
                                .or(event
                                    .response
                                    .as_ref()
                                    .and_then(|r| r.finish_reason.as_deref())),
                        );
                        yield ChatChunk::terminal(
                            &model,
                            &stream_id,
                            finish,
                            if missing { None } else { Some(usage) },
                        );
                        return;
                    }
                    _ => {}
                }
            }
        }))
    }

    /// Splits over the provider batch limit and reassembles vectors in
    /// input order.
    async fn embeddings(&self, request: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let model = request.model.clone();
        let texts = match request.input {
            EmbeddingInput::Single(text) => vec![text],
            EmbeddingInput::Batch(texts) => texts,
        };

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        let mut usage = Usage::default();
        for batch in texts.chunks(EMBED_BATCH_LIMIT) {
            let wire = WireEmbedRequest {
                model: model.clone(),
                texts: batch.to_vec(),
                input_type: "search_document",
            };
            let response = self
                .http
                .post(join_url(&self.base_url, "v1/embed"))
                .timeout(operation_timeout(OperationType::Embeddings))
                .json(&wire)
                .send()
                .await
                .map_err(classify_transport_error)?;
            let response = check_response(response).await?;
            let parsed: WireEmbedResponse = response
                .json()
                .await
                .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
            if let Some(units) = parsed.meta.as_ref().and_then(|m| m.billed_units.as_ref()) {
                usage.prompt_tokens += units.input_tokens;
                usage.total_tokens += units.input_tokens;
            }
            vectors.extend(parsed.embeddings);
        }

        Ok(EmbeddingsResponse::new(model, vectors, usage))
    }

    async fn verify_authentication(&self) -> AuthCheck {
        let start = Instant::now();
        let result = self
            .http
            .get(join_url(&self.base_url, "v1/models"))
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

    async fn list_models(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct List {
            models: Vec<Entry>,
        }
        #[derive(Deserialize)]
        struct Entry {
            name: String,
        }
        let response = self
            .http
            .get(join_url(&self.base_url, "v1/models"))
            .timeout(operation_timeout(OperationType::ModelDiscovery))
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let list: List = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
        Ok(list.models.into_iter().map(|m| m.name).collect())
    }

    fn capabilities(&self, _model_id: Option<&str>) -> ProviderCapabilities {
        ProviderCapabilities {
            chat_parameters: ChatParameters {
                temperature: Some(Range { min: 0.0, max: 5.0 }),
                max_tokens: Some(Range { min: 1, max: 4_000 }),
                top_p: Some(Range { min: 0.01, max: 0.99 }),
                top_k: Some(Range { min: 0, max: 500 }),
                stop_sequences_max: Some(5),
                presence_penalty: Some(Range { min: 0.0, max: 1.0 }),
                frequency_penalty: Some(Range { min: 0.0, max: 1.0 }),
                logit_bias: false,
                n_max: Some(1),
                user_field: false,
                seed: false,
                response_format: false,
                max_tools: None,
            },
            streaming: true,
            embeddings: true,
            vision: false,
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
    fn history_roles_are_upper_case() {
        let req = ChatRequest::new(
            "command-r",
            vec![
                ChatMessage::system("Stay factual."),
                ChatMessage::user("Hi"),
                ChatMessage::assistant("Hello!"),
                ChatMessage::user("What is Cohere?"),
            ],
        );
        let wire = to_wire(&req).unwrap();
        assert_eq!(wire.message, "What is Cohere?");
        assert_eq!(wire.preamble.as_deref(), Some("Stay factual."));
        let roles: Vec<&str> = wire.chat_history.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec!["USER", "CHATBOT"]);
    }

    #[test]
    fn trailing_assistant_turn_is_invalid() {
        let req = ChatRequest::new(
            "command-r",
            vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello!")],
        );
        assert!(matches!(
            to_wire(&req).unwrap_err(),
            GatewayError::InvalidRequest(_)
        ));
    }

    #[test]
    fn missing_usage_flags_estimation() {
        let (usage, missing) = usage_from_meta(None);
        assert!(missing);
        assert!(usage.is_zero());
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish(Some("MAX_TOKENS")), FinishReason::Length);
        assert_eq!(map_finish(Some("COMPLETE")), FinishReason::Stop);
    }
}
