//! Vertex AI Gemini dialect: `contents` of role/parts, `generationConfig`,
//! and `usageMetadata` token counts. Streaming uses `:streamGenerateContent`
//! with SSE framing.

use crate::classify::{check_response, classify_transport_error};
use crate::http::{AuthStyle, build_http_client, operation_timeout};
use crate::sse::sse_data_stream;
use crate::{AuthCheck, ChatParameters, ProviderCapabilities, ProviderClient, Range};
use async_trait::async_trait;
use conduit_core::chat::ContentPart;
use conduit_core::{
    ChatChunk, ChatChunkStream, ChatRequest, ChatResponse, FinishReason, GatewayError,
    MessageContent, OperationType, Provider, ProviderKey, ProviderType, Result, Role, Usage,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const VERTEX_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireInlineData>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    usage_metadata: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

fn map_finish(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn to_wire(request: &ChatRequest) -> WireRequest {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for message in &request.messages {
        let parts = match &message.content {
            Some(MessageContent::Text(text)) => vec![WirePart {
                text: Some(text.clone()),
                inline_data: None,
            }],
            Some(MessageContent::Parts(mixed)) => mixed
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => WirePart {
                        text: Some(text.clone()),
                        inline_data: None,
                    },
                    // Gemini wants inline data; data URLs carry it directly.
                    ContentPart::ImageUrl { image_url } => WirePart {
                        text: None,
                        inline_data: Some(WireInlineData {
                            mime_type: "image/jpeg".to_string(),
                            data: image_url
                                .url
                                .rsplit_once("base64,")
                                .map(|(_, d)| d.to_string())
                                .unwrap_or_else(|| image_url.url.clone()),
                        }),
                    },
                })
                .collect(),
            None => Vec::new(),
        };

        match message.role {
            Role::System => {
                system_parts.extend(parts);
            }
            Role::Assistant => contents.push(WireContent {
                role: Some("model".to_string()),
                parts,
            }),
            Role::User | Role::Tool => contents.push(WireContent {
                role: Some("user".to_string()),
                parts,
            }),
        }
    }

    let generation_config = WireGenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        max_output_tokens: request.max_tokens,
        stop_sequences: request.stop.clone(),
    };
    let has_config = generation_config.temperature.is_some()
        || generation_config.top_p.is_some()
        || generation_config.top_k.is_some()
        || generation_config.max_output_tokens.is_some()
        || generation_config.stop_sequences.is_some();

    WireRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then_some(WireContent {
            role: None,
            parts: system_parts,
        }),
        generation_config: has_config.then_some(generation_config),
    }
}

fn candidate_text(response: &WireResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

pub struct VertexClient {
    http: reqwest::Client,
    base_url: String,
    provider_name: String,
}

impl VertexClient {
    pub fn new(provider: &Provider, key: &ProviderKey) -> Result<Self> {
        let base_url = key
            .base_url_override
            .clone()
            .or_else(|| provider.base_url.clone())
            .unwrap_or_else(|| VERTEX_API_BASE.to_string());
        Ok(Self {
            http: build_http_client(AuthStyle::Bearer, &key.api_key)?,
            base_url,
            provider_name: provider.name.clone(),
        })
    }

    fn model_url(&self, model: &str, op: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.base_url.trim_end_matches('/'),
            model,
            op
        )
    }
}

#[async_trait]
impl ProviderClient for VertexClient {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Vertex
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let model = request.model.clone();
        let wire = to_wire(&request);

        let response = self
            .http
            .post(self.model_url(&model, "generateContent"))
            .timeout(operation_timeout(OperationType::Chat))
            .json(&wire)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;

        let (usage, estimated) = match &parsed.usage_metadata {
            Some(u) => (
                Usage::new(u.prompt_token_count, u.candidates_token_count),
                false,
            ),
            None => (Usage::default(), true),
        };
        let finish = map_finish(
            parsed
                .candidates
                .first()
                .and_then(|c| c.finish_reason.as_deref()),
        );
        let mut canonical = ChatResponse::assistant(model, candidate_text(&parsed), usage);
        canonical.choices[0].finish_reason = Some(finish);
        canonical.usage_estimated = estimated;
        Ok(canonical)
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatChunkStream> {
        let model = request.model.clone();
        let wire = to_wire(&request);

        let response = self
            .http
            .post(format!(
                "{}?alt=sse",
                self.model_url(&model, "streamGenerateContent")
            ))
            .timeout(operation_timeout(OperationType::Chat))
            .json(&wire)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;

        let mut events = sse_data_stream(response.bytes_stream());
        let stream_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        Ok(Box::pin(async_stream::try_stream! {
            let mut usage: Option<Usage> = None;
            let mut finish = FinishReason::Stop;
            while let Some(event) = events.next().await {
                let event = event?;
                let parsed: WireResponse = match serde_json::from_str(&event) {
                    Ok(parsed) => parsed,
                    Err(_) => continue,
                };
                if let Some(u) = &parsed.usage_metadata {
                    usage = Some(Usage::new(u.prompt_token_count, u.candidates_token_count));
                }
                if let Some(reason) = parsed
                    .candidates
                    .first()
                    .and_then(|c| c.finish_reason.as_deref())
                {
                    finish = map_finish(Some(reason));
                }
                let text = candidate_text(&parsed);
                if !text.is_empty() {
                    yield ChatChunk::delta(&model, &stream_id, text);
                }
            }
            yield ChatChunk::terminal(&model, &stream_id, finish, usage);
        }))
    }

    async fn verify_authentication(&self) -> AuthCheck {
        let start = Instant::now();
        let result = self
            .http
            .get(format!("{}/models", self.base_url.trim_end_matches('/')))
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

    fn capabilities(&self, _model_id: Option<&str>) -> ProviderCapabilities {
        ProviderCapabilities {
            chat_parameters: ChatParameters {
                temperature: Some(Range { min: 0.0, max: 2.0 }),
                max_tokens: Some(Range { min: 1, max: 8_192 }),
                top_p: Some(Range { min: 0.0, max: 1.0 }),
                top_k: Some(Range { min: 1, max: 40 }),
                stop_sequences_max: Some(5),
                presence_penalty: None,
                frequency_penalty: None,
                logit_bias: false,
                n_max: Some(1),
                user_field: false,
                seed: false,
                response_format: true,
                max_tools: Some(64),
            },
            streaming: true,
            embeddings: false,
            vision: true,
            image_generation: false,
            function_calling: true,
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
    fn roles_map_to_user_and_model() {
        let req = ChatRequest::new(
            "gemini-1.5-pro",
            vec![
                ChatMessage::system("short answers"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ],
        );
        let wire = to_wire(&req);
        assert!(wire.system_instruction.is_some());
        let roles: Vec<Option<&str>> = wire
            .contents
            .iter()
            .map(|c| c.role.as_deref())
            .collect();
        assert_eq!(roles, vec![Some("user"), Some("model")]);
    }

    #[test]
    fn generation_config_shape() {
        let mut req = ChatRequest::new("gemini-1.5-pro", vec![ChatMessage::user("hi")]);
        req.temperature = Some(0.9);
        req.max_tokens = Some(100);
        let body = serde_json::to_value(to_wire(&req)).unwrap();
        assert_eq!(body["generationConfig"]["temperature"], 0.9);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 100);
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn usage_metadata_maps() {
        let parsed: WireResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "bonjour"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
        }))
        .unwrap();
        assert_eq!(candidate_text(&parsed), "bonjour");
        let usage = parsed.usage_metadata.unwrap();
        assert_eq!(usage.prompt_token_count, 4);
        assert_eq!(usage.candidates_token_count, 2);
    }
}
