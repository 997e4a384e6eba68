//! Anthropic Messages dialect. `system` is a top-level string, `messages`
//! carry only user/assistant turns, `max_tokens` is mandatory, and the
//! stream is an event sequence (`message_start`, `content_block_delta`,
//! `message_delta`, `message_stop`) rather than OpenAI chunks.

use crate::classify::{check_response, classify_transport_error};
use crate::http::{AuthStyle, build_http_client, join_url, operation_timeout};
use crate::sse::sse_data_stream;
use crate::{AuthCheck, ChatParameters, ProviderCapabilities, ProviderClient, Range};
use async_trait::async_trait;
use conduit_core::{
    ChatChunk, ChatChunkStream, ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason,
    GatewayError, MessageContent, OperationType, Provider, ProviderKey, ProviderType, Result, Role,
    ToolCall, Usage,
};
use conduit_core::chat::{ContentPart, FunctionCall};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    Image {
        source: serde_json::Value,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    model: String,
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StreamMessageStart },
    ContentBlockStart {},
    ContentBlockDelta { delta: StreamDelta },
    ContentBlockStop {},
    MessageDelta {
        delta: StreamMessageDelta,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop {},
    Ping {},
    Error { error: serde_json::Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessageStart {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

fn to_wire(request: &ChatRequest) -> Result<MessagesRequest> {
    let mut system_parts = Vec::new();
    let mut messages: Vec<WireMessage> = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => {
                if let Some(content) = &message.content {
                    system_parts.push(content.as_text());
                }
            }
            Role::User => {
                messages.push(WireMessage {
                    role: "user",
                    content: content_blocks(message)?,
                });
            }
            Role::Assistant => {
                let mut blocks = content_blocks(message)?;
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        blocks.push(WireBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input: serde_json::from_str(&call.function.arguments)
                                .unwrap_or(serde_json::Value::Null),
                        });
                    }
                }
                messages.push(WireMessage {
                    role: "assistant",
                    content: blocks,
                });
            }
            // Tool results travel as user-side tool_result blocks.
            Role::Tool => {
                let content = message
                    .content
                    .as_ref()
                    .map(MessageContent::as_text)
                    .unwrap_or_default();
                messages.push(WireMessage {
                    role: "user",
                    content: vec![WireBlock::ToolResult {
                        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                        content,
                    }],
                });
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| WireTool {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                input_schema: t
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            })
            .collect()
    });

    Ok(MessagesRequest {
        model: request.model.clone(),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        },
        messages,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stop_sequences: request.stop.clone(),
        tools,
        stream: request.stream,
    })
}

fn content_blocks(message: &ChatMessage) -> Result<Vec<WireBlock>> {
    let Some(content) = &message.content else {
        return Ok(Vec::new());
    };
    match content {
        MessageContent::Text(text) => Ok(vec![WireBlock::Text { text: text.clone() }]),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => Ok(WireBlock::Text { text: text.clone() }),
                ContentPart::ImageUrl { image_url } => Ok(WireBlock::Image {
                    source: serde_json::json!({"type": "url", "url": image_url.url}),
                }),
            })
            .collect(),
    }
}

fn from_wire(wire: MessagesResponse, alias_model: &str) -> ChatResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in wire.content {
        match block {
            ResponseBlock::Text { text: t } => text.push_str(&t),
            ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                call_type: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            ResponseBlock::Other => {}
        }
    }

    let message = ChatMessage {
        role: Role::Assistant,
        content: Some(MessageContent::Text(text)),
        name: None,
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
    };

    ChatResponse {
        id: wire.id,
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: if wire.model.is_empty() {
            alias_model.to_string()
        } else {
            wire.model
        },
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: Some(map_stop_reason(wire.stop_reason.as_deref())),
        }],
        usage: Usage::new(wire.usage.input_tokens, wire.usage.output_tokens),
        usage_estimated: false,
    }
}

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    provider_name: String,
}

impl AnthropicClient {
    pub fn new(provider: &Provider, key: &ProviderKey) -> Result<Self> {
        let base_url = key
            .base_url_override
            .clone()
            .or_else(|| provider.base_url.clone())
            .unwrap_or_else(|| ANTHROPIC_API_BASE.to_string());
        Ok(Self {
            http: build_http_client(AuthStyle::Anthropic, &key.api_key)?,
            base_url,
            provider_name: provider.name.clone(),
        })
    }

    fn messages_url(&self) -> String {
        join_url(&self.base_url, "v1/messages")
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let alias_model = request.model.clone();
        let mut wire = to_wire(&request)?;
        wire.stream = false;

        let response = self
            .http
            .post(self.messages_url())
            .timeout(operation_timeout(OperationType::Chat))
            .json(&wire)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
        Ok(from_wire(parsed, &alias_model))
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatChunkStream> {
        let model = request.model.clone();
        let mut wire = to_wire(&request)?;
        wire.stream = true;

        let response = self
            .http
            .post(self.messages_url())
            .timeout(operation_timeout(OperationType::Chat))
            .json(&wire)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;

        let mut events = sse_data_stream(response.bytes_stream());
        let stream_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        Ok(Box::pin(async_stream::try_stream! {
            let mut usage = Usage::default();
            let mut finish = FinishReason::Stop;
            while let Some(event) = events.next().await {
                let event = event?;
                let parsed: StreamEvent = match serde_json::from_str(&event) {
                    Ok(parsed) => parsed,
                    Err(_) => continue,
                };
                match parsed {
                    StreamEvent::MessageStart { message } => {
                        usage.prompt_tokens = message.usage.input_tokens;
                    }
                    StreamEvent::ContentBlockDelta { delta } => {
                        if let StreamDelta::TextDelta { text } = delta {
                            yield ChatChunk::delta(&model, &stream_id, text);
                        }
                    }
                    StreamEvent::MessageDelta { delta, usage: delta_usage } => {
                        if let Some(wire_usage) = delta_usage {
                            usage.completion_tokens = wire_usage.output_tokens;
                        }
                        finish = map_stop_reason(delta.stop_reason.as_deref());
                    }
                    StreamEvent::MessageStop {} => {
                        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
                        yield ChatChunk::terminal(&model, &stream_id, finish, Some(usage));
                        return;
                    }
                    StreamEvent::Error { error } => {
                        Err(GatewayError::Provider {
                            status: 500,
                            message: error.to_string(),
                            retry_after_seconds: None,
                        })?;
                    }
                    _ => {}
                }
            }
        }))
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
            data: Vec<Entry>,
        }
        #[derive(Deserialize)]
        struct Entry {
            id: String,
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
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    fn capabilities(&self, _model_id: Option<&str>) -> ProviderCapabilities {
        ProviderCapabilities {
            chat_parameters: ChatParameters {
                temperature: Some(Range { min: 0.0, max: 1.0 }),
                max_tokens: Some(Range { min: 1, max: 64_000 }),
                top_p: Some(Range { min: 0.0, max: 1.0 }),
                top_k: Some(Range { min: 0, max: 500 }),
                stop_sequences_max: Some(4),
                presence_penalty: None,
                frequency_penalty: None,
                logit_bias: false,
                n_max: Some(1),
                user_field: false,
                seed: false,
                response_format: false,
                max_tools: Some(128),
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

    fn request() -> ChatRequest {
        let mut req = ChatRequest::new(
            "claude-3-opus",
            vec![
                ChatMessage::system("Be brief."),
                ChatMessage::user("Hello"),
            ],
        );
        req.temperature = Some(0.5);
        req
    }

    #[test]
    fn system_is_hoisted_top_level() {
        let wire = to_wire(&request()).unwrap();
        assert_eq!(wire.system.as_deref(), Some("Be brief."));
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "user");
        assert_eq!(wire.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn max_tokens_is_always_present() {
        let mut req = request();
        req.max_tokens = Some(512);
        let wire = to_wire(&req).unwrap();
        assert_eq!(wire.max_tokens, 512);

        let body = serde_json::to_value(&wire).unwrap();
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn tool_result_becomes_user_block() {
        let mut req = request();
        req.messages.push(ChatMessage {
            role: Role::Tool,
            content: Some(MessageContent::Text("42".to_string())),
            name: None,
            tool_calls: None,
            tool_call_id: Some("toolu_1".to_string()),
        });
        let wire = to_wire(&req).unwrap();
        let last = wire.messages.last().unwrap();
        assert_eq!(last.role, "user");
        let body = serde_json::to_value(last).unwrap();
        assert_eq!(body["content"][0]["type"], "tool_result");
        assert_eq!(body["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn response_maps_to_canonical() {
        let wire: MessagesResponse = serde_json::from_value(serde_json::json!({
            "id": "msg_1",
            "model": "claude-3-opus-20240229",
            "content": [{"type": "text", "text": "Bonjour"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 3}
        }))
        .unwrap();
        let canonical = from_wire(wire, "claude-3-opus");
        assert_eq!(canonical.first_text().as_deref(), Some("Bonjour"));
        assert_eq!(canonical.usage, Usage::new(12, 3));
        assert_eq!(
            canonical.choices[0].finish_reason,
            Some(FinishReason::Stop)
        );
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(map_stop_reason(Some("tool_use")), FinishReason::ToolCalls);
        assert_eq!(map_stop_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(map_stop_reason(None), FinishReason::Stop);
    }
}
