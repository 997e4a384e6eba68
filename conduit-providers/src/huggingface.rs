//! HuggingFace Inference API dialect: `{inputs, parameters, options}`
//! against `models/{id}`, with messages flattened into a single prompt.

use crate::classify::{check_response, classify_transport_error};
use crate::http::{AuthStyle, build_http_client, operation_timeout};
use crate::{AuthCheck, ChatParameters, ProviderCapabilities, ProviderClient, Range};
use async_trait::async_trait;
use conduit_core::{
    ChatRequest, ChatResponse, EmbeddingInput, EmbeddingsRequest, EmbeddingsResponse,
    GatewayError, MessageContent, OperationType, Provider, ProviderKey, ProviderType, Result,
    Role, Usage,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const HUGGINGFACE_API_BASE: &str = "https://api-inference.huggingface.co";

#[derive(Debug, Serialize)]
struct WireRequest {
    inputs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<WireParameters>,
    options: WireOptions,
}

#[derive(Debug, Serialize)]
struct WireParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_new_tokens: Option<u32>,
    return_full_text: bool,
}

#[derive(Debug, Serialize)]
struct WireOptions {
    wait_for_model: bool,
}

#[derive(Debug, Deserialize)]
struct WireGeneration {
    generated_text: String,
}

/// Flatten chat history into a single prompt with role prefixes, the
/// conventional fallback for text-generation models.
fn flatten_prompt(request: &ChatRequest) -> String {
    let mut prompt = String::new();
    for message in &request.messages {
        let text = message
            .content
            .as_ref()
            .map(MessageContent::as_text)
            .unwrap_or_default();
        let prefix = match message.role {
            Role::System => "System",
            Role::User | Role::Tool => "User",
            Role::Assistant => "Assistant",
        };
        prompt.push_str(prefix);
        prompt.push_str(": ");
        prompt.push_str(&text);
        prompt.push('\n');
    }
    prompt.push_str("Assistant: ");
    prompt
}

pub struct HuggingFaceClient {
    http: reqwest::Client,
    base_url: String,
    provider_name: String,
}

impl HuggingFaceClient {
    pub fn new(provider: &Provider, key: &ProviderKey) -> Result<Self> {
        let base_url = key
            .base_url_override
            .clone()
            .or_else(|| provider.base_url.clone())
            .unwrap_or_else(|| HUGGINGFACE_API_BASE.to_string());
        Ok(Self {
            http: build_http_client(AuthStyle::Bearer, &key.api_key)?,
            base_url,
            provider_name: provider.name.clone(),
        })
    }

    fn model_url(&self, model: &str) -> String {
        format!("{}/models/{}", self.base_url.trim_end_matches('/'), model)
    }
}

#[async_trait]
impl ProviderClient for HuggingFaceClient {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Huggingface
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let model = request.model.clone();
        let prompt = flatten_prompt(&request);
        let wire = WireRequest {
            inputs: prompt,
            parameters: Some(WireParameters {
                temperature: request.temperature,
                top_p: request.top_p,
                top_k: request.top_k,
                max_new_tokens: request.max_tokens,
                return_full_text: false,
            }),
            options: WireOptions {
                wait_for_model: true,
            },
        };

        let response = self
            .http
            .post(self.model_url(&model))
            .timeout(operation_timeout(OperationType::Chat))
            .json(&wire)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let generations: Vec<WireGeneration> = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;

        let text = generations
            .into_iter()
            .next()
            .map(|g| g.generated_text)
            .unwrap_or_default();

        // The inference API reports no token counts.
        let mut canonical = ChatResponse::assistant(model, text, Usage::default());
        canonical.usage_estimated = true;
        Ok(canonical)
    }

    async fn embeddings(&self, request: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        #[derive(Serialize)]
        struct WireEmbedRequest {
            inputs: Vec<String>,
            options: WireOptions,
        }

        let model = request.model.clone();
        let inputs = match request.input {
            EmbeddingInput::Single(text) => vec![text],
            EmbeddingInput::Batch(texts) => texts,
        };
        let response = self
            .http
            .post(format!(
                "{}/pipeline/feature-extraction/{}",
                self.base_url.trim_end_matches('/'),
                model
            ))
            .timeout(operation_timeout(OperationType::Embeddings))
            .json(&WireEmbedRequest {
                inputs,
                options: WireOptions {
                    wait_for_model: true,
                },
            })
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let vectors: Vec<Vec<f32>> = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
        Ok(EmbeddingsResponse::new(model, vectors, Usage::default()))
    }

    async fn verify_authentication(&self) -> AuthCheck {
        let start = Instant::now();
        let result = self
            .http
            .get("https://huggingface.co/api/whoami-v2")
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
                temperature: Some(Range { min: 0.0, max: 100.0 }),
                max_tokens: Some(Range { min: 1, max: 4_096 }),
                top_p: Some(Range { min: 0.0, max: 1.0 }),
                top_k: Some(Range { min: 1, max: 1_000 }),
                stop_sequences_max: None,
                presence_penalty: None,
                frequency_penalty: None,
                logit_bias: false,
                n_max: Some(1),
                user_field: false,
                seed: false,
                response_format: false,
                max_tools: None,
            },
            streaming: false,
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
