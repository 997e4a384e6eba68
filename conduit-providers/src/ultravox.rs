//! Ultravox dialect. The HTTP surface only provisions realtime calls: a
//! call is created here and the duplex session connects to the returned
//! join URL (see `conduit-realtime`).

use crate::classify::{check_response, classify_transport_error};
use crate::http::{AuthStyle, build_http_client, join_url, operation_timeout};
use crate::{AuthCheck, ChatParameters, ProviderCapabilities, ProviderClient};
use async_trait::async_trait;
use conduit_core::{
    GatewayError, OperationType, Provider, ProviderKey, ProviderType, Result,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const ULTRAVOX_API_BASE: &str = "https://api.ultravox.ai";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_speaker: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedCall {
    pub call_id: String,
    pub join_url: String,
}

pub struct UltravoxClient {
    http: reqwest::Client,
    base_url: String,
    provider_name: String,
}

impl UltravoxClient {
    pub fn new(provider: &Provider, key: &ProviderKey) -> Result<Self> {
        let base_url = key
            .base_url_override
            .clone()
            .or_else(|| provider.base_url.clone())
            .unwrap_or_else(|| ULTRAVOX_API_BASE.to_string());
        Ok(Self {
            http: build_http_client(AuthStyle::XApiKey, &key.api_key)?,
            base_url,
            provider_name: provider.name.clone(),
        })
    }

    /// Provision a realtime call and return its websocket join URL.
    pub async fn create_call(&self, request: CreateCallRequest) -> Result<CreatedCall> {
        let response = self
            .http
            .post(join_url(&self.base_url, "api/calls"))
            .timeout(operation_timeout(OperationType::Realtime))
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
}

#[async_trait]
impl ProviderClient for UltravoxClient {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Ultravox
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn verify_authentication(&self) -> AuthCheck {
        let start = Instant::now();
        let result = self
            .http
            .get(join_url(&self.base_url, "api/voices"))
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
            chat_parameters: ChatParameters::default(),
            streaming: false,
            embeddings: false,
            vision: false,
            image_generation: false,
            function_calling: true,
            audio_transcription: false,
            text_to_speech: false,
            realtime_audio: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_call_wire_shape() {
        let body = serde_json::to_value(CreateCallRequest {
            model: "fixie-ai/ultravox".to_string(),
            system_prompt: Some("be nice".to_string()),
            voice: None,
            first_speaker: None,
        })
        .unwrap();
        assert_eq!(body["model"], "fixie-ai/ultravox");
        assert_eq!(body["systemPrompt"], "be nice");
        assert!(body.get("voice").is_none());
    }

    #[test]
    fn created_call_parses_camel_case() {
        let call: CreatedCall = serde_json::from_value(serde_json::json!({
            "callId": "c1",
            "joinUrl": "wss://example/join"
        }))
        .unwrap();
        assert_eq!(call.call_id, "c1");
        assert_eq!(call.join_url, "wss://example/join");
    }
}
