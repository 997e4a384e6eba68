//! Replicate dialect: predictions are created and then polled until they
//! settle, bounded by the image-generation deadline.

use crate::classify::{check_response, classify_transport_error};
use crate::http::{AuthStyle, build_http_client, join_url, operation_timeout};
use crate::{AuthCheck, ChatParameters, ProviderCapabilities, ProviderClient};
use async_trait::async_trait;
use conduit_core::{
    GatewayError, GeneratedImage, ImageGenerationRequest, ImageGenerationResponse, OperationType,
    Provider, ProviderKey, ProviderType, Result,
};
use serde::Deserialize;
use std::time::{Duration, Instant};

pub const REPLICATE_API_BASE: &str = "https://api.replicate.com";

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl Prediction {
    fn is_settled(&self) -> bool {
        matches!(self.status.as_str(), "succeeded" | "failed" | "canceled")
    }
}

pub struct ReplicateClient {
    http: reqwest::Client,
    base_url: String,
    provider_name: String,
}

impl ReplicateClient {
    pub fn new(provider: &Provider, key: &ProviderKey) -> Result<Self> {
        let base_url = key
            .base_url_override
            .clone()
            .or_else(|| provider.base_url.clone())
            .unwrap_or_else(|| REPLICATE_API_BASE.to_string());
        Ok(Self {
            http: build_http_client(AuthStyle::Bearer, &key.api_key)?,
            base_url,
            provider_name: provider.name.clone(),
        })
    }

    async fn poll_until_settled(&self, id: &str, deadline: Instant) -> Result<Prediction> {
        loop {
            let response = self
                .http
                .get(join_url(&self.base_url, &format!("v1/predictions/{id}")))
                .timeout(Duration::from_secs(10))
                .send()
                .await
                .map_err(classify_transport_error)?;
            let response = check_response(response).await?;
            let prediction: Prediction = response
                .json()
                .await
                .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;

            if prediction.is_settled() {
                return Ok(prediction);
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(GatewayError::Timeout {
                    seconds: operation_timeout(OperationType::ImageGeneration).as_secs(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn outputs_to_images(output: Option<serde_json::Value>) -> Vec<GeneratedImage> {
    let urls: Vec<String> = match output {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(serde_json::Value::String(url)) => vec![url],
        _ => Vec::new(),
    };
    urls.into_iter()
        .map(|url| GeneratedImage {
            url: Some(url),
            b64_json: None,
            revised_prompt: None,
        })
        .collect()
}

#[async_trait]
impl ProviderClient for ReplicateClient {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Replicate
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn generate_images(
        &self,
        request: ImageGenerationRequest,
    ) -> Result<ImageGenerationResponse> {
        let deadline = Instant::now() + operation_timeout(OperationType::ImageGeneration);
        let body = serde_json::json!({
            "input": {
                "prompt": request.prompt,
                "num_outputs": request.count(),
            }
        });

        // The mapping's provider_model_id is an owner/name slug.
        let create_url = join_url(
            &self.base_url,
            &format!("v1/models/{}/predictions", request.model),
        );
        let response = self
            .http
            .post(create_url)
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let created: Prediction = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;

        let settled = if created.is_settled() {
            created
        } else {
            self.poll_until_settled(&created.id, deadline).await?
        };

        match settled.status.as_str() {
            "succeeded" => Ok(ImageGenerationResponse::new(outputs_to_images(
                settled.output,
            ))),
            "canceled" => Err(GatewayError::Cancelled),
            _ => Err(GatewayError::Provider {
                status: 502,
                message: settled
                    .error
                    .unwrap_or_else(|| "prediction failed".to_string()),
                retry_after_seconds: None,
            }),
        }
    }

    async fn verify_authentication(&self) -> AuthCheck {
        let start = Instant::now();
        let result = self
            .http
            .get(join_url(&self.base_url, "v1/account"))
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
            image_generation: true,
            function_calling: false,
            audio_transcription: false,
            text_to_speech: false,
            realtime_audio: false,
        }
    }
}
