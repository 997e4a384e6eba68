//! ElevenLabs dialect: text-to-speech against `text-to-speech/{voice}`,
//! with native HTTP streaming surfaced as audio chunks.

use crate::classify::{check_response, classify_transport_error};
use crate::http::{AuthStyle, build_http_client, join_url, operation_timeout};
use crate::{AuthCheck, ChatParameters, ProviderCapabilities, ProviderClient};
use async_trait::async_trait;
use bytes::Bytes;
use conduit_core::{
    AudioChunk, AudioChunkStream, AudioFormat, AudioUsage, GatewayError, OperationType, Provider,
    ProviderKey, ProviderType, Result, TtsRequest,
};
use futures::StreamExt;
use serde::Serialize;
use std::time::Instant;

pub const ELEVENLABS_API_BASE: &str = "https://api.elevenlabs.io";

#[derive(Debug, Serialize)]
struct WireTtsRequest {
    text: String,
    model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice_settings: Option<WireVoiceSettings>,
}

#[derive(Debug, Serialize)]
struct WireVoiceSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
}

fn output_format_query(format: Option<AudioFormat>, sample_rate: Option<u32>) -> String {
    let rate = sample_rate.unwrap_or(44_100);
    match format {
        Some(AudioFormat::Pcm) => format!("pcm_{rate}"),
        Some(AudioFormat::Ulaw) => "ulaw_8000".to_string(),
        _ => format!("mp3_{rate}_128"),
    }
}

pub struct ElevenLabsClient {
    http: reqwest::Client,
    base_url: String,
    provider_name: String,
}

impl ElevenLabsClient {
    pub fn new(provider: &Provider, key: &ProviderKey) -> Result<Self> {
        let base_url = key
            .base_url_override
            .clone()
            .or_else(|| provider.base_url.clone())
            .unwrap_or_else(|| ELEVENLABS_API_BASE.to_string());
        Ok(Self {
            http: build_http_client(AuthStyle::ElevenLabs, &key.api_key)?,
            base_url,
            provider_name: provider.name.clone(),
        })
    }

    /// The model must be present: it is either specified by the caller or
    /// resolved upstream through the capability service's configured
    /// defaults. There is no fallback here.
    fn tts_body(request: &TtsRequest) -> Result<WireTtsRequest> {
        let model_id = request.model.clone().ok_or_else(|| {
            GatewayError::InvalidRequest("text-to-speech model must be specified".to_string())
        })?;
        Ok(WireTtsRequest {
            text: request.input.clone(),
            model_id,
            voice_settings: request.speed.map(|speed| WireVoiceSettings {
                speed: Some(speed),
            }),
        })
    }
}

#[async_trait]
impl ProviderClient for ElevenLabsClient {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Elevenlabs
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn speak(&self, request: TtsRequest) -> Result<(Bytes, AudioUsage)> {
        request.validate()?;
        let character_count = request.input.chars().count() as u64;
        let url = format!(
            "{}?output_format={}",
            join_url(
                &self.base_url,
                &format!("v1/text-to-speech/{}", request.voice)
            ),
            output_format_query(request.response_format, request.sample_rate)
        );

        let response = self
            .http
            .post(url)
            .timeout(operation_timeout(OperationType::TextToSpeech))
            .json(&Self::tts_body(&request)?)
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

    /// Native streaming over the `/stream` endpoint; frames arrive as the
    /// provider produces them.
    async fn stream_speech(&self, request: TtsRequest) -> Result<AudioChunkStream> {
        request.validate()?;
        let url = format!(
            "{}?output_format={}",
            join_url(
                &self.base_url,
                &format!("v1/text-to-speech/{}/stream", request.voice)
            ),
            output_format_query(request.response_format, request.sample_rate)
        );

        let response = self
            .http
            .post(url)
            .timeout(operation_timeout(OperationType::TextToSpeech))
            .json(&Self::tts_body(&request)?)
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;

        let mut bytes = response.bytes_stream();
        Ok(Box::pin(async_stream::stream! {
            let mut index: u32 = 0;
            let mut pending: Option<Bytes> = None;
            loop {
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        if let Some(previous) = pending.replace(chunk) {
                            yield Ok(AudioChunk {
                                data: previous,
                                chunk_index: index,
                                is_final: false,
                                text_segment: None,
                                timestamp: None,
                            });
                            index += 1;
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(GatewayError::ProviderCommunication(e.to_string()));
                        return;
                    }
                    None => break,
                }
            }
            // Whatever is buffered last is the terminal frame.
            yield Ok(AudioChunk {
                data: pending.unwrap_or_default(),
                chunk_index: index,
                is_final: true,
                text_segment: None,
                timestamp: None,
            });
        }))
    }

    async fn verify_authentication(&self) -> AuthCheck {
        let start = Instant::now();
        let result = self
            .http
            .get(join_url(&self.base_url, "v1/user"))
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
        #[derive(serde::Deserialize)]
        struct Model {
            model_id: String,
        }
        let response = self
            .http
            .get(join_url(&self.base_url, "v1/models"))
            .timeout(operation_timeout(OperationType::ModelDiscovery))
            .send()
            .await
            .map_err(classify_transport_error)?;
        let response = check_response(response).await?;
        let models: Vec<Model> = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderCommunication(e.to_string()))?;
        Ok(models.into_iter().map(|m| m.model_id).collect())
    }

    fn capabilities(&self, _model_id: Option<&str>) -> ProviderCapabilities {
        ProviderCapabilities {
            chat_parameters: ChatParameters::default(),
            streaming: false,
            embeddings: false,
            vision: false,
            image_generation: false,
            function_calling: false,
            audio_transcription: true,
            text_to_speech: true,
            realtime_audio: true,
        }
    }
}
