//! OpenAI Realtime API translation over a split websocket.

use crate::config::{RealtimeConfig, TurnDetection};
use crate::events::{ClientFrame, RealtimeResponse};
use crate::session::{CLOSE_TIMEOUT, RealtimeSession, SessionState, SessionStats, StatsRecorder};
use async_trait::async_trait;
use base64::prelude::*;
use conduit_core::{GatewayError, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::Message};

pub const OPENAI_REALTIME_BASE: &str = "wss://api.openai.com/v1/realtime";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

fn turn_detection_json(policy: &TurnDetection) -> Value {
    match policy {
        TurnDetection::ServerVad {
            silence_threshold_ms,
            prefix_padding_ms,
            energy_threshold,
        } => json!({
            "type": "server_vad",
            "threshold": energy_threshold,
            "prefix_padding_ms": prefix_padding_ms,
            "silence_duration_ms": silence_threshold_ms,
        }),
        // Manual and push-to-talk both disable provider VAD; the caller
        // commits turns explicitly.
        TurnDetection::Manual | TurnDetection::PushToTalk => Value::Null,
    }
}

fn session_update_payload(config: &RealtimeConfig) -> Value {
    let mut session = json!({
        "turn_detection": turn_detection_json(&config.turn_detection),
        "input_audio_transcription": { "model": "whisper-1" },
    });
    if let Some(voice) = &config.voice {
        session["voice"] = json!(voice);
    }
    if let Some(prompt) = &config.system_prompt {
        session["instructions"] = json!(prompt);
    }
    if let Some(temperature) = config.temperature {
        session["temperature"] = json!(temperature);
    }
    if let Some(tools) = &config.tools {
        session["tools"] = json!(tools);
    }
    json!({ "type": "session.update", "session": session })
}

/// Seconds of 16-bit mono PCM represented by `byte_len` bytes.
fn pcm_seconds(byte_len: usize, sample_rate: u32) -> f64 {
    byte_len as f64 / (sample_rate as f64 * 2.0)
}

pub struct OpenAiRealtimeSession {
    session_id: String,
    provider_name: String,
    sample_rate: u32,
    state: SyncMutex<SessionState>,
    sender: Arc<Mutex<WsSink>>,
    receiver: Arc<Mutex<WsSource>>,
    stats: Arc<StatsRecorder>,
}

impl OpenAiRealtimeSession {
    /// Connect and send the initial `session.update` derived from the
    /// config.
    pub async fn connect(
        api_key: &SecretString,
        base_url: Option<&str>,
        config: RealtimeConfig,
    ) -> Result<Self> {
        let url = format!(
            "{}?model={}",
            base_url.unwrap_or(OPENAI_REALTIME_BASE),
            config.model
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| GatewayError::Configuration(format!("bad realtime URL: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
            .map_err(|_| GatewayError::Configuration("api key contains invalid characters".into()))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(format!("realtime connect: {e}")))?;
        let (sink, source) = stream.split();

        let session = Self {
            session_id: format!("rt_{}", uuid::Uuid::new_v4().simple()),
            provider_name: "openai".to_string(),
            sample_rate: config.sample_rate,
            state: SyncMutex::new(SessionState::Connected),
            sender: Arc::new(Mutex::new(sink)),
            receiver: Arc::new(Mutex::new(source)),
            stats: StatsRecorder::new(),
        };
        session.send_json(session_update_payload(&config)).await?;
        Ok(session)
    }

    async fn send_json(&self, payload: Value) -> Result<()> {
        let mut sender = self.sender.lock().await;
        sender
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| {
                *self.state.lock() = SessionState::Error;
                GatewayError::ProviderCommunication(format!("realtime send: {e}"))
            })
    }

    fn translate_event(&self, event: &Value) -> Option<RealtimeResponse> {
        let event_type = event.get("type").and_then(Value::as_str)?;
        match event_type {
            "conversation.item.input_audio_transcription.delta" => {
                Some(RealtimeResponse::TranscriptionPartial {
                    text: event.get("delta")?.as_str()?.to_string(),
                })
            }
            "conversation.item.input_audio_transcription.completed" => {
                Some(RealtimeResponse::TranscriptionFinal {
                    text: event.get("transcript")?.as_str()?.to_string(),
                })
            }
            "response.audio_transcript.delta" => {
                Some(RealtimeResponse::AssistantTranscriptDelta {
                    text: event.get("delta")?.as_str()?.to_string(),
                })
            }
            "response.audio.delta" => {
                let audio = event.get("delta")?.as_str()?.to_string();
                if let Ok(decoded) = BASE64_STANDARD.decode(&audio) {
                    self.stats
                        .add_output_audio(pcm_seconds(decoded.len(), self.sample_rate));
                }
                Some(RealtimeResponse::AudioChunk { audio })
            }
            "input_audio_buffer.speech_started" => {
                // Caller speech over assistant output marks an
                // interruption of the current turn.
                *self.state.lock() = SessionState::Active;
                None
            }
            "response.function_call_arguments.done" => {
                self.stats.function_called();
                Some(RealtimeResponse::ToolCall {
                    call_id: event.get("call_id")?.as_str()?.to_string(),
                    name: event.get("name")?.as_str()?.to_string(),
                    arguments: event.get("arguments")?.as_str()?.to_string(),
                })
            }
            "response.done" => {
                let response = event.get("response");
                if let Some(usage) = response.and_then(|r| r.get("usage")) {
                    self.stats.add_tokens(
                        usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                        usage
                            .get("output_tokens")
                            .and_then(Value::as_u64)
                            .unwrap_or(0),
                    );
                }
                let interrupted = response
                    .and_then(|r| r.get("status"))
                    .and_then(Value::as_str)
                    .is_some_and(|s| s == "cancelled");
                self.stats.turn_completed(interrupted);
                Some(RealtimeResponse::TurnComplete { interrupted })
            }
            "error" => {
                self.stats.note_error();
                Some(RealtimeResponse::Error {
                    message: event
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or("realtime error")
                        .to_string(),
                })
            }
            _ => None,
        }
    }
}

#[async_trait]
impl RealtimeSession for OpenAiRealtimeSession {
    fn id(&self) -> &str {
        &self.session_id
    }

    fn provider(&self) -> &str {
        &self.provider_name
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    async fn send(&self, frame: ClientFrame) -> Result<()> {
        let payload = match frame {
            ClientFrame::AppendAudio { audio } => {
                if let Ok(decoded) = BASE64_STANDARD.decode(&audio) {
                    self.stats
                        .add_input_audio(pcm_seconds(decoded.len(), self.sample_rate));
                }
                json!({ "type": "input_audio_buffer.append", "audio": audio })
            }
            ClientFrame::CommitAudio => {
                self.send_json(json!({ "type": "input_audio_buffer.commit" }))
                    .await?;
                json!({ "type": "response.create" })
            }
            ClientFrame::ClearAudio => json!({ "type": "input_audio_buffer.clear" }),
            ClientFrame::UserText { text } => {
                self.send_json(json!({
                    "type": "conversation.item.create",
                    "item": {
                        "type": "message",
                        "role": "user",
                        "content": [{ "type": "input_text", "text": text }],
                    }
                }))
                .await?;
                json!({ "type": "response.create" })
            }
            ClientFrame::ToolResult { call_id, output } => {
                self.send_json(json!({
                    "type": "conversation.item.create",
                    "item": {
                        "type": "function_call_output",
                        "call_id": call_id,
                        "output": output,
                    }
                }))
                .await?;
                json!({ "type": "response.create" })
            }
            ClientFrame::UpdateSession { config } => session_update_payload(&config),
        };
        *self.state.lock() = SessionState::Active;
        self.send_json(payload).await
    }

    async fn receive(&self) -> Result<Option<RealtimeResponse>> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    let Ok(event) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if let Some(response) = self.translate_event(&event) {
                        return Ok(Some(response));
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    *self.state.lock() = SessionState::Disconnected;
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    *self.state.lock() = SessionState::Error;
                    self.stats.note_error();
                    return Err(GatewayError::ProviderCommunication(format!(
                        "realtime receive: {e}"
                    )));
                }
            }
        }
    }

    async fn update(&self, config: RealtimeConfig) -> Result<()> {
        self.send_json(session_update_payload(&config)).await
    }

    async fn close(&self) -> Result<()> {
        let close = async {
            let mut sender = self.sender.lock().await;
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "session disposed".into(),
                })))
                .await;
            let _ = sender.close().await;
        };
        // Best-effort: a hung peer must not hold disposal hostage.
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, close).await;
        *self.state.lock() = SessionState::Closed;
        Ok(())
    }
}
