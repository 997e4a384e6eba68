//! Ultravox call translation. Audio travels as raw binary frames in both
//! directions; transcripts and state changes arrive as JSON data
//! messages.

use crate::config::RealtimeConfig;
use crate::events::{ClientFrame, RealtimeResponse};
use crate::session::{CLOSE_TIMEOUT, RealtimeSession, SessionState, SessionStats, StatsRecorder};
use async_trait::async_trait;
use base64::prelude::*;
use conduit_core::{GatewayError, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

pub struct UltravoxRealtimeSession {
    session_id: String,
    provider_name: String,
    sample_rate: u32,
    state: SyncMutex<SessionState>,
    sender: Arc<Mutex<WsSink>>,
    receiver: Arc<Mutex<WsSource>>,
    stats: Arc<StatsRecorder>,
}

impl UltravoxRealtimeSession {
    /// Join a call previously created through the Ultravox HTTP client.
    pub async fn connect(join_url: &str, config: &RealtimeConfig) -> Result<Self> {
        let request = join_url
            .into_client_request()
            .map_err(|e| GatewayError::Configuration(format!("bad join URL: {e}")))?;
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| GatewayError::ProviderUnavailable(format!("ultravox connect: {e}")))?;
        let (sink, source) = stream.split();

        Ok(Self {
            session_id: format!("rt_{}", uuid::Uuid::new_v4().simple()),
            provider_name: "ultravox".to_string(),
            sample_rate: config.sample_rate,
            state: SyncMutex::new(SessionState::Connected),
            sender: Arc::new(Mutex::new(sink)),
            receiver: Arc::new(Mutex::new(source)),
            stats: StatsRecorder::new(),
        })
    }

    fn pcm_seconds(&self, byte_len: usize) -> f64 {
        byte_len as f64 / (self.sample_rate as f64 * 2.0)
    }
}

fn translate_data_message(stats: &StatsRecorder, event: &Value) -> Option<RealtimeResponse> {
    match event.get("type").and_then(Value::as_str)? {
        "transcript" => {
            let text = event.get("text").and_then(Value::as_str)?.to_string();
            let is_final = event.get("final").and_then(Value::as_bool).unwrap_or(false);
            let role = event.get("role").and_then(Value::as_str).unwrap_or("user");
            Some(match (role, is_final) {
                ("agent", _) => RealtimeResponse::AssistantTranscriptDelta { text },
                (_, true) => RealtimeResponse::TranscriptionFinal { text },
                (_, false) => RealtimeResponse::TranscriptionPartial { text },
            })
        }
        "client_tool_invocation" => {
            stats.function_called();
            Some(RealtimeResponse::ToolCall {
                call_id: event
                    .get("invocationId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: event
                    .get("toolName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                arguments: event
                    .get("parameters")
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "{}".to_string()),
            })
        }
        "state" => {
            let state = event.get("state").and_then(Value::as_str)?;
            match state {
                // Agent went back to listening: the turn finished.
                "listening" => {
                    stats.turn_completed(false);
                    Some(RealtimeResponse::TurnComplete { interrupted: false })
                }
                _ => None,
            }
        }
        // The agent's playback was cut short by caller speech.
        "playback_clear_buffer" => {
            stats.turn_completed(true);
            Some(RealtimeResponse::TurnComplete { interrupted: true })
        }
        "error" => {
            stats.note_error();
            Some(RealtimeResponse::Error {
                message: event
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("ultravox error")
                    .to_string(),
            })
        }
        _ => None,
    }
}

#[async_trait]
impl RealtimeSession for UltravoxRealtimeSession {
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
        let message = match frame {
            // Audio goes over the wire as raw PCM binary.
            ClientFrame::AppendAudio { audio } => {
                let decoded = BASE64_STANDARD.decode(&audio).map_err(|_| {
                    GatewayError::InvalidRequest("audio frame is not valid base64".to_string())
                })?;
                self.stats.add_input_audio(self.pcm_seconds(decoded.len()));
                Message::Binary(decoded)
            }
            // Turn boundaries are VAD-driven on the Ultravox side.
            ClientFrame::CommitAudio | ClientFrame::ClearAudio => return Ok(()),
            ClientFrame::UserText { text } => Message::Text(
                json!({
                    "type": "input_text_message",
                    "text": text,
                })
                .to_string(),
            ),
            ClientFrame::ToolResult { call_id, output } => Message::Text(
                json!({
                    "type": "client_tool_result",
                    "invocationId": call_id,
                    "result": output,
                })
                .to_string(),
            ),
            ClientFrame::UpdateSession { .. } => {
                return Err(GatewayError::NotImplemented(
                    "ultravox does not support mid-call session updates".to_string(),
                ));
            }
        };

        let mut sender = self.sender.lock().await;
        *self.state.lock() = SessionState::Active;
        sender.send(message).await.map_err(|e| {
            *self.state.lock() = SessionState::Error;
            GatewayError::ProviderCommunication(format!("ultravox send: {e}"))
        })
    }

    async fn receive(&self) -> Result<Option<RealtimeResponse>> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.next().await {
                Some(Ok(Message::Binary(audio))) => {
                    self.stats.add_output_audio(self.pcm_seconds(audio.len()));
                    return Ok(Some(RealtimeResponse::AudioChunk {
                        audio: BASE64_STANDARD.encode(&audio),
                    }));
                }
                Some(Ok(Message::Text(text))) => {
                    let Ok(event) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if let Some(response) = translate_data_message(&self.stats, &event) {
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
                        "ultravox receive: {e}"
                    )));
                }
            }
        }
    }

    async fn update(&self, _config: RealtimeConfig) -> Result<()> {
        Err(GatewayError::NotImplemented(
            "ultravox does not support mid-call session updates".to_string(),
        ))
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
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, close).await;
        *self.state.lock() = SessionState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_roles_and_finality() {
        let stats = StatsRecorder::new();
        let partial = translate_data_message(
            &stats,
            &json!({"type": "transcript", "role": "user", "text": "hel", "final": false}),
        );
        assert_eq!(
            partial,
            Some(RealtimeResponse::TranscriptionPartial {
                text: "hel".to_string()
            })
        );

        let final_ = translate_data_message(
            &stats,
            &json!({"type": "transcript", "role": "user", "text": "hello", "final": true}),
        );
        assert_eq!(
            final_,
            Some(RealtimeResponse::TranscriptionFinal {
                text: "hello".to_string()
            })
        );

        let agent = translate_data_message(
            &stats,
            &json!({"type": "transcript", "role": "agent", "text": "hi", "final": false}),
        );
        assert_eq!(
            agent,
            Some(RealtimeResponse::AssistantTranscriptDelta {
                text: "hi".to_string()
            })
        );
    }

    #[test]
    fn interruption_marks_turn() {
        let stats = StatsRecorder::new();
        let response =
            translate_data_message(&stats, &json!({"type": "playback_clear_buffer"}));
        assert_eq!(
            response,
            Some(RealtimeResponse::TurnComplete { interrupted: true })
        );
        assert_eq!(stats.snapshot().interruption_count, 1);
    }

    #[test]
    fn tool_invocation_counts_and_translates() {
        let stats = StatsRecorder::new();
        let response = translate_data_message(
            &stats,
            &json!({
                "type": "client_tool_invocation",
                "invocationId": "inv1",
                "toolName": "lookup",
                "parameters": {"q": "x"}
            }),
        );
        assert_eq!(
            response,
            Some(RealtimeResponse::ToolCall {
                call_id: "inv1".to_string(),
                name: "lookup".to_string(),
                arguments: r#"{"q":"x"}"#.to_string(),
            })
        );
        assert_eq!(stats.snapshot().function_call_count, 1);
    }

    #[test]
    fn unknown_messages_are_skipped() {
        let stats = StatsRecorder::new();
        assert!(translate_data_message(&stats, &json!({"type": "pong"})).is_none());
        assert!(translate_data_message(&stats, &json!({"no_type": 1})).is_none());
    }
}
