//! Operation kinds, their default deadlines, and the trace record emitted
//! for every completed request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Chat,
    Completion,
    Embeddings,
    ImageGeneration,
    VideoGeneration,
    AudioTranscription,
    TextToSpeech,
    Realtime,
    HealthCheck,
    ModelDiscovery,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Chat => "chat",
            OperationType::Completion => "completion",
            OperationType::Embeddings => "embeddings",
            OperationType::ImageGeneration => "image_generation",
            OperationType::VideoGeneration => "video_generation",
            OperationType::AudioTranscription => "audio_transcription",
            OperationType::TextToSpeech => "text_to_speech",
            OperationType::Realtime => "realtime",
            OperationType::HealthCheck => "health_check",
            OperationType::ModelDiscovery => "model_discovery",
        }
    }

    /// Default deadline for the operation. Overridable per provider and via
    /// `CONDUIT_TIMEOUT_<OP>_SECS`.
    pub fn default_deadline(&self) -> Duration {
        match self {
            OperationType::Chat | OperationType::Completion => Duration::from_secs(60),
            OperationType::Embeddings => Duration::from_secs(60),
            OperationType::ImageGeneration => Duration::from_secs(120),
            OperationType::VideoGeneration => Duration::from_secs(300),
            OperationType::AudioTranscription => Duration::from_secs(120),
            OperationType::TextToSpeech => Duration::from_secs(60),
            OperationType::Realtime => Duration::from_secs(300),
            OperationType::HealthCheck => Duration::from_secs(5),
            OperationType::ModelDiscovery => Duration::from_secs(10),
        }
    }

    /// Environment override key, e.g. `CONDUIT_TIMEOUT_CHAT_SECS`.
    pub fn timeout_env_key(&self) -> String {
        format!("CONDUIT_TIMEOUT_{}_SECS", self.as_str().to_uppercase())
    }

    /// Effective deadline after environment overrides.
    pub fn deadline(&self) -> Duration {
        std::env::var(self.timeout_env_key())
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.default_deadline())
    }

    /// Whether retrying the operation against another provider cannot
    /// duplicate side effects.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            OperationType::Chat
                | OperationType::Completion
                | OperationType::Embeddings
                | OperationType::ImageGeneration
                | OperationType::HealthCheck
                | OperationType::ModelDiscovery
        )
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Ok,
    Error,
    Cancelled,
}

/// Out-of-band record of one request. Emission failures never fail the
/// request itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTrace {
    pub trace_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub operation: OperationType,
    pub provider: Option<String>,
    pub virtual_key: Option<String>,
    pub status: TraceStatus,
    pub error_kind: Option<String>,
    pub tags: HashMap<String, String>,
}
