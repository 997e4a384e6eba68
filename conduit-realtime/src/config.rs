//! Session configuration, including the turn-detection policy honored by
//! every provider translation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    /// Provider-side voice activity detection.
    ServerVad {
        /// Silence before a turn is considered finished.
        silence_threshold_ms: u32,
        /// Audio replayed from before speech onset.
        prefix_padding_ms: u32,
        /// Detection threshold in [0, 1].
        energy_threshold: f64,
    },
    /// The caller commits turns explicitly.
    Manual,
    /// Caller-held push-to-talk; commit on release.
    PushToTalk,
}

impl Default for TurnDetection {
    fn default() -> Self {
        TurnDetection::ServerVad {
            silence_threshold_ms: 500,
            prefix_padding_ms: 300,
            energy_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub turn_detection: TurnDetection,
    /// PCM sample rate for both directions.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
}

fn default_sample_rate() -> u32 {
    24_000
}

impl RealtimeConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            voice: None,
            system_prompt: None,
            turn_detection: TurnDetection::default(),
            sample_rate: default_sample_rate(),
            temperature: None,
            tools: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_turn_detection_is_server_vad() {
        let config = RealtimeConfig::new("gpt-4o-realtime");
        assert!(matches!(
            config.turn_detection,
            TurnDetection::ServerVad {
                silence_threshold_ms: 500,
                ..
            }
        ));
        assert_eq!(config.sample_rate, 24_000);
    }

    #[test]
    fn manual_round_trips() {
        let json = serde_json::to_value(TurnDetection::Manual).unwrap();
        assert_eq!(json["type"], "manual");
        let back: TurnDetection = serde_json::from_value(json).unwrap();
        assert_eq!(back, TurnDetection::Manual);
    }
}
