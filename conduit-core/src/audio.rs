//! Canonical audio types: transcription, text-to-speech, and the metering
//! record both feed into billing.

use crate::error::GatewayError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Hard cap on TTS input length.
pub const MAX_TTS_INPUT_CHARS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionFormat {
    Json,
    VerboseJson,
    Text,
    Srt,
    Vtt,
}

impl Default for TranscriptionFormat {
    fn default() -> Self {
        TranscriptionFormat::Json
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampGranularity {
    None,
    Segment,
    Word,
}

impl Default for TimestampGranularity {
    fn default() -> Self {
        TimestampGranularity::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Wav,
    Flac,
    Ogg,
    Aac,
    Opus,
    Pcm,
    Ulaw,
    Alaw,
}

impl AudioFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Aac => "audio/aac",
            AudioFormat::Opus => "audio/opus",
            AudioFormat::Pcm => "audio/pcm",
            AudioFormat::Ulaw => "audio/basic",
            AudioFormat::Alaw => "audio/basic",
        }
    }
}

/// Transcription input: raw bytes with a filename hint, or a URL for
/// providers that accept one. Exactly one must be set.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub model: String,
    pub audio_data: Option<Bytes>,
    pub file_name: Option<String>,
    pub audio_url: Option<String>,
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub temperature: Option<f64>,
    pub response_format: TranscriptionFormat,
    pub timestamp_granularity: TimestampGranularity,
}

impl TranscriptionRequest {
    /// Enforces the empty/conflicting-input boundary rules before any
    /// provider work happens.
    pub fn validate(&self) -> Result<(), GatewayError> {
        match (&self.audio_data, &self.audio_url) {
            (None, None) => Err(GatewayError::InvalidRequest(
                "AudioData cannot be empty".to_string(),
            )),
            (Some(data), None) if data.is_empty() => Err(GatewayError::InvalidRequest(
                "AudioData cannot be empty".to_string(),
            )),
            (Some(_), Some(_)) => Err(GatewayError::InvalidRequest(
                "AudioData and AudioUrl are mutually exclusive".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Estimated audio duration when the provider omits one:
    /// 16 kB/s ≈ 16 kHz mono 8-bit PCM.
    pub fn estimated_duration_secs(&self) -> f64 {
        self.audio_data
            .as_ref()
            .map(|d| d.len() as f64 / 16_000.0)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    pub id: u32,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionWord {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

/// Metering record for audio operations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AudioUsage {
    pub audio_seconds: f64,
    pub character_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<TranscriptionSegment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<TranscriptionWord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternatives: Option<Vec<String>>,
    #[serde(skip)]
    pub usage: AudioUsage,
}

#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub model: Option<String>,
    pub input: String,
    pub voice: String,
    pub response_format: Option<AudioFormat>,
    pub speed: Option<f64>,
    pub pitch: Option<f64>,
    pub volume: Option<f64>,
    pub ssml: bool,
    pub sample_rate: Option<u32>,
}

impl TtsRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.input.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "input text cannot be empty".to_string(),
            ));
        }
        if self.input.chars().count() > MAX_TTS_INPUT_CHARS {
            return Err(GatewayError::InvalidRequest(format!(
                "input text exceeds {MAX_TTS_INPUT_CHARS} characters"
            )));
        }
        if self.voice.is_empty() {
            return Err(GatewayError::InvalidRequest("voice is required".to_string()));
        }
        if let Some(speed) = self.speed {
            if !(0.25..=4.0).contains(&speed) {
                return Err(GatewayError::InvalidRequest(
                    "speed must be within [0.25, 4.0]".to_string(),
                ));
            }
        }
        if let Some(volume) = self.volume {
            if !(0.0..=2.0).contains(&volume) {
                return Err(GatewayError::InvalidRequest(
                    "volume must be within [0.0, 2.0]".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One frame of a (possibly simulated) TTS stream.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Bytes,
    pub chunk_index: u32,
    pub is_final: bool,
    pub text_segment: Option<String>,
    pub timestamp: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tts(input: &str) -> TtsRequest {
        TtsRequest {
            model: None,
            input: input.to_string(),
            voice: "alloy".to_string(),
            response_format: None,
            speed: None,
            pitch: None,
            volume: None,
            ssml: false,
            sample_rate: None,
        }
    }

    #[test]
    fn empty_audio_rejected() {
        let req = TranscriptionRequest {
            model: "whisper-1".into(),
            audio_data: Some(Bytes::new()),
            file_name: Some("a.wav".into()),
            audio_url: None,
            language: None,
            prompt: None,
            temperature: None,
            response_format: TranscriptionFormat::default(),
            timestamp_granularity: TimestampGranularity::default(),
        };
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("AudioData cannot be empty"));
    }

    #[test]
    fn conflicting_audio_inputs_rejected() {
        let req = TranscriptionRequest {
            model: "whisper-1".into(),
            audio_data: Some(Bytes::from_static(b"riff")),
            file_name: None,
            audio_url: Some("https://x/a.wav".into()),
            language: None,
            prompt: None,
            temperature: None,
            response_format: TranscriptionFormat::default(),
            timestamp_granularity: TimestampGranularity::default(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn duration_estimate_from_bytes() {
        let req = TranscriptionRequest {
            model: "whisper-1".into(),
            audio_data: Some(Bytes::from(vec![0u8; 32_000])),
            file_name: None,
            audio_url: None,
            language: None,
            prompt: None,
            temperature: None,
            response_format: TranscriptionFormat::default(),
            timestamp_granularity: TimestampGranularity::default(),
        };
        assert!((req.estimated_duration_secs() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn tts_limits() {
        assert!(tts("hello").validate().is_ok());
        assert!(tts(&"x".repeat(MAX_TTS_INPUT_CHARS + 1)).validate().is_err());

        let mut fast = tts("hello");
        fast.speed = Some(5.0);
        assert!(fast.validate().is_err());
    }
}
