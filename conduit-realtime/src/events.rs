//! Canonical duplex frames. Provider modules translate these to and from
//! their wire formats; nothing upstream of a session ever sees provider
//! JSON.

use crate::config::RealtimeConfig;
use serde::{Deserialize, Serialize};

/// Client → provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Base64 PCM appended to the input buffer.
    AppendAudio { audio: String },
    /// Commit the buffered audio as one turn (manual / push-to-talk).
    CommitAudio,
    /// Drop buffered audio without committing.
    ClearAudio,
    /// Plain-text user input.
    UserText { text: String },
    /// Result for a previously surfaced tool call.
    ToolResult { call_id: String, output: String },
    /// Mid-session configuration update.
    UpdateSession { config: RealtimeConfig },
}

/// Provider → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeResponse {
    /// Incremental transcription of caller audio.
    TranscriptionPartial { text: String },
    /// Final transcription for the turn.
    TranscriptionFinal { text: String },
    /// Incremental assistant transcript.
    AssistantTranscriptDelta { text: String },
    /// Base64 PCM assistant audio.
    AudioChunk { audio: String },
    /// Assistant turn finished.
    TurnComplete { interrupted: bool },
    /// The assistant requested a tool invocation.
    ToolCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    Error { message: String },
}
