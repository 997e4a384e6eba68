//! Core types for the Conduit gateway.
//!
//! Everything the other crates agree on lives here: the canonical
//! OpenAI-shaped request/response types, the entity model (providers, keys,
//! mappings, costs, virtual keys, groups), the unified error taxonomy, the
//! log sanitizer, and the read/write storage traits the persistence layer
//! implements.

pub mod audio;
pub mod chat;
pub mod embeddings;
pub mod entities;
pub mod error;
pub mod images;
pub mod operation;
pub mod sanitize;
pub mod store;

pub use audio::{
    AudioChunk, AudioFormat, AudioUsage, TimestampGranularity, TranscriptionFormat,
    TranscriptionRequest, TranscriptionResponse, TranscriptionSegment, TranscriptionWord,
    TtsRequest,
};
pub use chat::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, Choice, ChunkChoice, ChunkDelta,
    FinishReason, MessageContent, ResponseFormat, Role, Tool, ToolCall, ToolFunction, Usage,
};
pub use embeddings::{EmbeddingInput, EmbeddingsRequest, EmbeddingsResponse};
pub use entities::{
    CapabilityFlags, GroupId, MappingId, ModelCost, ModelMapping, PricingModel, Provider,
    ProviderId, ProviderKey, ProviderKeyId, ProviderType, VirtualKey, VirtualKeyGroup,
    VirtualKeyId,
};
pub use error::{GatewayError, Result};
pub use images::{GeneratedImage, ImageGenerationRequest, ImageGenerationResponse};
pub use operation::{OperationType, RequestTrace, TraceStatus};
pub use sanitize::sanitize_for_log;
pub use store::{GatewayStore, MemoryStore, ModelKind, ModelMetadata};

use futures::stream::Stream;
use std::pin::Pin;

/// Streaming chat responses: canonical chunks in provider order.
pub type ChatChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

/// Streaming synthesized audio.
pub type AudioChunkStream = Pin<Box<dyn Stream<Item = Result<AudioChunk>> + Send>>;
