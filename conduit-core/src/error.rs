use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Unified failure taxonomy for the request path.
///
/// Every internal failure is expressed as one of these kinds before it
/// reaches the edge; the server maps each kind onto the OpenAI error
/// envelope. Provider-reported failures keep the upstream HTTP status and
/// any `Retry-After` the provider supplied.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("virtual key expired")]
    KeyExpired,

    #[error("virtual key disabled")]
    KeyDisabled,

    #[error("model not allowed: {0}")]
    ModelNotAllowed(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("unknown capability for model {model}: {capability}")]
    UnknownCapability { model: String, capability: String },

    #[error("insufficient balance for group {group}")]
    InsufficientBalance { group: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after_seconds: Option<u64> },

    #[error("no provider available for {alias}")]
    NoProviderAvailable { alias: String },

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("request cancelled")]
    Cancelled,

    #[error("provider communication error: {0}")]
    ProviderCommunication(String),

    #[error("provider error ({status}): {message}")]
    Provider {
        status: u16,
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether the router may retry this failure against another
    /// provider/key tuple. Only transient, provider-side conditions
    /// qualify; caller mistakes and billing denials never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::RateLimitExceeded { .. }
            | GatewayError::ProviderUnavailable(_)
            | GatewayError::Timeout { .. }
            | GatewayError::ProviderCommunication(_) => true,
            GatewayError::Provider { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// Retry-After hint, when one exists.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimitExceeded {
                retry_after_seconds,
            } => *retry_after_seconds,
            GatewayError::Provider {
                retry_after_seconds,
                ..
            } => *retry_after_seconds,
            _ => None,
        }
    }

    /// True when the target model itself was rejected and the router may
    /// try the next mapping for the alias.
    pub fn is_model_miss(&self) -> bool {
        matches!(self, GatewayError::ModelNotFound(_))
    }
}
