//! Single mapping from the unified error taxonomy onto the OpenAI error
//! envelope. Every outward failure goes through here; `X-Request-Id`
//! always carries the trace id and `Retry-After` is attached when known.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use conduit_core::GatewayError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

/// `(status, type, code, param)` for an error. Deterministic: the same
/// error kind always maps to the same triple.
pub fn mapping_for(error: &GatewayError) -> (StatusCode, &'static str, &'static str, Option<String>) {
    match error {
        GatewayError::Unauthenticated(_)
        | GatewayError::KeyExpired
        | GatewayError::KeyDisabled => (
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "unauthorized",
            None,
        ),
        GatewayError::ModelNotAllowed(_) => (
            StatusCode::FORBIDDEN,
            "invalid_request_error",
            "authorization_required",
            None,
        ),
        GatewayError::InsufficientBalance { .. } => (
            StatusCode::FORBIDDEN,
            "invalid_request_error",
            "insufficient_quota",
            None,
        ),
        GatewayError::ModelNotFound(_) | GatewayError::UnknownCapability { .. } => (
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "model_not_found",
            None,
        ),
        GatewayError::InvalidRequest(_) => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "invalid_request",
            None,
        ),
        GatewayError::InvalidParameter { name, .. } => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "invalid_parameter",
            Some(name.clone()),
        ),
        GatewayError::PayloadTooLarge(_) => (
            StatusCode::PAYLOAD_TOO_LARGE,
            "invalid_request_error",
            "payload_too_large",
            None,
        ),
        GatewayError::RateLimitExceeded { .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "rate_limit_exceeded",
            None,
        ),
        GatewayError::Timeout { .. } => (
            StatusCode::REQUEST_TIMEOUT,
            "timeout_error",
            "request_timeout",
            None,
        ),
        GatewayError::NoProviderAvailable { .. } | GatewayError::ProviderUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            "service_unavailable",
            None,
        ),
        GatewayError::Cancelled => (
            // Client closed the request; nginx convention.
            StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            "invalid_request_error",
            "client_closed_request",
            None,
        ),
        GatewayError::ProviderCommunication(_) | GatewayError::Provider { .. } => (
            StatusCode::BAD_GATEWAY,
            "server_error",
            "internal_error",
            None,
        ),
        GatewayError::Configuration(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "configuration_error",
            None,
        ),
        GatewayError::NotImplemented(_) => (
            StatusCode::NOT_IMPLEMENTED,
            "server_error",
            "not_implemented",
            None,
        ),
        GatewayError::Serialization(_) | GatewayError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "internal_error",
            None,
        ),
    }
}

/// Whether the raw error text is safe to show callers. Internal failures
/// get a stable generic message outside development mode.
fn public_message(error: &GatewayError) -> String {
    let development = std::env::var("CONDUIT_ENVIRONMENT")
        .map(|v| v == "development")
        .unwrap_or(false);
    match error {
        GatewayError::Internal(_)
        | GatewayError::Configuration(_)
        | GatewayError::Serialization(_)
        | GatewayError::ProviderCommunication(_)
            if !development =>
        {
            "an internal error occurred".to_string()
        }
        _ => error.to_string(),
    }
}

/// Build the outward response for a failure.
pub fn error_response(error: &GatewayError, trace_id: &str) -> Response {
    let (status, error_type, code, param) = mapping_for(error);
    let body = ErrorBody {
        error: ErrorDetail {
            message: public_message(error),
            error_type: error_type.to_string(),
            code: code.to_string(),
            param,
        },
    };

    let mut response = (status, axum::Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    if let Some(seconds) = error.retry_after_seconds() {
        if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_denial_shape() {
        let (status, error_type, code, _) =
            mapping_for(&GatewayError::ModelNotAllowed("claude-3-opus".into()));
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(error_type, "invalid_request_error");
        assert_eq!(code, "authorization_required");
    }

    #[test]
    fn rate_limit_sets_retry_after() {
        let error = GatewayError::RateLimitExceeded {
            retry_after_seconds: Some(2),
        };
        let response = error_response(&error, "trace-1");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "2"
        );
        assert_eq!(response.headers().get("x-request-id").unwrap(), "trace-1");
    }

    #[test]
    fn mapping_is_deterministic() {
        for _ in 0..3 {
            let (status, t, code, _) = mapping_for(&GatewayError::Timeout { seconds: 60 });
            assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
            assert_eq!(t, "timeout_error");
            assert_eq!(code, "request_timeout");
        }
    }

    #[test]
    fn invalid_parameter_carries_param() {
        let error = GatewayError::InvalidParameter {
            name: "max_tokens".to_string(),
            reason: "exceeds context window".to_string(),
        };
        let (status, _, code, param) = mapping_for(&error);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "invalid_parameter");
        assert_eq!(param.as_deref(), Some("max_tokens"));
    }

    #[test]
    fn internal_detail_is_hidden_in_production() {
        let error = GatewayError::Internal("secret table missing".to_string());
        assert_eq!(public_message(&error), "an internal error occurred");
    }

    #[test]
    fn unknown_capability_is_model_not_found() {
        let error = GatewayError::UnknownCapability {
            model: "m".into(),
            capability: "chat".into(),
        };
        let (status, _, code, _) = mapping_for(&error);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "model_not_found");
    }
}
