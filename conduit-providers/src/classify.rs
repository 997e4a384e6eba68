//! Provider error classification. The HTTP status gives the base kind;
//! the body is then inspected for provider-specific refinements so that,
//! for example, an OpenAI 403 quota denial surfaces as insufficient
//! balance rather than a generic provider error.

use conduit_core::GatewayError;

/// Seconds from a `Retry-After` header, when present and numeric.
pub fn retry_after_seconds(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn body_mentions(body: &str, needles: &[&str]) -> bool {
    let lower = body.to_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

/// Map a provider response to the unified taxonomy.
pub fn classify_provider_error(
    status: u16,
    body: &str,
    retry_after: Option<u64>,
) -> GatewayError {
    // Body patterns refine the status-derived base kind.
    if body_mentions(body, &["rate limit", "too many requests"]) {
        return GatewayError::RateLimitExceeded {
            retry_after_seconds: retry_after,
        };
    }
    if status == 403
        && body_mentions(body, &["insufficient_quota", "billing", "payment", "credit"])
    {
        return GatewayError::InsufficientBalance {
            group: "provider-account".to_string(),
        };
    }
    if body_mentions(
        body,
        &["model not found", "does not exist", "invalid model", "unknown model"],
    ) {
        return GatewayError::ModelNotFound(extract_message(body));
    }

    match status {
        400 => GatewayError::InvalidRequest(extract_message(body)),
        401 | 403 => GatewayError::Provider {
            status,
            message: extract_message(body),
            retry_after_seconds: None,
        },
        404 => GatewayError::ModelNotFound(extract_message(body)),
        408 => GatewayError::Timeout { seconds: 0 },
        413 => GatewayError::PayloadTooLarge(extract_message(body)),
        429 => GatewayError::RateLimitExceeded {
            retry_after_seconds: retry_after,
        },
        500..=504 => GatewayError::ProviderUnavailable(extract_message(body)),
        _ => GatewayError::Provider {
            status,
            message: extract_message(body),
            retry_after_seconds: retry_after,
        },
    }
}

/// Pull the human message out of common error envelopes, falling back to a
/// truncated raw body.
fn extract_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for path in [
            &["error", "message"][..],
            &["message"][..],
            &["detail"][..],
        ] {
            let mut cursor = &value;
            let mut found = true;
            for segment in path {
                match cursor.get(segment) {
                    Some(next) => cursor = next,
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if found {
                if let Some(message) = cursor.as_str() {
                    return message.to_string();
                }
            }
        }
    }
    body.chars().take(200).collect()
}

/// Convert a transport failure into the taxonomy.
pub fn classify_transport_error(error: reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout { seconds: 0 }
    } else if error.is_connect() {
        GatewayError::ProviderUnavailable(error.to_string())
    } else {
        GatewayError::ProviderCommunication(error.to_string())
    }
}

/// Read the response, classifying non-2xx statuses.
pub async fn check_response(response: reqwest::Response) -> conduit_core::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = retry_after_seconds(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(classify_provider_error(status.as_u16(), &body, retry_after))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_403_is_insufficient_balance() {
        let err = classify_provider_error(
            403,
            r#"{"error":{"message":"You exceeded your insufficient_quota","type":"insufficient_quota"}}"#,
            None,
        );
        assert!(matches!(err, GatewayError::InsufficientBalance { .. }));
    }

    #[test]
    fn rate_limit_body_wins_over_status() {
        let err = classify_provider_error(400, "Rate limit reached for requests", Some(2));
        assert!(matches!(
            err,
            GatewayError::RateLimitExceeded {
                retry_after_seconds: Some(2)
            }
        ));
    }

    #[test]
    fn model_missing_body() {
        let err = classify_provider_error(
            404,
            r#"{"error":{"message":"The model `gpt-9` does not exist"}}"#,
            None,
        );
        assert!(matches!(err, GatewayError::ModelNotFound(_)));
    }

    #[test]
    fn status_fallbacks() {
        assert!(matches!(
            classify_provider_error(400, "bad", None),
            GatewayError::InvalidRequest(_)
        ));
        assert!(matches!(
            classify_provider_error(503, "overloaded", None),
            GatewayError::ProviderUnavailable(_)
        ));
        assert!(matches!(
            classify_provider_error(429, "slow", Some(7)),
            GatewayError::RateLimitExceeded {
                retry_after_seconds: Some(7)
            }
        ));
    }

    #[test]
    fn classification_is_deterministic() {
        let body = r#"{"error":{"message":"boom"}}"#;
        for _ in 0..3 {
            let err = classify_provider_error(500, body, None);
            assert!(matches!(err, GatewayError::ProviderUnavailable(m) if m == "boom"));
        }
    }

    #[test]
    fn message_extraction_falls_back_to_raw() {
        assert_eq!(extract_message("plain failure"), "plain failure");
        assert_eq!(
            extract_message(r#"{"error":{"message":"structured"}}"#),
            "structured"
        );
    }
}
