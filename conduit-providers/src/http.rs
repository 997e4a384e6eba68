//! Shared HTTP client configuration: auth header styles, user agent, and
//! endpoint derivation. One pooled client per provider instance;
//! connection reuse is relied on for streaming.

use conduit_core::{GatewayError, OperationType, Result};
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

pub const GATEWAY_USER_AGENT: &str = concat!("conduit-gateway/", env!("CARGO_PKG_VERSION"));

/// How a provider expects its credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — OpenAI and compatibles.
    Bearer,
    /// `api-key: <key>` — Azure OpenAI.
    AzureApiKey,
    /// `x-api-key: <key>` plus `anthropic-version` — Anthropic.
    Anthropic,
    /// `xi-api-key: <key>` — ElevenLabs.
    ElevenLabs,
    /// `X-API-Key: <key>` — Ultravox.
    XApiKey,
}

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

fn secret_header(value: &str) -> Result<HeaderValue> {
    let mut header = HeaderValue::from_str(value)
        .map_err(|_| GatewayError::Configuration("api key contains invalid characters".into()))?;
    header.set_sensitive(true);
    Ok(header)
}

/// Default headers for a provider client: JSON accept, gateway user agent,
/// and the provider's auth header style.
pub fn default_headers(style: AuthStyle, api_key: &SecretString) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(GATEWAY_USER_AGENT));

    let key = api_key.expose_secret();
    match style {
        AuthStyle::Bearer => {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                secret_header(&format!("Bearer {key}"))?,
            );
        }
        AuthStyle::AzureApiKey => {
            headers.insert(HeaderName::from_static("api-key"), secret_header(key)?);
        }
        AuthStyle::Anthropic => {
            headers.insert(HeaderName::from_static("x-api-key"), secret_header(key)?);
            headers.insert(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        AuthStyle::ElevenLabs => {
            headers.insert(HeaderName::from_static("xi-api-key"), secret_header(key)?);
        }
        AuthStyle::XApiKey => {
            headers.insert(HeaderName::from_static("x-api-key"), secret_header(key)?);
        }
    }
    Ok(headers)
}

/// Build the pooled client for one provider.
pub fn build_http_client(style: AuthStyle, api_key: &SecretString) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .default_headers(default_headers(style, api_key)?)
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| GatewayError::Configuration(format!("http client build failed: {e}")))
}

/// Join a base URL and a path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Request timeout for an operation, after environment overrides.
pub fn operation_timeout(operation: OperationType) -> Duration {
    operation.deadline()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_handles_slashes() {
        assert_eq!(
            join_url("https://api.openai.com/v1/", "/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("https://api.openai.com/v1", "models"),
            "https://api.openai.com/v1/models"
        );
    }

    #[test]
    fn bearer_headers() {
        let headers =
            default_headers(AuthStyle::Bearer, &SecretString::from("sk-x".to_string())).unwrap();
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer sk-x"
        );
        assert!(headers.get(reqwest::header::AUTHORIZATION).unwrap().is_sensitive());
        assert_eq!(headers.get(ACCEPT).unwrap(), "application/json");
    }

    #[test]
    fn anthropic_headers_carry_version() {
        let headers =
            default_headers(AuthStyle::Anthropic, &SecretString::from("ak".to_string())).unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "ak");
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
    }

    #[test]
    fn azure_api_key_header() {
        let headers =
            default_headers(AuthStyle::AzureApiKey, &SecretString::from("az".to_string()))
                .unwrap();
        assert_eq!(headers.get("api-key").unwrap(), "az");
        assert!(headers.get(reqwest::header::AUTHORIZATION).is_none());
    }
}
