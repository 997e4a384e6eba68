//! Key authentication and model authorization.

use conduit_core::store::GatewayStore;
use conduit_core::{GatewayError, Result, VirtualKey, sanitize_for_log};
use globset::{Glob, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// SHA-256 hex of a bearer token; the plaintext never persists.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{digest:x}")
}

pub struct VirtualKeyService {
    store: Arc<dyn GatewayStore>,
}

impl VirtualKeyService {
    pub fn new(store: Arc<dyn GatewayStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Resolve a bearer token to its virtual key. Comparison of the hashed
    /// token is constant-time; expiry and admin-disable are checked after
    /// the match.
    pub async fn authenticate(&self, bearer_token: &str) -> Result<VirtualKey> {
        let hash = hash_token(bearer_token);
        let key = self
            .store
            .virtual_key_by_hash(&hash)
            .await?
            .ok_or_else(|| GatewayError::Unauthenticated("unknown virtual key".to_string()))?;

        let matches: bool = key
            .token_hash
            .as_bytes()
            .ct_eq(hash.as_bytes())
            .into();
        if !matches {
            return Err(GatewayError::Unauthenticated(
                "unknown virtual key".to_string(),
            ));
        }

        if !key.enabled {
            return Err(GatewayError::KeyDisabled);
        }
        if let Some(expires_at) = key.expires_at {
            if expires_at < chrono::Utc::now() {
                return Err(GatewayError::KeyExpired);
            }
        }
        Ok(key)
    }

    /// Check the key's allow-list against the requested alias. An empty
    /// allow-list admits everything.
    pub fn authorize(&self, key: &VirtualKey, model_alias: &str) -> Result<()> {
        if key.allowed_models.is_empty() {
            return Ok(());
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in &key.allowed_models {
            let glob = Glob::new(pattern).map_err(|e| {
                GatewayError::Configuration(format!(
                    "invalid allow-list pattern {}: {e}",
                    sanitize_for_log(pattern)
                ))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| GatewayError::Configuration(format!("allow-list build failed: {e}")))?;

        if set.is_match(model_alias) {
            Ok(())
        } else {
            tracing::debug!(
                key = %key.id,
                model = %sanitize_for_log(model_alias),
                "allow-list denied model"
            );
            Err(GatewayError::ModelNotAllowed(model_alias.to_string()))
        }
    }
}
