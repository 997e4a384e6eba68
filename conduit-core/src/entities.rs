//! Entity model: providers, credentials, mappings, pricing, virtual keys,
//! and billing groups. Owned by the persistence layer; immutable within a
//! request.

use chrono::{DateTime, Utc};
use derive_more::{AsRef, Deref, Display, From, Into};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Display, From, AsRef, Deref, Into, Serialize, Deserialize, Default,
)]
pub struct ProviderId(String);

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Display, From, AsRef, Deref, Into, Serialize, Deserialize, Default,
)]
pub struct ProviderKeyId(String);

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Display, From, AsRef, Deref, Into, Serialize, Deserialize, Default,
)]
pub struct MappingId(String);

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Display, From, AsRef, Deref, Into, Serialize, Deserialize, Default,
)]
pub struct VirtualKeyId(String);

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Display, From, AsRef, Deref, Into, Serialize, Deserialize, Default,
)]
pub struct GroupId(String);

/// Upstream dialect tag. One provider client variant exists per value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    Openai,
    AzureOpenai,
    Anthropic,
    Cohere,
    Groq,
    Cerebras,
    Sambanova,
    Fireworks,
    Replicate,
    Huggingface,
    Ollama,
    Vertex,
    OpenaiCompatible,
    Minimax,
    Ultravox,
    Elevenlabs,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Openai => "openai",
            ProviderType::AzureOpenai => "azure-openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Cohere => "cohere",
            ProviderType::Groq => "groq",
            ProviderType::Cerebras => "cerebras",
            ProviderType::Sambanova => "sambanova",
            ProviderType::Fireworks => "fireworks",
            ProviderType::Replicate => "replicate",
            ProviderType::Huggingface => "huggingface",
            ProviderType::Ollama => "ollama",
            ProviderType::Vertex => "vertex",
            ProviderType::OpenaiCompatible => "openai-compatible",
            ProviderType::Minimax => "minimax",
            ProviderType::Ultravox => "ultravox",
            ProviderType::Elevenlabs => "elevenlabs",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub provider_type: ProviderType,
    pub base_url: Option<String>,
    pub enabled: bool,
}

/// Credential bound to a provider. Exactly one primary enabled key exists
/// per provider; a failing non-primary key is skipped, not erased.
#[derive(Clone)]
pub struct ProviderKey {
    pub id: ProviderKeyId,
    pub provider_id: ProviderId,
    pub api_key: SecretString,
    pub base_url_override: Option<String>,
    pub organization: Option<String>,
    pub is_primary: bool,
    pub enabled: bool,
    pub account_group: Option<String>,
}

impl std::fmt::Debug for ProviderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderKey")
            .field("id", &self.id)
            .field("provider_id", &self.provider_id)
            .field("api_key", &"[redacted]")
            .field("is_primary", &self.is_primary)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// What a mapping claims its target model can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub chat: bool,
    pub vision: bool,
    pub streaming: bool,
    pub function_calling: bool,
    pub audio: bool,
}

impl CapabilityFlags {
    pub fn chat_only() -> Self {
        Self {
            chat: true,
            streaming: true,
            ..Default::default()
        }
    }

    /// Whether `self` admits every capability `required` asks for.
    pub fn satisfies(&self, required: &CapabilityFlags) -> bool {
        (!required.chat || self.chat)
            && (!required.vision || self.vision)
            && (!required.streaming || self.streaming)
            && (!required.function_calling || self.function_calling)
            && (!required.audio || self.audio)
    }
}

/// Alias → `(provider, provider_model_id)` with capability flags and
/// priority. The alias is unique per tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    pub id: MappingId,
    pub model_alias: String,
    pub provider_id: ProviderId,
    pub provider_model_id: String,
    pub capabilities: CapabilityFlags,
    pub priority: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PricingModel {
    Standard,
    Tiered,
    PerSecond,
    PerCharacter,
    PerImage,
}

/// Pricing rule attached to one or more mappings. Rates are decimals with
/// at least six fractional digits; rounding happens only at the debit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCost {
    pub name: String,
    pub mapping_ids: Vec<MappingId>,
    pub pricing_model: PricingModel,
    /// Cost per million input tokens.
    pub input_cost_per_million: Decimal,
    /// Cost per million output tokens.
    pub output_cost_per_million: Decimal,
    pub per_second_rate: Option<Decimal>,
    pub per_character_rate: Option<Decimal>,
    pub per_image_rate: Option<Decimal>,
    pub priority: i32,
}

/// Billing aggregate. At rest,
/// `balance = lifetime_credits_added - lifetime_spent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualKeyGroup {
    pub id: GroupId,
    pub name: String,
    pub balance: Decimal,
    pub lifetime_credits_added: Decimal,
    pub lifetime_spent: Decimal,
    pub external_group_id: Option<String>,
}

/// API token issued to a caller. The stored value is a SHA-256 hash of the
/// bearer token; the plaintext never persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualKey {
    pub id: VirtualKeyId,
    pub token_hash: String,
    pub name: String,
    /// Glob patterns; empty means allow all.
    pub allowed_models: Vec<String>,
    pub group_id: GroupId,
    pub expires_at: Option<DateTime<Utc>>,
    pub rpm_limit: Option<u32>,
    pub rpd_limit: Option<u32>,
    pub enabled: bool,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn capability_satisfaction() {
        let have = CapabilityFlags {
            chat: true,
            vision: true,
            streaming: true,
            function_calling: false,
            audio: false,
        };
        let need_vision = CapabilityFlags {
            chat: true,
            vision: true,
            ..Default::default()
        };
        let need_tools = CapabilityFlags {
            function_calling: true,
            ..Default::default()
        };
        assert!(have.satisfies(&need_vision));
        assert!(!have.satisfies(&need_tools));
    }

    #[test]
    fn group_invariant_holds_at_rest() {
        let group = VirtualKeyGroup {
            id: GroupId::from("g1".to_string()),
            name: "test".into(),
            balance: dec!(99.999800),
            lifetime_credits_added: dec!(100.000000),
            lifetime_spent: dec!(0.000200),
            external_group_id: None,
        };
        assert_eq!(
            group.balance,
            group.lifetime_credits_added - group.lifetime_spent
        );
    }

    #[test]
    fn provider_key_debug_redacts_secret() {
        let key = ProviderKey {
            id: ProviderKeyId::from("pk1".to_string()),
            provider_id: ProviderId::from("p1".to_string()),
            api_key: "sk-secret".to_string().into(),
            base_url_override: None,
            organization: None,
            is_primary: true,
            enabled: true,
            account_group: None,
        };
        let debug = format!("{key:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[redacted]"));
    }
}
