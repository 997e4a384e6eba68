//! Usage and cost accounting. All arithmetic is decimal with at least six
//! fractional digits of precision; rounding is deferred to presentation.

use chrono::{DateTime, Utc};
use conduit_core::{AudioUsage, ModelCost, OperationType, PricingModel, Usage};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};

const MILLION: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

/// What one completed request consumed, attached to the emitted usage
/// event and used for the final debit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub occurred_at: DateTime<Utc>,
    pub operation: OperationType,
    pub provider: String,
    pub model_alias: String,
    pub virtual_key: String,
    pub usage: Option<Usage>,
    pub audio_usage: Option<AudioUsage>,
    pub image_count: Option<u32>,
    pub cost: Decimal,
    /// Set when the provider reported no usage and billing fell back to
    /// zero or an estimate.
    pub usage_missing: bool,
}

/// Stateless decimal cost computation over pricing rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostCalculator;

impl CostCalculator {
    /// Token cost: `input/1e6 × input_rate + output/1e6 × output_rate`.
    pub fn chat_cost(&self, cost: &ModelCost, usage: &Usage) -> Decimal {
        let input = Decimal::from(usage.prompt_tokens) / MILLION * cost.input_cost_per_million;
        let output =
            Decimal::from(usage.completion_tokens) / MILLION * cost.output_cost_per_million;
        input + output
    }

    /// Transcription cost: `audio_seconds × per_second_rate`. The caller
    /// supplies the byte-derived fallback duration when the provider omits
    /// one.
    pub fn transcription_cost(&self, cost: &ModelCost, audio_seconds: f64) -> Decimal {
        let rate = cost.per_second_rate.unwrap_or(Decimal::ZERO);
        Decimal::from_f64(audio_seconds).unwrap_or(Decimal::ZERO) * rate
    }

    /// TTS cost: `characters × per_character_rate`.
    pub fn tts_cost(&self, cost: &ModelCost, character_count: u64) -> Decimal {
        let rate = cost.per_character_rate.unwrap_or(Decimal::ZERO);
        Decimal::from(character_count) * rate
    }

    /// Realtime cost: audio seconds in both directions at the per-second
    /// rate plus token costs when the provider bills them.
    pub fn realtime_cost(
        &self,
        cost: &ModelCost,
        input_audio_seconds: f64,
        output_audio_seconds: f64,
        token_usage: Option<&Usage>,
    ) -> Decimal {
        let rate = cost.per_second_rate.unwrap_or(Decimal::ZERO);
        let audio = Decimal::from_f64(input_audio_seconds + output_audio_seconds)
            .unwrap_or(Decimal::ZERO)
            * rate;
        let tokens = token_usage
            .map(|usage| self.chat_cost(cost, usage))
            .unwrap_or(Decimal::ZERO);
        audio + tokens
    }

    /// Image cost: `count × per_image_rate`.
    pub fn image_cost(&self, cost: &ModelCost, count: u32) -> Decimal {
        let rate = cost.per_image_rate.unwrap_or(Decimal::ZERO);
        Decimal::from(count) * rate
    }

    /// Cost of the completed operation given what was metered.
    pub fn cost_for(
        &self,
        cost: &ModelCost,
        operation: OperationType,
        usage: Option<&Usage>,
        audio: Option<&AudioUsage>,
        image_count: Option<u32>,
    ) -> Decimal {
        match (cost.pricing_model, operation) {
            (PricingModel::PerImage, _) | (_, OperationType::ImageGeneration) => {
                self.image_cost(cost, image_count.unwrap_or(0))
            }
            (PricingModel::PerCharacter, _) | (_, OperationType::TextToSpeech) => {
                self.tts_cost(cost, audio.map(|a| a.character_count).unwrap_or(0))
            }
            (PricingModel::PerSecond, _) | (_, OperationType::AudioTranscription) => {
                self.transcription_cost(cost, audio.map(|a| a.audio_seconds).unwrap_or(0.0))
            }
            (_, OperationType::Realtime) => self.realtime_cost(
                cost,
                audio.map(|a| a.audio_seconds).unwrap_or(0.0),
                0.0,
                usage,
            ),
            _ => usage
                .map(|u| self.chat_cost(cost, u))
                .unwrap_or(Decimal::ZERO),
        }
    }

    /// Pre-flight worst-case estimate for the budget reservation:
    /// `max_tokens × output_rate + prompt_tokens_estimate × input_rate`.
    /// When `max_tokens` is unset the model's context window caps the
    /// output term.
    pub fn estimate_chat_cost(
        &self,
        cost: &ModelCost,
        prompt_chars: usize,
        max_tokens: Option<u32>,
        context_window: u32,
    ) -> Decimal {
        let prompt_tokens = estimate_tokens(prompt_chars);
        let output_tokens = max_tokens.unwrap_or(context_window);
        self.chat_cost(cost, &Usage::new(prompt_tokens, output_tokens))
    }
}

/// ~4 characters per token, the usual heuristic when a provider reports
/// no usage.
pub fn estimate_tokens(chars: usize) -> u32 {
    (chars.div_ceil(4)).max(1) as u32
}

use conduit_auth::{GroupLedger, ReservationHandle};
use std::sync::Arc;

/// Turns metered usage into a decimal cost and settles the reservation
/// against the group.
pub struct BillingService {
    ledger: Arc<GroupLedger>,
    calculator: CostCalculator,
}

impl BillingService {
    pub fn new(ledger: Arc<GroupLedger>) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            calculator: CostCalculator,
        })
    }

    pub fn calculator(&self) -> &CostCalculator {
        &self.calculator
    }

    /// Commit the reservation at the actual metered cost. When the
    /// provider reported no usage, the request is billed at zero and the
    /// event carries a `usage_missing` warning.
    pub async fn settle(
        &self,
        handle: ReservationHandle,
        cost_rule: Option<&ModelCost>,
        mut event: UsageEvent,
    ) -> conduit_core::Result<UsageEvent> {
        let cost = match cost_rule {
            Some(rule) => self.calculator.cost_for(
                rule,
                event.operation,
                event.usage.as_ref(),
                event.audio_usage.as_ref(),
                event.image_count,
            ),
            None => Decimal::ZERO,
        };
        event.cost = cost;
        if event.usage_missing {
            tracing::warn!(
                provider = %event.provider,
                model = %event.model_alias,
                "usage_missing: provider reported no usage, billed zero"
            );
        }
        self.ledger.commit(handle, cost).await?;
        Ok(event)
    }

    /// Release the reservation without billing (failure or cancellation
    /// before any provider-reported usage).
    pub async fn abandon(&self, handle: ReservationHandle) -> conduit_core::Result<()> {
        self.ledger.release(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::MappingId;
    use rust_decimal_macros::dec;

    fn cost_rule(input: Decimal, output: Decimal) -> ModelCost {
        ModelCost {
            name: "test".to_string(),
            mapping_ids: vec![MappingId::from("m1".to_string())],
            pricing_model: PricingModel::Standard,
            input_cost_per_million: input,
            output_cost_per_million: output,
            per_second_rate: None,
            per_character_rate: None,
            per_image_rate: None,
            priority: 0,
        }
    }

    #[test]
    fn groq_chat_cost_exact() {
        // 0.20/M in and out: the scenario-one rule.
        let rule = cost_rule(dec!(0.20), dec!(0.20));
        let calc = CostCalculator;
        let cost = calc.chat_cost(&rule, &Usage::new(9, 120));
        assert_eq!(cost, dec!(0.0000258));

        // (prompt + completion)/1e6 × 0.20, within 1e-6.
        let expected = Decimal::from(9 + 120) / dec!(1000000) * dec!(0.20);
        assert!((cost - expected).abs() <= dec!(0.000001));
    }

    #[test]
    fn asymmetric_rates() {
        let rule = cost_rule(dec!(2.50), dec!(10.00));
        let cost = CostCalculator.chat_cost(&rule, &Usage::new(1_000_000, 500_000));
        assert_eq!(cost, dec!(7.50));
    }

    #[test]
    fn transcription_per_second() {
        let mut rule = cost_rule(Decimal::ZERO, Decimal::ZERO);
        rule.pricing_model = PricingModel::PerSecond;
        rule.per_second_rate = Some(dec!(0.0001));
        let cost = CostCalculator.transcription_cost(&rule, 120.0);
        assert_eq!(cost, dec!(0.012));
    }

    #[test]
    fn tts_per_character() {
        let mut rule = cost_rule(Decimal::ZERO, Decimal::ZERO);
        rule.pricing_model = PricingModel::PerCharacter;
        rule.per_character_rate = Some(dec!(0.000015));
        let cost = CostCalculator.tts_cost(&rule, 2_000);
        assert_eq!(cost, dec!(0.03));
    }

    #[test]
    fn image_per_count() {
        let mut rule = cost_rule(Decimal::ZERO, Decimal::ZERO);
        rule.pricing_model = PricingModel::PerImage;
        rule.per_image_rate = Some(dec!(0.04));
        assert_eq!(CostCalculator.image_cost(&rule, 3), dec!(0.12));
    }

    #[test]
    fn realtime_combines_audio_and_tokens() {
        let mut rule = cost_rule(dec!(5.00), dec!(20.00));
        rule.per_second_rate = Some(dec!(0.0001));
        let cost = CostCalculator.realtime_cost(&rule, 30.0, 45.0, Some(&Usage::new(100, 200)));
        let audio = dec!(75.0) * dec!(0.0001);
        let tokens = dec!(0.0005) + dec!(0.004);
        assert_eq!(cost, audio + tokens);
    }

    #[test]
    fn estimate_caps_at_context_window() {
        let rule = cost_rule(dec!(1.00), dec!(1.00));
        let calc = CostCalculator;
        let capped = calc.estimate_chat_cost(&rule, 400, None, 8_192);
        let bounded = calc.estimate_chat_cost(&rule, 400, Some(256), 8_192);
        assert!(capped > bounded);
        assert_eq!(
            bounded,
            calc.chat_cost(&rule, &Usage::new(100, 256))
        );
    }

    #[test]
    fn missing_usage_costs_zero() {
        let rule = cost_rule(dec!(1.00), dec!(1.00));
        let cost = CostCalculator.cost_for(&rule, OperationType::Chat, None, None, None);
        assert_eq!(cost, Decimal::ZERO);
    }

    #[test]
    fn token_estimation_heuristic() {
        assert_eq!(estimate_tokens(0), 1);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
        assert_eq!(estimate_tokens(400), 100);
    }
}
