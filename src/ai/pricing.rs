//! Model price registry
//!
//! Static per-model prices in microdollars per million tokens. Lookups match
//! the longest registered prefix so dated model ids resolve to their family.

/// Price entry for one model family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub model_prefix: &'static str,
    /// Microdollars per million input tokens
    pub input_per_million: u64,
    /// Microdollars per million output tokens
    pub output_per_million: u64,
}

const fn price(model_prefix: &'static str, input: u64, output: u64) -> ModelPricing {
    ModelPricing {
        model_prefix,
        input_per_million: input,
        output_per_million: output,
    }
}

const PRICES: &[ModelPricing] = &[
    price("claude-opus-4-5", 5_000_000, 25_000_000),
    price("claude-opus-4", 15_000_000, 75_000_000),
    price("claude-sonnet-4", 3_000_000, 15_000_000),
    price("claude-haiku-4", 1_000_000, 5_000_000),
    price("claude-3-7-sonnet", 3_000_000, 15_000_000),
    price("claude-3-5-sonnet", 3_000_000, 15_000_000),
    price("claude-3-5-haiku", 800_000, 4_000_000),
    price("claude-3-opus", 15_000_000, 75_000_000),
    price("claude-3-haiku", 250_000, 1_250_000),
];

/// Price entry for `model`, if known
pub fn lookup(model: &str) -> Option<ModelPricing> {
    PRICES
        .iter()
        .filter(|p| model.starts_with(p.model_prefix))
        .max_by_key(|p| p.model_prefix.len())
        .copied()
}

/// Estimated USD cost of one call.
///
/// Unknown models cost zero and log once per call at debug level.
pub fn estimate_cost_usd(model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    let Some(pricing) = lookup(model) else {
        tracing::debug!(model, "No price registered for model, cost estimated as 0");
        return 0.0;
    };
    let micros = input_tokens as u128 * pricing.input_per_million as u128
        + output_tokens as u128 * pricing.output_per_million as u128;
    // micros-per-million-tokens * tokens / 1e6 = micros; / 1e6 again = dollars
    micros as f64 / 1_000_000_000_000.0
}
