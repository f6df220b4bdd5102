use crate::types::{CostDetails, TokenUsage};

/// USD per million tokens: (model prefix, input, output). Longest matching
/// prefix wins, so dated snapshots inherit their family's price.
const PRICES: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1-nano", 0.10, 0.40),
    ("gpt-4.1", 2.00, 8.00),
    ("o3-mini", 1.10, 4.40),
    ("o4-mini", 1.10, 4.40),
    ("claude-opus-4", 15.00, 75.00),
    ("claude-sonnet-4", 3.00, 15.00),
    ("claude-3-7-sonnet", 3.00, 15.00),
    ("claude-3-5-haiku", 0.80, 4.00),
    ("claude-3-5-sonnet", 3.00, 15.00),
    ("mistral-large", 2.00, 6.00),
    ("mistral-small", 0.20, 0.60),
    ("llama-3.3-70b", 0.59, 0.79),
    ("llama-3.1-8b", 0.05, 0.08),
];

/// Per-million rates for a model, if known.
pub fn rates(model: &str) -> Option<(f64, f64)> {
    // OpenRouter style ids carry a vendor prefix: "openai/gpt-4o".
    let bare = model.rsplit('/').next().unwrap_or(model);
    PRICES
        .iter()
        .filter(|(prefix, _, _)| bare.starts_with(prefix))
        .max_by_key(|(prefix, _, _)| prefix.len())
        .map(|(_, input, output)| (*input, *output))
}

/// Cost of a generation. Unknown models are free.
pub fn cost_for(model: &str, usage: &TokenUsage) -> CostDetails {
    match rates(model) {
        Some((input, output)) => CostDetails::new(
            usage.prompt_tokens as f64 * input / 1_000_000.0,
            usage.completion_tokens as f64 * output / 1_000_000.0,
        ),
        None => CostDetails::free(),
    }
}
