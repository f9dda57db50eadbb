//! Model pricing in USD per million tokens.

/// `(model id, input price, output price)` per 1M tokens.
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    // Anthropic
    ("claude-sonnet-4", 3.0, 15.0),
    ("claude-sonnet-4-20250514", 3.0, 15.0),
    ("claude-haiku-4", 0.80, 4.0),
    ("claude-haiku-4-5-20251001", 0.80, 4.0),
    ("claude-opus-4", 15.0, 75.0),
    ("claude-opus-4-20250514", 15.0, 75.0),
    // OpenAI
    ("gpt-4o", 2.50, 10.0),
    ("gpt-4o-mini", 0.15, 0.60),
    ("o1", 15.0, 60.0),
    ("o3-mini", 1.10, 4.40),
    // OpenRouter
    ("anthropic/claude-sonnet-4", 3.0, 15.0),
    ("anthropic/claude-haiku-4", 0.80, 4.0),
    ("anthropic/claude-opus-4", 15.0, 75.0),
    ("openai/gpt-4o", 2.50, 10.0),
    ("openai/gpt-4o-mini", 0.15, 0.60),
    ("google/gemini-2.5-pro", 1.25, 10.0),
    ("google/gemini-2.5-flash", 0.15, 0.60),
    ("deepseek/deepseek-chat-v3", 0.27, 1.10),
];

/// Cost in USD for the given token counts. Unknown models cost nothing.
pub fn calculate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    match MODEL_PRICING.iter().find(|(id, _, _)| *id == model) {
        Some((_, input, output)) => {
            (input_tokens as f64 / 1_000_000.0) * input
                + (output_tokens as f64 / 1_000_000.0) * output
        }
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_cost() {
        let cost = calculate_cost("claude-sonnet-4-20250514", 1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);

        let cost = calculate_cost("gpt-4o-mini", 2_000_000, 0);
        assert!((cost - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_is_free() {
        assert_eq!(calculate_cost("llama3.1", 5_000, 5_000), 0.0);
    }
}
