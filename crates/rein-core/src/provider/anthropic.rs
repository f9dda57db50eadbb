//! Anthropic Messages API.
//!
//! POST {base_url}/v1/messages
//! Headers:
//!   x-api-key: {api_key}
//!   anthropic-version: 2023-06-01

use std::time::Instant;

use super::{http_client, temperature_value, Completion, Provider, ProviderSettings, UsageStats};
use crate::error::ReinError;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl AnthropicProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ReinError> {
        let api_key = settings
            .api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ReinError::Provider("ANTHROPIC_API_KEY environment variable not set".to_string())
            })?;
        let base_url = settings
            .base_url
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            client: http_client(),
            api_key,
            base_url,
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        })
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, prompt: &str, stage: &str) -> Result<Completion, ReinError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": temperature_value(self.temperature),
            "messages": [{ "role": "user", "content": prompt }],
        });

        tracing::info!(
            "[Provider] {} -> Anthropic API (model: {})",
            stage,
            self.model
        );
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ReinError::Provider(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| ReinError::Provider(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(ReinError::Provider(format!(
                "Anthropic API returned {}: {}",
                status, response_text
            )));
        }

        let json: serde_json::Value = serde_json::from_str(&response_text)
            .map_err(|e| ReinError::Provider(format!("Failed to parse response JSON: {}", e)))?;

        let text = extract_text(&json);
        let usage = json.get("usage");
        let input = usage
            .and_then(|u| u.get("input_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let output = usage
            .and_then(|u| u.get("output_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        Ok(Completion {
            text,
            usage: UsageStats::for_call("anthropic", &self.model, input, output, started.elapsed()),
        })
    }
}

/// Concatenate the text blocks of a Messages API response.
fn extract_text(json: &serde_json::Value) -> String {
    json.get("content")
        .and_then(|c| c.as_array())
        .and_then(|arr| {
            arr.iter()
                .filter_map(|block| {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        block.get("text").and_then(|t| t.as_str()).map(|s| s.to_string())
                    } else {
                        None
                    }
                })
                .reduce(|a, b| format!("{}\n{}", a, b))
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_joins_text_blocks() {
        let json = serde_json::json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "tool_use", "name": "ignored"},
                {"type": "text", "text": "second"}
            ]
        });
        assert_eq!(extract_text(&json), "first\nsecond");
    }

    #[test]
    fn test_explicit_key_and_model() {
        let settings = ProviderSettings {
            model: Some("claude-haiku-4".to_string()),
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let provider = AnthropicProvider::new(&settings).unwrap();
        assert_eq!(provider.model(), "claude-haiku-4");
        assert_eq!(provider.max_tokens, 4096);
    }
}
