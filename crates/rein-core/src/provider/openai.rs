//! OpenAI-compatible chat completions (OpenAI and OpenRouter).
//!
//! POST {base_url}/chat/completions
//! Headers:
//!   Authorization: Bearer {api_key}

use std::time::Instant;

use super::{http_client, temperature_value, Completion, Provider, ProviderSettings, UsageStats};
use crate::error::ReinError;

/// Which OpenAI-compatible service to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiFlavor {
    OpenAi,
    OpenRouter,
}

impl OpenAiFlavor {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
        }
    }

    fn key_var(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    fn base_url(&self) -> String {
        match self {
            Self::OpenAi => std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            Self::OpenRouter => "https://openrouter.ai/api/v1".to_string(),
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::OpenRouter => "anthropic/claude-sonnet-4",
        }
    }
}

pub struct OpenAiProvider {
    flavor: OpenAiFlavor,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl OpenAiProvider {
    pub fn new(flavor: OpenAiFlavor, settings: &ProviderSettings) -> Result<Self, ReinError> {
        let api_key = settings
            .api_key
            .clone()
            .or_else(|| std::env::var(flavor.key_var()).ok())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ReinError::Provider(format!("{} environment variable not set", flavor.key_var()))
            })?;

        Ok(Self {
            flavor,
            client: http_client(),
            api_key,
            base_url: settings.base_url.clone().unwrap_or_else(|| flavor.base_url()),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| flavor.default_model().to_string()),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        })
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        self.flavor.name()
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, prompt: &str, stage: &str) -> Result<Completion, ReinError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": temperature_value(self.temperature),
            "messages": [{ "role": "user", "content": prompt }],
        });

        tracing::info!(
            "[Provider] {} -> {} API (model: {})",
            stage,
            self.flavor.name(),
            self.model
        );
        let started = Instant::now();

        let mut request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json");
        if self.flavor == OpenAiFlavor::OpenRouter {
            request = request.header("X-Title", "rein");
        }

        let response = request
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
                "{} API returned {}: {}",
                self.flavor.name(),
                status,
                response_text
            )));
        }

        let json: serde_json::Value = serde_json::from_str(&response_text)
            .map_err(|e| ReinError::Provider(format!("Failed to parse response JSON: {}", e)))?;

        let (input, output) = token_counts(&json);
        Ok(Completion {
            text: extract_text(&json),
            usage: UsageStats::for_call(
                self.flavor.name(),
                &self.model,
                input,
                output,
                started.elapsed(),
            ),
        })
    }
}

fn extract_text(json: &serde_json::Value) -> String {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}

fn token_counts(json: &serde_json::Value) -> (u64, u64) {
    let usage = json.get("usage");
    let input = usage
        .and_then(|u| u.get("prompt_tokens").or_else(|| u.get("input_tokens")))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output = usage
        .and_then(|u| u.get("completion_tokens").or_else(|| u.get("output_tokens")))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    (input, output)
}
