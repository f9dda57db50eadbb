//! Local Ollama server. No API key; cost is always zero.

use std::time::Instant;

use super::{http_client, temperature_value, Completion, Provider, ProviderSettings, UsageStats};
use crate::error::ReinError;

pub const DEFAULT_MODEL: &str = "llama3.1";
const DEFAULT_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl OllamaProvider {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            client: http_client(),
            base_url: settings
                .base_url
                .clone()
                .or_else(|| std::env::var("OLLAMA_URL").ok())
                .unwrap_or_else(|| DEFAULT_URL.to_string()),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        }
    }
}

#[async_trait::async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, prompt: &str, stage: &str) -> Result<Completion, ReinError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "messages": [{ "role": "user", "content": prompt }],
            "options": {
                "num_predict": self.max_tokens,
                "temperature": temperature_value(self.temperature),
            },
        });

        tracing::info!("[Provider] {} -> Ollama {} (model: {})", stage, url, self.model);
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReinError::Provider(format!("Ollama request failed: {}", e)))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| ReinError::Provider(format!("Failed to read response body: {}", e)))?;
        if !status.is_success() {
            return Err(ReinError::Provider(format!(
                "Ollama returned {}: {}",
                status, response_text
            )));
        }

        let json: serde_json::Value = serde_json::from_str(&response_text)
            .map_err(|e| ReinError::Provider(format!("Failed to parse response JSON: {}", e)))?;

        let text = json
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        let input = json.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0);
        let output = json.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0);

        let mut usage = UsageStats::for_call("ollama", &self.model, input, output, started.elapsed());
        usage.cost = 0.0;
        Ok(Completion { text, usage })
    }
}
