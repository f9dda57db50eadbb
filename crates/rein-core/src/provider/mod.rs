//! LLM provider boundary.
//!
//! Every vendor implements the same capability, `call(prompt, stage) ->
//! (text, usage)`, so the block runner never knows which backend it talks
//! to. Selection happens once per task from the workflow's `provider`
//! settings or, failing that, from the environment.
//!
//! ```text
//! workflow.provider ──► ProviderSettings ──► create_provider()
//!                                                 │
//!          ┌──────────────┬───────────────┬───────┴──────┬──────────────┐
//!      anthropic       openai        openrouter        ollama        scripted
//!   /v1/messages  /chat/completions /chat/completions  /api/chat    (tests)
//! ```

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod pricing;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ReinError;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::{OpenAiFlavor, OpenAiProvider};
pub use pricing::calculate_cost;
pub use scripted::{CallSpan, ScriptedProvider};

pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Token usage and cost for one call (or an aggregate of calls).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub duration_ms: u64,
}

impl UsageStats {
    /// Build usage for one call, pricing it from the model table.
    pub fn for_call(
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        duration: Duration,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cost: calculate_cost(model, input_tokens, output_tokens),
            model: model.to_string(),
            provider: provider.to_string(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Add another call's usage into this aggregate.
    pub fn accumulate(&mut self, other: &UsageStats) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.cost += other.cost;
        self.duration_ms += other.duration_ms;
        if self.model.is_empty() {
            self.model = other.model.clone();
        }
        if self.provider.is_empty() {
            self.provider = other.provider.clone();
        }
    }
}

/// Response text plus usage.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: UsageStats,
}

/// A pluggable LLM backend.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Provider id, e.g. `anthropic`.
    fn name(&self) -> &str;

    /// Model the provider sends requests to.
    fn model(&self) -> &str;

    /// Send the assembled prompt for `stage` and return the response text.
    async fn call(&self, prompt: &str, stage: &str) -> Result<Completion, ReinError>;
}

/// Resolved provider configuration for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    /// Explicit provider id; `None` means auto-detect from the environment.
    pub name: Option<String>,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: None,
            model: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            api_key: None,
            base_url: None,
        }
    }
}

impl ProviderSettings {
    /// Apply `MAX_TOKENS` / `TEMPERATURE` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = std::env::var("MAX_TOKENS").ok().and_then(|v| v.parse().ok()) {
            self.max_tokens = v;
        }
        if let Some(v) = std::env::var("TEMPERATURE").ok().and_then(|v| v.parse().ok()) {
            self.temperature = v;
        }
        self
    }
}

/// Provider ids understood by [`create_provider`].
pub fn available_providers() -> &'static [&'static str] {
    &["anthropic", "ollama", "openai", "openrouter"]
}

/// Build a provider from settings, auto-detecting from the environment when
/// no provider is named.
pub fn create_provider(settings: &ProviderSettings) -> Result<Arc<dyn Provider>, ReinError> {
    let name = match settings.name.as_deref().map(|n| n.trim().to_lowercase()) {
        Some(n) if !n.is_empty() => n,
        _ => detect_from_env().ok_or_else(|| {
            ReinError::Provider(
                "No provider specified and no API keys found in environment. \
                 Set one of: ANTHROPIC_API_KEY, OPENAI_API_KEY, OPENROUTER_API_KEY, OLLAMA_URL"
                    .to_string(),
            )
        })?,
    };

    let provider: Arc<dyn Provider> = match name.as_str() {
        "anthropic" => Arc::new(AnthropicProvider::new(settings)?),
        "openai" => Arc::new(OpenAiProvider::new(OpenAiFlavor::OpenAi, settings)?),
        "openrouter" => Arc::new(OpenAiProvider::new(OpenAiFlavor::OpenRouter, settings)?),
        "ollama" => Arc::new(OllamaProvider::new(settings)),
        other => {
            return Err(ReinError::Provider(format!(
                "Unknown provider '{}'. Available: {}",
                other,
                available_providers().join(", ")
            )))
        }
    };

    tracing::info!(
        "[Provider] Using {} (model: {})",
        provider.name(),
        provider.model()
    );
    Ok(provider)
}

fn detect_from_env() -> Option<String> {
    let set = |key: &str| std::env::var(key).map(|v| !v.is_empty()).unwrap_or(false);
    if set("ANTHROPIC_API_KEY") {
        Some("anthropic".to_string())
    } else if set("OPENAI_API_KEY") {
        Some("openai".to_string())
    } else if set("OPENROUTER_API_KEY") {
        Some("openrouter".to_string())
    } else if set("OLLAMA_URL") {
        Some("ollama".to_string())
    } else {
        None
    }
}

/// Shared HTTP client for vendor calls.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// JSON number for a temperature, falling back to 0.
pub(crate) fn temperature_value(temp: f64) -> serde_json::Value {
    serde_json::Value::Number(
        serde_json::Number::from_f64(temp).unwrap_or_else(|| serde_json::Number::from(0)),
    )
}
