//! YAML schema types for workflow definitions.
//!
//! ```yaml
//! schema_version: "2.5.3"
//! name: story-pipeline
//! team: team-writers
//! max_parallel: 2
//! provider: anthropic
//!
//! inputs:
//!   topic:
//!     description: "What the story is about"
//!
//! blocks:
//!   - name: draft
//!     specialist: writer
//!     prompt: "Write about {{ task.input.topic }}"
//!
//!   - name: gate
//!     specialist: editor
//!     depends_on: [draft]
//!     prompt: "Review: {{ draft.json }}"
//!     next:
//!       - if: "{{ result.approved }}"
//!         goto: publish
//!       - else: revision
//!
//!   - name: revision
//!     specialist: writer
//!     depends_on: [gate]
//!     max_runs: 2
//!     next: gate
//!
//!   - name: publish
//!     depends_on: [gate]
//!     logic:
//!       custom: logic/publish.py
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ReinError;
use crate::provider::{ProviderSettings, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};

/// Top-level workflow definition loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Team whose collaboration tone prefixes every prompt.
    #[serde(default)]
    pub team: Option<String>,

    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,

    /// Wall-clock limit for the whole run, in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub provider: Option<ProviderSpec>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub temperature: Option<f64>,

    /// Print the last block's result to stdout after completion.
    #[serde(default)]
    pub print_final: bool,

    /// Write a Markdown rendering of each block result to `outputs/result.md`.
    #[serde(default)]
    pub readable_outputs: bool,

    /// Declared task inputs. `None` disables input validation.
    #[serde(default)]
    pub inputs: Option<BTreeMap<String, InputField>>,

    pub blocks: Vec<BlockSpec>,
}

fn default_schema_version() -> String {
    "2.5.3".to_string()
}

fn default_max_parallel() -> u32 {
    3
}

/// `provider: anthropic` or the long form with overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ProviderSpec {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        max_tokens: Option<u32>,
        #[serde(default)]
        temperature: Option<f64>,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        base_url: Option<String>,
    },
}

/// One declared task input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputField {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// A single block of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSpec {
    pub name: String,

    /// Specialist role text prepended to the prompt. Pure logic blocks omit it.
    #[serde(default)]
    pub specialist: Option<String>,

    #[serde(default)]
    pub prompt: String,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Display phase override.
    #[serde(default)]
    pub phase: Option<u32>,

    #[serde(default)]
    pub next: Option<NextRule>,

    #[serde(default = "default_max_runs")]
    pub max_runs: u32,

    #[serde(default)]
    pub skip_if_previous_failed: bool,

    #[serde(default = "default_true")]
    pub continue_if_failed: bool,

    /// Per-block execution limit, in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub logic: Option<LogicHooks>,
}

fn default_max_runs() -> u32 {
    1
}

/// Control transfer after a block finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NextRule {
    /// `next: target`
    Always(String),
    /// `next: [{if, goto}, ..., {else}]`
    Branches(Vec<NextBranch>),
}

/// One entry of a conditional `next` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NextBranch {
    #[serde(default, rename = "if")]
    pub condition: Option<String>,
    #[serde(default)]
    pub goto: Option<String>,
    #[serde(default, rename = "else")]
    pub otherwise: Option<ElseTarget>,
}

/// `else: target` or `else: true` paired with `goto`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ElseTarget {
    Flag(bool),
    Target(String),
}

impl NextBranch {
    pub fn is_else(&self) -> bool {
        match &self.otherwise {
            Some(ElseTarget::Flag(flag)) => *flag,
            Some(ElseTarget::Target(_)) => true,
            None => false,
        }
    }

    /// Block this branch transfers control to.
    pub fn target(&self) -> Option<&str> {
        match &self.otherwise {
            Some(ElseTarget::Target(t)) => Some(t.as_str()),
            _ => self.goto.as_deref(),
        }
    }
}

impl NextRule {
    /// Every block this rule may transfer control to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            NextRule::Always(t) => vec![t.as_str()],
            NextRule::Branches(branches) => branches.iter().filter_map(|b| b.target()).collect(),
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, NextRule::Branches(_))
    }
}

/// Pre/post/validate/custom scripts around a block's provider call.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LogicHooks {
    #[serde(default)]
    pub pre: Option<String>,
    #[serde(default)]
    pub post: Option<String>,
    #[serde(default)]
    pub validate: Option<String>,
    #[serde(default)]
    pub custom: Option<CustomLogic>,
}

/// `custom: true` skips the provider; `custom: script.py` replaces it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CustomLogic {
    Skip(bool),
    Script(String),
}

impl BlockSpec {
    pub fn hooks(&self) -> LogicHooks {
        self.logic.clone().unwrap_or_default()
    }

    /// Whether the block runs without calling the provider.
    pub fn is_custom(&self) -> bool {
        matches!(
            self.logic.as_ref().and_then(|l| l.custom.as_ref()),
            Some(CustomLogic::Skip(true)) | Some(CustomLogic::Script(_))
        )
    }
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ReinError> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ReinError::definition(format!("Failed to parse workflow YAML: {}", e))
        })
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ReinError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReinError::definition(format!(
                "Failed to read workflow file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn block(&self, name: &str) -> Option<&BlockSpec> {
        self.blocks.iter().find(|b| b.name == name)
    }

    /// Whether any block needs an LLM provider.
    pub fn needs_provider(&self) -> bool {
        self.blocks.iter().any(|b| !b.is_custom())
    }

    /// Provider settings from the `provider`/`model`/`max_tokens`/`temperature`
    /// fields. Environment overrides are applied on top.
    pub fn provider_settings(&self) -> ProviderSettings {
        let mut settings = ProviderSettings {
            name: None,
            model: self.model.clone(),
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            api_key: None,
            base_url: None,
        };
        match &self.provider {
            Some(ProviderSpec::Name(name)) => settings.name = Some(name.clone()),
            Some(ProviderSpec::Detailed {
                name,
                model,
                max_tokens,
                temperature,
                api_key,
                base_url,
            }) => {
                settings.name = Some(name.clone());
                if model.is_some() {
                    settings.model = model.clone();
                }
                if let Some(v) = max_tokens {
                    settings.max_tokens = *v;
                }
                if let Some(v) = temperature {
                    settings.temperature = *v;
                }
                settings.api_key = api_key.as_deref().map(crate::config::resolve_env_vars);
                settings.base_url = base_url.as_deref().map(crate::config::resolve_env_vars);
            }
            None => {}
        }
        settings.with_env_overrides()
    }
}
