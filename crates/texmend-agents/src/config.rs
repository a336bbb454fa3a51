//! Configuration for the repair tiers.
//!
//! Defaults come from the environment; a TOML file with `[fixer]` and
//! `[compiler]` tables overrides them, and CLI flags override both.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use texmend_engine::{BackoffPolicy, CompilerConfig};

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
}

/// Settings for the LLM, comprehensive and agent tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixerConfig {
    /// Bearer token for the chat-completions endpoint
    #[serde(skip_serializing)]
    pub api_key: String,
    pub api_url: String,
    /// Model for the single-shot LLM tier
    pub model: String,
    /// Model for the agent and comprehensive tiers
    pub agent_model: String,
    pub enable_agent: bool,
    /// Attempts of the LLM tier, each followed by a recompilation
    pub max_retries: u32,
    pub http_timeout_secs: u64,
    /// Pacing of retried backend requests
    pub backoff: BackoffPolicy,
}

impl Default for FixerConfig {
    fn default() -> Self {
        let model = std::env::var("TEXMEND_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self {
            api_key: std::env::var("TEXMEND_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .unwrap_or_default(),
            api_url: std::env::var("TEXMEND_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            agent_model: std::env::var("TEXMEND_AGENT_MODEL").unwrap_or_else(|_| model.clone()),
            model,
            enable_agent: env_flag("TEXMEND_ENABLE_AGENT").unwrap_or(true),
            max_retries: std::env::var("TEXMEND_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_RETRIES),
            http_timeout_secs: std::env::var("TEXMEND_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl FixerConfig {
    /// The chat-completions URL, with `/chat/completions` appended to a bare
    /// base URL.
    pub fn endpoint(&self) -> String {
        let url = self.api_url.trim();
        if url.is_empty() {
            DEFAULT_API_URL.to_string()
        } else if url.ends_with("/chat/completions") {
            url.to_string()
        } else {
            format!("{}/chat/completions", url.trim_end_matches('/'))
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn agent_model(&self) -> &str {
        if self.agent_model.is_empty() {
            &self.model
        } else {
            &self.agent_model
        }
    }
}

/// Everything the `texmend` binary needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub fixer: FixerConfig,
    pub compiler: CompilerConfig,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Parse a TOML document. Missing keys keep their environment defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
