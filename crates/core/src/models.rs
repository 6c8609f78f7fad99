//! # Stagecraft Models
//!
//! Generation parameters passed through to the external content generator.
//! The orchestrator never interprets these values; they travel with every
//! [`AgentRequest`](crate::agent::AgentRequest) so each port can configure
//! its backend.
//!
//! Every supported provider speaks the OpenAI-compatible chat-completions
//! protocol, which is what [`ChatCompletionsAgent`](crate::agent::ChatCompletionsAgent)
//! implements.

use serde::{Deserialize, Serialize};

/// Supported LLM providers
///
/// - OpenAI (GPT) - `OPENAI_API_KEY`
/// - OpenRouter (Gateway) - `OPENROUTER_API_KEY`
/// - DeepSeek - `DEEPSEEK_API_KEY`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
    OpenRouter,
    DeepSeek,
}

impl LlmProvider {
    /// Display name for logs and CLI output
    pub fn display_name(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "OpenAI",
            LlmProvider::OpenRouter => "OpenRouter",
            LlmProvider::DeepSeek => "DeepSeek",
        }
    }

    /// Environment variable holding the API key
    pub fn api_key_env(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "OPENAI_API_KEY",
            LlmProvider::OpenRouter => "OPENROUTER_API_KEY",
            LlmProvider::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }

    /// Base URL of the chat-completions API
    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "https://api.openai.com/v1",
            LlmProvider::OpenRouter => "https://openrouter.ai/api/v1",
            LlmProvider::DeepSeek => "https://api.deepseek.com/v1",
        }
    }

    /// Model used when the configuration names none
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "gpt-4o",
            LlmProvider::OpenRouter => "openai/gpt-4o",
            LlmProvider::DeepSeek => "deepseek-chat",
        }
    }

    /// Parse a provider name as written in config files and env vars
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(LlmProvider::OpenAI),
            "openrouter" => Some(LlmProvider::OpenRouter),
            "deepseek" => Some(LlmProvider::DeepSeek),
            _ => None,
        }
    }
}

/// Generation parameters for every stage call
///
/// ## Example
/// ```rust,ignore
/// use stagecraft_core::models::{ModelParameters, LlmProvider};
///
/// // Default OpenAI gpt-4o
/// let params = ModelParameters::default();
///
/// // Specific provider and model
/// let params = ModelParameters::with_provider(LlmProvider::DeepSeek, "deepseek-chat")
///     .with_base_url("http://localhost:8080/v1");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelParameters {
    /// LLM provider to use
    pub provider: LlmProvider,
    /// Model name (e.g., "gpt-4o", "deepseek-chat")
    pub model: String,
    /// Optional base URL override for OpenAI-compatible APIs
    pub base_url: Option<String>,
    /// Sampling temperature
    pub temperature: f32,
    /// Upper bound on generated tokens per call
    pub max_tokens: u32,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAI,
            model: LlmProvider::OpenAI.default_model().to_string(),
            base_url: None,
            temperature: 0.7,
            max_tokens: 4000,
        }
    }
}

impl ModelParameters {
    /// Create parameters for a specific provider
    pub fn with_provider(provider: LlmProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            ..Self::default()
        }
    }

    /// Set base URL (for OpenAI-compatible endpoints)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Base URL actually used for requests
    pub fn endpoint(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
    }
}
