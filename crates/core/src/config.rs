//! # Pipeline Configuration
//!
//! Immutable per-run settings. A [`PipelineConfig`] is built once (defaults,
//! then an optional TOML file, then `STAGECRAFT_*` environment overrides),
//! validated, wrapped in an `Arc` and handed to a run. Nothing mutates it
//! afterwards.
//!
//! ```toml
//! max_iterations = 5
//! call_timeout_secs = 120
//! on_exhausted = "best_effort"
//!
//! [retry]
//! retry_count = 3
//! backoff_base_ms = 1000
//! backoff_cap_ms = 30000
//!
//! [model]
//! provider = "openai"
//! model = "gpt-4o"
//! temperature = 0.7
//! max_tokens = 4000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::{LlmProvider, ModelParameters};

/// What the run does when the review loop runs out of iterations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Continue downstream with the last code version, marked unapproved
    #[default]
    BestEffort,
    /// Abort the run at the review stage
    Abort,
}

impl FromStr for ExhaustionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "best_effort" => Ok(Self::BestEffort),
            "abort" => Ok(Self::Abort),
            other => Err(other.to_string()),
        }
    }
}

/// Retry policy for transient agent failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub retry_count: u32,
    /// Delay before the first retry; doubles for every further retry
    pub backoff_base_ms: u64,
    /// Upper bound on any single delay
    pub backoff_cap_ms: u64,
    /// Explicit delays per retry; overrides the exponential schedule when set
    pub backoff_schedule_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
            backoff_schedule_ms: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let index = retry.saturating_sub(1);
        if let Some(last) = self.backoff_schedule_ms.last() {
            let ms = self
                .backoff_schedule_ms
                .get(index as usize)
                .copied()
                .unwrap_or(*last);
            return Duration::from_millis(ms);
        }

        let factor = 1u64.checked_shl(index).unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }
}

/// Configuration for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Review rejections tolerated before the loop is exhausted
    pub max_iterations: u32,
    /// Bound on every single agent call
    pub call_timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Opaque passthrough to the agent ports
    pub model: ModelParameters,
    pub on_exhausted: ExhaustionPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            call_timeout_secs: 120,
            retry: RetryPolicy::default(),
            model: ModelParameters::default(),
            on_exhausted: ExhaustionPolicy::BestEffort,
        }
    }
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse pipeline configuration")
    }

    /// Load a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Defaults, then `path` if given, then process environment overrides,
    /// then validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STAGECRAFT_*` overrides read through `lookup`
    pub fn with_env_overrides<F>(mut self, lookup: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env(&lookup, "STAGECRAFT_MAX_ITERATIONS")? {
            self.max_iterations = v;
        }
        if let Some(v) = parse_env(&lookup, "STAGECRAFT_CALL_TIMEOUT_SECS")? {
            self.call_timeout_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "STAGECRAFT_RETRY_COUNT")? {
            self.retry.retry_count = v;
        }
        if let Some(v) = parse_env(&lookup, "STAGECRAFT_BACKOFF_BASE_MS")? {
            self.retry.backoff_base_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "STAGECRAFT_TEMPERATURE")? {
            self.model.temperature = v;
        }
        if let Some(v) = parse_env(&lookup, "STAGECRAFT_MAX_TOKENS")? {
            self.model.max_tokens = v;
        }
        if let Some(v) = parse_env::<ExhaustionPolicy, _>(&lookup, "STAGECRAFT_ON_EXHAUSTED")? {
            self.on_exhausted = v;
        }
        if let Some(name) = lookup("STAGECRAFT_PROVIDER") {
            let provider = LlmProvider::parse(&name).ok_or_else(|| ConfigError::InvalidEnv {
                key: "STAGECRAFT_PROVIDER".to_string(),
                value: name.clone(),
            })?;
            if provider != self.model.provider && lookup("STAGECRAFT_MODEL").is_none() {
                self.model.model = provider.default_model().to_string();
            }
            self.model.provider = provider;
        }
        if let Some(model) = lookup("STAGECRAFT_MODEL") {
            self.model.model = model;
        }
        if let Some(url) = lookup("STAGECRAFT_BASE_URL") {
            self.model = std::mem::take(&mut self.model).with_base_url(url);
        }
        Ok(self)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::Temperature(self.model.temperature));
        }
        if self.model.max_tokens == 0 {
            return Err(ConfigError::ZeroMaxTokens);
        }
        if self.retry.backoff_base_ms == 0 && self.retry.backoff_schedule_ms.is_empty() {
            return Err(ConfigError::ZeroBackoff);
        }
        Ok(())
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> std::result::Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw,
            }),
    }
}
