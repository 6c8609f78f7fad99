//! # Errors
//!
//! Classified failures from agent ports and the stage-level errors the
//! invoker raises after applying its retry policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::agent::AgentRole;

/// Classification of a failed agent call, which decides the retry policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Channel trouble (network, rate limit, timeout); retried with backoff
    Transient,
    /// The generator answered but the output failed validation; retried once
    MalformedOutput,
    /// Credentials rejected; never retried
    Auth,
    /// Anything else; never retried
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::MalformedOutput => "malformed-output",
            Self::Auth => "auth",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by an [`AgentPort`](crate::agent::AgentPort)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("transient channel error: {0}")]
    Transient(String),

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("fatal agent error: {0}")]
    Fatal(String),
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::MalformedOutput(_) => ErrorClass::MalformedOutput,
            Self::Auth(_) => ErrorClass::Auth,
            Self::Fatal(_) => ErrorClass::Fatal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::MalformedOutput(m) | Self::Auth(m) | Self::Fatal(m) => m,
        }
    }

    /// Whether the invoker may try the same call again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::MalformedOutput(_))
    }
}

/// Terminal failure of a stage call after the retry policy ran its course
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("stage {stage} failed ({class}): {message}")]
    Fatal {
        stage: AgentRole,
        class: ErrorClass,
        message: String,
    },

    #[error("stage {stage} cancelled")]
    Cancelled { stage: AgentRole },
}

impl StageError {
    pub fn stage(&self) -> AgentRole {
        match self {
            Self::Fatal { stage, .. } | Self::Cancelled { stage } => *stage,
        }
    }
}

/// Invalid pipeline configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("call_timeout_secs must be greater than zero")]
    ZeroTimeout,

    #[error("temperature {0} is outside 0.0..=2.0")]
    Temperature(f32),

    #[error("max_tokens must be greater than zero")]
    ZeroMaxTokens,

    #[error("backoff_base_ms must be greater than zero")]
    ZeroBackoff,

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

/// Failure to assemble a complete agent roster
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RosterError {
    #[error("no agent registered for role {0}")]
    MissingRole(AgentRole),
}
