//! # Stagecraft Core
//!
//! Orchestration engine that carries a natural-language request through a
//! fixed sequence of generation stages, with a bounded coding ⟷ review loop
//! in the middle.
//!
//! ## Architecture
//!
//! - `agent/` - The `AgentPort` boundary, the role roster and the bundled ports
//! - `stages/` - Stage registry, payload shapes and output parsing helpers
//! - `pipeline/` - Invoker, review loop, orchestrator and run records
//! - `config` - Immutable per-run configuration
//! - `models` - Generation parameters passed through to the generator
//! - `error` - Error classification
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stagecraft_core::agent::{AgentRoster, ChatCompletionsAgent};
//! use stagecraft_core::config::PipelineConfig;
//! use stagecraft_core::pipeline::PipelineOrchestrator;
//!
//! let config = PipelineConfig::load(None)?;
//! let agent = Arc::new(ChatCompletionsAgent::from_env(&config.model)?);
//! let orchestrator = PipelineOrchestrator::new(AgentRoster::uniform(agent));
//! let result = orchestrator.run("Build a stock tracker", config).await;
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod stages;

pub use agent::{AgentPort, AgentRequest, AgentRole, AgentRoster};
pub use config::{ExhaustionPolicy, PipelineConfig, RetryPolicy};
pub use error::{AgentError, ConfigError, ErrorClass, RosterError, StageError};
pub use pipeline::{PipelineOrchestrator, PipelineResult, RunHandle, RunStatus};
