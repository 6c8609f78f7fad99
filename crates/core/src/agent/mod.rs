//! # Agent Ports
//!
//! The boundary to the external content generator. Each pipeline role is
//! served by one [`AgentPort`]; the fixed [`AgentRoster`] maps every
//! [`AgentRole`] to its port.
//!
//! ```text
//! RetryingInvoker ── AgentRequest{role, input, parameters} ──▶ AgentPort
//!        ▲                                                        │
//!        └──────────── JSON output | AgentError{class} ───────────┘
//! ```

pub mod http;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{AgentError, RosterError};
use crate::models::ModelParameters;

pub use http::ChatCompletionsAgent;
pub use scripted::ScriptedAgent;

/// Roles of the fixed pipeline, in execution order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AgentRole {
    RequirementAnalysis,
    Coding,
    Review,
    Documentation,
    TestGeneration,
    DeploymentConfiguration,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        AgentRole::RequirementAnalysis,
        AgentRole::Coding,
        AgentRole::Review,
        AgentRole::Documentation,
        AgentRole::TestGeneration,
        AgentRole::DeploymentConfiguration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequirementAnalysis => "requirement-analysis",
            Self::Coding => "coding",
            Self::Review => "review",
            Self::Documentation => "documentation",
            Self::TestGeneration => "test-generation",
            Self::DeploymentConfiguration => "deployment-configuration",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call to an agent port
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    pub role: AgentRole,
    /// Structured input matching the role's declared input shape
    pub input: serde_json::Value,
    pub parameters: ModelParameters,
}

/// Transforms structured input into structured output for one role.
///
/// Implementations own all network and backend state. The orchestrator only
/// sees the returned value or the classified error.
#[async_trait]
pub trait AgentPort: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<serde_json::Value, AgentError>;
}

/// Fixed mapping from every [`AgentRole`] to the port that serves it
#[derive(Clone)]
pub struct AgentRoster {
    ports: BTreeMap<AgentRole, Arc<dyn AgentPort>>,
}

impl AgentRoster {
    /// Serve every role from the same port
    pub fn uniform(port: Arc<dyn AgentPort>) -> Self {
        let ports = AgentRole::ALL
            .iter()
            .map(|role| (*role, Arc::clone(&port)))
            .collect();
        Self { ports }
    }

    pub fn builder() -> AgentRosterBuilder {
        AgentRosterBuilder::default()
    }

    pub fn port(&self, role: AgentRole) -> &Arc<dyn AgentPort> {
        // Construction guarantees every role is present
        &self.ports[&role]
    }
}

impl fmt::Debug for AgentRoster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRoster")
            .field("roles", &self.ports.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder that refuses to produce a roster with an unserved role
#[derive(Default)]
pub struct AgentRosterBuilder {
    ports: BTreeMap<AgentRole, Arc<dyn AgentPort>>,
}

impl AgentRosterBuilder {
    pub fn with(mut self, role: AgentRole, port: Arc<dyn AgentPort>) -> Self {
        self.ports.insert(role, port);
        self
    }

    /// Fill every role not yet registered with `port`
    pub fn with_fallback(mut self, port: Arc<dyn AgentPort>) -> Self {
        for role in AgentRole::ALL {
            self.ports.entry(role).or_insert_with(|| Arc::clone(&port));
        }
        self
    }

    pub fn build(self) -> Result<AgentRoster, RosterError> {
        if let Some(missing) = AgentRole::ALL
            .iter()
            .find(|role| !self.ports.contains_key(role))
        {
            return Err(RosterError::MissingRole(*missing));
        }
        Ok(AgentRoster { ports: self.ports })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names() {
        assert_eq!(AgentRole::RequirementAnalysis.to_string(), "requirement-analysis");
        assert_eq!(
            serde_json::to_string(&AgentRole::DeploymentConfiguration).unwrap(),
            "\"deployment-configuration\""
        );
    }

    #[test]
    fn test_roster_builder_missing_role() {
        let port: Arc<dyn AgentPort> = Arc::new(ScriptedAgent::new());
        let result = AgentRoster::builder()
            .with(AgentRole::RequirementAnalysis, Arc::clone(&port))
            .with(AgentRole::Coding, port)
            .build();
        assert_eq!(result.unwrap_err(), RosterError::MissingRole(AgentRole::Review));
    }

    #[test]
    fn test_roster_builder_fallback() {
        let coder: Arc<dyn AgentPort> = Arc::new(ScriptedAgent::new());
        let rest: Arc<dyn AgentPort> = Arc::new(ScriptedAgent::new());
        let roster = AgentRoster::builder()
            .with(AgentRole::Coding, Arc::clone(&coder))
            .with_fallback(Arc::clone(&rest))
            .build()
            .unwrap();

        assert!(Arc::ptr_eq(roster.port(AgentRole::Coding), &coder));
        assert!(Arc::ptr_eq(roster.port(AgentRole::Review), &rest));
    }
}
