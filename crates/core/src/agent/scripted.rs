//! # Scripted Agent
//!
//! Deterministic [`AgentPort`] that replays queued responses per role and
//! records every request it receives. Used for replay, offline runs and tests.
//!
//! ```rust,ignore
//! let agent = Arc::new(
//!     ScriptedAgent::with_defaults()
//!         .respond(AgentRole::Review, json!({"approved": false, "feedback": []}))
//!         .fail(AgentRole::Coding, AgentError::Transient("503".into())),
//! );
//! let roster = AgentRoster::uniform(agent.clone());
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::{AgentPort, AgentRequest, AgentRole};
use crate::error::AgentError;

/// One scripted reaction to a call
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(Value),
    Fail(AgentError),
    /// Sleep, then take the next step
    Delay(Duration, Box<ScriptStep>),
    /// Never resolve; only a timeout or cancellation ends the call
    Stall,
}

#[derive(Debug, Default)]
struct Script {
    queue: VecDeque<ScriptStep>,
    fallback: Option<ScriptStep>,
}

/// Replays scripted responses in order, per role
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    scripts: Mutex<HashMap<AgentRole, Script>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    /// An agent with no scripts; every call fails until steps are queued
    pub fn new() -> Self {
        Self::default()
    }

    /// An agent whose every role answers with a minimal valid payload and
    /// whose reviewer approves everything
    pub fn with_defaults() -> Self {
        let mut agent = Self::new();
        for role in AgentRole::ALL {
            agent = agent.always(role, default_output(role));
        }
        agent
    }

    /// Queue a successful response
    pub fn respond(self, role: AgentRole, output: Value) -> Self {
        self.push(role, ScriptStep::Respond(output))
    }

    /// Queue a failure
    pub fn fail(self, role: AgentRole, error: AgentError) -> Self {
        self.push(role, ScriptStep::Fail(error))
    }

    /// Queue a call that never completes
    pub fn stall(self, role: AgentRole) -> Self {
        self.push(role, ScriptStep::Stall)
    }

    /// Queue an arbitrary step
    pub fn push(self, role: AgentRole, step: ScriptStep) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(role).or_default().queue.push_back(step);
        }
        self
    }

    /// Response used once the queue for `role` is drained
    pub fn always(self, role: AgentRole, output: Value) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(role).or_default().fallback = Some(ScriptStep::Respond(output));
        }
        self
    }

    /// Every request received so far, in call order
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Requests received for one role
    pub fn requests_for(&self, role: AgentRole) -> Vec<AgentRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.role == role)
            .collect()
    }

    /// Number of calls received for one role
    pub fn calls(&self, role: AgentRole) -> usize {
        self.requests_for(role).len()
    }

    fn next_step(&self, role: AgentRole) -> Option<ScriptStep> {
        let mut scripts = self.scripts.lock().ok()?;
        let script = scripts.get_mut(&role)?;
        script.queue.pop_front().or_else(|| script.fallback.clone())
    }
}

#[async_trait]
impl AgentPort for ScriptedAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let mut step = self.next_step(request.role).ok_or_else(|| {
            AgentError::Fatal(format!("no scripted response for role {}", request.role))
        })?;

        loop {
            match step {
                ScriptStep::Respond(value) => return Ok(value),
                ScriptStep::Fail(error) => return Err(error),
                ScriptStep::Delay(delay, next) => {
                    tokio::time::sleep(delay).await;
                    step = *next;
                }
                ScriptStep::Stall => std::future::pending::<()>().await,
            }
        }
    }
}

/// Minimal valid output for each role
pub fn default_output(role: AgentRole) -> Value {
    match role {
        AgentRole::RequirementAnalysis => json!({
            "functional_requirements": ["Echo the input back to the caller"],
            "non_functional_requirements": [],
            "assumptions": [],
            "constraints": [],
            "clarifying_questions": [],
            "ambiguity_detected": false,
            "ambiguity_notes": ""
        }),
        AgentRole::Coding => json!({ "code": "def echo(value):\n    return value\n" }),
        AgentRole::Review => json!({ "approved": true, "feedback": [], "summary": "Looks good" }),
        AgentRole::Documentation => json!({ "content": "# echo\n\nReturns its argument." }),
        AgentRole::TestGeneration => json!({
            "code": "def test_echo():\n    assert echo(1) == 1\n"
        }),
        AgentRole::DeploymentConfiguration => json!({
            "files": [{ "path": "requirements.txt", "contents": "" }],
            "setup_instructions": "pip install -r requirements.txt",
            "vcs_instructions": "git init && git add . && git commit -m init",
            "hosting_notes": ""
        }),
    }
}
