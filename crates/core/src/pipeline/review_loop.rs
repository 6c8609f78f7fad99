//! # Review Loop
//!
//! The coding ⟷ review state machine.
//!
//! ```text
//!               ┌──────────────── RejectedRetry ◀──┐
//!               ▼                                  │ rejected, counter < max
//!  ──▶ AwaitingCode ──code──▶ UnderReview ─────────┤
//!                                  │               │ rejected, counter == max
//!                          approved│               └──▶ IterationsExhausted
//!                                  ▼
//!                               Approved
//! ```
//!
//! The rejection counter lives on the [`PipelineRun`]; the controller owns
//! the code versions, the verdicts and the accumulated feedback.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::events::{PipelineEvent, PipelineEventKind};
use super::invoker::RetryingInvoker;
use super::run::{CodeArtifact, LoopStatus, PipelineRun, ReviewSummary, ReviewVerdict};
use crate::agent::AgentRole;
use crate::error::StageError;
use crate::stages::payloads::{
    CodeDraft, CodingInput, FeedbackItem, Requirements, ReviewInput, ReviewReport,
};

/// State of the review loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Waiting for the coding role to produce the next version
    AwaitingCode,
    /// Latest version is with the reviewer
    UnderReview,
    Approved,
    /// Rejected with iterations to spare; loops back to coding
    RejectedRetry,
    IterationsExhausted,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Approved | LoopState::IterationsExhausted)
    }
}

/// Drives one run's coding ⟷ review loop
pub struct ReviewLoopController<'a> {
    invoker: &'a RetryingInvoker,
    requirements: &'a Requirements,
    state: LoopState,
    artifacts: Vec<CodeArtifact>,
    verdicts: Vec<ReviewVerdict>,
    /// Every feedback item from every rejection, oldest first
    feedback: Vec<FeedbackItem>,
}

impl<'a> ReviewLoopController<'a> {
    pub fn new(invoker: &'a RetryingInvoker, requirements: &'a Requirements) -> Self {
        Self {
            invoker,
            requirements,
            state: LoopState::AwaitingCode,
            artifacts: Vec::new(),
            verdicts: Vec::new(),
            feedback: Vec::new(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until approval, exhaustion or a stage failure
    pub async fn run(&mut self, run: &mut PipelineRun) -> Result<ReviewSummary, StageError> {
        loop {
            match self.state {
                LoopState::AwaitingCode => self.request_code(run).await?,
                LoopState::UnderReview => self.request_review(run).await?,
                LoopState::RejectedRetry => self.state = LoopState::AwaitingCode,
                LoopState::Approved => return Ok(self.summary(run, LoopStatus::Approved)),
                LoopState::IterationsExhausted => {
                    return Ok(self.summary(run, LoopStatus::IterationsExhausted))
                }
            }
        }
    }

    /// Code versions and verdicts produced so far, oldest first
    pub fn into_history(self) -> (Vec<CodeArtifact>, Vec<ReviewVerdict>) {
        (self.artifacts, self.verdicts)
    }

    async fn request_code(&mut self, run: &mut PipelineRun) -> Result<(), StageError> {
        let version = self.artifacts.len() as u32;
        let input = CodingInput {
            requirements: self.requirements.clone(),
            previous_code: self.artifacts.last().map(|a| a.code.clone()),
            feedback: self.feedback.clone(),
            attempt: version,
        };

        let draft: CodeDraft = self.invoker.call(run, AgentRole::Coding, &input).await?;

        let rejection = self.verdicts.last().filter(|v| !v.approved).cloned();
        self.artifacts.push(CodeArtifact {
            version,
            code: draft.code,
            rejection,
        });
        self.state = LoopState::UnderReview;
        Ok(())
    }

    async fn request_review(&mut self, run: &mut PipelineRun) -> Result<(), StageError> {
        let Some(artifact) = self.artifacts.last() else {
            self.state = LoopState::AwaitingCode;
            return Ok(());
        };
        let version = artifact.version;
        let input = ReviewInput {
            requirements: self.requirements.clone(),
            code: artifact.code.clone(),
            code_version: version,
        };

        let report: ReviewReport = self.invoker.call(run, AgentRole::Review, &input).await?;
        let blocking = report.blocking_count();
        let verdict = ReviewVerdict::from_report(report, version);
        let counts = (verdict.feedback.len(), blocking);

        if verdict.approved {
            info!(version, "Review approved");
            self.state = LoopState::Approved;
            self.emit(PipelineEventKind::ReviewApproved, version, counts)
                .await;
        } else {
            self.feedback.extend(verdict.feedback.iter().cloned());
            if run.count_rejection() {
                info!(
                    version,
                    blocking,
                    iteration = run.review_iterations(),
                    max = run.config.max_iterations,
                    "Review rejected, regenerating"
                );
                self.state = LoopState::RejectedRetry;
                self.emit(PipelineEventKind::ReviewRejected, version, counts)
                    .await;
            } else {
                tracing::warn!(
                    version,
                    blocking,
                    max = run.config.max_iterations,
                    "Review loop exhausted"
                );
                self.state = LoopState::IterationsExhausted;
                self.emit(PipelineEventKind::IterationsExhausted, version, counts)
                    .await;
            }
        }

        self.verdicts.push(verdict);
        Ok(())
    }

    fn summary(&self, run: &PipelineRun, status: LoopStatus) -> ReviewSummary {
        ReviewSummary {
            status,
            iterations: run.review_iterations(),
            final_version: self.artifacts.last().map(|a| a.version).unwrap_or(0),
            approved: status == LoopStatus::Approved,
        }
    }

    async fn emit(&self, kind: PipelineEventKind, version: u32, (feedback, blocking): (usize, usize)) {
        self.invoker
            .events()
            .emit(
                PipelineEvent::new(kind)
                    .for_stage(AgentRole::Review)
                    .with_data(json!({
                        "code_version": version,
                        "feedback_items": feedback,
                        "blocking_items": blocking,
                    })),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRoster, ScriptedAgent};
    use crate::config::PipelineConfig;
    use crate::error::{AgentError, ErrorClass};
    use crate::pipeline::events::EventSink;
    use crate::stages::payloads::Severity;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn reject(description: &str) -> serde_json::Value {
        json!({
            "approved": false,
            "feedback": [{ "severity": "blocking", "description": description }],
            "summary": "needs work"
        })
    }

    fn harness(agent: ScriptedAgent, max_iterations: u32) -> (Arc<ScriptedAgent>, RetryingInvoker, PipelineRun) {
        let agent = Arc::new(agent);
        let invoker = RetryingInvoker::new(
            AgentRoster::uniform(agent.clone()),
            CancellationToken::new(),
            EventSink::disabled(),
        );
        let config = PipelineConfig {
            max_iterations,
            ..PipelineConfig::default()
        };
        (agent, invoker, PipelineRun::new("request", Arc::new(config)))
    }

    #[tokio::test]
    async fn test_approved_first_time() {
        let (agent, invoker, mut run) = harness(ScriptedAgent::with_defaults(), 5);
        let requirements = Requirements::default();
        let mut controller = ReviewLoopController::new(&invoker, &requirements);

        let summary = controller.run(&mut run).await.unwrap();

        assert_eq!(summary.status, LoopStatus::Approved);
        assert_eq!(summary.iterations, 0);
        assert_eq!(summary.final_version, 0);
        assert_eq!(controller.state(), LoopState::Approved);
        assert!(controller.state().is_terminal());
        assert_eq!(agent.calls(AgentRole::Coding), agent.calls(AgentRole::Review));
    }

    #[tokio::test]
    async fn test_feedback_accumulates_across_rejections() {
        let agent = ScriptedAgent::with_defaults()
            .respond(AgentRole::Review, reject("handle empty input"))
            .respond(AgentRole::Review, reject("add type hints"));
        let (agent, invoker, mut run) = harness(agent, 5);
        let requirements = Requirements::default();
        let mut controller = ReviewLoopController::new(&invoker, &requirements);

        let summary = controller.run(&mut run).await.unwrap();
        assert_eq!(summary.status, LoopStatus::Approved);
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.final_version, 2);

        let coding_inputs: Vec<CodingInput> = agent
            .requests_for(AgentRole::Coding)
            .into_iter()
            .map(|r| serde_json::from_value(r.input).unwrap())
            .collect();

        assert!(coding_inputs[0].feedback.is_empty());
        assert!(coding_inputs[0].previous_code.is_none());
        assert_eq!(coding_inputs[1].feedback.len(), 1);
        assert!(coding_inputs[1].previous_code.is_some());
        assert_eq!(
            coding_inputs[2].feedback,
            vec![
                FeedbackItem::new(Severity::Blocking, "handle empty input"),
                FeedbackItem::new(Severity::Blocking, "add type hints"),
            ]
        );
        assert_eq!(coding_inputs[2].attempt, 2);

        let (artifacts, verdicts) = controller.into_history();
        assert!(artifacts[0].rejection.is_none());
        assert_eq!(artifacts[1].rejection.as_ref().unwrap().code_version, 0);
        assert_eq!(artifacts[2].rejection.as_ref().unwrap().code_version, 1);
        assert_eq!(verdicts.len(), 3);
        assert!(verdicts[2].approved);
    }

    #[tokio::test]
    async fn test_zero_iterations_exhausts_on_first_rejection() {
        let agent = ScriptedAgent::with_defaults().always(AgentRole::Review, reject("no"));
        let (agent, invoker, mut run) = harness(agent, 0);
        let requirements = Requirements::default();
        let mut controller = ReviewLoopController::new(&invoker, &requirements);

        let summary = controller.run(&mut run).await.unwrap();

        assert_eq!(summary.status, LoopStatus::IterationsExhausted);
        assert!(!summary.approved);
        assert_eq!(summary.iterations, 0);
        assert_eq!(agent.calls(AgentRole::Coding), 1);
        assert_eq!(agent.calls(AgentRole::Review), 1);
    }

    #[tokio::test]
    async fn test_coding_failure_stops_loop() {
        let agent = ScriptedAgent::with_defaults()
            .respond(AgentRole::Review, reject("wrong"))
            .respond(AgentRole::Coding, json!({"code": "v0"}))
            .fail(AgentRole::Coding, AgentError::Fatal("400 bad request".to_string()));
        let (agent, invoker, mut run) = harness(agent, 5);
        let requirements = Requirements::default();
        let mut controller = ReviewLoopController::new(&invoker, &requirements);

        let err = controller.run(&mut run).await.unwrap_err();

        assert!(matches!(
            err,
            StageError::Fatal { stage: AgentRole::Coding, class: ErrorClass::Fatal, .. }
        ));
        assert_eq!(controller.state(), LoopState::AwaitingCode);
        assert_eq!(agent.calls(AgentRole::Review), 1);
        let (artifacts, verdicts) = controller.into_history();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(verdicts.len(), 1);
    }

    #[tokio::test]
    async fn test_review_events_count_blocking_items() {
        let agent = Arc::new(ScriptedAgent::with_defaults().respond(
            AgentRole::Review,
            json!({
                "approved": false,
                "feedback": [
                    { "severity": "blocking", "description": "crashes on empty input" },
                    { "severity": "minor", "description": "naming" }
                ],
                "summary": ""
            }),
        ));
        let (tx, mut rx) = tokio::sync::mpsc::channel(32);
        let invoker = RetryingInvoker::new(
            AgentRoster::uniform(agent),
            CancellationToken::new(),
            EventSink::new(uuid::Uuid::new_v4(), Some(tx), CancellationToken::new()),
        );
        let mut run = PipelineRun::new("request", Arc::new(PipelineConfig::default()));
        let requirements = Requirements::default();

        ReviewLoopController::new(&invoker, &requirements)
            .run(&mut run)
            .await
            .unwrap();
        drop(invoker);

        let mut rejected = None;
        while let Some(event) = rx.recv().await {
            if event.kind == PipelineEventKind::ReviewRejected {
                rejected = event.data;
            }
        }
        let data = rejected.unwrap();
        assert_eq!(data["feedback_items"], 2);
        assert_eq!(data["blocking_items"], 1);
        assert_eq!(data["code_version"], 0);
    }
}
