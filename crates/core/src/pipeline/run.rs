//! # Run Records
//!
//! The data model of a pipeline run: the mutable [`PipelineRun`] owned by
//! one executing run, the append-only [`StageResult`] log it accumulates,
//! and the [`PipelineResult`] handed back to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::agent::AgentRole;
use crate::config::PipelineConfig;
use crate::error::{AgentError, ErrorClass};
use crate::stages::payloads::{
    DeploymentBundle, Documentation, FeedbackItem, PriorRun, Requirements, ReviewReport,
    TestSuite,
};

// ============================================================================
// Stage results
// ============================================================================

/// Outcome of one attempt, and of a whole stage call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    /// Failed, and the invoker tried again
    TransientFailure,
    /// Failed, and the invoker gave up
    FatalFailure,
    Cancelled,
}

/// Classified error attached to a failed attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&AgentError> for AttemptError {
    fn from(err: &AgentError) -> Self {
        Self {
            class: err.class(),
            message: err.message().to_string(),
        }
    }
}

/// One invocation of an agent port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based attempt number within the call
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub error: Option<AttemptError>,
}

impl AttemptRecord {
    pub fn succeeded(attempt: u32) -> Self {
        Self {
            attempt,
            timestamp: Utc::now(),
            outcome: AttemptOutcome::Success,
            error: None,
        }
    }

    pub fn failed(attempt: u32, outcome: AttemptOutcome, err: &AgentError) -> Self {
        Self {
            attempt,
            timestamp: Utc::now(),
            outcome,
            error: Some(err.into()),
        }
    }

    pub fn cancelled(attempt: u32) -> Self {
        Self {
            attempt,
            timestamp: Utc::now(),
            outcome: AttemptOutcome::Cancelled,
            error: None,
        }
    }
}

/// One stage call with every attempt it took
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    pub stage: AgentRole,
    /// Validated output; present only on success
    #[serde(default)]
    pub output: Option<Value>,
    pub outcome: AttemptOutcome,
    pub attempts: Vec<AttemptRecord>,
    /// When the call finished
    pub timestamp: DateTime<Utc>,
}

impl StageResult {
    pub fn new(
        stage: AgentRole,
        outcome: AttemptOutcome,
        output: Option<Value>,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            stage,
            output,
            outcome,
            attempts,
            timestamp: Utc::now(),
        }
    }

    /// Error of the last failed attempt
    pub fn last_error(&self) -> Option<&AttemptError> {
        self.attempts.iter().rev().find_map(|a| a.error.as_ref())
    }
}

// ============================================================================
// Review loop records
// ============================================================================

/// Reviewer decision on one code version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewVerdict {
    pub approved: bool,
    pub feedback: Vec<FeedbackItem>,
    /// Version of the code this verdict judged
    pub code_version: u32,
    #[serde(default)]
    pub summary: Option<String>,
}

impl ReviewVerdict {
    pub fn from_report(report: ReviewReport, code_version: u32) -> Self {
        let summary = Some(report.summary).filter(|s| !s.trim().is_empty());
        Self {
            approved: report.approved,
            feedback: report.feedback,
            code_version,
            summary,
        }
    }
}

/// One generated code version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeArtifact {
    /// 0-based, increasing by one per coding call
    pub version: u32,
    pub code: String,
    /// Verdict that rejected the previous version; absent for version 0
    #[serde(default)]
    pub rejection: Option<ReviewVerdict>,
}

/// How the review loop ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Approved,
    IterationsExhausted,
}

/// Summary of the coding ⟷ review loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewSummary {
    pub status: LoopStatus,
    /// Rejections that led to another coding round
    pub iterations: u32,
    pub final_version: u32,
    pub approved: bool,
}

// ============================================================================
// Run state
// ============================================================================

/// Terminal (or running) status of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted {
        stage: AgentRole,
        #[serde(default)]
        class: Option<ErrorClass>,
        reason: String,
    },
    Cancelled {
        #[serde(default)]
        stage: Option<AgentRole>,
    },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Mutable record of one executing run
#[derive(Debug)]
pub struct PipelineRun {
    pub id: Uuid,
    pub request: String,
    pub config: Arc<PipelineConfig>,
    pub started_at: DateTime<Utc>,
    current_stage: Option<AgentRole>,
    stage_results: Vec<StageResult>,
    review_iterations: u32,
    status: RunStatus,
}

impl PipelineRun {
    pub fn new(request: impl Into<String>, config: Arc<PipelineConfig>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: request.into(),
            config,
            started_at: Utc::now(),
            current_stage: None,
            stage_results: Vec::new(),
            review_iterations: 0,
            status: RunStatus::Running,
        }
    }

    pub fn current_stage(&self) -> Option<AgentRole> {
        self.current_stage
    }

    pub fn stage_results(&self) -> &[StageResult] {
        &self.stage_results
    }

    pub fn review_iterations(&self) -> u32 {
        self.review_iterations
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// Mark `stage` as executing
    pub fn enter(&mut self, stage: AgentRole) {
        if !self.status.is_terminal() {
            self.current_stage = Some(stage);
        }
    }

    /// Append a finished stage call
    pub fn record(&mut self, result: StageResult) {
        if self.status.is_terminal() {
            tracing::warn!(run_id = %self.id, stage = %result.stage, "Ignoring stage result for finished run");
            return;
        }
        self.stage_results.push(result);
    }

    /// Count one more rejection; refuses to pass `max_iterations`
    pub fn count_rejection(&mut self) -> bool {
        if self.review_iterations >= self.config.max_iterations {
            return false;
        }
        self.review_iterations += 1;
        true
    }

    /// Set the terminal status. Only the first transition takes effect.
    pub fn finish(&mut self, status: RunStatus) -> bool {
        if self.status.is_terminal() {
            tracing::warn!(run_id = %self.id, current = ?self.status, refused = ?status, "Run already finished");
            return false;
        }
        self.status = status;
        true
    }

    pub fn into_stage_results(self) -> Vec<StageResult> {
        self.stage_results
    }
}

// ============================================================================
// Result
// ============================================================================

/// Everything a run produced, how far it got and why it stopped
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub request: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stage_results: Vec<StageResult>,
    pub review_iterations: u32,
    #[serde(default)]
    pub requirements: Option<Requirements>,
    /// Every code version, oldest first
    #[serde(default)]
    pub artifacts: Vec<CodeArtifact>,
    /// Every review verdict, oldest first
    #[serde(default)]
    pub verdicts: Vec<ReviewVerdict>,
    #[serde(default)]
    pub review: Option<ReviewSummary>,
    #[serde(default)]
    pub documentation: Option<Documentation>,
    #[serde(default)]
    pub tests: Option<TestSuite>,
    #[serde(default)]
    pub deployment: Option<DeploymentBundle>,
}

impl PipelineResult {
    /// Copy with run identity and wall-clock timestamps zeroed, for comparing
    /// two runs of the same input
    pub fn normalized(&self) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let mut result = self.clone();
        result.run_id = Uuid::nil();
        result.started_at = epoch;
        result.finished_at = epoch;
        for stage in &mut result.stage_results {
            stage.timestamp = epoch;
            for attempt in &mut stage.attempts {
                attempt.timestamp = epoch;
            }
        }
        result
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Whether the final code was approved by the reviewer
    pub fn is_approved(&self) -> bool {
        self.review.as_ref().is_some_and(|r| r.approved)
    }

    /// Last code version produced
    pub fn final_code(&self) -> Option<&CodeArtifact> {
        self.artifacts.last()
    }

    /// Number of calls made for one role
    pub fn invocations(&self, role: AgentRole) -> usize {
        self.stage_results.iter().filter(|r| r.stage == role).count()
    }

    /// Context for a follow-up request that refines this run
    pub fn as_context(&self) -> PriorRun {
        PriorRun {
            request: self.request.clone(),
            functional_requirements: self
                .requirements
                .as_ref()
                .map(|r| r.functional_requirements.clone())
                .unwrap_or_default(),
            code: self.final_code().map(|a| a.code.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> PipelineRun {
        PipelineRun::new("build a thing", Arc::new(PipelineConfig::default()))
    }

    #[test]
    fn test_terminal_status_set_once() {
        let mut run = run();
        assert!(run.finish(RunStatus::Completed));
        assert!(!run.finish(RunStatus::Cancelled { stage: None }));
        assert_eq!(run.status(), &RunStatus::Completed);
    }

    #[test]
    fn test_finished_run_refuses_results() {
        let mut run = run();
        run.record(StageResult::new(
            AgentRole::RequirementAnalysis,
            AttemptOutcome::Success,
            None,
            vec![AttemptRecord::succeeded(1)],
        ));
        run.finish(RunStatus::Completed);
        run.record(StageResult::new(
            AgentRole::Coding,
            AttemptOutcome::Success,
            None,
            vec![AttemptRecord::succeeded(1)],
        ));

        assert_eq!(run.stage_results().len(), 1);
        assert!(run.stage_results().iter().all(|r| r.stage != AgentRole::Coding));
    }

    #[test]
    fn test_rejection_counter_is_bounded() {
        let config = PipelineConfig {
            max_iterations: 2,
            ..PipelineConfig::default()
        };
        let mut run = PipelineRun::new("x", Arc::new(config));

        assert!(run.count_rejection());
        assert!(run.count_rejection());
        assert!(!run.count_rejection());
        assert_eq!(run.review_iterations(), 2);
    }

    #[test]
    fn test_last_error() {
        let result = StageResult::new(
            AgentRole::Coding,
            AttemptOutcome::FatalFailure,
            None,
            vec![
                AttemptRecord::failed(
                    1,
                    AttemptOutcome::TransientFailure,
                    &AgentError::Transient("503".to_string()),
                ),
                AttemptRecord::failed(
                    2,
                    AttemptOutcome::FatalFailure,
                    &AgentError::Auth("401".to_string()),
                ),
            ],
        );
        assert_eq!(result.last_error().unwrap().class, ErrorClass::Auth);
    }

    #[test]
    fn test_verdict_drops_empty_summary() {
        let report = ReviewReport {
            approved: false,
            feedback: vec![],
            summary: "  ".to_string(),
        };
        let verdict = ReviewVerdict::from_report(report, 3);
        assert_eq!(verdict.code_version, 3);
        assert!(verdict.summary.is_none());
    }

    #[test]
    fn test_context_of_unfinished_run() {
        let result = PipelineResult {
            run_id: Uuid::new_v4(),
            request: "sum a list".to_string(),
            status: RunStatus::Cancelled { stage: Some(AgentRole::Coding) },
            started_at: Utc::now(),
            finished_at: Utc::now(),
            stage_results: Vec::new(),
            review_iterations: 0,
            requirements: Some(Requirements {
                functional_requirements: vec!["return the sum".to_string()],
                ..Requirements::default()
            }),
            artifacts: Vec::new(),
            verdicts: Vec::new(),
            review: None,
            documentation: None,
            tests: None,
            deployment: None,
        };

        let context = result.as_context();
        assert_eq!(context.request, "sum a list");
        assert_eq!(context.functional_requirements, vec!["return the sum"]);
        assert!(context.code.is_none());
    }

    #[test]
    fn test_run_status_serialization() {
        let status = RunStatus::Aborted {
            stage: AgentRole::RequirementAnalysis,
            class: Some(ErrorClass::Auth),
            reason: "invalid key".to_string(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "aborted");
        assert_eq!(json["stage"], "requirement-analysis");
        assert_eq!(json["class"], "auth");
    }
}
