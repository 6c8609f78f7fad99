//! # Pipeline Orchestrator
//!
//! Drives a run through every stage in order and assembles the
//! [`PipelineResult`]. The orchestrator itself holds only the immutable
//! roster and the optional event channel, so many runs can share one
//! instance.
//!
//! A run may refine an earlier one: [`PipelineOrchestrator::follow_up`]
//! hands the earlier run's request, requirements and final code to
//! requirement analysis.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::events::{EventSink, PipelineEvent, PipelineEventKind};
use super::invoker::RetryingInvoker;
use super::review_loop::ReviewLoopController;
use super::run::{
    CodeArtifact, LoopStatus, PipelineResult, PipelineRun, ReviewSummary, ReviewVerdict, RunStatus,
};
use crate::agent::{AgentRole, AgentRoster};
use crate::config::{ExhaustionPolicy, PipelineConfig};
use crate::error::StageError;
use crate::stages::detect_ambiguity;
use crate::stages::payloads::{
    DeploymentBundle, Documentation, DownstreamInput, PriorRun, RequirementInput, Requirements,
    TestSuite,
};

/// Runs the fixed stage sequence against an agent roster
#[derive(Debug, Clone)]
pub struct PipelineOrchestrator {
    roster: AgentRoster,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

/// Handle on a spawned run
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancellationToken,
    handle: JoinHandle<PipelineResult>,
}

impl RunHandle {
    /// Request cancellation; the run records it and finishes as cancelled
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish
    pub async fn join(self) -> Result<PipelineResult, JoinError> {
        self.handle.await
    }
}

/// Why a run stopped before the last stage
enum Halt {
    Stage(StageError),
    Exhausted { iterations: u32 },
}

impl From<StageError> for Halt {
    fn from(err: StageError) -> Self {
        Halt::Stage(err)
    }
}

/// Outputs gathered while the stages run
#[derive(Default)]
struct Outputs {
    requirements: Option<Requirements>,
    artifacts: Vec<CodeArtifact>,
    verdicts: Vec<ReviewVerdict>,
    review: Option<ReviewSummary>,
    documentation: Option<Documentation>,
    tests: Option<TestSuite>,
    deployment: Option<DeploymentBundle>,
}

impl PipelineOrchestrator {
    pub fn new(roster: AgentRoster) -> Self {
        Self {
            roster,
            event_tx: None,
        }
    }

    /// Stream progress events of every run to `tx`
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run to completion
    pub async fn run(
        &self,
        request: &str,
        config: impl Into<Arc<PipelineConfig>>,
    ) -> PipelineResult {
        self.run_with_cancel(request, config, CancellationToken::new())
            .await
    }

    /// Run to completion or until `cancel` fires
    pub async fn run_with_cancel(
        &self,
        request: &str,
        config: impl Into<Arc<PipelineConfig>>,
        cancel: CancellationToken,
    ) -> PipelineResult {
        self.drive(request, None, config.into(), cancel).await
    }

    /// Run a request that refines `previous`, to completion
    pub async fn follow_up(
        &self,
        previous: &PipelineResult,
        request: &str,
        config: impl Into<Arc<PipelineConfig>>,
    ) -> PipelineResult {
        self.drive(
            request,
            Some(previous.as_context()),
            config.into(),
            CancellationToken::new(),
        )
        .await
    }

    #[tracing::instrument(skip_all, fields(
        request_preview = %request.chars().take(50).collect::<String>(),
        follow_up = previous.is_some(),
    ))]
    async fn drive(
        &self,
        request: &str,
        previous: Option<PriorRun>,
        config: Arc<PipelineConfig>,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let mut run = PipelineRun::new(request, config);
        let events = EventSink::new(run.id, self.event_tx.clone(), cancel.clone());
        let invoker = RetryingInvoker::new(self.roster.clone(), cancel, events.clone());

        info!(run_id = %run.id, max_iterations = run.config.max_iterations, "Pipeline run started");
        events
            .emit(PipelineEvent::new(PipelineEventKind::RunStarted).with_data(json!({
                "request_chars": request.chars().count(),
                "follow_up": previous.is_some(),
            })))
            .await;

        let mut outputs = Outputs::default();
        let outcome = self.execute(&mut run, previous, &invoker, &mut outputs).await;

        let status = match outcome {
            Ok(()) => RunStatus::Completed,
            Err(Halt::Stage(err)) => {
                let stage = err.stage();
                match err {
                    // No stage when cancelled before the first one started
                    StageError::Cancelled { .. } => RunStatus::Cancelled {
                        stage: run.current_stage().map(|_| stage),
                    },
                    StageError::Fatal { class, message, .. } => RunStatus::Aborted {
                        stage,
                        class: Some(class),
                        reason: message,
                    },
                }
            }
            Err(Halt::Exhausted { iterations }) => RunStatus::Aborted {
                stage: AgentRole::Review,
                class: None,
                reason: format!("review loop exhausted after {} iterations", iterations),
            },
        };
        run.finish(status.clone());

        let (kind, data) = match &status {
            RunStatus::Completed => {
                info!(run_id = %run.id, approved = outputs.review.as_ref().is_some_and(|r| r.approved), "Pipeline run completed");
                (PipelineEventKind::RunCompleted, json!({}))
            }
            RunStatus::Cancelled { stage } => {
                info!(run_id = %run.id, stage = ?stage, "Pipeline run cancelled");
                (PipelineEventKind::RunCancelled, json!({ "stage": stage }))
            }
            RunStatus::Aborted { stage, reason, .. } => {
                warn!(run_id = %run.id, stage = %stage, reason = %reason, "Pipeline run aborted");
                (PipelineEventKind::RunAborted, json!({ "stage": stage, "reason": reason }))
            }
            RunStatus::Running => (PipelineEventKind::RunAborted, json!({})),
        };
        events.emit(PipelineEvent::new(kind).with_data(data)).await;

        Self::assemble(run, outputs)
    }

    /// Run on a new task and return a cancellable handle
    pub fn spawn(
        self: &Arc<Self>,
        request: impl Into<String>,
        config: impl Into<Arc<PipelineConfig>>,
    ) -> RunHandle {
        self.spawn_with_context(request, None, config)
    }

    /// Like [`spawn`](Self::spawn), optionally refining an earlier run
    pub fn spawn_with_context(
        self: &Arc<Self>,
        request: impl Into<String>,
        previous: Option<PriorRun>,
        config: impl Into<Arc<PipelineConfig>>,
    ) -> RunHandle {
        let this = Arc::clone(self);
        let request = request.into();
        let config = config.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle =
            tokio::spawn(async move { this.drive(&request, previous, config, token).await });
        RunHandle { cancel, handle }
    }

    async fn execute(
        &self,
        run: &mut PipelineRun,
        previous: Option<PriorRun>,
        invoker: &RetryingInvoker,
        out: &mut Outputs,
    ) -> Result<(), Halt> {
        // Requirement analysis
        let ambiguity = detect_ambiguity(&run.request);
        if ambiguity.is_ambiguous {
            info!(
                vague_terms = ambiguity.vague_terms_found,
                missing = ambiguity.missing_specifications,
                "Request looks ambiguous"
            );
        }
        let input = RequirementInput {
            request: run.request.clone(),
            ambiguity,
            previous,
        };
        let requirements: Requirements = invoker
            .call(run, AgentRole::RequirementAnalysis, &input)
            .await?;
        out.requirements = Some(requirements.clone());

        // Coding ⟷ review
        let mut controller = ReviewLoopController::new(invoker, &requirements);
        let loop_result = controller.run(run).await;
        let (artifacts, verdicts) = controller.into_history();
        out.artifacts = artifacts;
        out.verdicts = verdicts;
        let summary = loop_result?;
        out.review = Some(summary.clone());

        if summary.status == LoopStatus::IterationsExhausted
            && run.config.on_exhausted == ExhaustionPolicy::Abort
        {
            return Err(Halt::Exhausted {
                iterations: summary.iterations,
            });
        }

        let code = out
            .artifacts
            .last()
            .map(|a| a.code.clone())
            .unwrap_or_default();
        let downstream = DownstreamInput {
            requirements,
            code,
            code_version: summary.final_version,
            approved: summary.approved,
        };

        // Downstream stages
        out.documentation = Some(
            invoker
                .call(run, AgentRole::Documentation, &downstream)
                .await?,
        );
        out.tests = Some(
            invoker
                .call(run, AgentRole::TestGeneration, &downstream)
                .await?,
        );
        let bundle: DeploymentBundle = invoker
            .call(run, AgentRole::DeploymentConfiguration, &downstream)
            .await?;
        out.deployment = Some(bundle.with_fallbacks());

        Ok(())
    }

    fn assemble(run: PipelineRun, out: Outputs) -> PipelineResult {
        let run_id = run.id;
        let request = run.request.clone();
        let status = run.status().clone();
        let started_at = run.started_at;
        let review_iterations = run.review_iterations();
        PipelineResult {
            run_id,
            request,
            status,
            started_at,
            finished_at: Utc::now(),
            stage_results: run.into_stage_results(),
            review_iterations,
            requirements: out.requirements,
            artifacts: out.artifacts,
            verdicts: out.verdicts,
            review: out.review,
            documentation: out.documentation,
            tests: out.tests,
            deployment: out.deployment,
        }
    }
}
