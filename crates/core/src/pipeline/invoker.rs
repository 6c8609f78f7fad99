//! # Retrying Invoker
//!
//! Wraps every agent port call with a per-call timeout, output validation,
//! classified retry and cancellation. Every call that reaches its port
//! appends exactly one [`StageResult`] to the run, whatever way it ends. A
//! call made after cancellation returns at once and records nothing.
//!
//! | Class            | Policy                                        |
//! |------------------|-----------------------------------------------|
//! | transient        | retry up to `retry_count` with backoff        |
//! | malformed-output | retry once immediately, then fatal            |
//! | auth, fatal      | no retry                                      |

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventSink, PipelineEvent, PipelineEventKind};
use super::run::{AttemptOutcome, AttemptRecord, PipelineRun, StageResult};
use crate::agent::{AgentRequest, AgentRole, AgentRoster};
use crate::error::{AgentError, ErrorClass, StageError};

/// Per-run invoker over the agent roster
#[derive(Debug, Clone)]
pub struct RetryingInvoker {
    roster: AgentRoster,
    cancel: CancellationToken,
    events: EventSink,
}

/// How the invoker reacts to one failed attempt
enum Next {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryingInvoker {
    pub fn new(roster: AgentRoster, cancel: CancellationToken, events: EventSink) -> Self {
        Self {
            roster,
            cancel,
            events,
        }
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Call the port serving `role` and decode its output as `O`
    pub async fn call<I, O>(
        &self,
        run: &mut PipelineRun,
        role: AgentRole,
        input: &I,
    ) -> Result<O, StageError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        if self.cancel.is_cancelled() {
            debug!(stage = %role, "Run cancelled before stage started");
            return Err(StageError::Cancelled { stage: role });
        }

        run.enter(role);
        let config = std::sync::Arc::clone(&run.config);
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        let input = match serde_json::to_value(input) {
            Ok(value) => value,
            Err(e) => {
                let err = AgentError::Fatal(format!("input could not be encoded: {}", e));
                attempts.push(AttemptRecord::failed(1, AttemptOutcome::FatalFailure, &err));
                return Err(self.give_up(run, role, attempts, &err).await);
            }
        };
        let request = AgentRequest {
            role,
            input,
            parameters: config.model.clone(),
        };
        let port = self.roster.port(role);

        info!(stage = %role, "Stage started");
        self.events
            .emit(PipelineEvent::new(PipelineEventKind::StageStarted).for_stage(role))
            .await;

        let mut transient_retries = 0u32;
        let mut malformed_retried = false;

        loop {
            let attempt = attempts.len() as u32 + 1;
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(run, role, attempts).await);
            }

            let response = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                r = tokio::time::timeout(config.call_timeout(), port.invoke(&request)) => Some(r),
            };

            let result = match response {
                None => {
                    attempts.push(AttemptRecord::cancelled(attempt));
                    return Err(self.cancelled(run, role, attempts).await);
                }
                Some(Err(_elapsed)) => Err(AgentError::Transient(format!(
                    "call timed out after {}s",
                    config.call_timeout_secs
                ))),
                Some(Ok(Err(err))) => Err(err),
                Some(Ok(Ok(value))) => decode::<O>(value),
            };

            let err = match result {
                Ok((value, output)) => {
                    attempts.push(AttemptRecord::succeeded(attempt));
                    debug!(stage = %role, attempts = attempt, bytes = value.to_string().len(), "Stage output validated");
                    run.record(StageResult::new(
                        role,
                        AttemptOutcome::Success,
                        Some(value),
                        attempts,
                    ));
                    info!(stage = %role, attempts = attempt, "Stage completed");
                    self.events
                        .emit(
                            PipelineEvent::new(PipelineEventKind::StageCompleted)
                                .for_stage(role)
                                .with_data(json!({ "attempts": attempt })),
                        )
                        .await;
                    return Ok(output);
                }
                Err(err) => err,
            };

            let next = match err.class() {
                _ if !err.is_retryable() => Next::GiveUp,
                ErrorClass::Transient if transient_retries < config.retry.retry_count => {
                    transient_retries += 1;
                    Next::RetryAfter(config.retry.delay_for(transient_retries))
                }
                ErrorClass::MalformedOutput if !malformed_retried => {
                    malformed_retried = true;
                    Next::RetryAfter(Duration::ZERO)
                }
                _ => Next::GiveUp,
            };

            match next {
                Next::GiveUp => {
                    attempts.push(AttemptRecord::failed(
                        attempt,
                        AttemptOutcome::FatalFailure,
                        &err,
                    ));
                    return Err(self.give_up(run, role, attempts, &err).await);
                }
                Next::RetryAfter(delay) => {
                    attempts.push(AttemptRecord::failed(
                        attempt,
                        AttemptOutcome::TransientFailure,
                        &err,
                    ));
                    warn!(
                        stage = %role,
                        attempt,
                        class = %err.class(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    self.events
                        .emit(
                            PipelineEvent::new(PipelineEventKind::AttemptFailed)
                                .for_stage(role)
                                .with_data(json!({
                                    "attempt": attempt,
                                    "class": err.class(),
                                    "message": err.message(),
                                })),
                        )
                        .await;
                    self.events
                        .emit(
                            PipelineEvent::new(PipelineEventKind::RetryScheduled)
                                .for_stage(role)
                                .with_data(json!({
                                    "next_attempt": attempt + 1,
                                    "delay_ms": delay.as_millis() as u64,
                                })),
                        )
                        .await;

                    if !delay.is_zero() {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => {
                                return Err(self.cancelled(run, role, attempts).await);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    async fn give_up(
        &self,
        run: &mut PipelineRun,
        role: AgentRole,
        attempts: Vec<AttemptRecord>,
        err: &AgentError,
    ) -> StageError {
        let count = attempts.len();
        run.record(StageResult::new(
            role,
            AttemptOutcome::FatalFailure,
            None,
            attempts,
        ));
        warn!(stage = %role, attempts = count, class = %err.class(), error = %err, "Stage failed");
        self.events
            .emit(
                PipelineEvent::new(PipelineEventKind::StageFailed)
                    .for_stage(role)
                    .with_data(json!({
                        "attempts": count,
                        "class": err.class(),
                        "message": err.message(),
                    })),
            )
            .await;
        StageError::Fatal {
            stage: role,
            class: err.class(),
            message: err.message().to_string(),
        }
    }

    async fn cancelled(
        &self,
        run: &mut PipelineRun,
        role: AgentRole,
        attempts: Vec<AttemptRecord>,
    ) -> StageError {
        info!(stage = %role, attempts = attempts.len(), "Stage cancelled");
        // Nothing reached the port, so there is no call to record
        if !attempts.is_empty() {
            run.record(StageResult::new(
                role,
                AttemptOutcome::Cancelled,
                None,
                attempts,
            ));
        }
        StageError::Cancelled { stage: role }
    }
}

/// Validate port output against the role's declared output type
fn decode<O: DeserializeOwned>(value: Value) -> Result<(Value, O), AgentError> {
    match serde_json::from_value::<O>(value.clone()) {
        Ok(output) => Ok((value, output)),
        Err(e) => Err(AgentError::MalformedOutput(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::scripted::ScriptStep;
    use crate::agent::ScriptedAgent;
    use crate::config::{PipelineConfig, RetryPolicy};
    use crate::stages::payloads::CodeDraft;
    use std::sync::Arc;

    fn setup(agent: ScriptedAgent, config: PipelineConfig) -> (Arc<ScriptedAgent>, RetryingInvoker, PipelineRun) {
        let agent = Arc::new(agent);
        let invoker = RetryingInvoker::new(
            AgentRoster::uniform(agent.clone()),
            CancellationToken::new(),
            EventSink::disabled(),
        );
        let run = PipelineRun::new("request", Arc::new(config));
        (agent, invoker, run)
    }

    fn transient() -> AgentError {
        AgentError::Transient("503 service unavailable".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_then_success() {
        let agent = ScriptedAgent::with_defaults()
            .fail(AgentRole::Coding, transient())
            .fail(AgentRole::Coding, transient());
        let (agent, invoker, mut run) = setup(agent, PipelineConfig::default());

        let draft: CodeDraft = invoker
            .call(&mut run, AgentRole::Coding, &json!({}))
            .await
            .unwrap();

        assert!(draft.code.contains("echo"));
        assert_eq!(agent.calls(AgentRole::Coding), 3);
        assert_eq!(run.stage_results().len(), 1);

        let result = &run.stage_results()[0];
        assert_eq!(result.outcome, AttemptOutcome::Success);
        let outcomes: Vec<_> = result.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::TransientFailure,
                AttemptOutcome::TransientFailure,
                AttemptOutcome::Success
            ]
        );
        assert_eq!(result.attempts[2].attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_is_exponential() {
        let agent = ScriptedAgent::with_defaults()
            .fail(AgentRole::Coding, transient())
            .fail(AgentRole::Coding, transient())
            .fail(AgentRole::Coding, transient());
        let (_agent, invoker, mut run) = setup(agent, PipelineConfig::default());

        let start = tokio::time::Instant::now();
        let _: CodeDraft = invoker
            .call(&mut run, AgentRole::Coding, &json!({}))
            .await
            .unwrap();

        // 1s + 2s + 4s with the default policy
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(7000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(8000), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausts_retry_count() {
        let config = PipelineConfig {
            retry: RetryPolicy {
                retry_count: 1,
                ..RetryPolicy::default()
            },
            ..PipelineConfig::default()
        };
        let agent = ScriptedAgent::with_defaults()
            .fail(AgentRole::Coding, transient())
            .fail(AgentRole::Coding, transient());
        let (agent, invoker, mut run) = setup(agent, config);

        let err = invoker
            .call::<_, CodeDraft>(&mut run, AgentRole::Coding, &json!({}))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StageError::Fatal { class: ErrorClass::Transient, .. }
        ));
        assert_eq!(agent.calls(AgentRole::Coding), 2);
        let result = &run.stage_results()[0];
        assert_eq!(result.outcome, AttemptOutcome::FatalFailure);
        assert_eq!(result.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_auth_is_never_retried() {
        let agent = ScriptedAgent::with_defaults()
            .fail(AgentRole::RequirementAnalysis, AgentError::Auth("401".to_string()));
        let (agent, invoker, mut run) = setup(agent, PipelineConfig::default());

        let err = invoker
            .call::<_, serde_json::Value>(&mut run, AgentRole::RequirementAnalysis, &json!({}))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            StageError::Fatal {
                stage: AgentRole::RequirementAnalysis,
                class: ErrorClass::Auth,
                message: "401".to_string(),
            }
        );
        assert_eq!(agent.calls(AgentRole::RequirementAnalysis), 1);
    }

    #[tokio::test]
    async fn test_malformed_output_retried_once() {
        let agent = ScriptedAgent::with_defaults()
            .respond(AgentRole::Coding, json!({"source": "missing code field"}));
        let (agent, invoker, mut run) = setup(agent, PipelineConfig::default());

        let draft: CodeDraft = invoker
            .call(&mut run, AgentRole::Coding, &json!({}))
            .await
            .unwrap();

        assert!(!draft.code.is_empty());
        assert_eq!(agent.calls(AgentRole::Coding), 2);
        let first = &run.stage_results()[0].attempts[0];
        assert_eq!(first.error.as_ref().unwrap().class, ErrorClass::MalformedOutput);
    }

    #[tokio::test]
    async fn test_second_malformed_output_is_fatal() {
        let agent = ScriptedAgent::with_defaults()
            .respond(AgentRole::Coding, json!({"nope": 1}))
            .fail(
                AgentRole::Coding,
                AgentError::MalformedOutput("no JSON object".to_string()),
            );
        let (agent, invoker, mut run) = setup(agent, PipelineConfig::default());

        let err = invoker
            .call::<_, CodeDraft>(&mut run, AgentRole::Coding, &json!({}))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StageError::Fatal { class: ErrorClass::MalformedOutput, .. }
        ));
        assert_eq!(agent.calls(AgentRole::Coding), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let config = PipelineConfig {
            call_timeout_secs: 5,
            ..PipelineConfig::default()
        };
        let agent = ScriptedAgent::with_defaults().stall(AgentRole::Review);
        let (agent, invoker, mut run) = setup(agent, config);

        let report: serde_json::Value = invoker
            .call(&mut run, AgentRole::Review, &json!({}))
            .await
            .unwrap();

        assert_eq!(report["approved"], true);
        assert_eq!(agent.calls(AgentRole::Review), 2);
        let first = &run.stage_results()[0].attempts[0];
        assert_eq!(first.outcome, AttemptOutcome::TransientFailure);
        assert!(first.error.as_ref().unwrap().message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_inflight_call() {
        let agent = Arc::new(ScriptedAgent::with_defaults().stall(AgentRole::Documentation));
        let cancel = CancellationToken::new();
        let invoker = RetryingInvoker::new(
            AgentRoster::uniform(agent.clone()),
            cancel.clone(),
            EventSink::disabled(),
        );
        let mut run = PipelineRun::new("request", Arc::new(PipelineConfig::default()));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = invoker
            .call::<_, serde_json::Value>(&mut run, AgentRole::Documentation, &json!({}))
            .await
            .unwrap_err();

        assert_eq!(err, StageError::Cancelled { stage: AgentRole::Documentation });
        let result = &run.stage_results()[0];
        assert_eq!(result.outcome, AttemptOutcome::Cancelled);
        assert_eq!(result.attempts[0].outcome, AttemptOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let agent = ScriptedAgent::with_defaults().push(
            AgentRole::Coding,
            ScriptStep::Fail(transient()),
        );
        let config = PipelineConfig {
            retry: RetryPolicy {
                backoff_base_ms: 60_000,
                backoff_cap_ms: 60_000,
                ..RetryPolicy::default()
            },
            ..PipelineConfig::default()
        };
        let (agent, invoker, mut run) = setup(agent, config);

        let trigger = invoker.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = invoker
            .call::<_, CodeDraft>(&mut run, AgentRole::Coding, &json!({}))
            .await
            .unwrap_err();

        assert_eq!(err, StageError::Cancelled { stage: AgentRole::Coding });
        assert_eq!(agent.calls(AgentRole::Coding), 1);
        assert_eq!(run.stage_results()[0].attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_call_after_cancel_records_nothing() {
        let (agent, invoker, mut run) = setup(ScriptedAgent::with_defaults(), PipelineConfig::default());
        invoker.cancel.cancel();

        let err = invoker
            .call::<_, CodeDraft>(&mut run, AgentRole::Coding, &json!({}))
            .await
            .unwrap_err();

        assert_eq!(err, StageError::Cancelled { stage: AgentRole::Coding });
        assert_eq!(agent.calls(AgentRole::Coding), 0);
        assert!(run.stage_results().is_empty());
        assert_eq!(run.current_stage(), None);
    }
}
