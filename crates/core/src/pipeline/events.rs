//! # Pipeline Events
//!
//! Progress events streamed to observers of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentRole;

/// Kind of pipeline event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    /// Run accepted, nothing invoked yet
    RunStarted,
    /// Stage call started
    StageStarted,
    /// Stage call produced valid output
    StageCompleted,
    /// Stage call gave up
    StageFailed,
    /// A single attempt failed
    AttemptFailed,
    /// Retry scheduled after a failed attempt
    RetryScheduled,
    /// Reviewer rejected a code version, looping back to coding
    ReviewRejected,
    /// Reviewer approved a code version
    ReviewApproved,
    /// Review loop ran out of iterations
    IterationsExhausted,
    /// All stages completed
    RunCompleted,
    /// Run aborted on a fatal failure
    RunAborted,
    /// Run cancelled by its caller
    RunCancelled,
}

/// An event in a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique event ID
    pub id: Uuid,
    /// Run that produced the event
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    /// Stage the event belongs to, if any
    #[serde(default)]
    pub stage: Option<AgentRole>,
    /// Associated data (JSON)
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    /// Create a new event; the run id is stamped when it is emitted
    pub fn new(kind: PipelineEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: Uuid::nil(),
            timestamp: Utc::now(),
            kind,
            stage: None,
            data: None,
        }
    }

    pub fn for_stage(mut self, stage: AgentRole) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Add data to the event
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Per-run handle on the optional observer channel.
///
/// Sends wait for channel capacity only until the run is cancelled; after
/// that, events that do not fit are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    run_id: Uuid,
    tx: Option<mpsc::Sender<PipelineEvent>>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn new(
        run_id: Uuid,
        tx: Option<mpsc::Sender<PipelineEvent>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { run_id, tx, cancel }
    }

    /// Sink that drops every event
    pub fn disabled() -> Self {
        Self::new(Uuid::nil(), None, CancellationToken::new())
    }

    pub async fn emit(&self, mut event: PipelineEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        event.run_id = self.run_id;
        let kind = event.kind;

        if self.cancel.is_cancelled() {
            if tx.try_send(event).is_err() {
                tracing::debug!(?kind, "Event channel full after cancellation, event dropped");
            }
            return;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::warn!(?kind, "Run cancelled while the event channel was full, event dropped");
            }
            // A dropped receiver must not stop the run
            _ = tx.send(event) => {}
        }
    }
}
