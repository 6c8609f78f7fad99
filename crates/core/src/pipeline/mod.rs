//! # Pipeline
//!
//! Execution engine for a single request:
//!
//! ```text
//! PipelineOrchestrator
//!   ├── RetryingInvoker        (timeout, retry, classification, cancellation)
//!   ├── ReviewLoopController   (coding ⟷ review state machine)
//!   └── PipelineRun            (append-only stage log, terminal status)
//! ```

pub mod events;
pub mod invoker;
pub mod orchestrator;
pub mod review_loop;
pub mod run;

pub use events::{EventSink, PipelineEvent, PipelineEventKind};
pub use invoker::RetryingInvoker;
pub use orchestrator::{PipelineOrchestrator, RunHandle};
pub use review_loop::{LoopState, ReviewLoopController};
pub use run::{
    AttemptError, AttemptOutcome, AttemptRecord, CodeArtifact, LoopStatus, PipelineResult,
    PipelineRun, ReviewSummary, ReviewVerdict, RunStatus, StageResult,
};
