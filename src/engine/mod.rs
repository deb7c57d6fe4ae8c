//! engine
//!
//! Concurrency and reliability primitives shared by every workspace
//! operation.
//!
//! # Architecture
//!
//! - [`context`] - Cancellation token plus optional deadline, passed to every
//!   async operation
//! - [`retry`] - Error classification and retry with exponential backoff
//! - [`parallel`] - Bounded fan-out with ordered results
//! - [`pipeline`] - Ordered steps with reverse-order rollback
//!
//! A mutating workspace operation builds an [`OperationPipeline`]; steps that
//! touch several repositories fan out through a [`ParallelExecutor`], and each
//! network-facing git call inside a task is wrapped in a [`RetryExecutor`].
//!
//! # Invariants
//!
//! - Every suspension point (retry wait, task bodies, step boundaries)
//!   observes the [`Context`]
//! - Parallel results keep input order regardless of completion order
//! - Pipeline steps never interleave
//! - A rollback failure never replaces the error that triggered it
//!
//! # Example
//!
//! ```ignore
//! use grovework::engine::{Context, ExecutionMode, ParallelExecutor};
//!
//! let ctx = Context::background().with_timeout(Duration::from_secs(60));
//! let report = executor.execute(&ctx, tasks, ExecutionMode::FailFast).await;
//! let results = report.into_result()?;
//! ```

pub mod context;
pub mod parallel;
pub mod pipeline;
pub mod retry;

pub use context::{Context, Interrupt};
pub use parallel::{
    BatchError, BatchReport, ExecutionMode, ParallelExecutor, PartialFailure, DEFAULT_WORKERS,
    MAX_WORKERS, MIN_WORKERS,
};
pub use pipeline::{OperationPipeline, PipelineError, PipelineReport, RollbackReport};
pub use retry::{
    classify_message, Classify, ErrorClass, RetryConfig, RetryError, RetryExecutor,
};
