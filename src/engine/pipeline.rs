//! engine::pipeline
//!
//! Transactional step sequencing with reverse-order rollback.
//!
//! An [`OperationPipeline`] runs named steps strictly in order. When step
//! `k` fails, the rollbacks of steps `0..k` run in reverse order and the
//! forward-path error of step `k` is returned. Step `k`'s own rollback and
//! everything after it never run.
//!
//! # Rollback Semantics
//!
//! - Rollback failures are logged and collected in a [`RollbackReport`];
//!   they never replace the error that triggered the rollback.
//! - Rollbacks run with a fresh context, so a cancelled or expired caller
//!   context does not prevent cleanup.
//! - Irreversible steps (see [`OperationPipeline::add_irreversible_step`])
//!   are recorded as skipped during rollback.
//!
//! # Known Limitations
//!
//! - Partial side effects of the failing step itself are not undone. A step
//!   that can half-complete must clean up after itself before returning
//!   its error.
//!
//! # Example
//!
//! ```
//! use grovework::engine::context::Context;
//! use grovework::engine::pipeline::OperationPipeline;
//!
//! # tokio_test::block_on(async {
//! let mut pipeline = OperationPipeline::new("create");
//! pipeline.add_step(
//!     "mkdir",
//!     |_ctx| async { Ok(()) },
//!     |_ctx| async { Ok(()) },
//! );
//! let report = pipeline.execute(&Context::background()).await.unwrap();
//! assert_eq!(report.completed, vec!["mkdir".to_string()]);
//! # });
//! ```

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info_span, Instrument};
use uuid::Uuid;

use super::context::{Context, Interrupt};

type StepFn = Box<dyn FnOnce(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

fn boxed<F, Fut>(f: F) -> StepFn
where
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |ctx| f(ctx).boxed())
}

/// One unit of work with its compensating action.
struct OperationStep {
    name: String,
    action: StepFn,
    rollback: Option<StepFn>,
}

/// Result of rolling back completed steps.
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Steps whose rollback succeeded, in the order they were rolled back.
    pub rolled_back: Vec<String>,
    /// Steps whose rollback failed, with their errors.
    pub failed: Vec<(String, anyhow::Error)>,
    /// Irreversible steps that were left in place.
    pub skipped: Vec<String>,
}

impl RollbackReport {
    /// Whether every reversible step was rolled back.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        if self.is_complete() {
            format!("rolled back {} steps", self.rolled_back.len())
        } else {
            format!(
                "partial rollback: {} succeeded, {} failed",
                self.rolled_back.len(),
                self.failed.len()
            )
        }
    }
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Result of a successful pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Correlation id of this execution.
    pub op_id: Uuid,
    /// Names of the steps that ran, in order.
    pub completed: Vec<String>,
}

/// Errors from pipeline execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A step failed; completed steps were rolled back.
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        index: usize,
        #[source]
        source: anyhow::Error,
        rollback: RollbackReport,
    },

    /// The context fired between steps; completed steps were rolled back.
    #[error("operation interrupted before step '{next_step}': {reason}")]
    Interrupted {
        reason: Interrupt,
        next_step: String,
        rollback: RollbackReport,
    },
}

impl PipelineError {
    /// The rollback outcome attached to this error.
    pub fn rollback(&self) -> &RollbackReport {
        match self {
            PipelineError::StepFailed { rollback, .. } => rollback,
            PipelineError::Interrupted { rollback, .. } => rollback,
        }
    }

    /// The failing step's error, if a step failed.
    pub fn step_error(&self) -> Option<&anyhow::Error> {
        match self {
            PipelineError::StepFailed { source, .. } => Some(source),
            PipelineError::Interrupted { .. } => None,
        }
    }
}

/// An ordered list of steps executed transactionally.
pub struct OperationPipeline {
    operation: String,
    steps: Vec<OperationStep>,
}

impl fmt::Debug for OperationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationPipeline")
            .field("operation", &self.operation)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl OperationPipeline {
    /// Create an empty pipeline for the named operation.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step with its rollback.
    ///
    /// The rollback must be safe to run whether or not the action fully
    /// completed.
    pub fn add_step<A, AFut, R, RFut>(&mut self, name: impl Into<String>, action: A, rollback: R)
    where
        A: FnOnce(Context) -> AFut + Send + 'static,
        AFut: Future<Output = anyhow::Result<()>> + Send + 'static,
        R: FnOnce(Context) -> RFut + Send + 'static,
        RFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push(OperationStep {
            name: name.into(),
            action: boxed(action),
            rollback: Some(boxed(rollback)),
        });
    }

    /// Append a step that cannot be undone.
    pub fn add_irreversible_step<A, AFut>(&mut self, name: impl Into<String>, action: A)
    where
        A: FnOnce(Context) -> AFut + Send + 'static,
        AFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push(OperationStep {
            name: name.into(),
            action: boxed(action),
            rollback: None,
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, rolling back on failure.
    pub async fn execute(self, ctx: &Context) -> Result<PipelineReport, PipelineError> {
        let op_id = Uuid::new_v4();
        let span = info_span!("pipeline", op = %self.operation, op_id = %op_id);
        self.run(ctx, op_id).instrument(span).await
    }

    async fn run(self, ctx: &Context, op_id: Uuid) -> Result<PipelineReport, PipelineError> {
        let mut done: Vec<(String, Option<StepFn>)> = Vec::with_capacity(self.steps.len());

        for (index, step) in self.steps.into_iter().enumerate() {
            if let Some(reason) = ctx.err() {
                debug!(step = %step.name, %reason, "interrupted between steps");
                let rollback = rollback_completed(done).await;
                return Err(PipelineError::Interrupted {
                    reason,
                    next_step: step.name,
                    rollback,
                });
            }

            debug!(step = %step.name, index, "running step");
            match (step.action)(ctx.clone()).await {
                Ok(()) => done.push((step.name, step.rollback)),
                Err(source) => {
                    debug!(step = %step.name, index, error = %source, "step failed");
                    let rollback = rollback_completed(done).await;
                    return Err(PipelineError::StepFailed {
                        step: step.name,
                        index,
                        source,
                        rollback,
                    });
                }
            }
        }

        Ok(PipelineReport {
            op_id,
            completed: done.into_iter().map(|(name, _)| name).collect(),
        })
    }
}

/// Run rollbacks of completed steps in reverse order.
async fn rollback_completed(done: Vec<(String, Option<StepFn>)>) -> RollbackReport {
    let mut report = RollbackReport::default();
    let ctx = Context::background();

    for (name, rollback) in done.into_iter().rev() {
        match rollback {
            Some(rollback) => match rollback(ctx.clone()).await {
                Ok(()) => {
                    debug!(step = %name, "rolled back");
                    report.rolled_back.push(name);
                }
                Err(e) => {
                    let detail = format!("{:#}", e);
                    error!(step = %name, error = %detail, "rollback failed");
                    report.failed.push((name, e));
                }
            },
            None => {
                debug!(step = %name, "irreversible step left in place");
                report.skipped.push(name);
            }
        }
    }

    report
}
