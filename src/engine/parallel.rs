//! engine::parallel
//!
//! Bounded parallel execution of per-repository work.
//!
//! # Contract
//!
//! - At most `max_workers` tasks run at once (a tokio [`Semaphore`]).
//! - `results[i]` always corresponds to `tasks[i]`, whatever the
//!   completion order.
//! - [`ExecutionMode::FailFast`] cancels the batch context on the first
//!   failure; nothing is dispatched afterwards, running tasks finish.
//! - [`ExecutionMode::ContinueOnError`] runs every task and reports every
//!   failing index.
//! - Cancelling the caller's context stops dispatch and is reported as
//!   [`BatchError::Interrupted`], never as a task failure.
//!
//! # Example
//!
//! ```ignore
//! use grovework::engine::parallel::{ExecutionMode, ParallelExecutor};
//!
//! let executor = ParallelExecutor::new(4);
//! let tasks: Vec<_> = repos
//!     .iter()
//!     .map(|repo| {
//!         let git = git.clone();
//!         let dir = repo.dir.clone();
//!         move |ctx: Context| async move { git.fetch(&ctx, &dir).await }
//!     })
//!     .collect();
//! let fetched = executor
//!     .execute(&ctx, tasks, ExecutionMode::ContinueOnError)
//!     .await
//!     .into_result()?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::context::{Context, Interrupt};

/// Default number of concurrent workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Smallest accepted worker count.
pub const MIN_WORKERS: usize = 1;

/// Largest accepted worker count.
pub const MAX_WORKERS: usize = 10;

/// How a batch reacts to a failing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Stop dispatching after the first failure.
    FailFast,
    /// Run every task regardless of earlier failures.
    ContinueOnError,
}

/// Every failed task of a continue-on-error batch, in index order.
#[derive(Debug)]
pub struct PartialFailure<E> {
    pub failures: Vec<(usize, E)>,
    pub total: usize,
}

impl<E> PartialFailure<E> {
    /// Indices of the failed tasks.
    pub fn indices(&self) -> Vec<usize> {
        self.failures.iter().map(|(i, _)| *i).collect()
    }
}

impl<E: fmt::Display> fmt::Display for PartialFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} tasks failed", self.failures.len(), self.total)?;
        for (index, err) in &self.failures {
            write!(f, "; task {}: {}", index, err)?;
        }
        Ok(())
    }
}

/// Aggregate error of a batch.
#[derive(Debug, Error)]
pub enum BatchError<E>
where
    E: std::error::Error + 'static,
{
    /// First failure of a fail-fast batch.
    #[error("task {index} failed: {source} ({} other failures suppressed)", suppressed.len())]
    FailFast {
        index: usize,
        #[source]
        source: E,
        /// Failures of tasks that were already running.
        suppressed: Vec<(usize, E)>,
    },

    /// Failures of a continue-on-error batch.
    #[error("{0}")]
    Partial(PartialFailure<E>),

    /// The caller's context stopped before every task was dispatched.
    #[error("batch {reason}: {skipped} tasks not started")]
    Interrupted { reason: Interrupt, skipped: usize },
}

impl<E> BatchError<E>
where
    E: std::error::Error + 'static,
{
    /// Indices of every task that failed (not skipped).
    pub fn failed_indices(&self) -> Vec<usize> {
        match self {
            BatchError::FailFast {
                index, suppressed, ..
            } => {
                let mut all: Vec<usize> = suppressed.iter().map(|(i, _)| *i).collect();
                all.push(*index);
                all.sort_unstable();
                all
            }
            BatchError::Partial(partial) => partial.indices(),
            BatchError::Interrupted { .. } => Vec::new(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, BatchError::Interrupted { .. })
    }
}

/// Results of a batch plus its aggregate error.
///
/// `results[i]` is `Some` only when task `i` completed successfully.
#[derive(Debug)]
pub struct BatchReport<T, E>
where
    E: std::error::Error + 'static,
{
    pub results: Vec<Option<T>>,
    pub error: Option<BatchError<E>>,
}

impl<T, E> BatchReport<T, E>
where
    E: std::error::Error + 'static,
{
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// All results, or the aggregate error.
    pub fn into_result(self) -> Result<Vec<T>, BatchError<E>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(self.results.into_iter().flatten().collect())
    }
}

enum Outcome<T, E> {
    Completed(T),
    Failed(E),
}

/// Runs batches of tasks with a worker cap.
#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    max_workers: usize,
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl ParallelExecutor {
    /// Create an executor; `max_workers` is clamped to 1..=10.
    pub fn new(max_workers: usize) -> Self {
        let clamped = max_workers.clamp(MIN_WORKERS, MAX_WORKERS);
        if clamped != max_workers {
            warn!(
                requested = max_workers,
                using = clamped,
                "parallel worker count out of range"
            );
        }
        Self {
            max_workers: clamped,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `tasks`, at most `max_workers` at a time.
    ///
    /// Each task receives a context derived from `ctx` that is also
    /// cancelled when a fail-fast batch aborts.
    ///
    /// # Panics
    ///
    /// A panic inside a task is resumed on the caller.
    pub async fn execute<T, E, F, Fut>(
        &self,
        ctx: &Context,
        tasks: Vec<F>,
        mode: ExecutionMode,
    ) -> BatchReport<T, E>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let total = tasks.len();
        let batch = ctx.child();
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        // Index of the first failure in completion order.
        let first_failure: Arc<Mutex<Option<usize>>> = Arc::new(Mutex::new(None));

        debug!(total, workers = self.max_workers, ?mode, "dispatching batch");

        let mut set = JoinSet::new();
        let mut dispatched = 0;
        for (index, task) in tasks.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = batch.done() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            dispatched += 1;

            let batch = batch.clone();
            let first_failure = first_failure.clone();
            set.spawn(async move {
                let outcome = match task(batch.clone()).await {
                    Ok(value) => Outcome::Completed(value),
                    Err(err) => {
                        {
                            let mut first = first_failure
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                            if first.is_none() {
                                *first = Some(index);
                            }
                        }
                        if mode == ExecutionMode::FailFast {
                            // Cancel before the permit is returned so the
                            // dispatcher cannot hand it to another task.
                            batch.cancel();
                        }
                        Outcome::Failed(err)
                    }
                };
                drop(permit);
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<Outcome<T, E>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(err) => warn!(error = %err, "parallel task aborted"),
            }
        }

        let mut results = Vec::with_capacity(total);
        let mut failures = Vec::new();
        let mut skipped = 0;
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Some(Outcome::Completed(value)) => results.push(Some(value)),
                Some(Outcome::Failed(err)) => {
                    results.push(None);
                    failures.push((index, err));
                }
                None => {
                    results.push(None);
                    skipped += 1;
                }
            }
        }
        debug!(total, dispatched, skipped, "batch drained");

        let error = match (ctx.err(), skipped) {
            (Some(reason), n) if n > 0 => Some(BatchError::Interrupted { reason, skipped: n }),
            _ if !failures.is_empty() => Some(match mode {
                ExecutionMode::ContinueOnError => {
                    BatchError::Partial(PartialFailure { failures, total })
                }
                ExecutionMode::FailFast => {
                    let first = first_failure
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .take();
                    let pos = first
                        .and_then(|idx| failures.iter().position(|(i, _)| *i == idx))
                        .unwrap_or(0);
                    let (index, source) = failures.remove(pos);
                    BatchError::FailFast {
                        index,
                        source,
                        suppressed: failures,
                    }
                }
            }),
            (_, 0) => None,
            // The caller's deadline fired between dispatch and this check.
            (reason, n) => Some(BatchError::Interrupted {
                reason: reason.unwrap_or(Interrupt::DeadlineExceeded),
                skipped: n,
            }),
        };

        if let Some(err) = &error {
            debug!(total, skipped, error = %err, "batch finished with errors");
        }

        BatchReport { results, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Error, PartialEq)]
    #[error("task error {0}")]
    struct TaskError(usize);

    type Task = Box<dyn FnOnce(Context) -> BoxFuture<'static, Result<usize, TaskError>> + Send>;

    /// Tasks that sleep for `delays[i]` ms, fail if `i` is in `failing`, and
    /// track peak concurrency and how many started.
    fn tasks(
        delays: &[u64],
        failing: &[usize],
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        started: Arc<AtomicUsize>,
    ) -> Vec<Task> {
        delays
            .iter()
            .enumerate()
            .map(|(i, &delay)| {
                let fail = failing.contains(&i);
                let running = running.clone();
                let peak = peak.clone();
                let started = started.clone();
                let task: Task = Box::new(move |_ctx: Context| {
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        if fail {
                            Err(TaskError(i))
                        } else {
                            Ok(i * 10)
                        }
                    }
                    .boxed()
                });
                task
            })
            .collect()
    }

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    #[test]
    fn worker_count_is_clamped() {
        assert_eq!(ParallelExecutor::new(0).max_workers(), 1);
        assert_eq!(ParallelExecutor::new(4).max_workers(), 4);
        assert_eq!(ParallelExecutor::new(64).max_workers(), 10);
        assert_eq!(ParallelExecutor::default().max_workers(), DEFAULT_WORKERS);
    }

    #[tokio::test]
    async fn results_follow_input_order() {
        let (running, peak, started) = counters();
        let delays = [40, 5, 25, 1, 15, 30];
        let report = ParallelExecutor::new(3)
            .execute(
                &Context::background(),
                tasks(&delays, &[], running, peak.clone(), started),
                ExecutionMode::FailFast,
            )
            .await;

        let values = report.into_result().unwrap();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50]);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn never_exceeds_worker_limit() {
        let (running, peak, started) = counters();
        let delays = [10; 12];
        let report = ParallelExecutor::new(2)
            .execute(
                &Context::background(),
                tasks(&delays, &[], running, peak.clone(), started.clone()),
                ExecutionMode::ContinueOnError,
            )
            .await;

        assert!(report.is_success());
        assert_eq!(started.load(Ordering::SeqCst), 12);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn continue_on_error_reports_every_failure() {
        let (running, peak, started) = counters();
        let delays = [5, 1, 8, 2, 3];
        let report = ParallelExecutor::new(2)
            .execute(
                &Context::background(),
                tasks(&delays, &[1, 3], running, peak, started.clone()),
                ExecutionMode::ContinueOnError,
            )
            .await;

        assert_eq!(started.load(Ordering::SeqCst), 5);
        assert_eq!(report.results[0], Some(0));
        assert_eq!(report.results[1], None);
        assert_eq!(report.results[4], Some(40));

        match report.error {
            Some(BatchError::Partial(partial)) => {
                assert_eq!(partial.indices(), vec![1, 3]);
                assert_eq!(partial.total, 5);
                assert_eq!(partial.failures[0].1, TaskError(1));
                let msg = partial.to_string();
                assert!(msg.contains("2 of 5 tasks failed"));
                assert!(msg.contains("task 3: task error 3"));
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fail_fast_stops_dispatch() {
        let (running, peak, started) = counters();
        // Worker limit 1 makes dispatch strictly sequential.
        let delays = [1, 1, 1, 1, 1];
        let report = ParallelExecutor::new(1)
            .execute(
                &Context::background(),
                tasks(&delays, &[1], running, peak, started.clone()),
                ExecutionMode::FailFast,
            )
            .await;

        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(report.results[0], Some(0));
        assert!(report.results[2..].iter().all(Option::is_none));
        match report.error {
            Some(BatchError::FailFast {
                index,
                source,
                suppressed,
            }) => {
                assert_eq!(index, 1);
                assert_eq!(source, TaskError(1));
                assert!(suppressed.is_empty());
            }
            other => panic!("expected fail-fast error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fail_fast_lets_running_tasks_finish() {
        let (running, peak, started) = counters();
        // Task 0 fails quickly while task 1 is still running.
        let delays = [5, 60, 1, 1];
        let report = ParallelExecutor::new(2)
            .execute(
                &Context::background(),
                tasks(&delays, &[0, 1], running, peak, started.clone()),
                ExecutionMode::FailFast,
            )
            .await;

        assert_eq!(started.load(Ordering::SeqCst), 2);
        let err = report.error.expect("batch should fail");
        assert_eq!(err.failed_indices(), vec![0, 1]);
        match err {
            BatchError::FailFast {
                index, suppressed, ..
            } => {
                assert_eq!(index, 0);
                assert_eq!(suppressed.len(), 1);
                assert_eq!(suppressed[0].0, 1);
            }
            other => panic!("expected fail-fast error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn caller_cancellation_is_not_a_task_failure() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        let (running, peak, started) = counters();
        let delays = [30; 6];

        let handle = tokio::spawn(async move {
            ParallelExecutor::new(2)
                .execute(
                    &ctx,
                    tasks(&delays, &[], running, peak, started),
                    ExecutionMode::ContinueOnError,
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();

        let report = handle.await.unwrap();
        match report.error {
            Some(BatchError::Interrupted { reason, skipped }) => {
                assert_eq!(reason, Interrupt::Cancelled);
                assert_eq!(skipped, 4);
            }
            other => panic!("expected interruption, got {:?}", other),
        }
        // The two tasks already running were allowed to finish.
        assert_eq!(report.results[0], Some(0));
        assert_eq!(report.results[1], Some(10));
    }

    #[tokio::test]
    async fn tasks_observe_batch_cancellation() {
        let observed = Arc::new(AtomicUsize::new(0));
        let mut work: Vec<Task> = Vec::new();

        work.push(Box::new(|_ctx: Context| {
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err::<usize, _>(TaskError(0))
            }
            .boxed()
        }));
        let seen = observed.clone();
        work.push(Box::new(move |ctx: Context| {
            async move {
                let reason = ctx.done().await;
                assert_eq!(reason, Interrupt::Cancelled);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<usize, TaskError>(1)
            }
            .boxed()
        }));

        let report = ParallelExecutor::new(2)
            .execute(&Context::background(), work, ExecutionMode::FailFast)
            .await;

        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            report.error,
            Some(BatchError::FailFast { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn empty_batch_succeeds() {
        let work: Vec<Task> = Vec::new();
        let report = ParallelExecutor::default()
            .execute(&Context::background(), work, ExecutionMode::FailFast)
            .await;
        assert!(report.into_result().unwrap().is_empty());
    }

    #[test]
    fn error_display_formatting() {
        let err: BatchError<TaskError> = BatchError::FailFast {
            index: 2,
            source: TaskError(2),
            suppressed: vec![(4, TaskError(4))],
        };
        let msg = err.to_string();
        assert!(msg.contains("task 2 failed"));
        assert!(msg.contains("1 other failures suppressed"));

        let err: BatchError<TaskError> = BatchError::Interrupted {
            reason: Interrupt::DeadlineExceeded,
            skipped: 3,
        };
        assert!(err.to_string().contains("deadline exceeded"));
        assert!(err.is_interrupted());
        assert!(err.failed_indices().is_empty());
    }
}
