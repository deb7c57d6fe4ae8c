//! End-to-end scenarios for the engine primitives.
//!
//! These tests drive LockManager, RetryExecutor and OperationPipeline
//! together the way a workspace operation does, with paused time where
//! backoff or polling would otherwise make them slow.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tokio::time::Instant;

use grovework::core::ops::lock::{LockError, LockManager, DEFAULT_STALE_THRESHOLD};
use grovework::core::types::WorkspaceId;
use grovework::engine::{
    Classify, Context, ErrorClass, Interrupt, OperationPipeline, PipelineError, RetryConfig,
    RetryError, RetryExecutor,
};

// =============================================================================
// Test Helpers
// =============================================================================

#[derive(Debug, Error, PartialEq)]
enum NetError {
    #[error("connection reset by peer")]
    Reset,
    #[error("authentication failed")]
    Denied,
}

impl Classify for NetError {
    fn class(&self) -> ErrorClass {
        match self {
            NetError::Reset => ErrorClass::Retryable,
            NetError::Denied => ErrorClass::Permanent,
        }
    }
}

fn id(s: &str) -> WorkspaceId {
    WorkspaceId::new(s).unwrap()
}

// =============================================================================
// Locking
// =============================================================================

#[tokio::test(start_paused = true)]
async fn held_lock_times_out_after_two_seconds() {
    let temp = TempDir::new().unwrap();
    let locks = LockManager::new(temp.path(), DEFAULT_STALE_THRESHOLD);
    let ctx = Context::background();

    let _held = locks
        .acquire(&ctx, &id("PROJ-1"), Duration::from_secs(2))
        .await
        .unwrap();

    let started = Instant::now();
    let err = locks
        .acquire(&ctx, &id("PROJ-1"), Duration::from_secs(2))
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, LockError::Locked { .. }));
    assert!(waited >= Duration::from_secs(2));
    assert!(waited < Duration::from_millis(2_200));
}

#[tokio::test(start_paused = true)]
async fn released_lock_is_handed_to_waiter() {
    let temp = TempDir::new().unwrap();
    let locks = LockManager::new(temp.path(), DEFAULT_STALE_THRESHOLD);
    let ctx = Context::background();

    let held = locks
        .acquire(&ctx, &id("PROJ-1"), Duration::from_secs(1))
        .await
        .unwrap();

    let waiter = {
        let locks = locks.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { locks.acquire(&ctx, &id("PROJ-1"), Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(350)).await;
    drop(held);

    let lock = waiter.await.unwrap().unwrap();
    assert!(lock.is_held());
}

#[tokio::test]
async fn different_workspaces_do_not_contend() {
    let temp = TempDir::new().unwrap();
    let locks = LockManager::new(temp.path(), DEFAULT_STALE_THRESHOLD);
    let ctx = Context::background();

    let _a = locks
        .acquire(&ctx, &id("PROJ-1"), Duration::from_millis(100))
        .await
        .unwrap();
    let _b = locks
        .acquire(&ctx, &id("PROJ-2"), Duration::from_millis(100))
        .await
        .unwrap();
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn two_transient_failures_then_success() {
    let retry = RetryExecutor::new(RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
        jitter_factor: 0.0,
    });
    let calls = Arc::new(AtomicU32::new(0));

    let started = Instant::now();
    let result = retry
        .run(&Context::background(), "fetch", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(NetError::Reset)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 1s after the first failure, 2s after the second.
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_returned_immediately() {
    let retry = RetryExecutor::new(RetryConfig::default());
    let calls = Arc::new(AtomicU32::new(0));

    let started = Instant::now();
    let err = retry
        .run(&Context::background(), "push", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(NetError::Denied)
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RetryError::Permanent(NetError::Denied)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_stops_retrying() {
    let retry = RetryExecutor::new(RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(10),
        multiplier: 1.0,
        jitter_factor: 0.0,
    });
    let ctx = Context::background().with_timeout(Duration::from_secs(1));

    let err = retry
        .run(&ctx, "clone", || async { Err::<(), _>(NetError::Reset) })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RetryError::Interrupted {
            reason: Interrupt::DeadlineExceeded,
            attempts: 1,
        }
    ));
}

// =============================================================================
// Pipeline
// =============================================================================

#[tokio::test]
async fn failed_clone_rolls_back_only_mkdir() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("PROJ-1");
    let clone_rolled_back = Arc::new(AtomicU32::new(0));

    let mut pipeline = OperationPipeline::new("create");
    {
        let made = dir.clone();
        let removed = dir.clone();
        pipeline.add_step(
            "mkdir",
            move |_ctx| async move { Ok(tokio::fs::create_dir(&made).await?) },
            move |_ctx| async move { Ok(tokio::fs::remove_dir_all(&removed).await?) },
        );
    }
    {
        let counter = clone_rolled_back.clone();
        pipeline.add_step(
            "clone",
            |_ctx| async { Err(anyhow::anyhow!("clone failed: repository not found")) },
            move |_ctx| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
    }

    let err = pipeline.execute(&Context::background()).await.unwrap_err();
    let PipelineError::StepFailed {
        step,
        index,
        source,
        rollback,
    } = err
    else {
        panic!("expected step failure");
    };

    assert_eq!(step, "clone");
    assert_eq!(index, 1);
    assert_eq!(source.to_string(), "clone failed: repository not found");
    assert_eq!(rollback.rolled_back, vec!["mkdir"]);
    assert!(rollback.is_complete());
    assert_eq!(clone_rolled_back.load(Ordering::SeqCst), 0);
    assert!(!dir.exists());
}

#[tokio::test]
async fn rollback_failure_is_reported_not_returned() {
    let mut pipeline = OperationPipeline::new("rename");
    pipeline.add_step(
        "move",
        |_ctx| async { Ok(()) },
        |_ctx| async { Err(anyhow::anyhow!("cannot move back")) },
    );
    pipeline.add_step(
        "save",
        |_ctx| async { Err(anyhow::anyhow!("disk full")) },
        |_ctx| async { Ok(()) },
    );

    let err = pipeline.execute(&Context::background()).await.unwrap_err();
    assert_eq!(err.step_error().unwrap().to_string(), "disk full");
    let rollback = err.rollback();
    assert!(!rollback.is_complete());
    assert_eq!(rollback.failed.len(), 1);
    assert_eq!(rollback.failed[0].0, "move");
}
