//! engine::context
//!
//! Cancellation and deadline propagation for every async operation.
//!
//! A [`Context`] pairs a [`CancellationToken`] with an optional deadline.
//! Contexts form a tree: cancelling a context cancels everything derived
//! from it, and a derived deadline is never later than its parent's.
//!
//! # Example
//!
//! ```
//! use grovework::engine::context::{Context, Interrupt};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let root = Context::background();
//! let child = root.with_timeout(Duration::from_secs(5));
//! assert!(child.check().is_ok());
//!
//! root.cancel();
//! assert_eq!(child.err(), Some(Interrupt::Cancelled));
//! # });
//! ```

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped.
///
/// Kept distinct from ordinary failures so callers can tell a user
/// interrupt from a real error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupt {
    /// The context (or an ancestor) was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The context deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation token plus optional deadline.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A root context that is never cancelled on its own.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a child that can be cancelled independently of its parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child whose deadline is `timeout` from now (or the parent's,
    /// if that is sooner).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child with the given deadline (or the parent's, if sooner).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The reason this context stopped, or `None` while it is live.
    ///
    /// Cancellation wins over an expired deadline.
    pub fn err(&self) -> Option<Interrupt> {
        if self.token.is_cancelled() {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(Interrupt::DeadlineExceeded),
            _ => None,
        }
    }

    /// `Err` once the context has stopped.
    pub fn check(&self) -> Result<(), Interrupt> {
        match self.err() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Interrupt {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Interrupt::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Interrupt::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Interrupt::Cancelled
            }
        }
    }

    /// Sleep for `duration` unless the context stops first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_live() {
        let ctx = Context::background();
        assert!(ctx.check().is_ok());
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn cancel_propagates_to_children_only() {
        let root = Context::background();
        let child = root.child();
        let grandchild = child.child();

        child.cancel();
        assert!(root.check().is_ok());
        assert_eq!(child.err(), Some(Interrupt::Cancelled));
        assert_eq!(grandchild.err(), Some(Interrupt::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_secs(2));
        assert!(ctx.check().is_ok());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(ctx.err(), Some(Interrupt::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn child_deadline_never_exceeds_parent() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.with_timeout(Duration::from_millis(10));
        assert!(tighter.deadline() < parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn done_resolves_on_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(500));
        let start = Instant::now();
        assert_eq!(ctx.done().await, Interrupt::DeadlineExceeded);
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_cancel() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = ctx.sleep(Duration::from_secs(30)).await;
        assert_eq!(result, Err(Interrupt::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_when_live() {
        let ctx = Context::background();
        assert_eq!(ctx.sleep(Duration::from_secs(1)).await, Ok(()));
    }

    #[test]
    fn interrupt_display() {
        assert!(Interrupt::Cancelled.to_string().contains("cancelled"));
        assert!(Interrupt::DeadlineExceeded.to_string().contains("deadline"));
    }
}
