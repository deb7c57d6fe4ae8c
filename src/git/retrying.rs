//! git::retrying
//!
//! Retry wrapper for network-facing git operations.
//!
//! `RetryingGit` runs clone, fetch, push and pull through a
//! [`RetryExecutor`]. Local operations (worktrees, status) pass straight
//! through: their failures are not transient.

use std::path::Path;

use async_trait::async_trait;

use super::traits::{GitError, GitOp, GitOperations, RepoStatus};
use crate::engine::context::Context;
use crate::engine::retry::{RetryConfig, RetryExecutor};

/// Wraps any `GitOperations`, retrying transient network failures.
#[derive(Debug, Clone)]
pub struct RetryingGit<G> {
    inner: G,
    retry: RetryExecutor,
}

impl<G: GitOperations> RetryingGit<G> {
    pub fn new(inner: G, config: RetryConfig) -> Self {
        Self {
            inner,
            retry: RetryExecutor::new(config),
        }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    pub fn retry_config(&self) -> &RetryConfig {
        self.retry.config()
    }
}

#[async_trait]
impl<G: GitOperations> GitOperations for RetryingGit<G> {
    async fn clone_repo(&self, ctx: &Context, url: &str, dest: &Path) -> Result<(), GitError> {
        self.retry
            .run(ctx, "git clone", || self.inner.clone_repo(ctx, url, dest))
            .await
            .map_err(|e| GitError::from_retry(GitOp::Clone, e))
    }

    async fn fetch(&self, ctx: &Context, repo: &Path) -> Result<(), GitError> {
        self.retry
            .run(ctx, "git fetch", || self.inner.fetch(ctx, repo))
            .await
            .map_err(|e| GitError::from_retry(GitOp::Fetch, e))
    }

    async fn push(&self, ctx: &Context, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.retry
            .run(ctx, "git push", || self.inner.push(ctx, repo, branch))
            .await
            .map_err(|e| GitError::from_retry(GitOp::Push, e))
    }

    async fn pull(&self, ctx: &Context, repo: &Path) -> Result<(), GitError> {
        self.retry
            .run(ctx, "git pull", || self.inner.pull(ctx, repo))
            .await
            .map_err(|e| GitError::from_retry(GitOp::Pull, e))
    }

    async fn create_worktree(
        &self,
        ctx: &Context,
        repo: &Path,
        worktree: &Path,
        branch: &str,
    ) -> Result<(), GitError> {
        self.inner.create_worktree(ctx, repo, worktree, branch).await
    }

    async fn move_worktree(
        &self,
        ctx: &Context,
        repo: &Path,
        from: &Path,
        to: &Path,
    ) -> Result<(), GitError> {
        self.inner.move_worktree(ctx, repo, from, to).await
    }

    async fn remove_worktree(
        &self,
        ctx: &Context,
        repo: &Path,
        worktree: &Path,
    ) -> Result<(), GitError> {
        self.inner.remove_worktree(ctx, repo, worktree).await
    }

    async fn status(&self, ctx: &Context, repo: &Path) -> Result<RepoStatus, GitError> {
        self.inner.status(ctx, repo).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::mock::MockGit;
    use std::time::Duration;

    fn transient() -> GitError {
        GitError::CommandFailed {
            op: GitOp::Fetch,
            code: Some(128),
            stderr: "fatal: unable to access: Connection reset by peer".into(),
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_fetch_is_retried() {
        let mock = MockGit::new();
        mock.fail_next(GitOp::Fetch, transient(), 2);
        let git = RetryingGit::new(mock.clone(), fast_retry());

        git.fetch(&Context::background(), Path::new("/repo"))
            .await
            .unwrap();
        assert_eq!(mock.count(GitOp::Fetch), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts() {
        let mock = MockGit::new();
        mock.fail_next(GitOp::Fetch, transient(), 10);
        let git = RetryingGit::new(mock.clone(), fast_retry());

        let err = git
            .fetch(&Context::background(), Path::new("/repo"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GitError::RetriesExhausted {
                op: GitOp::Fetch,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(mock.count(GitOp::Fetch), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_not_retried() {
        let mock = MockGit::new();
        mock.fail_next(
            GitOp::Push,
            GitError::CommandFailed {
                op: GitOp::Push,
                code: Some(128),
                stderr: "fatal: Authentication failed".into(),
            },
            5,
        );
        let git = RetryingGit::new(mock.clone(), fast_retry());

        let err = git
            .push(&Context::background(), Path::new("/repo"), "main")
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::CommandFailed { .. }));
        assert_eq!(mock.count(GitOp::Push), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn local_operations_pass_through() {
        let temp = tempfile::TempDir::new().unwrap();
        let mock = MockGit::new();
        mock.fail_next(
            GitOp::CreateWorktree,
            GitError::CommandFailed {
                op: GitOp::CreateWorktree,
                code: Some(128),
                stderr: "connection reset".into(),
            },
            1,
        );
        let git = RetryingGit::new(mock.clone(), fast_retry());

        let err = git
            .create_worktree(
                &Context::background(),
                temp.path(),
                &temp.path().join("wt"),
                "b",
            )
            .await;
        assert!(err.is_err());
        assert_eq!(mock.count(GitOp::CreateWorktree), 1);
    }
}
