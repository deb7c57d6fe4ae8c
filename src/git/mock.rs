//! git::mock
//!
//! Mock git implementation for deterministic testing.
//!
//! # Design
//!
//! `MockGit` records every call, can inject scripted failures and latency,
//! and mirrors the filesystem effects tests care about: `clone_repo`
//! creates its destination with a `.git` directory and, like git, refuses a
//! destination that is not empty; `create_worktree` creates its target
//! directory and `remove_worktree` deletes it. Latency waits on the context, so cancellation and deadline
//! behavior can be exercised without real processes.
//!
//! # Example
//!
//! ```
//! use grovework::engine::context::Context;
//! use grovework::git::mock::MockGit;
//! use grovework::git::{GitError, GitOp, GitOperations};
//! use std::path::Path;
//!
//! # tokio_test::block_on(async {
//! let git = MockGit::new();
//! git.fail_next(
//!     GitOp::Fetch,
//!     GitError::CommandFailed { op: GitOp::Fetch, code: Some(128), stderr: "connection reset".into() },
//!     1,
//! );
//!
//! let ctx = Context::background();
//! assert!(git.fetch(&ctx, Path::new("/repo")).await.is_err());
//! assert!(git.fetch(&ctx, Path::new("/repo")).await.is_ok());
//! assert_eq!(git.count(GitOp::Fetch), 2);
//! # });
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::traits::{GitError, GitOp, GitOperations, RepoStatus};
use crate::engine::context::Context;

/// Mock git for testing.
///
/// Thread-safe via internal `Arc<Mutex<...>>` wrapping; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockGit {
    inner: Arc<Mutex<MockGitInner>>,
}

#[derive(Debug, Default)]
struct MockGitInner {
    /// Failures consumed one per call.
    scripted: HashMap<GitOp, Vec<GitError>>,
    /// Failures for any call whose target contains a needle.
    matching: Vec<(GitOp, String, GitError)>,
    /// Per-operation latency.
    latency: HashMap<GitOp, Duration>,
    /// Scripted status results.
    statuses: HashMap<PathBuf, RepoStatus>,
    /// Live worktrees and their branches.
    worktrees: HashMap<PathBuf, String>,
    /// Recorded calls.
    calls: Vec<MockGitCall>,
}

/// Recorded call for test verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockGitCall {
    pub op: GitOp,
    /// Destination, repository or worktree path
    pub target: PathBuf,
    /// URL or branch, when the operation takes one
    pub detail: Option<String>,
}

impl MockGit {
    /// Create a mock that succeeds at everything.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockGitInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_next(&self, op: GitOp, error: GitError, times: usize) {
        let mut state = self.state();
        let queue = state.scripted.entry(op).or_default();
        for _ in 0..times {
            queue.push(error.clone());
        }
    }

    /// Fail every call of `op` whose target path or URL contains `needle`.
    pub fn fail_matching(&self, op: GitOp, needle: impl Into<String>, error: GitError) {
        self.state().matching.push((op, needle.into(), error));
    }

    /// Remove all scripted failures.
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.scripted.clear();
        state.matching.clear();
    }

    /// Make every call of `op` take `delay` (observing the context).
    pub fn set_latency(&self, op: GitOp, delay: Duration) {
        self.state().latency.insert(op, delay);
    }

    /// Result returned by `status` for `repo`.
    pub fn set_status(&self, repo: impl Into<PathBuf>, status: RepoStatus) {
        self.state().statuses.insert(repo.into(), status);
    }

    /// Get all recorded calls.
    pub fn calls(&self) -> Vec<MockGitCall> {
        self.state().calls.clone()
    }

    /// Number of recorded calls of `op`.
    pub fn count(&self, op: GitOp) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    /// Clear recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Live worktree paths, sorted.
    pub fn worktrees(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.state().worktrees.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn has_worktree(&self, path: &Path) -> bool {
        self.state().worktrees.contains_key(path)
    }

    /// Whether `path` holds a clone (wherever it was cloned to).
    pub fn is_cloned(&self, path: &Path) -> bool {
        path.join(".git").is_dir()
    }

    /// Record the call, wait out any latency, then apply scripted failures.
    async fn enter(
        &self,
        ctx: &Context,
        op: GitOp,
        target: &Path,
        detail: Option<&str>,
    ) -> Result<(), GitError> {
        let latency = {
            let mut state = self.state();
            state.calls.push(MockGitCall {
                op,
                target: target.to_path_buf(),
                detail: detail.map(str::to_string),
            });
            state.latency.get(&op).copied()
        };

        ctx.check()
            .map_err(|reason| GitError::Interrupted { op, reason })?;
        if let Some(delay) = latency {
            ctx.sleep(delay)
                .await
                .map_err(|reason| GitError::Interrupted { op, reason })?;
        }

        let mut state = self.state();
        if let Some(queue) = state.scripted.get_mut(&op) {
            if !queue.is_empty() {
                return Err(queue.remove(0));
            }
        }
        let target_str = target.to_string_lossy();
        let matched = state.matching.iter().find(|(o, needle, _)| {
            *o == op
                && (target_str.contains(needle.as_str())
                    || detail.is_some_and(|d| d.contains(needle.as_str())))
        });
        if let Some((_, _, error)) = matched {
            return Err(error.clone());
        }
        Ok(())
    }
}

fn io_error(op: GitOp, e: std::io::Error) -> GitError {
    GitError::CommandFailed {
        op,
        code: Some(128),
        stderr: e.to_string(),
    }
}

#[async_trait]
impl GitOperations for MockGit {
    async fn clone_repo(&self, ctx: &Context, url: &str, dest: &Path) -> Result<(), GitError> {
        self.enter(ctx, GitOp::Clone, dest, Some(url)).await?;
        if let Ok(mut entries) = tokio::fs::read_dir(dest).await {
            if let Ok(Some(_)) = entries.next_entry().await {
                return Err(GitError::CommandFailed {
                    op: GitOp::Clone,
                    code: Some(128),
                    stderr: format!(
                        "fatal: destination path '{}' already exists and is not an empty directory.",
                        dest.display()
                    ),
                });
            }
        }
        tokio::fs::create_dir_all(dest.join(".git"))
            .await
            .map_err(|e| io_error(GitOp::Clone, e))
    }

    async fn fetch(&self, ctx: &Context, repo: &Path) -> Result<(), GitError> {
        self.enter(ctx, GitOp::Fetch, repo, None).await
    }

    async fn push(&self, ctx: &Context, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.enter(ctx, GitOp::Push, repo, Some(branch)).await
    }

    async fn pull(&self, ctx: &Context, repo: &Path) -> Result<(), GitError> {
        self.enter(ctx, GitOp::Pull, repo, None).await
    }

    async fn create_worktree(
        &self,
        ctx: &Context,
        _repo: &Path,
        worktree: &Path,
        branch: &str,
    ) -> Result<(), GitError> {
        self.enter(ctx, GitOp::CreateWorktree, worktree, Some(branch))
            .await?;
        if self.has_worktree(worktree) {
            return Err(GitError::CommandFailed {
                op: GitOp::CreateWorktree,
                code: Some(128),
                stderr: format!("fatal: '{}' already exists", worktree.display()),
            });
        }
        tokio::fs::create_dir_all(worktree)
            .await
            .map_err(|e| io_error(GitOp::CreateWorktree, e))?;
        self.state()
            .worktrees
            .insert(worktree.to_path_buf(), branch.to_string());
        Ok(())
    }

    async fn move_worktree(
        &self,
        ctx: &Context,
        _repo: &Path,
        from: &Path,
        to: &Path,
    ) -> Result<(), GitError> {
        let dest = to.to_string_lossy().into_owned();
        self.enter(ctx, GitOp::MoveWorktree, from, Some(&dest)).await?;
        let branch = self.state().worktrees.remove(from);
        let Some(branch) = branch else {
            return Err(GitError::CommandFailed {
                op: GitOp::MoveWorktree,
                code: Some(128),
                stderr: format!("fatal: '{}' is not a working tree", from.display()),
            });
        };
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(GitOp::MoveWorktree, e))?;
        }
        if let Err(e) = tokio::fs::rename(from, to).await {
            self.state().worktrees.insert(from.to_path_buf(), branch);
            return Err(io_error(GitOp::MoveWorktree, e));
        }
        self.state().worktrees.insert(to.to_path_buf(), branch);
        Ok(())
    }

    async fn remove_worktree(
        &self,
        ctx: &Context,
        _repo: &Path,
        worktree: &Path,
    ) -> Result<(), GitError> {
        self.enter(ctx, GitOp::RemoveWorktree, worktree, None).await?;
        if self.state().worktrees.remove(worktree).is_none() {
            return Err(GitError::CommandFailed {
                op: GitOp::RemoveWorktree,
                code: Some(128),
                stderr: format!("fatal: '{}' is not a working tree", worktree.display()),
            });
        }
        match tokio::fs::remove_dir_all(worktree).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(GitOp::RemoveWorktree, e)),
        }
    }

    async fn status(&self, ctx: &Context, repo: &Path) -> Result<RepoStatus, GitError> {
        self.enter(ctx, GitOp::Status, repo, None).await?;
        let state = self.state();
        if let Some(status) = state.statuses.get(repo) {
            return Ok(status.clone());
        }
        Ok(RepoStatus {
            branch: state.worktrees.get(repo).cloned(),
            ..Default::default()
        })
    }
}
