//! git::traits
//!
//! `GitOperations` trait definition for driving repositories.
//!
//! # Design
//!
//! The trait is async because clone, fetch, push and pull involve network
//! I/O, and every method takes a [`Context`] so a stuck call can be
//! abandoned. Errors carry enough information to be classified as
//! retryable or permanent (see [`Classify`]).
//!
//! # Example
//!
//! ```ignore
//! use grovework::git::GitOperations;
//!
//! async fn refresh(git: &dyn GitOperations, ctx: &Context, repo: &Path) -> Result<(), GitError> {
//!     git.fetch(ctx, repo).await?;
//!     git.pull(ctx, repo).await
//! }
//! ```

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::context::{Context, Interrupt};
use crate::engine::retry::{classify_message, Classify, ErrorClass, RetryError};

/// The git operations Grove performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitOp {
    Clone,
    Fetch,
    Push,
    Pull,
    CreateWorktree,
    MoveWorktree,
    RemoveWorktree,
    Status,
}

impl GitOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitOp::Clone => "clone",
            GitOp::Fetch => "fetch",
            GitOp::Push => "push",
            GitOp::Pull => "pull",
            GitOp::CreateWorktree => "worktree add",
            GitOp::MoveWorktree => "worktree move",
            GitOp::RemoveWorktree => "worktree remove",
            GitOp::Status => "status",
        }
    }

    /// Whether the operation talks to a remote.
    pub fn is_network(&self) -> bool {
        matches!(self, GitOp::Clone | GitOp::Fetch | GitOp::Push | GitOp::Pull)
    }
}

impl fmt::Display for GitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from git operations.
#[derive(Debug, Clone, Error)]
pub enum GitError {
    /// git exited unsuccessfully.
    #[error("git {op} failed: {stderr}")]
    CommandFailed {
        op: GitOp,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Trimmed standard error output
        stderr: String,
    },

    /// The git binary could not be started.
    #[error("failed to run git {op}: {message}")]
    Spawn { op: GitOp, message: String },

    /// The context stopped the operation.
    #[error("git {op} interrupted: {reason}")]
    Interrupted { op: GitOp, reason: Interrupt },

    /// A retried operation kept failing.
    #[error("git {op} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        op: GitOp,
        attempts: u32,
        #[source]
        source: Box<GitError>,
    },

    /// git produced output that could not be understood.
    #[error("unexpected git {op} output: {message}")]
    Parse { op: GitOp, message: String },
}

impl GitError {
    /// The operation that failed.
    pub fn op(&self) -> GitOp {
        match self {
            GitError::CommandFailed { op, .. }
            | GitError::Spawn { op, .. }
            | GitError::Interrupted { op, .. }
            | GitError::RetriesExhausted { op, .. }
            | GitError::Parse { op, .. } => *op,
        }
    }

    /// Collapse a retry outcome back into a `GitError`.
    pub fn from_retry(op: GitOp, err: RetryError<GitError>) -> Self {
        match err {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { attempts, source } => GitError::RetriesExhausted {
                op,
                attempts,
                source: Box::new(source),
            },
            RetryError::Interrupted { reason, .. } => GitError::Interrupted { op, reason },
        }
    }
}

impl Classify for GitError {
    fn class(&self) -> ErrorClass {
        match self {
            GitError::CommandFailed { stderr, .. } => classify_message(stderr),
            _ => ErrorClass::Permanent,
        }
    }
}

/// Working-tree state of one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    /// Checked-out branch (`None` when detached)
    pub branch: Option<String>,
    /// Commits ahead of upstream
    pub ahead: u32,
    /// Commits behind upstream
    pub behind: u32,
    /// Paths with uncommitted changes
    pub dirty_files: Vec<String>,
}

impl RepoStatus {
    pub fn is_clean(&self) -> bool {
        self.dirty_files.is_empty()
    }
}

/// Git operations used by workspace commands.
#[async_trait]
pub trait GitOperations: Send + Sync {
    /// Clone `url` into `dest`.
    async fn clone_repo(&self, ctx: &Context, url: &str, dest: &Path) -> Result<(), GitError>;

    /// Fetch from the default remote.
    async fn fetch(&self, ctx: &Context, repo: &Path) -> Result<(), GitError>;

    /// Push `branch` to the default remote.
    async fn push(&self, ctx: &Context, repo: &Path, branch: &str) -> Result<(), GitError>;

    /// Pull the current branch (fast-forward only).
    async fn pull(&self, ctx: &Context, repo: &Path) -> Result<(), GitError>;

    /// Create a worktree of `repo` at `worktree` on `branch`.
    ///
    /// The branch is created if it does not exist.
    async fn create_worktree(
        &self,
        ctx: &Context,
        repo: &Path,
        worktree: &Path,
        branch: &str,
    ) -> Result<(), GitError>;

    /// Move a worktree of `repo` from `from` to `to`.
    async fn move_worktree(
        &self,
        ctx: &Context,
        repo: &Path,
        from: &Path,
        to: &Path,
    ) -> Result<(), GitError>;

    /// Remove a worktree of `repo`.
    async fn remove_worktree(
        &self,
        ctx: &Context,
        repo: &Path,
        worktree: &Path,
    ) -> Result<(), GitError>;

    /// Report branch, upstream divergence and dirty files.
    async fn status(&self, ctx: &Context, repo: &Path) -> Result<RepoStatus, GitError>;
}
