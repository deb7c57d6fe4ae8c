//! git
//!
//! Git collaborators used by workspace operations.
//!
//! # Architecture
//!
//! Workspace code never shells out to git directly: it talks to the
//! [`GitOperations`] trait. This module provides:
//!
//! - `traits`: The `GitOperations` trait, `GitError` and `RepoStatus`
//! - [`command`]: Implementation running the `git` binary
//! - [`retrying`]: Wrapper retrying transient network failures
//! - [`mock`]: Mock implementation for deterministic testing
//!
//! Git protocol handling and network transport are left to git itself.
//!
//! # Invariants
//!
//! - Every call observes its [`Context`](crate::engine::Context)
//! - Only clone, fetch, push and pull are retried
//! - `GitError` is classified from git's stderr
//!
//! # Example
//!
//! ```ignore
//! use grovework::git::{CommandGit, RetryingGit, GitOperations};
//!
//! let git = RetryingGit::new(CommandGit::new(), config.retry().clone());
//! git.clone_repo(&ctx, "git@github.com:org/api.git", &dest).await?;
//! ```

pub mod command;
pub mod mock;
pub mod retrying;
mod traits;

pub use command::CommandGit;
pub use retrying::RetryingGit;
pub use traits::*;
