//! Grovework - concurrency and reliability engine for multi-repo workspaces
//!
//! A Grove workspace is a named set of git worktrees, one per repository,
//! all on the same branch. Grovework provides the machinery that keeps
//! concurrent operations on those workspaces safe and recoverable:
//! exclusive cross-process locks, bounded parallel execution, retry with
//! exponential backoff, transactional step pipelines with reverse-order
//! rollback, and a TTL cache for workspace metadata.
//!
//! # Architecture
//!
//! - [`engine`] - Context, parallel executor, retry executor, operation pipeline
//! - [`core`] - Domain types, configuration, paths, locking, metadata cache
//! - [`git`] - `GitOperations` trait, command-line and mock implementations
//! - [`storage`] - `WorkspaceStorage` trait, file and in-memory stores
//! - [`workspace`] - `WorkspaceService`, which composes everything above
//! - [`logging`] - Tracing subscriber setup
//!
//! # Correctness Invariants
//!
//! 1. At most one process mutates a given workspace at a time
//! 2. Parallel batches never exceed their worker limit and keep input order
//! 3. A failed operation undoes its completed steps in reverse order
//! 4. Rollback failures never mask the error that caused the rollback
//! 5. Every wait (lock polling, retry backoff, tasks) observes cancellation

pub mod core;
pub mod engine;
pub mod git;
pub mod logging;
pub mod storage;
pub mod workspace;

pub use engine::context::{Context, Interrupt};
pub use workspace::{WorkspaceError, WorkspaceService};
