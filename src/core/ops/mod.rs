//! core::ops
//!
//! Workspace and canonical clone locking.
//!
//! # Modules
//!
//! - [`lock`] - Exclusive cross-process locks per workspace and per
//!   canonical clone
//!
//! # Architecture
//!
//! Every mutating workspace operation:
//! 1. Acquires the workspace lock (waiting up to the configured timeout)
//! 2. Runs its steps through an `OperationPipeline`
//! 3. Invalidates the cached metadata for the workspace
//! 4. Releases the lock on drop, whatever the outcome
//!
//! Steps that touch a canonical clone shared with other workspaces also
//! hold that clone's lock for the duration of the change.
//!
//! # Example
//!
//! ```ignore
//! use grovework::core::ops::LockManager;
//!
//! let lock = locks.acquire(&ctx, &id, timeout).await?;
//! pipeline.execute(&ctx).await?;
//! cache.invalidate(&id);
//! // lock released when dropped
//! ```

pub mod lock;

pub use lock::{LockError, LockGuard, LockManager, LockTarget};
