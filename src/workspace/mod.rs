//! workspace
//!
//! Workspace lifecycle operations.
//!
//! # Modules
//!
//! - [`service`]: `WorkspaceService`, which ties the lock manager,
//!   operation pipeline, parallel executor, retrying git and metadata cache
//!   together
//!
//! # Flow
//!
//! Mutating operations take the workspace lock, run their steps through an
//! `OperationPipeline`, then invalidate the cached metadata. Reads never
//! take the lock; they serve from the cache when it is fresh.

pub mod service;

pub use service::{
    CreateRequest, RepoStatusEntry, WorkspaceError, WorkspaceService, WorkspaceStatus,
};
