//! storage
//!
//! Workspace metadata persistence.
//!
//! # Modules
//!
//! - `traits`: Core `WorkspaceStorage` trait and `StorageError`
//! - [`file_store`]: One JSON document per workspace on disk
//! - [`memory`]: In-memory store with failure injection, for tests
//!
//! Storage is always reached through the trait so the workspace service can
//! be driven against either implementation.

pub mod file_store;
pub mod memory;
mod traits;

pub use file_store::FileStorage;
pub use memory::{MemoryStorage, StorageOp};
pub use traits::{StorageError, WorkspaceStorage};
