//! storage::traits
//!
//! Workspace metadata storage trait definition.
//!
//! # Design
//!
//! Storage is keyed by [`WorkspaceId`] and holds one [`WorkspaceRecord`] per
//! workspace. Every method takes a [`Context`]; implementations check it
//! before touching storage and, for `list`, between entries.
//!
//! `close` and `rename` are provided in terms of `load` and `save`, so an
//! implementation only has to get the five primitives right.

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::core::types::{directory_name_for, WorkspaceId, WorkspaceRecord, WorkspaceState};
use crate::engine::context::{Context, Interrupt};

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No workspace with this ID.
    #[error("workspace not found: {0}")]
    NotFound(WorkspaceId),

    /// A workspace with this ID already exists.
    #[error("workspace already exists: {0}")]
    AlreadyExists(WorkspaceId),

    /// Underlying I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document could not be decoded.
    #[error("corrupt metadata for {id}: {message}")]
    Corrupt { id: String, message: String },

    /// The context stopped the operation.
    #[error("storage operation interrupted: {0}")]
    Interrupted(#[from] Interrupt),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Persistent workspace metadata.
#[async_trait]
pub trait WorkspaceStorage: Send + Sync {
    /// Load one workspace.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no workspace has this ID
    async fn load(&self, ctx: &Context, id: &WorkspaceId) -> Result<WorkspaceRecord, StorageError>;

    /// Insert or replace a workspace.
    async fn save(&self, ctx: &Context, record: &WorkspaceRecord) -> Result<(), StorageError>;

    /// Insert a new workspace.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if a workspace with the same ID is stored
    async fn create(&self, ctx: &Context, record: &WorkspaceRecord) -> Result<(), StorageError>;

    /// List every workspace, ordered by ID.
    async fn list(&self, ctx: &Context) -> Result<Vec<WorkspaceRecord>, StorageError>;

    /// Remove a workspace.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no workspace has this ID
    async fn delete(&self, ctx: &Context, id: &WorkspaceId) -> Result<(), StorageError>;

    /// Mark a workspace closed, returning the updated record.
    async fn close(&self, ctx: &Context, id: &WorkspaceId) -> Result<WorkspaceRecord, StorageError> {
        let mut record = self.load(ctx, id).await?;
        let now = Utc::now();
        record.snapshot.state = WorkspaceState::Closed;
        record.snapshot.closed_at = Some(now);
        record.snapshot.updated_at = now;
        self.save(ctx, &record).await?;
        Ok(record)
    }

    /// Change a workspace's display name and directory, returning the
    /// updated record.
    async fn rename(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
        new_name: &str,
    ) -> Result<WorkspaceRecord, StorageError> {
        let mut record = self.load(ctx, id).await?;
        record.snapshot.name = new_name.to_string();
        record.snapshot.updated_at = Utc::now();
        record.directory = directory_name_for(new_name);
        self.save(ctx, &record).await?;
        Ok(record)
    }
}
