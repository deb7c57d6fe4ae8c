//! storage::file_store
//!
//! JSON-file workspace storage.
//!
//! # Layout
//!
//! One document per workspace at `<metadata_dir>/<sanitized id>.json`
//! (see [`WorkspaceId::sanitized`]). All writes are atomic: the document
//! is written to a temp file in the same directory and renamed over the
//! target, so readers never observe a half-written file.
//!
//! # Example
//!
//! ```ignore
//! use grovework::storage::{FileStorage, WorkspaceStorage};
//!
//! let storage = FileStorage::new(paths.metadata_dir());
//! storage.create(&ctx, &record).await?;
//! let loaded = storage.load(&ctx, &record.snapshot.id).await?;
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::traits::{StorageError, WorkspaceStorage};
use crate::core::types::{WorkspaceId, WorkspaceRecord};
use crate::engine::context::Context;

const EXTENSION: &str = "json";

/// File-based workspace storage.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Store documents under `dir` (created on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for `id`.
    pub fn record_path(&self, id: &WorkspaceId) -> PathBuf {
        self.dir.join(format!("{}.{}", id.sanitized(), EXTENSION))
    }

    async fn read(&self, path: &Path, label: &str) -> Result<Option<WorkspaceRecord>, StorageError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                id: label.to_string(),
                message: e.to_string(),
            })
    }

    async fn write(&self, record: &WorkspaceRecord) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.record_path(&record.snapshot.id);
        let contents = serde_json::to_vec_pretty(record).map_err(|e| StorageError::Corrupt {
            id: record.snapshot.id.to_string(),
            message: e.to_string(),
        })?;

        // Unique temp name so concurrent writers never share a temp file.
        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", record.snapshot.id.sanitized(), Uuid::new_v4()));
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&contents).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %temp_path.display(), error = %cleanup, "temp file left behind");
                }
            }
            return Err(e.into());
        }
        debug!(workspace = %record.snapshot.id, path = %path.display(), "saved workspace metadata");
        Ok(())
    }
}

#[async_trait]
impl WorkspaceStorage for FileStorage {
    async fn load(&self, ctx: &Context, id: &WorkspaceId) -> Result<WorkspaceRecord, StorageError> {
        ctx.check()?;
        self.read(&self.record_path(id), id.as_str())
            .await?
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    async fn save(&self, ctx: &Context, record: &WorkspaceRecord) -> Result<(), StorageError> {
        ctx.check()?;
        self.write(record).await
    }

    async fn create(&self, ctx: &Context, record: &WorkspaceRecord) -> Result<(), StorageError> {
        ctx.check()?;
        let id = &record.snapshot.id;
        if fs::try_exists(self.record_path(id)).await? {
            return Err(StorageError::AlreadyExists(id.clone()));
        }
        self.write(record).await
    }

    async fn list(&self, ctx: &Context) -> Result<Vec<WorkspaceRecord>, StorageError> {
        ctx.check()?;
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            ctx.check()?;
            let path = entry.path();
            let is_document = path.extension().is_some_and(|ext| ext == EXTENSION)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_document {
                continue;
            }
            let label = path.display().to_string();
            match self.read(&path, &label).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(StorageError::Corrupt { id, message }) => {
                    warn!(path = %id, error = %message, "skipping corrupt workspace metadata");
                }
                Err(e) => return Err(e),
            }
        }

        records.sort_by(|a, b| a.snapshot.id.as_str().cmp(b.snapshot.id.as_str()));
        Ok(records)
    }

    async fn delete(&self, ctx: &Context, id: &WorkspaceId) -> Result<(), StorageError> {
        ctx.check()?;
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{WorkspaceSnapshot, WorkspaceState};
    use tempfile::TempDir;

    fn record(id: &str) -> WorkspaceRecord {
        let id = WorkspaceId::new(id).unwrap();
        let snapshot = WorkspaceSnapshot::new(id.clone(), id.as_str(), format!("feature/{}", id));
        let directory = snapshot.directory_name();
        WorkspaceRecord::new(snapshot, directory)
    }

    fn store() -> (TempDir, FileStorage) {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::new(temp.path().join("metadata"));
        (temp, storage)
    }

    #[tokio::test]
    async fn create_then_load() {
        let (_temp, storage) = store();
        let ctx = Context::background();
        let rec = record("PROJ-1");

        storage.create(&ctx, &rec).await.unwrap();
        assert_eq!(storage.load(&ctx, &rec.snapshot.id).await.unwrap(), rec);
        assert!(storage.record_path(&rec.snapshot.id).exists());
    }

    #[tokio::test]
    async fn failed_write_leaves_no_temp_file() {
        let (_temp, storage) = store();
        let ctx = Context::background();
        let rec = record("PROJ-1");

        // A directory squatting on the record path makes the final rename fail.
        let squatter = storage.record_path(&rec.snapshot.id);
        std::fs::create_dir_all(squatter.join("occupied")).unwrap();

        assert!(storage.save(&ctx, &rec).await.is_err());
        let leftovers: Vec<_> = std::fs::read_dir(&storage.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[tokio::test]
    async fn create_rejects_duplicate() {
        let (_temp, storage) = store();
        let ctx = Context::background();
        let rec = record("PROJ-1");
        storage.create(&ctx, &rec).await.unwrap();

        let err = storage.create(&ctx, &rec).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let (_temp, storage) = store();
        let err = storage
            .load(&Context::background(), &WorkspaceId::new("nope").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn ids_with_separators_are_stored_safely() {
        let (_temp, storage) = store();
        let ctx = Context::background();
        let rec = record("feature/login");
        storage.create(&ctx, &rec).await.unwrap();

        let path = storage.record_path(&rec.snapshot.id);
        assert_eq!(path.parent(), Some(storage.dir()));
        assert_eq!(storage.load(&ctx, &rec.snapshot.id).await.unwrap(), rec);
    }

    #[tokio::test]
    async fn close_and_rename_persist() {
        let (_temp, storage) = store();
        let ctx = Context::background();
        let rec = record("w1");
        storage.create(&ctx, &rec).await.unwrap();

        let closed = storage.close(&ctx, &rec.snapshot.id).await.unwrap();
        assert_eq!(closed.snapshot.state, WorkspaceState::Closed);
        assert!(closed.snapshot.closed_at.is_some());

        let renamed = storage
            .rename(&ctx, &rec.snapshot.id, "Login Flow")
            .await
            .unwrap();
        assert_eq!(renamed.directory, "Login-Flow");

        let loaded = storage.load(&ctx, &rec.snapshot.id).await.unwrap();
        assert_eq!(loaded.snapshot.name, "Login Flow");
        assert!(loaded.snapshot.is_closed());
    }

    #[tokio::test]
    async fn list_is_sorted_and_skips_corrupt_and_temp_files() {
        let (_temp, storage) = store();
        let ctx = Context::background();
        for id in ["b", "a", "c"] {
            storage.create(&ctx, &record(id)).await.unwrap();
        }
        std::fs::write(storage.dir().join("broken.json"), "{not json").unwrap();
        std::fs::write(storage.dir().join(".a.partial.tmp"), "x").unwrap();
        std::fs::write(storage.dir().join("notes.txt"), "x").unwrap();

        let ids: Vec<_> = storage
            .list(&ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.snapshot.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn list_missing_dir_is_empty() {
        let (_temp, storage) = store();
        assert!(storage.list(&Context::background()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_observes_cancellation() {
        let (_temp, storage) = store();
        let ctx = Context::background();
        storage.create(&ctx, &record("a")).await.unwrap();
        ctx.cancel();

        let err = storage.list(&ctx).await.unwrap_err();
        assert!(matches!(err, StorageError::Interrupted(_)));
    }

    #[tokio::test]
    async fn load_corrupt_document() {
        let (_temp, storage) = store();
        let id = WorkspaceId::new("w1").unwrap();
        std::fs::create_dir_all(storage.dir()).unwrap();
        std::fs::write(storage.record_path(&id), "[]").unwrap();

        let err = storage.load(&Context::background(), &id).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let (_temp, storage) = store();
        let ctx = Context::background();
        let rec = record("w1");
        storage.create(&ctx, &rec).await.unwrap();
        storage.delete(&ctx, &rec.snapshot.id).await.unwrap();

        assert!(storage.load(&ctx, &rec.snapshot.id).await.unwrap_err().is_not_found());
        assert!(storage
            .delete(&ctx, &rec.snapshot.id)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
