//! storage::memory
//!
//! In-memory workspace storage for tests.
//!
//! Records live in a `BTreeMap`, so `list` is ordered by ID. Failures can
//! be injected per operation to exercise rollback paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::traits::{StorageError, WorkspaceStorage};
use crate::core::types::{WorkspaceId, WorkspaceRecord};
use crate::engine::context::Context;

/// Storage operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Load,
    Save,
    Create,
    List,
    Delete,
}

/// In-memory storage.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: BTreeMap<String, WorkspaceRecord>,
    /// Remaining injected failures per operation.
    failures: HashMap<StorageOp, usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = WorkspaceRecord>) -> Self {
        let storage = Self::new();
        {
            let mut state = storage.state();
            for record in records {
                state
                    .records
                    .insert(record.snapshot.id.as_str().to_string(), record);
            }
        }
        storage
    }

    fn state(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `times` calls of `op` fail with an I/O error.
    pub fn fail_next(&self, op: StorageOp, times: usize) {
        *self.state().failures.entry(op).or_default() += times;
    }

    /// Snapshot of a stored record (for test verification).
    pub fn get(&self, id: &WorkspaceId) -> Option<WorkspaceRecord> {
        self.state().records.get(id.as_str()).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }

    fn enter(&self, ctx: &Context, op: StorageOp) -> Result<MutexGuard<'_, MemoryInner>, StorageError> {
        ctx.check()?;
        let mut state = self.state();
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Io(std::io::Error::other(format!(
                    "injected {:?} failure",
                    op
                ))));
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl WorkspaceStorage for MemoryStorage {
    async fn load(&self, ctx: &Context, id: &WorkspaceId) -> Result<WorkspaceRecord, StorageError> {
        let state = self.enter(ctx, StorageOp::Load)?;
        state
            .records
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    async fn save(&self, ctx: &Context, record: &WorkspaceRecord) -> Result<(), StorageError> {
        let mut state = self.enter(ctx, StorageOp::Save)?;
        state
            .records
            .insert(record.snapshot.id.as_str().to_string(), record.clone());
        Ok(())
    }

    async fn create(&self, ctx: &Context, record: &WorkspaceRecord) -> Result<(), StorageError> {
        let mut state = self.enter(ctx, StorageOp::Create)?;
        let key = record.snapshot.id.as_str().to_string();
        if state.records.contains_key(&key) {
            return Err(StorageError::AlreadyExists(record.snapshot.id.clone()));
        }
        state.records.insert(key, record.clone());
        Ok(())
    }

    async fn list(&self, ctx: &Context) -> Result<Vec<WorkspaceRecord>, StorageError> {
        let state = self.enter(ctx, StorageOp::List)?;
        Ok(state.records.values().cloned().collect())
    }

    async fn delete(&self, ctx: &Context, id: &WorkspaceId) -> Result<(), StorageError> {
        let mut state = self.enter(ctx, StorageOp::Delete)?;
        state
            .records
            .remove(id.as_str())
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::WorkspaceSnapshot;

    fn record(id: &str) -> WorkspaceRecord {
        let id = WorkspaceId::new(id).unwrap();
        WorkspaceRecord::new(WorkspaceSnapshot::new(id.clone(), id.as_str(), "b"), id.as_str())
    }

    #[tokio::test]
    async fn crud() {
        let storage = MemoryStorage::new();
        let ctx = Context::background();
        let rec = record("w1");

        storage.create(&ctx, &rec).await.unwrap();
        assert!(matches!(
            storage.create(&ctx, &rec).await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(storage.load(&ctx, &rec.snapshot.id).await.unwrap(), rec);

        storage.delete(&ctx, &rec.snapshot.id).await.unwrap();
        assert!(storage.is_empty());
        assert!(storage
            .load(&ctx, &rec.snapshot.id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn list_is_ordered() {
        let storage = MemoryStorage::with_records(vec![record("c"), record("a"), record("b")]);
        let ids: Vec<_> = storage
            .list(&Context::background())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.snapshot.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let storage = MemoryStorage::new();
        let ctx = Context::background();
        storage.fail_next(StorageOp::Save, 1);

        assert!(matches!(
            storage.save(&ctx, &record("w1")).await,
            Err(StorageError::Io(_))
        ));
        storage.save(&ctx, &record("w1")).await.unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_context_is_rejected() {
        let storage = MemoryStorage::new();
        let ctx = Context::background();
        ctx.cancel();
        assert!(matches!(
            storage.list(&ctx).await,
            Err(StorageError::Interrupted(_))
        ));
    }
}
