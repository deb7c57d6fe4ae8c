//! core::cache
//!
//! In-process workspace metadata cache with TTL support.
//!
//! # Design
//!
//! The cache is keyed by [`WorkspaceId`]. Each entry stores the workspace
//! snapshot, its directory name and the insertion timestamp for TTL
//! enforcement.
//!
//! Cache invalidation:
//! - Entries expire after the configured TTL (default 5 minutes)
//! - Every mutating operation calls [`WorkspaceCache::invalidate`] once its
//!   pipeline finishes, committed or rolled back
//! - `prune_expired()` removes stale entries
//! - An optional capacity bound evicts the oldest entry on insert
//!
//! All state sits behind one `Mutex`; callers only ever receive clones, so
//! concurrent `get`/`set`/`invalidate` from a parallel batch cannot observe
//! or corrupt partial state.
//!
//! # Example
//!
//! ```
//! use grovework::core::cache::WorkspaceCache;
//! use grovework::core::types::{WorkspaceId, WorkspaceSnapshot};
//! use std::time::Duration;
//!
//! let cache = WorkspaceCache::new(Duration::from_secs(300));
//! let id = WorkspaceId::new("w1").unwrap();
//! let snap = WorkspaceSnapshot::new(id.clone(), "w1", "feature/w1");
//!
//! cache.set(&id, snap.clone(), "dir");
//! assert_eq!(cache.get(&id), Some((snap, "dir".to_string())));
//!
//! cache.invalidate(&id);
//! assert!(cache.get(&id).is_none());
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::types::{WorkspaceId, WorkspaceRecord, WorkspaceSnapshot};

/// Default time-to-live for cached entries (5 minutes).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// A cached workspace.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub workspace_id: WorkspaceId,
    pub snapshot: WorkspaceSnapshot,
    pub directory_name: String,
    pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Check if this entry has outlived `ttl`.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        let age = Utc::now() - self.inserted_at;
        match age.to_std() {
            Ok(age) => age > ttl,
            // Negative age: inserted "in the future" by clock skew.
            Err(_) => false,
        }
    }
}

/// Thread-safe workspace metadata cache.
#[derive(Debug)]
pub struct WorkspaceCache {
    ttl: Duration,
    capacity: Option<usize>,
    entries: Mutex<HashMap<WorkspaceId, CacheEntry>>,
}

impl Default for WorkspaceCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl WorkspaceCache {
    /// Create an unbounded cache with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            capacity: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Bound the number of entries; the oldest entry is evicted on overflow.
    pub fn with_capacity_limit(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<WorkspaceId, CacheEntry>> {
        // A panic while holding the guard cannot leave a half-written entry
        // (every mutation is a single map operation), so poisoning is ignored.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a cached snapshot and directory name if present and not expired.
    ///
    /// Expired entries are dropped on the way out.
    pub fn get(&self, workspace_id: &WorkspaceId) -> Option<(WorkspaceSnapshot, String)> {
        let mut entries = self.entries();
        match entries.get(workspace_id) {
            Some(entry) if !entry.is_expired(self.ttl) => {
                Some((entry.snapshot.clone(), entry.directory_name.clone()))
            }
            Some(_) => {
                debug!(workspace = %workspace_id, "cache entry expired");
                entries.remove(workspace_id);
                None
            }
            None => None,
        }
    }

    /// Get a cached entry as a [`WorkspaceRecord`].
    pub fn get_record(&self, workspace_id: &WorkspaceId) -> Option<WorkspaceRecord> {
        self.get(workspace_id)
            .map(|(snapshot, directory)| WorkspaceRecord::new(snapshot, directory))
    }

    /// Store a snapshot, replacing any previous entry.
    pub fn set(
        &self,
        workspace_id: &WorkspaceId,
        snapshot: WorkspaceSnapshot,
        directory_name: impl Into<String>,
    ) {
        let mut entries = self.entries();

        if let Some(capacity) = self.capacity {
            if entries.len() >= capacity && !entries.contains_key(workspace_id) {
                let oldest = entries
                    .values()
                    .min_by_key(|e| e.inserted_at)
                    .map(|e| e.workspace_id.clone());
                if let Some(oldest) = oldest {
                    debug!(workspace = %oldest, "evicting oldest cache entry");
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            workspace_id.clone(),
            CacheEntry {
                workspace_id: workspace_id.clone(),
                snapshot,
                directory_name: directory_name.into(),
                inserted_at: Utc::now(),
            },
        );
    }

    /// Remove one entry, forcing the next lookup to reload from storage.
    pub fn invalidate(&self, workspace_id: &WorkspaceId) {
        if self.entries().remove(workspace_id).is_some() {
            debug!(workspace = %workspace_id, "cache entry invalidated");
        }
    }

    /// Remove every entry.
    pub fn invalidate_all(&self) {
        self.entries().clear();
    }

    /// Remove all expired entries from the cache.
    pub fn prune_expired(&self) {
        let ttl = self.ttl;
        self.entries().retain(|_, entry| !entry.is_expired(ttl));
    }

    /// Check if an entry exists (regardless of expiry).
    pub fn contains(&self, workspace_id: &WorkspaceId) -> bool {
        self.entries().contains_key(workspace_id)
    }

    /// Get the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    #[cfg(test)]
    fn backdate(&self, workspace_id: &WorkspaceId, by: chrono::Duration) {
        if let Some(entry) = self.entries().get_mut(workspace_id) {
            entry.inserted_at = entry.inserted_at - by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(s: &str) -> WorkspaceId {
        WorkspaceId::new(s).unwrap()
    }

    fn snapshot(s: &str) -> WorkspaceSnapshot {
        WorkspaceSnapshot::new(id(s), s, format!("feature/{}", s))
    }

    mod cache_entry_tests {
        use super::*;

        fn entry(age: chrono::Duration) -> CacheEntry {
            CacheEntry {
                workspace_id: id("w"),
                snapshot: snapshot("w"),
                directory_name: "w".into(),
                inserted_at: Utc::now() - age,
            }
        }

        #[test]
        fn is_expired_fresh() {
            assert!(!entry(chrono::Duration::zero()).is_expired(DEFAULT_CACHE_TTL));
        }

        #[test]
        fn is_expired_old() {
            assert!(entry(chrono::Duration::minutes(6)).is_expired(DEFAULT_CACHE_TTL));
        }

        #[test]
        fn is_expired_at_boundary() {
            let e = entry(chrono::Duration::minutes(4) + chrono::Duration::seconds(59));
            assert!(!e.is_expired(DEFAULT_CACHE_TTL));
        }

        #[test]
        fn future_timestamp_is_fresh() {
            assert!(!entry(chrono::Duration::minutes(-5)).is_expired(DEFAULT_CACHE_TTL));
        }
    }

    mod workspace_cache_tests {
        use super::*;

        #[test]
        fn new_is_empty() {
            let cache = WorkspaceCache::default();
            assert!(cache.is_empty());
            assert_eq!(cache.len(), 0);
            assert_eq!(cache.ttl(), DEFAULT_CACHE_TTL);
        }

        #[test]
        fn set_and_get() {
            let cache = WorkspaceCache::default();
            let snap = snapshot("w1");
            cache.set(&id("w1"), snap.clone(), "dir");

            assert_eq!(cache.get(&id("w1")), Some((snap, "dir".to_string())));
            assert!(cache.get(&id("w2")).is_none());
        }

        #[test]
        fn set_replaces_entry() {
            let cache = WorkspaceCache::default();
            cache.set(&id("w1"), snapshot("w1"), "old");
            cache.set(&id("w1"), snapshot("w1"), "new");

            assert_eq!(cache.len(), 1);
            assert_eq!(cache.get(&id("w1")).unwrap().1, "new");
        }

        #[test]
        fn callers_get_copies() {
            let cache = WorkspaceCache::default();
            cache.set(&id("w1"), snapshot("w1"), "dir");

            let (mut copy, _) = cache.get(&id("w1")).unwrap();
            copy.name = "mutated".into();
            assert_eq!(cache.get(&id("w1")).unwrap().0.name, "w1");
        }

        #[test]
        fn invalidate_removes_entry() {
            let cache = WorkspaceCache::default();
            cache.set(&id("w1"), snapshot("w1"), "dir");
            cache.invalidate(&id("w1"));

            assert!(cache.get(&id("w1")).is_none());
            assert!(!cache.contains(&id("w1")));
            // Invalidating a missing entry is fine.
            cache.invalidate(&id("w1"));
        }

        #[test]
        fn invalidate_all_clears() {
            let cache = WorkspaceCache::default();
            cache.set(&id("a"), snapshot("a"), "a");
            cache.set(&id("b"), snapshot("b"), "b");
            cache.invalidate_all();
            assert!(cache.is_empty());
        }

        #[test]
        fn expired_entry_is_a_miss_and_dropped() {
            let cache = WorkspaceCache::new(Duration::from_secs(60));
            cache.set(&id("w1"), snapshot("w1"), "dir");
            cache.backdate(&id("w1"), chrono::Duration::seconds(61));

            assert!(cache.contains(&id("w1")));
            assert!(cache.get(&id("w1")).is_none());
            assert!(!cache.contains(&id("w1")));
        }

        #[test]
        fn prune_expired_keeps_fresh() {
            let cache = WorkspaceCache::new(Duration::from_secs(60));
            cache.set(&id("old"), snapshot("old"), "old");
            cache.set(&id("new"), snapshot("new"), "new");
            cache.backdate(&id("old"), chrono::Duration::minutes(5));

            cache.prune_expired();
            assert_eq!(cache.len(), 1);
            assert!(cache.contains(&id("new")));
        }

        #[test]
        fn capacity_limit_evicts_oldest() {
            let cache = WorkspaceCache::default().with_capacity_limit(2);
            cache.set(&id("a"), snapshot("a"), "a");
            cache.set(&id("b"), snapshot("b"), "b");
            cache.backdate(&id("a"), chrono::Duration::seconds(10));
            cache.set(&id("c"), snapshot("c"), "c");

            assert_eq!(cache.len(), 2);
            assert!(!cache.contains(&id("a")));
            assert!(cache.contains(&id("b")));
            assert!(cache.contains(&id("c")));
        }

        #[test]
        fn get_record_wraps_entry() {
            let cache = WorkspaceCache::default();
            cache.set(&id("w1"), snapshot("w1"), "dir");
            let record = cache.get_record(&id("w1")).unwrap();
            assert_eq!(record.directory, "dir");
            assert_eq!(record.snapshot.id, id("w1"));
        }

        #[test]
        fn concurrent_access_is_consistent() {
            let cache = Arc::new(WorkspaceCache::default());
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let cache = cache.clone();
                    std::thread::spawn(move || {
                        for i in 0..200 {
                            let key = id(&format!("w{}", i % 5));
                            match (t + i) % 3 {
                                0 => cache.set(&key, snapshot(key.as_str()), key.as_str()),
                                1 => {
                                    if let Some((snap, dir)) = cache.get(&key) {
                                        assert_eq!(snap.id, key);
                                        assert_eq!(dir, key.as_str());
                                    }
                                }
                                _ => cache.invalidate(&key),
                            }
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().expect("worker thread");
            }
            assert!(cache.len() <= 5);
        }
    }
}
