//! workspace::service
//!
//! Workspace lifecycle orchestration.
//!
//! # Architecture
//!
//! [`WorkspaceService`] is built once from a [`Config`] and [`GrovePaths`]
//! and owns every collaborator an operation needs: the retrying git
//! wrapper, metadata storage, the lock manager, the metadata cache and the
//! parallel executor. Nothing is global, so tests build as many services as
//! they like against temporary roots.
//!
//! Every mutating operation follows the same shape:
//!
//! 1. Acquire the workspace lock (bounded by `lock_timeout` and `ctx`)
//! 2. Validate against freshly loaded metadata
//! 3. Run an [`OperationPipeline`] whose steps each know how to undo
//!    themselves
//! 4. Invalidate the cache entry, then release the lock
//!
//! Multi-repository steps fan out through the [`ParallelExecutor`];
//! network git calls go through [`RetryingGit`].
//!
//! Canonical clones are shared by every workspace, so each per-repository
//! task that clones into, fetches or changes the worktrees of a canonical
//! clone first takes that clone's lock (workspace lock first, then clone
//! lock). Sync and status work inside the worktrees and take no clone lock.
//!
//! # Directory Layout
//!
//! - `<root>/repos/<repo>-<url hash>` - canonical clone, created on first
//!   use by cloning into `.<repo>-<url hash>.partial` and renaming, so the
//!   canonical path only ever holds a complete clone
//! - `<root>/workspaces/<dir>/<repo>` - worktree on the workspace branch

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::cache::WorkspaceCache;
use crate::core::config::Config;
use crate::core::ops::lock::{LockError, LockGuard, LockManager};
use crate::core::paths::GrovePaths;
use crate::core::types::{
    directory_name_for, RepoEntry, TypeError, WorkspaceId, WorkspaceRecord, WorkspaceSnapshot,
    WorkspaceState,
};
use crate::engine::context::Context;
use crate::engine::parallel::{BatchError, BatchReport, ExecutionMode, ParallelExecutor};
use crate::engine::pipeline::{OperationPipeline, PipelineError};
use crate::git::{GitError, GitOperations, RepoStatus, RetryingGit};
use crate::storage::{StorageError, WorkspaceStorage};

/// Errors from workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A step failed (or the context fired) and completed steps were
    /// rolled back.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Per-repository failures of an operation that has nothing to roll
    /// back.
    #[error(transparent)]
    Batch(#[from] BatchError<GitError>),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("workspace already exists: {0}")]
    AlreadyExists(WorkspaceId),

    #[error("workspace '{id}' is {state}, expected {expected}")]
    InvalidState {
        id: WorkspaceId,
        state: WorkspaceState,
        expected: WorkspaceState,
    },

    #[error("repository '{repo}' is already part of workspace '{id}'")]
    DuplicateRepo { id: WorkspaceId, repo: String },

    #[error("repository '{repo}' is not part of workspace '{id}'")]
    RepoNotFound { id: WorkspaceId, repo: String },

    #[error("directory already exists: {}", path.display())]
    DirectoryExists { path: PathBuf },

    #[error("invalid workspace name: {0:?}")]
    InvalidName(String),
}

/// Parameters for [`WorkspaceService::create`].
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub id: WorkspaceId,
    pub name: String,
    /// Branch checked out in every worktree; created when missing.
    pub branch: String,
    pub repos: Vec<RepoEntry>,
}

/// Status of one repository in a workspace.
#[derive(Debug, Clone, Serialize)]
pub struct RepoStatusEntry {
    pub name: String,
    pub path: PathBuf,
    /// `None` when the workspace is closed or the query failed.
    pub status: Option<RepoStatus>,
    pub error: Option<String>,
}

/// Result of [`WorkspaceService::status`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceStatus {
    pub record: WorkspaceRecord,
    pub repos: Vec<RepoStatusEntry>,
}

impl WorkspaceStatus {
    /// Whether every repository reported a clean working tree.
    pub fn is_clean(&self) -> bool {
        self.repos
            .iter()
            .all(|r| r.error.is_none() && r.status.as_ref().map_or(true, RepoStatus::is_clean))
    }
}

/// Where one repository of a workspace lives.
#[derive(Debug, Clone)]
struct WorktreePlan {
    url: String,
    /// Canonical clone directory name; also names the clone's lock.
    clone_key: String,
    canonical: PathBuf,
    staging: PathBuf,
    worktree: PathBuf,
}

/// A worktree relocation performed by `rename`.
#[derive(Debug, Clone)]
struct WorktreeMove {
    clone_key: String,
    canonical: PathBuf,
    from: PathBuf,
    to: PathBuf,
}

/// Failure of one per-repository task.
#[derive(Debug, Error)]
enum RepoTaskError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("{action}: {source}")]
    Io {
        action: String,
        #[source]
        source: io::Error,
    },
}

/// Locks on canonical clones.
#[derive(Debug, Clone)]
struct CloneLocks {
    locks: LockManager,
    /// A live holder refreshes its lock, so waiters give up only after
    /// the stale threshold.
    timeout: Duration,
}

impl CloneLocks {
    async fn lock(&self, ctx: &Context, clone_key: &str) -> Result<LockGuard, LockError> {
        self.locks.acquire_repo(ctx, clone_key, self.timeout).await
    }
}

type Shared<T> = Arc<Mutex<T>>;

fn take_all<T>(shared: &Shared<Vec<T>>) -> Vec<T> {
    std::mem::take(&mut *shared.lock().unwrap_or_else(|p| p.into_inner()))
}

fn push<T>(shared: &Shared<Vec<T>>, item: T) {
    shared.lock().unwrap_or_else(|p| p.into_inner()).push(item);
}

fn take_slot<T>(slot: &Shared<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|p| p.into_inner()).take()
}

/// Workspace lifecycle operations.
pub struct WorkspaceService<G, S> {
    git: Arc<RetryingGit<G>>,
    storage: Arc<S>,
    paths: GrovePaths,
    locks: LockManager,
    cache: Arc<WorkspaceCache>,
    executor: ParallelExecutor,
    lock_timeout: Duration,
}

impl<G, S> Clone for WorkspaceService<G, S> {
    fn clone(&self) -> Self {
        Self {
            git: self.git.clone(),
            storage: self.storage.clone(),
            paths: self.paths.clone(),
            locks: self.locks.clone(),
            cache: self.cache.clone(),
            executor: self.executor.clone(),
            lock_timeout: self.lock_timeout,
        }
    }
}

impl<G, S> WorkspaceService<G, S>
where
    G: GitOperations + 'static,
    S: WorkspaceStorage + 'static,
{
    /// Build a service; network calls on `git` are wrapped with the
    /// configured retry policy.
    pub fn new(git: G, storage: S, paths: GrovePaths, config: &Config) -> Self {
        Self {
            git: Arc::new(RetryingGit::new(git, config.retry().clone())),
            storage: Arc::new(storage),
            locks: LockManager::new(paths.locks_dir(), config.lock_stale_threshold()),
            paths,
            cache: Arc::new(WorkspaceCache::new(config.cache_ttl())),
            executor: ParallelExecutor::new(config.parallel_workers()),
            lock_timeout: config.lock_timeout(),
        }
    }

    /// Replace the lock manager (e.g. to change the polling interval).
    pub fn with_lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = locks;
        self
    }

    pub fn paths(&self) -> &GrovePaths {
        &self.paths
    }

    pub fn cache(&self) -> &WorkspaceCache {
        &self.cache
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    // =========================================================================
    // Mutating operations
    // =========================================================================

    /// Create a workspace with a worktree per repository.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if the ID is taken
    /// - `DirectoryExists` if the derived directory is already on disk
    /// - `Pipeline` if a step failed; everything done so far is undone
    pub async fn create(
        &self,
        ctx: &Context,
        request: CreateRequest,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let id = request.id.clone();
        let lock = self.lock(ctx, &id).await?;
        let result = self.create_locked(ctx, request).await;
        self.finish(&id, lock, result)
    }

    async fn create_locked(
        &self,
        ctx: &Context,
        request: CreateRequest,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let CreateRequest {
            id,
            name,
            branch,
            repos,
        } = request;
        if name.trim().is_empty() {
            return Err(WorkspaceError::InvalidName(name));
        }
        check_unique_repos(&id, &repos)?;

        match self.storage.load(ctx, &id).await {
            Ok(_) => return Err(WorkspaceError::AlreadyExists(id)),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let directory = directory_name_for(&name);
        let dir = self.paths.workspace_dir(&directory);
        if path_exists(&dir).await {
            return Err(WorkspaceError::DirectoryExists { path: dir });
        }

        let mut snapshot = WorkspaceSnapshot::new(id.clone(), name, branch.clone());
        snapshot.repos = repos;
        let record = WorkspaceRecord::new(snapshot, directory);

        let mut pipeline = OperationPipeline::new("create");
        add_create_directory(&mut pipeline, dir);
        {
            let storage = self.storage.clone();
            let rollback_storage = self.storage.clone();
            let saved = record.clone();
            let saved_id = id.clone();
            pipeline.add_step(
                "save metadata",
                move |ctx| async move {
                    storage
                        .create(&ctx, &saved)
                        .await
                        .map_err(anyhow::Error::from)
                },
                move |ctx| async move {
                    match rollback_storage.delete(&ctx, &saved_id).await {
                        Ok(()) | Err(StorageError::NotFound(_)) => anyhow::Ok(()),
                        Err(e) => Err(e.into()),
                    }
                },
            );
        }
        self.add_create_worktrees(&mut pipeline, self.plans(&record), branch);

        pipeline.execute(ctx).await?;
        info!(
            workspace = %id,
            repos = record.snapshot.repos.len(),
            "workspace created"
        );
        Ok(record)
    }

    /// Close a workspace: remove its worktrees and directory, keep its
    /// metadata so it can be restored.
    ///
    /// Worktrees that are already gone are skipped, so a close that failed
    /// part way can simply be retried.
    pub async fn close(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let lock = self.lock(ctx, id).await?;
        let result = self.close_locked(ctx, id).await;
        self.finish(id, lock, result)
    }

    async fn close_locked(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let previous = self.storage.load(ctx, id).await?;
        expect_state(&previous, WorkspaceState::Active)?;
        let plans = self.plans(&previous);
        let dir = self.paths.workspace_dir(&previous.directory);
        let closed: Shared<Option<WorkspaceRecord>> = Arc::default();

        let mut pipeline = OperationPipeline::new("close");
        {
            let storage = self.storage.clone();
            let rollback_storage = self.storage.clone();
            let close_id = id.clone();
            let slot = closed.clone();
            pipeline.add_step(
                "mark closed",
                move |ctx| async move {
                    let record = storage.close(&ctx, &close_id).await?;
                    *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(record);
                    anyhow::Ok(())
                },
                move |ctx| async move {
                    rollback_storage
                        .save(&ctx, &previous)
                        .await
                        .map_err(anyhow::Error::from)
                },
            );
        }
        {
            let git = self.git.clone();
            let locks = self.clone_locks();
            let executor = self.executor.clone();
            pipeline.add_irreversible_step("remove worktrees", move |ctx| {
                remove_existing_worktrees(git, locks, executor, ctx, plans)
            });
        }
        pipeline.add_irreversible_step("remove directory", move |_ctx| async move {
            remove_dir_all_if_exists(&dir).await
        });

        pipeline.execute(ctx).await?;
        let record = match take_slot(&closed) {
            Some(record) => record,
            None => self.storage.load(ctx, id).await?,
        };
        info!(workspace = %id, "workspace closed");
        Ok(record)
    }

    /// Reopen a closed workspace and recreate its worktrees.
    pub async fn restore(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let lock = self.lock(ctx, id).await?;
        let result = self.restore_locked(ctx, id).await;
        self.finish(id, lock, result)
    }

    async fn restore_locked(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let previous = self.storage.load(ctx, id).await?;
        expect_state(&previous, WorkspaceState::Closed)?;
        let dir = self.paths.workspace_dir(&previous.directory);
        if path_exists(&dir).await {
            return Err(WorkspaceError::DirectoryExists { path: dir });
        }

        let mut reopened = previous.clone();
        reopened.snapshot.state = WorkspaceState::Active;
        reopened.snapshot.closed_at = None;
        reopened.snapshot.updated_at = Utc::now();

        let mut pipeline = OperationPipeline::new("restore");
        add_create_directory(&mut pipeline, dir);
        self.add_create_worktrees(
            &mut pipeline,
            self.plans(&previous),
            previous.snapshot.branch.clone(),
        );
        self.add_save_step(&mut pipeline, "mark active", reopened.clone(), previous);

        pipeline.execute(ctx).await?;
        info!(workspace = %id, "workspace restored");
        Ok(reopened)
    }

    /// Change a workspace's name and, with it, its directory.
    ///
    /// Worktrees of an active workspace are moved one by one with
    /// `git worktree move` so their links to the canonical clones stay
    /// valid. A closed workspace only has its metadata updated.
    pub async fn rename(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
        new_name: &str,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let lock = self.lock(ctx, id).await?;
        let result = self.rename_locked(ctx, id, new_name).await;
        self.finish(id, lock, result)
    }

    async fn rename_locked(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
        new_name: &str,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(WorkspaceError::InvalidName(new_name.to_string()));
        }

        let previous = self.storage.load(ctx, id).await?;
        let new_directory = directory_name_for(new_name);
        let relocate = !previous.snapshot.is_closed() && new_directory != previous.directory;
        let old_dir = self.paths.workspace_dir(&previous.directory);
        let new_dir = self.paths.workspace_dir(&new_directory);
        if relocate && path_exists(&new_dir).await {
            return Err(WorkspaceError::DirectoryExists { path: new_dir });
        }

        let mut pipeline = OperationPipeline::new("rename");
        if relocate {
            let created = new_dir.clone();
            let removed = new_dir.clone();
            pipeline.add_step(
                "create directory",
                move |_ctx| async move {
                    tokio::fs::create_dir(&created)
                        .await
                        .with_context(|| format!("creating {}", created.display()))
                },
                // Never recursive: worktrees must be moved back, not deleted.
                move |_ctx| async move {
                    match tokio::fs::remove_dir(&removed).await {
                        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(anyhow::Error::new(e)
                            .context(format!("removing {}", removed.display()))),
                        _ => Ok(()),
                    }
                },
            );

            let moves: Vec<WorktreeMove> = previous
                .snapshot
                .repos
                .iter()
                .map(|repo| WorktreeMove {
                    clone_key: repo.clone_dir_name(),
                    canonical: self.paths.canonical_repo_path(repo),
                    from: self.paths.worktree_path(&previous.directory, &repo.name),
                    to: self.paths.worktree_path(&new_directory, &repo.name),
                })
                .collect();
            let moved: Shared<Vec<WorktreeMove>> = Arc::default();
            let git = self.git.clone();
            let rollback_git = self.git.clone();
            let locks = self.clone_locks();
            let rollback_locks = self.clone_locks();
            let executor = self.executor.clone();
            let done = moved.clone();
            pipeline.add_step(
                "move worktrees",
                move |ctx| move_worktrees(git, locks, executor, ctx, moves, done),
                move |ctx| async move {
                    move_back(&*rollback_git, &rollback_locks, &ctx, take_all(&moved)).await
                },
            );
        }

        {
            let storage = self.storage.clone();
            let rollback_storage = self.storage.clone();
            let rename_id = id.clone();
            let name = new_name.to_string();
            let previous = previous.clone();
            pipeline.add_step(
                "update metadata",
                move |ctx| async move {
                    storage
                        .rename(&ctx, &rename_id, &name)
                        .await
                        .map(|_| ())
                        .map_err(anyhow::Error::from)
                },
                move |ctx| async move {
                    rollback_storage
                        .save(&ctx, &previous)
                        .await
                        .map_err(anyhow::Error::from)
                },
            );
        }

        if relocate {
            pipeline.add_irreversible_step("remove old directory", move |_ctx| async move {
                // Leftover files only cost disk space; the rename stands.
                if let Err(e) = tokio::fs::remove_dir(&old_dir).await {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(dir = %old_dir.display(), error = %e, "old workspace directory left behind");
                    }
                }
                anyhow::Ok(())
            });
        }

        pipeline.execute(ctx).await?;

        let mut record = previous;
        record.snapshot.name = new_name.to_string();
        record.directory = new_directory;
        info!(workspace = %id, name = %new_name, "workspace renamed");
        Ok(record)
    }

    /// Add a repository to a workspace, creating its worktree when the
    /// workspace is active.
    pub async fn add_repo(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
        repo: RepoEntry,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let lock = self.lock(ctx, id).await?;
        let result = self.add_repo_locked(ctx, id, repo).await;
        self.finish(id, lock, result)
    }

    async fn add_repo_locked(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
        repo: RepoEntry,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let previous = self.storage.load(ctx, id).await?;
        if previous.snapshot.repo(&repo.name).is_some() {
            return Err(WorkspaceError::DuplicateRepo {
                id: id.clone(),
                repo: repo.name,
            });
        }

        let mut updated = previous.clone();
        updated.snapshot.repos.push(repo.clone());
        updated.snapshot.updated_at = Utc::now();

        let mut pipeline = OperationPipeline::new("add-repo");
        if !previous.snapshot.is_closed() {
            let plan = self.plan(&previous.directory, &repo);
            self.add_create_worktrees(&mut pipeline, vec![plan], previous.snapshot.branch.clone());
        }
        self.add_save_step(&mut pipeline, "save metadata", updated.clone(), previous);

        pipeline.execute(ctx).await?;
        info!(workspace = %id, repo = %repo.name, "repository added");
        Ok(updated)
    }

    /// Remove a repository from a workspace along with its worktree.
    pub async fn remove_repo(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
        name: &str,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let lock = self.lock(ctx, id).await?;
        let result = self.remove_repo_locked(ctx, id, name).await;
        self.finish(id, lock, result)
    }

    async fn remove_repo_locked(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
        name: &str,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let previous = self.storage.load(ctx, id).await?;
        let Some(repo) = previous.snapshot.repo(name).cloned() else {
            return Err(WorkspaceError::RepoNotFound {
                id: id.clone(),
                repo: name.to_string(),
            });
        };

        let mut updated = previous.clone();
        updated.snapshot.repos.retain(|r| r.name != name);
        updated.snapshot.updated_at = Utc::now();
        let active = !previous.snapshot.is_closed();
        let plan = self.plan(&previous.directory, &repo);

        let mut pipeline = OperationPipeline::new("remove-repo");
        self.add_save_step(&mut pipeline, "save metadata", updated.clone(), previous);
        if active {
            let git = self.git.clone();
            let locks = self.clone_locks();
            pipeline.add_irreversible_step("remove worktree", move |ctx| async move {
                if path_exists(&plan.worktree).await {
                    remove_worktree(&*git, &locks, &ctx, &plan).await?;
                }
                anyhow::Ok(())
            });
        }

        pipeline.execute(ctx).await?;
        info!(workspace = %id, repo = %name, "repository removed");
        Ok(updated)
    }

    /// Fetch and fast-forward every repository of an active workspace.
    ///
    /// Every repository is attempted; failures come back together as
    /// [`BatchError::Partial`].
    pub async fn sync(&self, ctx: &Context, id: &WorkspaceId) -> Result<(), WorkspaceError> {
        let lock = self.lock(ctx, id).await?;
        let result = self.sync_locked(ctx, id).await;
        self.finish(id, lock, result)
    }

    async fn sync_locked(&self, ctx: &Context, id: &WorkspaceId) -> Result<(), WorkspaceError> {
        let record = self.storage.load(ctx, id).await?;
        expect_state(&record, WorkspaceState::Active)?;

        let tasks: Vec<_> = self
            .plans(&record)
            .into_iter()
            .map(|plan| {
                let git = self.git.clone();
                move |ctx: Context| async move {
                    git.fetch(&ctx, &plan.worktree).await?;
                    git.pull(&ctx, &plan.worktree).await
                }
            })
            .collect();
        self.executor
            .execute(ctx, tasks, ExecutionMode::ContinueOnError)
            .await
            .into_result()?;

        info!(workspace = %id, repos = record.snapshot.repos.len(), "workspace synced");
        Ok(())
    }

    // =========================================================================
    // Read operations (no lock)
    // =========================================================================

    /// List every workspace, refreshing the cache along the way.
    pub async fn list(&self, ctx: &Context) -> Result<Vec<WorkspaceRecord>, WorkspaceError> {
        let records = self.storage.list(ctx).await?;
        for record in &records {
            self.cache
                .set(&record.snapshot.id, record.snapshot.clone(), &record.directory);
        }
        Ok(records)
    }

    /// Get one workspace, from the cache when fresh.
    pub async fn get(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        if let Some(record) = self.cache.get_record(id) {
            debug!(workspace = %id, "cache hit");
            return Ok(record);
        }
        let record = self.storage.load(ctx, id).await?;
        self.cache
            .set(id, record.snapshot.clone(), &record.directory);
        Ok(record)
    }

    /// Report the status of every repository in a workspace.
    ///
    /// Per-repository failures are reported in the entries; only an
    /// interrupted batch fails the call.
    pub async fn status(
        &self,
        ctx: &Context,
        id: &WorkspaceId,
    ) -> Result<WorkspaceStatus, WorkspaceError> {
        let record = self.get(ctx, id).await?;
        let plans = self.plans(&record);
        let names = record.snapshot.repos.iter().map(|r| r.name.clone());

        if record.snapshot.is_closed() {
            let repos = names
                .zip(plans)
                .map(|(name, plan)| RepoStatusEntry {
                    name,
                    path: plan.worktree,
                    status: None,
                    error: None,
                })
                .collect();
            return Ok(WorkspaceStatus { record, repos });
        }

        let tasks: Vec<_> = plans
            .iter()
            .map(|plan| {
                let git = self.git.clone();
                let worktree = plan.worktree.clone();
                move |ctx: Context| async move { git.status(&ctx, &worktree).await }
            })
            .collect();
        let BatchReport { results, error } = self
            .executor
            .execute(ctx, tasks, ExecutionMode::ContinueOnError)
            .await;

        let mut errors: HashMap<usize, String> = HashMap::new();
        match error {
            Some(BatchError::Partial(partial)) => {
                errors.extend(partial.failures.into_iter().map(|(i, e)| (i, e.to_string())));
            }
            Some(other) => return Err(other.into()),
            None => {}
        }

        let repos = names
            .zip(plans)
            .zip(results)
            .enumerate()
            .map(|(index, ((name, plan), status))| RepoStatusEntry {
                name,
                path: plan.worktree,
                status,
                error: errors.remove(&index),
            })
            .collect();
        Ok(WorkspaceStatus { record, repos })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn lock(&self, ctx: &Context, id: &WorkspaceId) -> Result<LockGuard, WorkspaceError> {
        Ok(self.locks.acquire(ctx, id, self.lock_timeout).await?)
    }

    /// Invalidate before the lock is released so no reader can cache a
    /// snapshot from before the mutation after it completes.
    fn finish<T>(
        &self,
        id: &WorkspaceId,
        lock: LockGuard,
        result: Result<T, WorkspaceError>,
    ) -> Result<T, WorkspaceError> {
        self.cache.invalidate(id);
        drop(lock);
        result
    }

    fn clone_locks(&self) -> CloneLocks {
        CloneLocks {
            locks: self.locks.clone(),
            timeout: self.locks.stale_threshold(),
        }
    }

    fn plan(&self, directory: &str, repo: &RepoEntry) -> WorktreePlan {
        WorktreePlan {
            url: repo.url.clone(),
            clone_key: repo.clone_dir_name(),
            canonical: self.paths.canonical_repo_path(repo),
            staging: self.paths.clone_staging_path(repo),
            worktree: self.paths.worktree_path(directory, &repo.name),
        }
    }

    fn plans(&self, record: &WorkspaceRecord) -> Vec<WorktreePlan> {
        record
            .snapshot
            .repos
            .iter()
            .map(|repo| self.plan(&record.directory, repo))
            .collect()
    }

    fn add_create_worktrees(
        &self,
        pipeline: &mut OperationPipeline,
        plans: Vec<WorktreePlan>,
        branch: String,
    ) {
        let created: Shared<Vec<WorktreePlan>> = Arc::default();
        let git = self.git.clone();
        let rollback_git = self.git.clone();
        let locks = self.clone_locks();
        let rollback_locks = self.clone_locks();
        let executor = self.executor.clone();
        let done = created.clone();
        pipeline.add_step(
            "create worktrees",
            move |ctx| create_worktrees(git, locks, executor, ctx, plans, branch, done),
            move |ctx| async move {
                remove_worktrees(&*rollback_git, &rollback_locks, &ctx, take_all(&created)).await
            },
        );
    }

    fn add_save_step(
        &self,
        pipeline: &mut OperationPipeline,
        name: &str,
        record: WorkspaceRecord,
        previous: WorkspaceRecord,
    ) {
        let storage = self.storage.clone();
        let rollback_storage = self.storage.clone();
        pipeline.add_step(
            name,
            move |ctx| async move { storage.save(&ctx, &record).await.map_err(anyhow::Error::from) },
            move |ctx| async move {
                rollback_storage
                    .save(&ctx, &previous)
                    .await
                    .map_err(anyhow::Error::from)
            },
        );
    }
}

fn check_unique_repos(id: &WorkspaceId, repos: &[RepoEntry]) -> Result<(), WorkspaceError> {
    let mut seen = HashSet::new();
    for repo in repos {
        if !seen.insert(repo.name.as_str()) {
            return Err(WorkspaceError::DuplicateRepo {
                id: id.clone(),
                repo: repo.name.clone(),
            });
        }
    }
    Ok(())
}

fn expect_state(record: &WorkspaceRecord, expected: WorkspaceState) -> Result<(), WorkspaceError> {
    if record.snapshot.state != expected {
        return Err(WorkspaceError::InvalidState {
            id: record.snapshot.id.clone(),
            state: record.snapshot.state,
            expected,
        });
    }
    Ok(())
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn remove_tree(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn remove_dir_all_if_exists(dir: &Path) -> anyhow::Result<()> {
    remove_tree(dir)
        .await
        .with_context(|| format!("removing {}", dir.display()))
}

fn add_create_directory(pipeline: &mut OperationPipeline, dir: PathBuf) {
    let removed = dir.clone();
    pipeline.add_step(
        "create directory",
        move |_ctx| async move {
            if let Some(parent) = dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::create_dir(&dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))
        },
        move |_ctx| async move { remove_dir_all_if_exists(&removed).await },
    );
}

/// Make sure the canonical clone exists. The caller holds the clone lock.
async fn ensure_clone<G>(git: &G, ctx: &Context, plan: &WorktreePlan) -> Result<(), RepoTaskError>
where
    G: GitOperations + ?Sized,
{
    if path_exists(&plan.canonical).await {
        return Ok(());
    }

    // Whatever is here was left by an interrupted clone.
    remove_tree(&plan.staging)
        .await
        .map_err(|source| RepoTaskError::Io {
            action: format!("clearing {}", plan.staging.display()),
            source,
        })?;

    debug!(repo = %plan.canonical.display(), "cloning canonical repository");
    if let Err(e) = git.clone_repo(ctx, &plan.url, &plan.staging).await {
        if let Err(cleanup) = remove_tree(&plan.staging).await {
            warn!(dir = %plan.staging.display(), error = %cleanup, "partial clone left behind");
        }
        return Err(e.into());
    }
    tokio::fs::rename(&plan.staging, &plan.canonical)
        .await
        .map_err(|source| RepoTaskError::Io {
            action: format!("moving clone to {}", plan.canonical.display()),
            source,
        })
}

/// Clone (if needed), fetch and add a worktree for every plan.
///
/// On failure the worktrees this call created are removed before the error
/// is returned.
async fn create_worktrees<G>(
    git: Arc<RetryingGit<G>>,
    locks: CloneLocks,
    executor: ParallelExecutor,
    ctx: Context,
    plans: Vec<WorktreePlan>,
    branch: String,
    created: Shared<Vec<WorktreePlan>>,
) -> anyhow::Result<()>
where
    G: GitOperations + 'static,
{
    let tasks: Vec<_> = plans
        .into_iter()
        .map(|plan| {
            let git = git.clone();
            let locks = locks.clone();
            let branch = branch.clone();
            let created = created.clone();
            move |ctx: Context| async move {
                let _clone = locks.lock(&ctx, &plan.clone_key).await?;
                ensure_clone(&*git, &ctx, &plan).await?;
                git.fetch(&ctx, &plan.canonical).await?;
                git.create_worktree(&ctx, &plan.canonical, &plan.worktree, &branch)
                    .await?;
                push(&created, plan);
                Ok::<(), RepoTaskError>(())
            }
        })
        .collect();

    let report = executor
        .execute(&ctx, tasks, ExecutionMode::FailFast)
        .await;
    if let Some(err) = report.error {
        let partial = take_all(&created);
        if let Err(cleanup) = remove_worktrees(&*git, &locks, &Context::background(), partial).await
        {
            warn!(error = %cleanup, "could not remove every partially created worktree");
        }
        return Err(err.into());
    }
    Ok(())
}

async fn remove_worktree<G>(
    git: &G,
    locks: &CloneLocks,
    ctx: &Context,
    plan: &WorktreePlan,
) -> Result<(), RepoTaskError>
where
    G: GitOperations + ?Sized,
{
    let _clone = locks.lock(ctx, &plan.clone_key).await?;
    git.remove_worktree(ctx, &plan.canonical, &plan.worktree)
        .await?;
    Ok(())
}

/// Remove worktrees in reverse creation order, attempting all of them.
async fn remove_worktrees<G>(
    git: &G,
    locks: &CloneLocks,
    ctx: &Context,
    plans: Vec<WorktreePlan>,
) -> anyhow::Result<()>
where
    G: GitOperations + ?Sized,
{
    let mut first_error = None;
    for plan in plans.into_iter().rev() {
        if let Err(e) = remove_worktree(git, locks, ctx, &plan).await {
            warn!(worktree = %plan.worktree.display(), error = %e, "failed to remove worktree");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Remove every worktree that still exists, continuing past failures.
async fn remove_existing_worktrees<G>(
    git: Arc<RetryingGit<G>>,
    locks: CloneLocks,
    executor: ParallelExecutor,
    ctx: Context,
    plans: Vec<WorktreePlan>,
) -> anyhow::Result<()>
where
    G: GitOperations + 'static,
{
    let tasks: Vec<_> = plans
        .into_iter()
        .map(|plan| {
            let git = git.clone();
            let locks = locks.clone();
            move |ctx: Context| async move {
                if !path_exists(&plan.worktree).await {
                    debug!(worktree = %plan.worktree.display(), "worktree already gone");
                    return Ok(());
                }
                remove_worktree(&*git, &locks, &ctx, &plan).await
            }
        })
        .collect();
    executor
        .execute(&ctx, tasks, ExecutionMode::ContinueOnError)
        .await
        .into_result()?;
    Ok(())
}

async fn move_worktree<G>(
    git: &G,
    locks: &CloneLocks,
    ctx: &Context,
    mv: &WorktreeMove,
    from: &Path,
    to: &Path,
) -> Result<(), RepoTaskError>
where
    G: GitOperations + ?Sized,
{
    let _clone = locks.lock(ctx, &mv.clone_key).await?;
    git.move_worktree(ctx, &mv.canonical, from, to).await?;
    Ok(())
}

/// Move worktrees to their new location.
///
/// On failure the moves this call made are reverted before the error is
/// returned.
async fn move_worktrees<G>(
    git: Arc<RetryingGit<G>>,
    locks: CloneLocks,
    executor: ParallelExecutor,
    ctx: Context,
    moves: Vec<WorktreeMove>,
    moved: Shared<Vec<WorktreeMove>>,
) -> anyhow::Result<()>
where
    G: GitOperations + 'static,
{
    let tasks: Vec<_> = moves
        .into_iter()
        .map(|mv| {
            let git = git.clone();
            let locks = locks.clone();
            let moved = moved.clone();
            move |ctx: Context| async move {
                if !path_exists(&mv.from).await {
                    debug!(worktree = %mv.from.display(), "worktree missing, not moved");
                    return Ok(());
                }
                move_worktree(&*git, &locks, &ctx, &mv, &mv.from, &mv.to).await?;
                push(&moved, mv);
                Ok::<(), RepoTaskError>(())
            }
        })
        .collect();

    let report = executor
        .execute(&ctx, tasks, ExecutionMode::FailFast)
        .await;
    if let Some(err) = report.error {
        let done = take_all(&moved);
        if let Err(revert) = move_back(&*git, &locks, &Context::background(), done).await {
            warn!(error = %revert, "could not move every worktree back");
        }
        return Err(err.into());
    }
    Ok(())
}

async fn move_back<G>(
    git: &G,
    locks: &CloneLocks,
    ctx: &Context,
    moves: Vec<WorktreeMove>,
) -> anyhow::Result<()>
where
    G: GitOperations + ?Sized,
{
    let mut first_error = None;
    for mv in moves.into_iter().rev() {
        if let Err(e) = move_worktree(git, locks, ctx, &mv, &mv.to, &mv.from).await {
            warn!(worktree = %mv.to.display(), error = %e, "failed to move worktree back");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
