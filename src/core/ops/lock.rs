//! core::ops::lock
//!
//! Cross-process exclusive locks for workspaces and canonical clones.
//!
//! # Architecture
//!
//! Separate Grove invocations share no memory, so mutual exclusion goes
//! through the filesystem. Each workspace has one lock file under the
//! dedicated lock directory, named from its sanitized ID; each canonical
//! clone has one under `repos/`, named after its clone directory. The
//! protocol is existence plus modification time. The file body carries the
//! holder's pid and a random token that identifies the guard owning it.
//!
//! # Storage
//!
//! - `<root>/locks/<sanitized-id>.lock`
//! - `<root>/locks/repos/<clone-dir>.lock`
//! - `<root>/locks/**/<name>.lock.reclaim` - present only while a stale lock
//!   is being replaced
//!
//! # Algorithm
//!
//! 1. Atomically create the lock file (`create_new`). Success = lock held.
//! 2. If it exists and is older than the stale threshold, take the reclaim
//!    guard (`create_new` on `<name>.lock.reclaim`), check the age again
//!    under the guard, delete the stale file and create a fresh one. A
//!    reclaimer that finds the guard taken backs off to (3).
//! 3. Otherwise poll every [`LOCK_POLL_INTERVAL`] until the timeout
//!    elapses, then fail with [`LockError::Locked`].
//!
//! Guards returned by [`LockManager::acquire`] touch their lock file every
//! third of the stale threshold, so a long operation is never mistaken for
//! a crashed one. Releasing a guard only deletes the file if its token is
//! still the one written at creation.
//!
//! # Invariants
//!
//! - At most one non-stale lock per target exists at any time
//! - The lock directory is only ever mutated by atomic create or delete
//! - A guard never deletes a lock file it does not own
//! - Lock is automatically released on drop (RAII pattern)
//! - Only mutating operations take the lock; reads never wait on it
//!
//! # Known Limitations
//!
//! A reclaim guard abandoned by a crash is removed after
//! [`RECLAIM_GUARD_STALE`]; two processes clearing the same abandoned guard
//! at that instant can both proceed to the re-check.
//!
//! # Example
//!
//! ```ignore
//! use grovework::core::ops::lock::LockManager;
//! use std::time::Duration;
//!
//! let locks = LockManager::new(paths.locks_dir(), Duration::from_secs(300));
//! let lock = locks.acquire(&ctx, &id, Duration::from_secs(30)).await?;
//!
//! // Mutate the workspace while holding the lock
//! // ...
//!
//! // Lock automatically released when dropped
//! drop(lock);
//! ```

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use filetime::FileTime;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::types::WorkspaceId;
use crate::engine::context::{Context, Interrupt};

/// Default timeout for lock acquisition (30 seconds).
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default age after which a lock file is presumed abandoned (5 minutes).
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(300);

/// Polling interval when waiting for a lock (100ms).
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Age after which a reclaim guard is presumed abandoned.
pub const RECLAIM_GUARD_STALE: Duration = Duration::from_secs(30);

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// What a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockTarget {
    Workspace(WorkspaceId),
    /// A canonical clone, by its directory name under `repos/`.
    Repo(String),
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Workspace(id) => write!(f, "workspace '{}'", id),
            LockTarget::Repo(key) => write!(f, "repository '{}'", key),
        }
    }
}

/// Errors from locking operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The timeout elapsed while another process held the lock.
    #[error("{target} is locked by another process (waited {}ms)", waited.as_millis())]
    Locked { target: LockTarget, waited: Duration },

    /// The caller's context stopped while waiting.
    #[error("waiting for lock on {target}: {reason}")]
    Interrupted {
        target: LockTarget,
        reason: Interrupt,
    },

    /// Failed to create the lock directory or lock file.
    #[error("lock i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Hands out [`LockGuard`]s backed by files in one lock directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    lock_dir: PathBuf,
    stale_threshold: Duration,
    poll_interval: Duration,
}

impl LockManager {
    /// Create a manager for `lock_dir`. The directory is created lazily.
    pub fn new(lock_dir: impl Into<PathBuf>, stale_threshold: Duration) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            stale_threshold,
            poll_interval: LOCK_POLL_INTERVAL,
        }
    }

    /// Override the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Path of the lock file for a target.
    pub fn lock_path(&self, target: &LockTarget) -> PathBuf {
        match target {
            LockTarget::Workspace(id) => self.lock_dir.join(id.lock_file_name()),
            LockTarget::Repo(key) => self.lock_dir.join("repos").join(format!("{}.lock", key)),
        }
    }

    /// Acquire the lock for `workspace_id`, waiting up to `timeout`.
    ///
    /// Both `timeout` and `ctx` are honored, whichever fires first.
    ///
    /// # Errors
    ///
    /// - [`LockError::Locked`] if the timeout elapses first
    /// - [`LockError::Interrupted`] if `ctx` is cancelled or expires first
    /// - [`LockError::Io`] if the lock directory or file cannot be created
    pub async fn acquire(
        &self,
        ctx: &Context,
        workspace_id: &WorkspaceId,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        self.acquire_target(ctx, LockTarget::Workspace(workspace_id.clone()), timeout)
            .await
    }

    /// Acquire the lock for the canonical clone directory `key`.
    pub async fn acquire_repo(
        &self,
        ctx: &Context,
        key: &str,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        self.acquire_target(ctx, LockTarget::Repo(key.to_string()), timeout)
            .await
    }

    async fn acquire_target(
        &self,
        ctx: &Context,
        target: LockTarget,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let path = self.lock_path(&target);
        self.ensure_lock_dir(&path)?;

        loop {
            if let Err(reason) = ctx.check() {
                return Err(LockError::Interrupted { target, reason });
            }

            if let Some(mut lock) = self.attempt(&target, &path)? {
                debug!(
                    lock = %target,
                    waited_ms = start.elapsed().as_millis() as u64,
                    "acquired lock"
                );
                lock.start_heartbeat(self.heartbeat_interval());
                return Ok(lock);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Locked {
                    target,
                    waited: now - start,
                });
            }

            let wait = self.poll_interval.min(deadline - now);
            if let Err(reason) = ctx.sleep(wait).await {
                return Err(LockError::Interrupted { target, reason });
            }
        }
    }

    /// Make a single attempt to acquire the lock without waiting.
    ///
    /// Returns `Ok(None)` if another holder has a non-stale lock. The guard
    /// does not refresh its file, so it goes stale after the threshold.
    pub fn try_acquire(&self, workspace_id: &WorkspaceId) -> Result<Option<LockGuard>, LockError> {
        let target = LockTarget::Workspace(workspace_id.clone());
        let path = self.lock_path(&target);
        self.ensure_lock_dir(&path)?;
        self.attempt(&target, &path)
    }

    /// Whether a lock file currently exists for `workspace_id`.
    pub fn is_locked(&self, workspace_id: &WorkspaceId) -> bool {
        self.lock_path(&LockTarget::Workspace(workspace_id.clone()))
            .exists()
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.stale_threshold / 3).max(MIN_HEARTBEAT_INTERVAL)
    }

    fn ensure_lock_dir(&self, path: &Path) -> Result<(), LockError> {
        let dir = path.parent().unwrap_or(self.lock_dir.as_path());
        fs::create_dir_all(dir).map_err(|e| LockError::io(dir, e))
    }

    /// One round of the protocol: create, or reclaim-if-stale.
    fn attempt(&self, target: &LockTarget, path: &Path) -> Result<Option<LockGuard>, LockError> {
        if let Some(lock) = create(target, path)? {
            return Ok(Some(lock));
        }

        match file_age(path) {
            Ok(Some(age)) if age > self.stale_threshold => self.reclaim(target, path),
            // Released between our create and our stat.
            Ok(None) => create(target, path),
            Ok(Some(_)) => Ok(None),
            Err(e) => Err(LockError::io(path, e)),
        }
    }

    /// Replace a stale lock file while holding its reclaim guard.
    fn reclaim(&self, target: &LockTarget, path: &Path) -> Result<Option<LockGuard>, LockError> {
        let guard = reclaim_guard_path(path);
        match OpenOptions::new().write(true).create_new(true).open(&guard) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Ok(Some(age)) = file_age(&guard) {
                    if age > RECLAIM_GUARD_STALE {
                        warn!(path = %guard.display(), "removing abandoned reclaim guard");
                        remove_if_present(&guard)?;
                    }
                }
                return Ok(None);
            }
            Err(e) => return Err(LockError::io(&guard, e)),
        }

        let result = self.reclaim_guarded(target, path);
        if let Err(e) = remove_if_present(&guard) {
            warn!(error = %e, "failed to remove reclaim guard");
        }
        result
    }

    fn reclaim_guarded(
        &self,
        target: &LockTarget,
        path: &Path,
    ) -> Result<Option<LockGuard>, LockError> {
        // Another reclaimer may have replaced the file since our stat.
        match file_age(path) {
            Ok(Some(age)) if age > self.stale_threshold => {
                warn!(
                    lock = %target,
                    age_secs = age.as_secs(),
                    path = %path.display(),
                    "reclaiming stale lock"
                );
                remove_if_present(path)?;
            }
            Ok(Some(_)) => return Ok(None),
            Ok(None) => {}
            Err(e) => return Err(LockError::io(path, e)),
        }
        create(target, path)
    }
}

/// Atomic exclusive create. `Ok(None)` if the file already exists.
fn create(target: &LockTarget, path: &Path) -> Result<Option<LockGuard>, LockError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(LockError::io(path, e)),
    };

    let token = Uuid::new_v4();
    let acquired_at = Utc::now();
    if let Err(e) = writeln!(
        file,
        "pid={} acquired_at={} token={}",
        std::process::id(),
        acquired_at.to_rfc3339(),
        token
    ) {
        // Nobody else can own a file we created a moment ago.
        let _ = fs::remove_file(path);
        return Err(LockError::io(path, e));
    }

    Ok(Some(LockGuard {
        target: target.clone(),
        path: path.to_path_buf(),
        token,
        acquired_at,
        held: true,
        heartbeat: None,
    }))
}

fn reclaim_guard_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".reclaim");
    path.with_file_name(name)
}

fn remove_if_present(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LockError::io(path, e)),
    }
}

/// Age of an existing file, `None` if it vanished.
fn file_age(path: &Path) -> io::Result<Option<Duration>> {
    let modified = match fs::metadata(path) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    // A timestamp in the future (clock skew) counts as fresh.
    Ok(Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    ))
}

/// Token recorded in a lock file, `None` if the body has none (e.g. it is
/// still being written).
fn read_token(path: &Path) -> io::Result<Option<Uuid>> {
    let body = fs::read_to_string(path)?;
    Ok(body
        .split_whitespace()
        .find_map(|field| field.strip_prefix("token="))
        .and_then(|raw| Uuid::parse_str(raw).ok()))
}

fn owns(path: &Path, token: Uuid) -> bool {
    matches!(read_token(path), Ok(Some(found)) if found == token)
}

/// An exclusive lock on one workspace or canonical clone.
///
/// The lock is automatically released when this guard is dropped (RAII
/// pattern), so every exit path (success, error, cancellation, panic)
/// releases it.
#[derive(Debug)]
pub struct LockGuard {
    target: LockTarget,
    path: PathBuf,
    token: Uuid,
    acquired_at: DateTime<Utc>,
    held: bool,
    /// Cancelled on release to stop the refresh task.
    heartbeat: Option<Context>,
}

impl LockGuard {
    pub fn target(&self) -> &LockTarget {
        &self.target
    }

    /// Get the path to the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Check if this guard still holds the lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Keep the lock file's mtime fresh until release.
    fn start_heartbeat(&mut self, interval: Duration) {
        let beat = Context::background();
        let stop = beat.clone();
        let path = self.path.clone();
        let token = self.token;
        let target = self.target.clone();
        tokio::spawn(async move {
            while beat.sleep(interval).await.is_ok() {
                if !owns(&path, token) {
                    warn!(lock = %target, "lock file no longer ours, heartbeat stopped");
                    break;
                }
                if let Err(e) = filetime::set_file_mtime(&path, FileTime::now()) {
                    warn!(lock = %target, error = %e, "failed to refresh lock file");
                }
            }
        });
        self.heartbeat = Some(stop);
    }

    /// Release the lock.
    ///
    /// Idempotent and infallible for the caller: removal failures are
    /// logged, and a lock file that is gone or now belongs to another
    /// holder (e.g. after a stale reclaim) is left alone.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }

        match read_token(&self.path) {
            Ok(Some(token)) if token == self.token => match fs::remove_file(&self.path) {
                Ok(()) => debug!(lock = %self.target, "released lock"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(lock = %self.target, "lock already gone")
                }
                Err(e) => warn!(
                    lock = %self.target,
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove lock file"
                ),
            },
            Ok(_) => warn!(
                lock = %self.target,
                path = %self.path.display(),
                "lock file was taken over by another holder, leaving it in place"
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(lock = %self.target, "lock already gone")
            }
            Err(e) => warn!(
                lock = %self.target,
                path = %self.path.display(),
                error = %e,
                "failed to read lock file, leaving it in place"
            ),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}
