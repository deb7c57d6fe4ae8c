//! core::types
//!
//! Strong types for core domain concepts.
//!
//! # Types
//!
//! - [`WorkspaceId`] - Validated workspace identifier
//! - [`RepoEntry`] - A repository participating in a workspace
//! - [`WorkspaceSnapshot`] - Persisted workspace metadata
//! - [`WorkspaceRecord`] - A snapshot plus its on-disk directory name
//!
//! # Validation
//!
//! These types enforce validity at construction time. Invalid values
//! cannot be represented, preventing entire classes of bugs.
//!
//! # Examples
//!
//! ```
//! use grovework::core::types::WorkspaceId;
//!
//! let id = WorkspaceId::new("PROJ-1").unwrap();
//! assert_eq!(id.lock_file_name(), "PROJ-1.lock");
//!
//! assert!(WorkspaceId::new("").is_err());
//! assert!(WorkspaceId::new("..").is_err());
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum length of a workspace ID in bytes.
pub const MAX_WORKSPACE_ID_LEN: usize = 128;

/// Errors from type validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid workspace id: {0}")]
    InvalidWorkspaceId(String),

    #[error("invalid repository name: {0}")]
    InvalidRepoName(String),
}

/// A validated workspace identifier.
///
/// Workspace IDs are free-form (ticket keys such as `PROJ-1` are typical)
/// but must be usable as the stem of a file name once sanitized:
/// - Cannot be empty
/// - Cannot exceed [`MAX_WORKSPACE_ID_LEN`] bytes
/// - Cannot be `.` or `..`
/// - Cannot contain ASCII control characters
///
/// # Example
///
/// ```
/// use grovework::core::types::WorkspaceId;
///
/// let id = WorkspaceId::new("feature/login").unwrap();
/// assert_eq!(id.as_str(), "feature/login");
/// assert!(id.sanitized().starts_with("feature_login-"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkspaceId(String);

impl WorkspaceId {
    /// Create a new validated workspace ID.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidWorkspaceId` if the ID is empty, too long,
    /// a relative path component, or contains control characters.
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    fn validate(id: &str) -> Result<(), TypeError> {
        if id.is_empty() {
            return Err(TypeError::InvalidWorkspaceId(
                "workspace id cannot be empty".into(),
            ));
        }
        if id.len() > MAX_WORKSPACE_ID_LEN {
            return Err(TypeError::InvalidWorkspaceId(format!(
                "workspace id exceeds {} bytes",
                MAX_WORKSPACE_ID_LEN
            )));
        }
        if id == "." || id == ".." {
            return Err(TypeError::InvalidWorkspaceId(format!(
                "workspace id cannot be '{}'",
                id
            )));
        }
        if id.chars().any(|c| c.is_ascii_control()) {
            return Err(TypeError::InvalidWorkspaceId(
                "workspace id cannot contain control characters".into(),
            ));
        }
        Ok(())
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe form of the ID.
    ///
    /// Characters outside `[A-Za-z0-9._-]` are replaced with `_`. When that
    /// changed anything, a short SHA-256 suffix of the raw ID is appended so
    /// that `a/b` and `a_b` never map to the same file.
    pub fn sanitized(&self) -> String {
        let mut clean: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        // A leading dot would produce a hidden file.
        if clean.starts_with('.') {
            clean.replace_range(0..1, "_");
        }

        if clean != self.0 {
            let digest = Sha256::digest(self.0.as_bytes());
            clean.push('-');
            clean.push_str(&hex::encode(digest)[..8]);
        }
        clean
    }

    /// Name of this workspace's lock file inside the lock directory.
    pub fn lock_file_name(&self) -> String {
        format!("{}.lock", self.sanitized())
    }
}

impl TryFrom<String> for WorkspaceId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorkspaceId> for String {
    fn from(id: WorkspaceId) -> Self {
        id.0
    }
}

impl AsRef<str> for WorkspaceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A repository participating in a workspace.
///
/// `name` doubles as the worktree directory name inside the workspace and
/// as the stem of the canonical clone directory name, so it must be a
/// single path component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEntry {
    /// Short repository name, e.g. `api`.
    pub name: String,
    /// Remote URL the canonical clone is made from.
    pub url: String,
}

impl RepoEntry {
    /// Create a validated repository entry.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.chars().any(|c| c.is_ascii_control())
        {
            return Err(TypeError::InvalidRepoName(name));
        }
        Ok(Self {
            name,
            url: url.into(),
        })
    }

    /// Directory name of this repository's canonical clone.
    ///
    /// Includes a hash of the URL, so repositories that share a name but
    /// not a remote never share a clone.
    pub fn clone_dir_name(&self) -> String {
        let digest = Sha256::digest(self.url.as_bytes());
        format!("{}-{}", self.name, &hex::encode(digest)[..8])
    }
}

/// Lifecycle state of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    /// Worktrees exist and the workspace is in use.
    Active,
    /// Worktrees were removed; metadata is kept for `restore`.
    Closed,
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceState::Active => write!(f, "active"),
            WorkspaceState::Closed => write!(f, "closed"),
        }
    }
}

/// Persisted workspace metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub id: WorkspaceId,
    /// Human-facing name; also determines the directory name.
    pub name: String,
    /// Branch checked out in every worktree.
    pub branch: String,
    pub state: WorkspaceState,
    #[serde(default)]
    pub repos: Vec<RepoEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl WorkspaceSnapshot {
    /// Create a fresh active snapshot with no repositories.
    pub fn new(id: WorkspaceId, name: impl Into<String>, branch: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            branch: branch.into(),
            state: WorkspaceState::Active,
            repos: Vec::new(),
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    /// Find a repository by name.
    pub fn repo(&self, name: &str) -> Option<&RepoEntry> {
        self.repos.iter().find(|r| r.name == name)
    }

    pub fn is_closed(&self) -> bool {
        self.state == WorkspaceState::Closed
    }

    /// Directory name derived from the workspace name.
    pub fn directory_name(&self) -> String {
        directory_name_for(&self.name)
    }
}

/// Derive a workspace directory name from a display name.
///
/// Whitespace and path separators collapse to `-`; the result is never
/// empty.
pub fn directory_name_for(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_whitespace() || c == '/' || c == '\\' || c.is_ascii_control() {
            if !out.ends_with('-') {
                out.push('-');
            }
        } else {
            out.push(c);
        }
    }
    let out = out.trim_matches('-').trim_start_matches('.').to_string();
    if out.is_empty() {
        "workspace".to_string()
    } else {
        out
    }
}

/// A workspace snapshot together with its on-disk directory name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub snapshot: WorkspaceSnapshot,
    pub directory: String,
}

impl WorkspaceRecord {
    pub fn new(snapshot: WorkspaceSnapshot, directory: impl Into<String>) -> Self {
        Self {
            snapshot,
            directory: directory.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod workspace_id {
        use super::*;

        #[test]
        fn valid_ids() {
            assert!(WorkspaceId::new("PROJ-1").is_ok());
            assert!(WorkspaceId::new("feature/login").is_ok());
            assert!(WorkspaceId::new("with space").is_ok());
        }

        #[test]
        fn invalid_ids() {
            assert!(WorkspaceId::new("").is_err());
            assert!(WorkspaceId::new(".").is_err());
            assert!(WorkspaceId::new("..").is_err());
            assert!(WorkspaceId::new("tab\there").is_err());
            assert!(WorkspaceId::new("x".repeat(MAX_WORKSPACE_ID_LEN + 1)).is_err());
        }

        #[test]
        fn clean_id_is_not_suffixed() {
            let id = WorkspaceId::new("PROJ-1").unwrap();
            assert_eq!(id.sanitized(), "PROJ-1");
            assert_eq!(id.lock_file_name(), "PROJ-1.lock");
        }

        #[test]
        fn sanitized_ids_do_not_collide() {
            let a = WorkspaceId::new("a/b").unwrap();
            let b = WorkspaceId::new("a_b").unwrap();
            assert_ne!(a.sanitized(), b.sanitized());
            assert!(a.sanitized().starts_with("a_b-"));
            assert_eq!(a.sanitized().len(), "a_b-".len() + 8);
        }

        #[test]
        fn leading_dot_is_replaced() {
            let id = WorkspaceId::new(".hidden").unwrap();
            assert!(!id.sanitized().starts_with('.'));
        }

        #[test]
        fn serde_rejects_invalid() {
            let parsed: Result<WorkspaceId, _> = serde_json::from_str("\"\"");
            assert!(parsed.is_err());

            let parsed: WorkspaceId = serde_json::from_str("\"PROJ-2\"").unwrap();
            assert_eq!(parsed.as_str(), "PROJ-2");
        }
    }

    mod repo_entry {
        use super::*;

        #[test]
        fn rejects_path_like_names() {
            assert!(RepoEntry::new("api", "git@example.com:org/api.git").is_ok());
            assert!(RepoEntry::new("", "url").is_err());
            assert!(RepoEntry::new("a/b", "url").is_err());
            assert!(RepoEntry::new("..", "url").is_err());
        }

        #[test]
        fn clone_dir_is_keyed_by_url() {
            let a = RepoEntry::new("api", "https://example.com/a/api.git").unwrap();
            let b = RepoEntry::new("api", "https://example.com/b/api.git").unwrap();
            assert_ne!(a.clone_dir_name(), b.clone_dir_name());
            assert!(a.clone_dir_name().starts_with("api-"));
            assert_eq!(a.clone_dir_name().len(), "api-".len() + 8);
            assert_eq!(a.clone_dir_name(), a.clone().clone_dir_name());
        }
    }

    mod snapshot {
        use super::*;

        #[test]
        fn directory_name_collapses_separators() {
            assert_eq!(directory_name_for("Login  flow/v2"), "Login-flow-v2");
            assert_eq!(directory_name_for("  "), "workspace");
            assert_eq!(directory_name_for(".secret"), "secret");
        }

        #[test]
        fn repo_lookup() {
            let mut snap =
                WorkspaceSnapshot::new(WorkspaceId::new("W-1").unwrap(), "w", "feature/w");
            snap.repos.push(RepoEntry::new("api", "u").unwrap());
            assert!(snap.repo("api").is_some());
            assert!(snap.repo("web").is_none());
            assert!(!snap.is_closed());
        }

        #[test]
        fn closed_at_omitted_when_none() {
            let snap = WorkspaceSnapshot::new(WorkspaceId::new("W-1").unwrap(), "w", "b");
            let json = serde_json::to_string(&snap).unwrap();
            assert!(!json.contains("closed_at"));
            assert!(json.contains("\"state\":\"active\""));
        }
    }
}
