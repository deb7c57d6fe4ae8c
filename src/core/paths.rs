//! core::paths
//!
//! Centralized path routing for Grove storage locations.
//!
//! **Hard rule:** No code outside this module should compute paths under
//! the Grove root. All paths go through `GrovePaths`.
//!
//! # Storage Layout
//!
//! All Grove data is stored under `<root>/` (default `~/.grove`):
//! - `locks/` - One lock file per workspace
//! - `locks/repos/` - One lock file per canonical clone
//! - `metadata/` - One JSON document per workspace
//! - `repos/<repo>-<url hash>` - Canonical clones shared by every workspace
//! - `repos/.<repo>-<url hash>.partial` - A clone in progress
//! - `workspaces/<dir>/<repo>` - Worktrees of a workspace
//!
//! # Example
//!
//! ```
//! use grovework::core::paths::GrovePaths;
//! use std::path::PathBuf;
//!
//! let paths = GrovePaths::new("/home/me/.grove");
//!
//! assert_eq!(paths.locks_dir(), PathBuf::from("/home/me/.grove/locks"));
//! assert_eq!(
//!     paths.worktree_path("feature-x", "api"),
//!     PathBuf::from("/home/me/.grove/workspaces/feature-x/api")
//! );
//! ```

use std::path::{Path, PathBuf};

use super::config::{Config, ConfigError};
use super::types::RepoEntry;

/// Centralized path routing for Grove storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrovePaths {
    root: PathBuf,
}

impl GrovePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the root from configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(config.root()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding workspace lock files.
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Directory holding workspace metadata documents.
    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    /// Directory holding canonical clones.
    pub fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    /// Canonical clone of a repository.
    pub fn canonical_repo_path(&self, repo: &RepoEntry) -> PathBuf {
        self.repos_dir().join(repo.clone_dir_name())
    }

    /// Where a canonical clone is made before it is moved into place.
    pub fn clone_staging_path(&self, repo: &RepoEntry) -> PathBuf {
        self.repos_dir()
            .join(format!(".{}.partial", repo.clone_dir_name()))
    }

    /// Directory holding workspace directories.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    /// A workspace's directory.
    pub fn workspace_dir(&self, directory: &str) -> PathBuf {
        self.workspaces_dir().join(directory)
    }

    /// A repository's worktree inside a workspace.
    pub fn worktree_path(&self, directory: &str, repo: &str) -> PathBuf {
        self.workspace_dir(directory).join(repo)
    }

    /// Create the top-level directories if they don't exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.locks_dir())?;
        std::fs::create_dir_all(self.metadata_dir())?;
        std::fs::create_dir_all(self.repos_dir())?;
        std::fs::create_dir_all(self.workspaces_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GroveConfig;

    #[test]
    fn layout() {
        let paths = GrovePaths::new("/g");
        assert_eq!(paths.root(), Path::new("/g"));
        assert_eq!(paths.metadata_dir(), PathBuf::from("/g/metadata"));
        assert_eq!(paths.workspace_dir("ws"), PathBuf::from("/g/workspaces/ws"));
    }

    #[test]
    fn canonical_clone_paths() {
        let paths = GrovePaths::new("/g");
        let repo = RepoEntry::new("api", "https://example.com/api.git").unwrap();
        let canonical = paths.canonical_repo_path(&repo);
        let staging = paths.clone_staging_path(&repo);

        assert_eq!(canonical.parent(), Some(paths.repos_dir().as_path()));
        assert_eq!(staging.parent(), Some(paths.repos_dir().as_path()));
        assert_eq!(
            canonical.file_name().unwrap().to_str().unwrap(),
            repo.clone_dir_name()
        );
        assert_eq!(
            staging.file_name().unwrap().to_str().unwrap(),
            format!(".{}.partial", repo.clone_dir_name())
        );
    }

    #[test]
    fn from_config_uses_configured_root() {
        let config = Config::new(GroveConfig {
            root: Some(PathBuf::from("/srv/grove")),
            ..Default::default()
        })
        .unwrap();
        let paths = GrovePaths::from_config(&config).unwrap();
        assert_eq!(paths.locks_dir(), PathBuf::from("/srv/grove/locks"));
    }

    #[test]
    fn ensure_dirs_creates_layout() {
        let temp = tempfile::TempDir::new().unwrap();
        let paths = GrovePaths::new(temp.path().join("grove"));
        paths.ensure_dirs().unwrap();
        paths.ensure_dirs().unwrap();

        assert!(paths.locks_dir().is_dir());
        assert!(paths.metadata_dir().is_dir());
        assert!(paths.repos_dir().is_dir());
        assert!(paths.workspaces_dir().is_dir());
    }
}
