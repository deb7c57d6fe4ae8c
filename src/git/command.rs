//! git::command
//!
//! `GitOperations` backed by the `git` command-line tool.
//!
//! Each call spawns `git` through `tokio::process`. When the context fires
//! the child is killed and [`GitError::Interrupted`] is returned. Failures
//! keep git's stderr so they can be classified for retry.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::traits::{GitError, GitOp, GitOperations, RepoStatus};
use crate::engine::context::Context;

/// Runs the `git` binary.
#[derive(Debug, Clone)]
pub struct CommandGit {
    binary: PathBuf,
    remote: String,
}

impl Default for CommandGit {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandGit {
    /// Use `git` from `PATH` and the `origin` remote.
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("git"),
            remote: "origin".to_string(),
        }
    }

    /// Use a specific git binary.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Use a remote other than `origin`.
    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    /// Run git with `args`, returning stdout on success.
    async fn run(
        &self,
        ctx: &Context,
        op: GitOp,
        cwd: Option<&Path>,
        args: &[&OsStr],
    ) -> Result<String, GitError> {
        ctx.check()
            .map_err(|reason| GitError::Interrupted { op, reason })?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!(%op, ?args, "running git");
        let child = cmd.spawn().map_err(|e| GitError::Spawn {
            op,
            message: e.to_string(),
        })?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            biased;
            reason = ctx.done() => return Err(GitError::Interrupted { op, reason }),
            output = child.wait_with_output() => output.map_err(|e| GitError::Spawn {
                op,
                message: e.to_string(),
            })?,
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(GitError::CommandFailed {
                op,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn branch_exists(&self, ctx: &Context, repo: &Path, branch: &str) -> Result<bool, GitError> {
        let refname = OsString::from(format!("refs/heads/{}", branch));
        let args = [
            OsStr::new("show-ref"),
            OsStr::new("--verify"),
            OsStr::new("--quiet"),
            refname.as_os_str(),
        ];
        match self.run(ctx, GitOp::CreateWorktree, Some(repo), &args).await {
            Ok(_) => Ok(true),
            Err(GitError::CommandFailed { code: Some(1), .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl GitOperations for CommandGit {
    async fn clone_repo(&self, ctx: &Context, url: &str, dest: &Path) -> Result<(), GitError> {
        let args = [OsStr::new("clone"), OsStr::new(url), dest.as_os_str()];
        self.run(ctx, GitOp::Clone, None, &args).await.map(|_| ())
    }

    async fn fetch(&self, ctx: &Context, repo: &Path) -> Result<(), GitError> {
        let args = [
            OsStr::new("fetch"),
            OsStr::new("--prune"),
            OsStr::new(&self.remote),
        ];
        self.run(ctx, GitOp::Fetch, Some(repo), &args).await.map(|_| ())
    }

    async fn push(&self, ctx: &Context, repo: &Path, branch: &str) -> Result<(), GitError> {
        let args = [
            OsStr::new("push"),
            OsStr::new("--set-upstream"),
            OsStr::new(&self.remote),
            OsStr::new(branch),
        ];
        self.run(ctx, GitOp::Push, Some(repo), &args).await.map(|_| ())
    }

    async fn pull(&self, ctx: &Context, repo: &Path) -> Result<(), GitError> {
        let args = [OsStr::new("pull"), OsStr::new("--ff-only")];
        self.run(ctx, GitOp::Pull, Some(repo), &args).await.map(|_| ())
    }

    async fn create_worktree(
        &self,
        ctx: &Context,
        repo: &Path,
        worktree: &Path,
        branch: &str,
    ) -> Result<(), GitError> {
        let args: Vec<&OsStr> = if self.branch_exists(ctx, repo, branch).await? {
            vec![
                OsStr::new("worktree"),
                OsStr::new("add"),
                worktree.as_os_str(),
                OsStr::new(branch),
            ]
        } else {
            vec![
                OsStr::new("worktree"),
                OsStr::new("add"),
                OsStr::new("-b"),
                OsStr::new(branch),
                worktree.as_os_str(),
            ]
        };
        self.run(ctx, GitOp::CreateWorktree, Some(repo), &args)
            .await
            .map(|_| ())
    }

    async fn move_worktree(
        &self,
        ctx: &Context,
        repo: &Path,
        from: &Path,
        to: &Path,
    ) -> Result<(), GitError> {
        let args = [
            OsStr::new("worktree"),
            OsStr::new("move"),
            from.as_os_str(),
            to.as_os_str(),
        ];
        self.run(ctx, GitOp::MoveWorktree, Some(repo), &args)
            .await
            .map(|_| ())
    }

    async fn remove_worktree(
        &self,
        ctx: &Context,
        repo: &Path,
        worktree: &Path,
    ) -> Result<(), GitError> {
        let args = [
            OsStr::new("worktree"),
            OsStr::new("remove"),
            OsStr::new("--force"),
            worktree.as_os_str(),
        ];
        self.run(ctx, GitOp::RemoveWorktree, Some(repo), &args)
            .await
            .map(|_| ())
    }

    async fn status(&self, ctx: &Context, repo: &Path) -> Result<RepoStatus, GitError> {
        let args = [
            OsStr::new("status"),
            OsStr::new("--porcelain=v2"),
            OsStr::new("--branch"),
        ];
        let stdout = self.run(ctx, GitOp::Status, Some(repo), &args).await?;
        parse_porcelain_v2(&stdout)
    }
}

/// Parse `git status --porcelain=v2 --branch` output.
pub fn parse_porcelain_v2(output: &str) -> Result<RepoStatus, GitError> {
    let mut status = RepoStatus::default();

    for line in output.lines() {
        if let Some(header) = line.strip_prefix("# ") {
            if let Some(head) = header.strip_prefix("branch.head ") {
                if head != "(detached)" {
                    status.branch = Some(head.to_string());
                }
            } else if let Some(ab) = header.strip_prefix("branch.ab ") {
                let (ahead, behind) = parse_ahead_behind(ab).ok_or_else(|| GitError::Parse {
                    op: GitOp::Status,
                    message: format!("bad branch.ab line: {}", line),
                })?;
                status.ahead = ahead;
                status.behind = behind;
            }
            continue;
        }

        let path = match line.chars().next() {
            Some('?') | Some('!') => line.get(2..),
            // "1 XY sub mH mI mW hH hI path"
            Some('1') => line.splitn(9, ' ').nth(8),
            // "2 XY sub mH mI mW hH hI Xscore path\torig"
            Some('2') => line
                .splitn(10, ' ')
                .nth(9)
                .and_then(|rest| rest.split('\t').next()),
            // "u XY sub m1 m2 m3 mW h1 h2 h3 path"
            Some('u') => line.splitn(11, ' ').nth(10),
            _ => None,
        };

        match path {
            Some(path) if !line.starts_with('!') => status.dirty_files.push(path.to_string()),
            Some(_) => {}
            None if line.is_empty() => {}
            None => {
                return Err(GitError::Parse {
                    op: GitOp::Status,
                    message: format!("unrecognized status line: {}", line),
                })
            }
        }
    }

    Ok(status)
}

fn parse_ahead_behind(ab: &str) -> Option<(u32, u32)> {
    let mut parts = ab.split_whitespace();
    let ahead = parts.next()?.strip_prefix('+')?.parse().ok()?;
    let behind = parts.next()?.strip_prefix('-')?.parse().ok()?;
    Some((ahead, behind))
}
