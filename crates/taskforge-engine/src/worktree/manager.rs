//! Worktree manager: one git worktree and branch per task.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use sha2::{Digest, Sha256};
use taskforge_core::config::WorktreeConfig;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Worktree has uncommitted changes: {}", .path.display())]
    Dirty { path: PathBuf },

    #[error("Worktree already exists: {}", .path.display())]
    AlreadyExists { path: PathBuf },

    #[error("Path exists but is not a git checkout: {}", .path.display())]
    NotACheckout { path: PathBuf },

    #[error("Invalid task id: {0}")]
    InvalidName(String),

    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One task's isolated checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Worktree {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
    /// Uncommitted changes, untracked files included.
    pub dirty: bool,
    /// The owning task no longer exists.
    pub orphan: bool,
    pub disk_usage_bytes: u64,
}

/// Outcome of [`WorktreeManager::cleanup_all_worktrees`].
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub failed: Vec<(String, WorktreeError)>,
}

impl CleanupReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct RepoInfo {
    root: PathBuf,
    /// Branch checked out in the main repository; task branches start here.
    base_branch: String,
}

/// Map a task id onto `[A-Za-z0-9._-]`, rejecting results that could escape
/// the isolation root. Ids that had to be rewritten get a short digest of
/// the original id appended, so distinct ids never share a name.
pub fn sanitize_task_id(task_id: &str) -> Result<String, WorktreeError> {
    let sanitized: String = task_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if sanitized.is_empty() {
        return Err(WorktreeError::InvalidName("task id cannot be empty".into()));
    }
    if sanitized.contains("..") || sanitized == "." {
        return Err(WorktreeError::InvalidName(format!(
            "task id cannot contain '..': {task_id}"
        )));
    }
    if sanitized.starts_with('-') {
        return Err(WorktreeError::InvalidName(format!(
            "task id cannot start with a dash: {task_id}"
        )));
    }
    if sanitized == task_id {
        return Ok(sanitized);
    }
    let digest = Sha256::digest(task_id.as_bytes());
    Ok(format!("{sanitized}-{}", hex::encode(&digest[..4])))
}

/// Run git in `dir` and return trimmed stdout.
async fn git(dir: &Path, args: &[&str]) -> Result<String, WorktreeError> {
    let operation = args.first().copied().unwrap_or_default().to_string();
    let start = Instant::now();
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await?;
    let elapsed_ms = start.elapsed().as_millis();

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(?args, elapsed_ms, status = %output.status, stderr = %stderr, "git command failed");
        return Err(WorktreeError::Git {
            operation: args.join(" "),
            message: stderr,
        });
    }
    debug!(operation, ?args, elapsed_ms, "git command completed");
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Total size of regular files under `path`; symlinks are not followed.
fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = std::fs::symlink_metadata(entry.path()) else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}

async fn disk_usage(path: &Path) -> u64 {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || dir_size(&path))
        .await
        .unwrap_or(0)
}

/// Manages per-task git worktrees under `<repo>/<root_dir>`.
#[derive(Debug)]
pub struct WorktreeManager {
    project_dir: PathBuf,
    config: WorktreeConfig,
    repo: OnceCell<RepoInfo>,
}

impl WorktreeManager {
    pub fn new(project_dir: impl Into<PathBuf>, config: WorktreeConfig) -> Self {
        Self {
            project_dir: project_dir.into(),
            config,
            repo: OnceCell::new(),
        }
    }

    /// Whether `git` can be executed at all.
    pub async fn verify_git_available() -> bool {
        match Command::new("git").arg("--version").output().await {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(status = %output.status, "git --version failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "git is not available");
                false
            }
        }
    }

    /// Repository root and base branch, resolved once.
    async fn repo(&self) -> Result<&RepoInfo, WorktreeError> {
        self.repo
            .get_or_try_init(|| async {
                let root = PathBuf::from(
                    git(&self.project_dir, &["rev-parse", "--show-toplevel"]).await?,
                );
                let base_branch = match git(&root, &["symbolic-ref", "--short", "HEAD"]).await {
                    Ok(branch) if !branch.is_empty() => branch,
                    _ => git(&root, &["rev-parse", "--abbrev-ref", "HEAD"]).await?,
                };
                info!(root = %root.display(), base_branch, "Resolved repository");
                Ok(RepoInfo { root, base_branch })
            })
            .await
    }

    /// Directory holding every task worktree.
    pub async fn isolation_root(&self) -> Result<PathBuf, WorktreeError> {
        Ok(self.repo().await?.root.join(&self.config.root_dir))
    }

    /// Deterministic checkout path for a task.
    pub async fn worktree_path(&self, task_id: &str) -> Result<PathBuf, WorktreeError> {
        let name = sanitize_task_id(task_id)?;
        Ok(self.isolation_root().await?.join(name))
    }

    /// Deterministic branch name for a task.
    pub fn branch_name(&self, task_id: &str) -> Result<String, WorktreeError> {
        Ok(format!(
            "{}{}",
            self.config.branch_prefix,
            sanitize_task_id(task_id)?
        ))
    }

    /// Create the task's branch and worktree. An existing branch (left by an
    /// earlier delete) is checked out again instead of recreated.
    pub async fn create_worktree(&self, task_id: &str) -> Result<Worktree, WorktreeError> {
        let repo = self.repo().await?.clone();
        let path = self.worktree_path(task_id).await?;
        let branch = self.branch_name(task_id)?;

        if path.exists() {
            return Err(WorktreeError::AlreadyExists { path });
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path_arg = path.to_string_lossy().into_owned();
        let branch_ref = format!("refs/heads/{branch}");
        let branch_exists = git(&repo.root, &["rev-parse", "--verify", "--quiet", &branch_ref])
            .await
            .is_ok();
        let result = if branch_exists {
            git(&repo.root, &["worktree", "add", &path_arg, &branch]).await
        } else {
            git(
                &repo.root,
                &["worktree", "add", "-b", &branch, &path_arg, &repo.base_branch],
            )
            .await
        };
        if let Err(e) = result {
            let message = match e {
                WorktreeError::Git { message, .. } => message,
                other => other.to_string(),
            };
            return Err(WorktreeError::Git {
                operation: format!("worktree add (task {task_id})"),
                message,
            });
        }

        info!(task_id, path = %path.display(), branch, reused_branch = branch_exists, "Created git worktree");
        Ok(Worktree {
            task_id: task_id.to_string(),
            disk_usage_bytes: disk_usage(&path).await,
            path,
            branch,
            dirty: false,
            orphan: false,
        })
    }

    /// `None` when the task has no worktree; [`WorktreeError::NotACheckout`]
    /// when the path exists but git does not own it.
    pub async fn get_worktree_status(
        &self,
        task_id: &str,
    ) -> Result<Option<Worktree>, WorktreeError> {
        let path = self.worktree_path(task_id).await?;
        if !path.exists() {
            return Ok(None);
        }
        self.inspect(task_id, &path).await.map(Some)
    }

    async fn inspect(&self, task_id: &str, path: &Path) -> Result<Worktree, WorktreeError> {
        let toplevel = git(path, &["rev-parse", "--show-toplevel"])
            .await
            .map(PathBuf::from)
            .map_err(|_| WorktreeError::NotACheckout {
                path: path.to_path_buf(),
            })?;
        if !same_path(&toplevel, path) {
            return Err(WorktreeError::NotACheckout {
                path: path.to_path_buf(),
            });
        }
        let branch = git(path, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let dirty = !git(path, &["status", "--porcelain"]).await?.is_empty();
        Ok(Worktree {
            task_id: task_id.to_string(),
            path: path.to_path_buf(),
            branch,
            dirty,
            orphan: false,
            disk_usage_bytes: disk_usage(path).await,
        })
    }

    /// Remove the task's worktree. Refuses a dirty (or unrecognised) one
    /// unless `force`. Returns `false` when there was nothing to delete. The
    /// branch is kept.
    pub async fn delete_worktree(&self, task_id: &str, force: bool) -> Result<bool, WorktreeError> {
        let path = self.worktree_path(task_id).await?;
        if !path.exists() {
            debug!(task_id, "No worktree to delete");
            return Ok(false);
        }
        if !force {
            let status = self.inspect(task_id, &path).await?;
            if status.dirty {
                return Err(WorktreeError::Dirty { path });
            }
        }

        let root = self.repo().await?.root.clone();
        let path_arg = path.to_string_lossy().into_owned();
        if let Err(e) = git(&root, &["worktree", "remove", "--force", &path_arg]).await {
            warn!(task_id, error = %e, "git worktree remove failed, removing directory");
        }
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        if let Err(e) = git(&root, &["worktree", "prune"]).await {
            warn!(task_id, error = %e, "git worktree prune failed");
        }

        info!(task_id, path = %path.display(), force, "Removed git worktree");
        Ok(true)
    }

    /// Registered worktrees under the isolation root. With `live_task_ids`,
    /// worktrees whose task is not in the set are flagged as orphans.
    pub async fn list_worktrees(
        &self,
        live_task_ids: Option<&HashSet<String>>,
    ) -> Result<Vec<Worktree>, WorktreeError> {
        let repo = self.repo().await?.clone();
        let isolation_root = repo.root.join(&self.config.root_dir);
        let isolation_root = std::fs::canonicalize(&isolation_root).unwrap_or(isolation_root);
        let porcelain = git(&repo.root, &["worktree", "list", "--porcelain"]).await?;
        let live_names: Option<HashSet<String>> = live_task_ids.map(|ids| {
            ids.iter()
                .filter_map(|id| sanitize_task_id(id).ok())
                .collect()
        });

        let mut worktrees = Vec::new();
        for entry in parse_worktree_list(&porcelain) {
            let canonical = std::fs::canonicalize(&entry.path).unwrap_or_else(|_| entry.path.clone());
            if canonical.parent() != Some(isolation_root.as_path()) {
                continue;
            }
            let Some(task_id) = canonical.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let dirty = match git(&canonical, &["status", "--porcelain"]).await {
                Ok(out) => !out.is_empty(),
                Err(e) => {
                    warn!(task_id, error = %e, "Could not read worktree status");
                    false
                }
            };
            let branch = entry.branch.unwrap_or_else(|| {
                self.branch_name(task_id).unwrap_or_else(|_| task_id.to_string())
            });
            worktrees.push(Worktree {
                task_id: task_id.to_string(),
                orphan: live_names.as_ref().is_some_and(|live| !live.contains(task_id)),
                disk_usage_bytes: disk_usage(&canonical).await,
                path: canonical,
                branch,
                dirty,
            });
        }
        worktrees.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(worktrees)
    }

    /// Delete every task worktree, continuing past failures.
    pub async fn cleanup_all_worktrees(&self, force: bool) -> Result<CleanupReport, WorktreeError> {
        let mut report = CleanupReport::default();
        for worktree in self.list_worktrees(None).await? {
            match self.delete_worktree(&worktree.task_id, force).await {
                Ok(_) => report.removed.push(worktree.task_id),
                Err(e) => {
                    warn!(task_id = %worktree.task_id, error = %e, "Worktree cleanup failed");
                    report.failed.push((worktree.task_id, e));
                }
            }
        }
        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Worktree cleanup finished"
        );
        Ok(report)
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ListedWorktree {
    path: PathBuf,
    branch: Option<String>,
}

/// Parse `git worktree list --porcelain`.
fn parse_worktree_list(porcelain: &str) -> Vec<ListedWorktree> {
    let mut out = Vec::new();
    for block in porcelain.split("\n\n") {
        let mut path = None;
        let mut branch = None;
        for line in block.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                path = Some(PathBuf::from(p));
            } else if let Some(b) = line.strip_prefix("branch ") {
                branch = Some(b.trim_start_matches("refs/heads/").to_string());
            }
        }
        if let Some(path) = path {
            out.push(ListedWorktree { path, branch });
        }
    }
    out
}
