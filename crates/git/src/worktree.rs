//! Detached-worktree lifecycle.
//!
//! Each repair run gets its own worktree at
//! `<repo>/.crucible/worktrees/<run_id>`, checked out detached so the main
//! tree can keep whatever branch it has. Removal always goes through
//! `git worktree remove --force` followed by a prune pass, so git's own
//! bookkeeping stays consistent; a plain directory delete is only the last
//! resort when git refused.

use std::{
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cli::{GitCli, GitCliError};

/// Repo-relative prefix all worktrees live under. Must be ignored by the
/// host repository; [`Worktree::create`] arranges that via `info/exclude`.
pub const WORKTREE_DIR: &str = ".crucible/worktrees";

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    TaskJoin(String),
    #[error("worktree creation reported success but {0} does not exist")]
    Missing(String),
}

/// Derive the run identifier: `sha256(repo ‖ millis ‖ pid)`, 12 hex chars.
pub fn generate_run_id(repo_path: &Path) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(repo_path.to_string_lossy().as_bytes());
    hasher.update(millis.to_string().as_bytes());
    hasher.update(std::process::id().to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

/// Handle to one detached worktree. Dropping the handle without calling
/// [`Worktree::remove`] performs a best-effort blocking removal, so the
/// directory disappears even on panic unwinds.
pub struct Worktree {
    repo_path: PathBuf,
    run_id: String,
    path: PathBuf,
    git: GitCli,
    removed: bool,
}

impl Worktree {
    /// Create a detached worktree for `repo_path` under the crucible prefix.
    pub async fn create(git: GitCli, repo_path: &Path) -> Result<Self, WorktreeError> {
        let repo = repo_path.to_path_buf();
        let run_id = generate_run_id(&repo);
        let path = repo.join(WORKTREE_DIR).join(&run_id);

        let created = {
            let git = git.clone();
            let repo = repo.clone();
            let path = path.clone();
            let run_id = run_id.clone();
            tokio::task::spawn_blocking(move || -> Result<(), WorktreeError> {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                ensure_prefix_ignored(&git, &repo);
                let path_arg = path.to_string_lossy().to_string();
                // Detached on purpose: a named branch could already be
                // checked out in the main tree.
                git_checked(&git, &repo, &["worktree", "add", "--detach", path_arg.as_str()])?;
                if !path.exists() {
                    return Err(WorktreeError::Missing(path_arg));
                }
                info!("created detached worktree {run_id} at {}", path.display());
                Ok(())
            })
            .await
            .map_err(|e| WorktreeError::TaskJoin(e.to_string()))?
        };
        created?;

        Ok(Self {
            repo_path: repo,
            run_id,
            path,
            git,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Reset the worktree to HEAD and drop untracked files, so an iteration
    /// always starts from a clean tree.
    pub async fn reset_hard(&self) -> Result<(), WorktreeError> {
        let git = self.git.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), WorktreeError> {
            git_checked(&git, &path, &["reset", "--hard", "HEAD"])?;
            git_checked(&git, &path, &["clean", "-fd"])?;
            Ok(())
        })
        .await
        .map_err(|e| WorktreeError::TaskJoin(e.to_string()))?
    }

    /// Trimmed `git rev-parse HEAD` of the worktree.
    pub async fn head_sha(&self) -> Result<String, WorktreeError> {
        let git = self.git.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || git_checked(&git, &path, &["rev-parse", "HEAD"]))
            .await
            .map_err(|e| WorktreeError::TaskJoin(e.to_string()))?
            .map_err(WorktreeError::Git)
    }

    /// Remove the worktree. Failures are logged, never fatal: a failed
    /// removal must not mask a successful loop outcome.
    pub async fn remove(mut self) {
        self.removed = true;
        let git = self.git.clone();
        let repo = self.repo_path.clone();
        let path = self.path.clone();
        let joined =
            tokio::task::spawn_blocking(move || remove_blocking(&git, &repo, &path)).await;
        if let Err(e) = joined {
            warn!("worktree removal task failed: {e}");
        }
    }
}

impl Drop for Worktree {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        // Unwind path: callers normally remove explicitly. Blocking here is
        // the price of guaranteed cleanup.
        debug!(
            "worktree {} dropped without explicit removal, cleaning up",
            self.run_id
        );
        remove_blocking(&self.git, &self.repo_path, &self.path);
    }
}

fn remove_blocking(git: &GitCli, repo: &Path, path: &Path) {
    let path_arg = path.to_string_lossy().to_string();
    if let Err(e) = git_checked(git, repo, &["worktree", "remove", "--force", path_arg.as_str()]) {
        warn!("git worktree remove failed (continuing with prune): {e}");
    }
    // Prune runs even when removal failed, so stale metadata never lingers.
    if let Err(e) = git_checked(git, repo, &["worktree", "prune"]) {
        warn!("git worktree prune failed: {e}");
    }
    if path.exists()
        && let Err(e) = fs::remove_dir_all(path)
    {
        warn!("failed to delete worktree directory {}: {e}", path.display());
    }
}

/// Append `.crucible/` to the repository's `info/exclude` when missing, so
/// worktrees never show up as untracked noise in the main tree. Best-effort.
fn ensure_prefix_ignored(git: &GitCli, repo: &Path) {
    let common_dir = git.git_quiet(repo, ["rev-parse", "--git-common-dir"]);
    if common_dir.is_empty() {
        return;
    }
    let mut exclude = PathBuf::from(&common_dir);
    if exclude.is_relative() {
        exclude = repo.join(exclude);
    }
    exclude.push("info");
    if fs::create_dir_all(&exclude).is_err() {
        return;
    }
    exclude.push("exclude");
    let existing = fs::read_to_string(&exclude).unwrap_or_default();
    if existing.lines().any(|line| line.trim() == ".crucible/") {
        return;
    }
    let result = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&exclude)
        .and_then(|mut f| writeln!(f, ".crucible/"));
    if let Err(e) = result {
        debug!("could not update info/exclude: {e}");
    }
}

fn git_checked(git: &GitCli, dir: &Path, args: &[&str]) -> Result<String, GitCliError> {
    let out = git.git_output(dir, args)?;
    if out.status.success() {
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    } else {
        Err(GitCliError::CommandFailed(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        )))
    }
}
