//! Unified-diff production.

use std::{
    io::Write as _,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use utils::text::file_slug;

use crate::cli::{GitCli, GitCliError};

#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git diff exited with {code}: {stderr}")]
    DiffFailed { code: i32, stderr: String },
}

/// Unified diff between two in-memory contents, via `git diff --no-index`
/// over two temp files.
///
/// Exit 0 means identical (empty diff); exit 1 carries the diff on stdout
/// and is not an error; anything else is. The temp files carry pid and a
/// nanosecond timestamp in their prefix and a random suffix from `tempfile`,
/// and are deleted on every exit path when the handles drop.
pub fn diff_contents(
    git: &GitCli,
    before: &str,
    after: &str,
    label: &str,
) -> Result<String, DiffError> {
    let slug = file_slug(label);
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut left = tempfile::Builder::new()
        .prefix(&format!("crucible-diff-{pid}-{nanos}-{slug}-a-"))
        .tempfile()?;
    let mut right = tempfile::Builder::new()
        .prefix(&format!("crucible-diff-{pid}-{nanos}-{slug}-b-"))
        .tempfile()?;
    left.write_all(before.as_bytes())?;
    left.flush()?;
    right.write_all(after.as_bytes())?;
    right.flush()?;

    let left_arg = left.path().to_string_lossy().to_string();
    let right_arg = right.path().to_string_lossy().to_string();
    let out = git.git_output(
        &std::env::temp_dir(),
        ["diff", "--no-index", "--", left_arg.as_str(), right_arg.as_str()],
    )?;
    match out.status.code() {
        Some(0) => Ok(String::new()),
        Some(1) => Ok(String::from_utf8_lossy(&out.stdout).into_owned()),
        code => Err(DiffError::DiffFailed {
            code: code.unwrap_or(-1),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        }),
    }
}

/// The worktree's own unified diff of unstaged changes, optionally scoped to
/// a single path. Untracked files do not appear, by construction.
pub fn unified_diff(
    git: &GitCli,
    worktree_path: &Path,
    path: Option<&str>,
) -> Result<String, DiffError> {
    let mut args: Vec<&str> = vec!["diff"];
    if let Some(p) = path {
        args.push("--");
        args.push(p);
    }
    let out = git.git_output(worktree_path, &args)?;
    if out.status.success() || out.status.code() == Some(1) {
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    } else {
        Err(DiffError::DiffFailed {
            code: out.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}
