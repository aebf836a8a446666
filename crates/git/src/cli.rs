//! Why the Git CLI rather than a bindings library
//!
//! - Worktree semantics: `git worktree add/remove/prune` keeps the
//!   repository's own bookkeeping consistent; re-implementing that on top of
//!   bindings means replicating a lot of safety behaviour for no gain.
//! - Argument vectors only: every invocation passes an explicit argv with no
//!   shell in between, so caller-supplied strings can never be re-tokenised.
//! - Sanitised environment: children source their environment from
//!   [`EnvPolicy`], which strips provider credentials before the spawn.
//!
//! The same discipline applies to `gh`: argument vectors, no shell, the
//! sanitised environment.

use std::{
    ffi::OsStr,
    path::Path,
    process::{Command, Output, Stdio},
};

use thiserror::Error;
use utils::{env::EnvPolicy, shell::resolve_executable};

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("`{0}` executable not found or not runnable")]
    NotAvailable(&'static str),
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Thin runner around the `git` and `gh` binaries.
///
/// Two public shapes: a *quiet* variant that captures stdout and never fails
/// (non-zero exit or spawn failure yields an empty string), and an *exec*
/// variant that inherits the parent's stdio and errors on non-zero exit.
#[derive(Clone, Default)]
pub struct GitCli {
    env: EnvPolicy,
}

impl GitCli {
    pub fn new(env: EnvPolicy) -> Self {
        Self { env }
    }

    /// Run `git` in `dir`, capture stdout, return it trimmed. Never errors.
    pub fn git_quiet<I, S>(&self, dir: &Path, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_quiet("git", dir, args)
    }

    /// Run `git` in `dir` with inherited stdio; error on non-zero exit.
    pub fn git_exec<I, S>(&self, dir: &Path, args: I) -> Result<(), GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_exec("git", dir, args)
    }

    /// `gh` twin of [`Self::git_quiet`].
    pub fn gh_quiet<I, S>(&self, dir: &Path, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_quiet("gh", dir, args)
    }

    /// `gh` twin of [`Self::git_exec`].
    pub fn gh_exec<I, S>(&self, dir: &Path, args: I) -> Result<(), GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_exec("gh", dir, args)
    }

    /// Low-level captured invocation exposing the raw `Output`. Prefer the
    /// quiet/exec shapes; this exists for callers that must distinguish exit
    /// codes (`git diff --no-index` uses 1 for "differs").
    pub fn git_output<I, S>(&self, dir: &Path, args: I) -> Result<Output, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command("git", dir)?;
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Ok(cmd.output()?)
    }

    fn command(&self, program: &'static str, dir: &Path) -> Result<Command, GitCliError> {
        let exe = resolve_executable(program).ok_or(GitCliError::NotAvailable(program))?;
        let mut cmd = Command::new(exe);
        cmd.current_dir(dir);
        self.env.apply_to_command(&mut cmd);
        Ok(cmd)
    }

    fn run_quiet<I, S>(&self, program: &'static str, dir: &Path, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let Ok(mut cmd) = self.command(program, dir) else {
            return String::new();
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        match cmd.output() {
            Ok(out) if out.status.success() => {
                String::from_utf8_lossy(&out.stdout).trim().to_string()
            }
            _ => String::new(),
        }
    }

    fn run_exec<I, S>(&self, program: &'static str, dir: &Path, args: I) -> Result<(), GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(program, dir)?;
        cmd.args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let status = cmd.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(GitCliError::CommandFailed(format!(
                "{program} exited with {status}"
            )))
        }
    }
}
