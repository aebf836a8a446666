//! Tool dispatch for the agentic ops generator.
//!
//! Exactly four tools are exposed to the model. Every failure path returns a
//! plain string (the model sees it as the tool result and can react); the
//! dispatcher never propagates an error that would abort the conversation.
//! `submit_ops` is terminal and handled by the generator, never dispatched.

use std::{path::PathBuf, time::Duration};

use command_group::AsyncCommandGroup;
use git::GitCli;
use ignore::{WalkBuilder, overrides::OverrideBuilder};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;
use tokio::io::AsyncReadExt;
use workspace_utils::{
    env::EnvPolicy,
    path::validate_staging_path,
    text::truncate_to_char_boundary,
};

use crate::client::ToolDefinition;

pub const TOOL_READ_FILE: &str = "read_file";
pub const TOOL_SEARCH_CONTENT: &str = "search_content";
pub const TOOL_RUN_COMMAND: &str = "run_command";
pub const TOOL_SUBMIT_OPS: &str = "submit_ops";

/// Files above this size require an explicit line range.
pub const READ_FILE_MAX_BYTES: u64 = 50_000;
const SEARCH_MAX_MATCHES: usize = 20;
const SEARCH_MAX_CHARS: usize = 3_000;
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const RUN_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const RUN_COMMAND_MAX_CHARS: usize = 5_000;

/// Caller-configured command lines for the bounded `run_command` kinds.
/// `git_diff` is built in and needs no entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandMap {
    pub test: Option<String>,
    pub build: Option<String>,
    pub lint: Option<String>,
    pub typecheck: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// Repo-relative path of the file to read.
    pub path: String,
    /// 1-indexed first line of the requested slice.
    #[serde(default)]
    pub start_line: Option<usize>,
    /// 1-indexed last line of the requested slice (inclusive).
    #[serde(default)]
    pub end_line: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchContentArgs {
    /// Regular expression matched line by line.
    pub pattern: String,
    /// Optional glob restricting which files are searched, e.g. `src/**/*.js`.
    #[serde(default)]
    pub glob: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandKind {
    Test,
    Build,
    Lint,
    Typecheck,
    GitDiff,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunCommandArgs {
    pub kind: CommandKind,
    /// Optional repo-relative path appended to the command.
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SubmitOpsArgs {
    /// The patch-op array to apply. Terminal: ends the conversation.
    pub ops: Value,
}

pub struct ToolDispatcher {
    worktree_root: PathBuf,
    commands: CommandMap,
    env: EnvPolicy,
    git: GitCli,
}

impl ToolDispatcher {
    pub fn new(worktree_root: PathBuf, commands: CommandMap, env: EnvPolicy, git: GitCli) -> Self {
        Self {
            worktree_root,
            commands,
            env,
            git,
        }
    }

    pub fn worktree_root(&self) -> &std::path::Path {
        &self.worktree_root
    }

    /// Definitions handed to the model, schemas derived from the arg types.
    pub fn tool_definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: TOOL_READ_FILE.to_string(),
                description: "Read a file from the worktree, or a line range of it. Large files \
                              must be read in slices."
                    .to_string(),
                input_schema: schema_of::<ReadFileArgs>(),
            },
            ToolDefinition {
                name: TOOL_SEARCH_CONTENT.to_string(),
                description: "Search file contents in the worktree with a regular expression, \
                              optionally limited by a glob. Returns up to 20 file:line:text \
                              matches."
                    .to_string(),
                input_schema: schema_of::<SearchContentArgs>(),
            },
            ToolDefinition {
                name: TOOL_RUN_COMMAND.to_string(),
                description: "Run one of the configured project commands (test, build, lint, \
                              typecheck) or git_diff inside the worktree, with a 30 second \
                              timeout."
                    .to_string(),
                input_schema: schema_of::<RunCommandArgs>(),
            },
            ToolDefinition {
                name: TOOL_SUBMIT_OPS.to_string(),
                description: "Submit the final patch-op array. This ends the conversation; no \
                              further tools run."
                    .to_string(),
                input_schema: schema_of::<SubmitOpsArgs>(),
            },
        ]
    }

    /// Execute one non-terminal tool call. The return value is always the
    /// string shown to the model.
    pub async fn dispatch(&self, name: &str, input: &Value) -> String {
        match name {
            TOOL_READ_FILE => match serde_json::from_value::<ReadFileArgs>(input.clone()) {
                Ok(args) => self.read_file(args).await,
                Err(e) => format!("invalid read_file input: {e}"),
            },
            TOOL_SEARCH_CONTENT => match serde_json::from_value::<SearchContentArgs>(input.clone())
            {
                Ok(args) => self.search_content(args).await,
                Err(e) => format!("invalid search_content input: {e}"),
            },
            TOOL_RUN_COMMAND => match serde_json::from_value::<RunCommandArgs>(input.clone()) {
                Ok(args) => self.run_command(args).await,
                Err(e) => format!("invalid run_command input: {e}"),
            },
            TOOL_SUBMIT_OPS => "submit_ops is terminal and never returns a tool result".to_string(),
            other => format!("unknown tool: {other}"),
        }
    }

    async fn read_file(&self, args: ReadFileArgs) -> String {
        let abs = match validate_staging_path(&self.worktree_root, &args.path) {
            Ok(abs) => abs,
            Err(e) => return e.to_string(),
        };
        let meta = match tokio::fs::metadata(&abs).await {
            Ok(meta) => meta,
            Err(e) => return format!("cannot read {}: {e}", args.path),
        };
        if meta.len() > READ_FILE_MAX_BYTES && args.start_line.is_none() && args.end_line.is_none()
        {
            return format!(
                "{} is {} bytes; request a slice instead, e.g. start_line=1 end_line=200",
                args.path,
                meta.len()
            );
        }
        let content = match tokio::fs::read_to_string(&abs).await {
            Ok(content) => content,
            Err(e) => return format!("cannot read {}: {e}", args.path),
        };
        match (args.start_line, args.end_line) {
            (None, None) => content,
            (start, end) => {
                let start = start.unwrap_or(1).max(1);
                let end = end.unwrap_or(usize::MAX);
                if end < start {
                    return format!("invalid range: end_line {end} precedes start_line {start}");
                }
                content
                    .lines()
                    .skip(start - 1)
                    .take(end - start + 1)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
    }

    async fn search_content(&self, args: SearchContentArgs) -> String {
        let pattern = match Regex::new(&args.pattern) {
            Ok(re) => re,
            Err(e) => return format!("invalid pattern: {e}"),
        };
        let root = self.worktree_root.clone();
        let glob = args.glob.clone();

        let walk = tokio::task::spawn_blocking(move || search_blocking(&root, &pattern, glob));
        match tokio::time::timeout(SEARCH_TIMEOUT, walk).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => format!("search failed: {e}"),
            Err(_) => format!("search timed out after {}s", SEARCH_TIMEOUT.as_secs()),
        }
    }

    async fn run_command(&self, args: RunCommandArgs) -> String {
        let target_rel = match &args.target {
            Some(target) => match validate_staging_path(&self.worktree_root, target) {
                Ok(_) => Some(target.clone()),
                Err(e) => return e.to_string(),
            },
            None => None,
        };

        if args.kind == CommandKind::GitDiff {
            let mut git_args = vec!["diff".to_string()];
            if let Some(target) = &target_rel {
                git_args.push("--".to_string());
                git_args.push(target.clone());
            }
            return match self.git.git_output(&self.worktree_root, &git_args) {
                Ok(out) => render_command_output(
                    out.status.code().unwrap_or(-1),
                    &out.stdout,
                    &out.stderr,
                ),
                Err(e) => format!("git diff failed: {e}"),
            };
        }

        let command_line = match args.kind {
            CommandKind::Test => self.commands.test.as_deref(),
            CommandKind::Build => self.commands.build.as_deref(),
            CommandKind::Lint => self.commands.lint.as_deref(),
            CommandKind::Typecheck => self.commands.typecheck.as_deref(),
            CommandKind::GitDiff => unreachable!(),
        };
        let Some(command_line) = command_line else {
            return format!("no {} command configured for this project", args.kind);
        };
        let Some(mut parts) = shlex::split(command_line).filter(|p| !p.is_empty()) else {
            return format!("cannot parse {} command: {command_line}", args.kind);
        };
        if let Some(target) = target_rel {
            parts.push(target);
        }

        let mut cmd = tokio::process::Command::new(&parts[0]);
        cmd.args(&parts[1..])
            .current_dir(&self.worktree_root)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        self.env.apply_to_tokio_command(&mut cmd);

        let mut child = match cmd.group_spawn() {
            Ok(child) => child,
            Err(e) => return format!("failed to spawn {}: {e}", parts[0]),
        };
        let deadline = tokio::time::Instant::now() + RUN_COMMAND_TIMEOUT;

        let stdout_pipe = child.inner().stdout.take();
        let stderr_pipe = child.inner().stderr.take();
        let drain = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            if let Some(mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut out).await;
            }
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut err).await;
            }
            (out, err)
        };
        let Ok((out, err)) = tokio::time::timeout_at(deadline, drain).await else {
            let _ = child.kill().await;
            return format!(
                "exit -1\ncommand timed out after {}s and was killed",
                RUN_COMMAND_TIMEOUT.as_secs()
            );
        };
        let code = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status.code().unwrap_or(-1),
            Ok(Err(e)) => return format!("failed to wait for {}: {e}", parts[0]),
            Err(_) => {
                let _ = child.kill().await;
                return format!(
                    "exit -1\ncommand timed out after {}s and was killed",
                    RUN_COMMAND_TIMEOUT.as_secs()
                );
            }
        };
        render_command_output(code, &out, &err)
    }
}

fn render_command_output(code: i32, stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    let err = String::from_utf8_lossy(stderr);
    if !err.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&err);
    }
    let body = truncate_to_char_boundary(&combined, RUN_COMMAND_MAX_CHARS);
    format!("exit {code}\n{body}")
}

fn search_blocking(root: &std::path::Path, pattern: &Regex, glob: Option<String>) -> String {
    let mut builder = WalkBuilder::new(root);
    if let Some(glob) = glob {
        let mut overrides = OverrideBuilder::new(root);
        if overrides.add(&glob).is_err() {
            return format!("invalid glob: {glob}");
        }
        match overrides.build() {
            Ok(ov) => {
                builder.overrides(ov);
            }
            Err(e) => return format!("invalid glob: {e}"),
        }
    }

    let mut lines: Vec<String> = Vec::new();
    let mut total_chars = 0usize;
    'walk: for entry in builder.build().flatten() {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        // Binary or unreadable files are skipped, not reported.
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        for (lineno, line) in content.lines().enumerate() {
            if pattern.is_match(line) {
                let hit = format!("{rel}:{}:{}", lineno + 1, line.trim_end());
                total_chars += hit.len() + 1;
                lines.push(hit);
                if lines.len() >= SEARCH_MAX_MATCHES || total_chars >= SEARCH_MAX_CHARS {
                    break 'walk;
                }
            }
        }
    }
    if lines.is_empty() {
        return "no matches".to_string();
    }
    let joined = lines.join("\n");
    truncate_to_char_boundary(&joined, SEARCH_MAX_CHARS).to_string()
}

fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}
