//! Child-process environment sanitising.
//!
//! Every child process spawned by the repair engine (git, gh, tool commands,
//! the test command) sources its environment from [`EnvPolicy`]. The default
//! mode clones the parent environment minus provider credentials; paranoid
//! mode is default-deny with an explicit allowlist.

use std::collections::HashMap;

/// `1` enforces the allowlist, `warn` only audits, anything else (or unset)
/// keeps the blacklist default.
pub const PARANOID_ENV_VAR: &str = "CRUCIBLE_PARANOID_ENV";
/// Comma-separated variable names opted into the paranoid allowlist.
pub const EXTRA_ENV_VAR: &str = "CRUCIBLE_EXTRA_ENV";

/// Provider credentials and first-party caches that never reach a child,
/// regardless of mode.
const BLOCKED_VARS: &[&str] = &[
    "OPENAI_API_KEY",
    "OPENAI_ORG_ID",
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_AUTH_TOKEN",
    "CRUCIBLE_API_KEY",
    "CRUCIBLE_KEY_CACHE",
];

const ALLOWED_EXACT: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    "TMPDIR",
    "LANG",
    "LANGUAGE",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "SSH_AUTH_SOCK",
    "GPG_AGENT_INFO",
    "GITHUB_TOKEN",
    "GH_TOKEN",
];

const ALLOWED_PREFIXES: &[&str] = &["LC_", "GIT_", "SSH_", "GPG_", "CRUCIBLE_"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SanitizeMode {
    /// Clone the environment, delete the blocked names.
    #[default]
    Blacklist,
    /// Log what the allowlist would drop, forward everything unchanged.
    AllowlistWarn,
    /// Default-deny; only allowlisted names are forwarded.
    AllowlistEnforce,
}

#[derive(Debug, Clone, Default)]
pub struct EnvPolicy {
    pub mode: SanitizeMode,
    pub extra_allow: Vec<String>,
}

impl EnvPolicy {
    /// Read the policy once from `CRUCIBLE_PARANOID_ENV` / `CRUCIBLE_EXTRA_ENV`.
    /// Callers hold on to the result instead of re-reading per spawn.
    pub fn from_env() -> Self {
        let mode = match std::env::var(PARANOID_ENV_VAR).ok().as_deref() {
            Some("1") => SanitizeMode::AllowlistEnforce,
            Some("warn") => SanitizeMode::AllowlistWarn,
            _ => SanitizeMode::Blacklist,
        };
        let extra_allow = std::env::var(EXTRA_ENV_VAR)
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self { mode, extra_allow }
    }

    /// The sanitised environment for a child process.
    pub fn sanitized_env(&self) -> HashMap<String, String> {
        self.sanitize(std::env::vars().collect())
    }

    /// Apply the policy to an arbitrary base map. Split out from
    /// [`Self::sanitized_env`] so the filtering rules are testable without
    /// mutating the process environment.
    pub fn sanitize(&self, base: HashMap<String, String>) -> HashMap<String, String> {
        match self.mode {
            SanitizeMode::Blacklist => base
                .into_iter()
                .filter(|(name, _)| !BLOCKED_VARS.contains(&name.as_str()))
                .collect(),
            SanitizeMode::AllowlistWarn => {
                let dropped = self.would_drop(&base);
                if !dropped.is_empty() {
                    tracing::warn!(
                        "paranoid env audit: allowlist would drop {} variable(s): {}",
                        dropped.len(),
                        dropped.join(", ")
                    );
                }
                base
            }
            SanitizeMode::AllowlistEnforce => {
                let dropped = self.would_drop(&base);
                if !dropped.is_empty() {
                    // Names only. Values must never hit the log stream.
                    tracing::warn!(
                        "paranoid env: dropping {} variable(s): {}",
                        dropped.len(),
                        dropped.join(", ")
                    );
                }
                base.into_iter()
                    .filter(|(name, _)| self.is_allowed(name))
                    .collect()
            }
        }
    }

    /// Install the sanitised environment on a std `Command`, replacing the
    /// inherited one wholesale.
    pub fn apply_to_command(&self, command: &mut std::process::Command) {
        command.env_clear();
        command.envs(self.sanitized_env());
    }

    /// Same as [`Self::apply_to_command`] for a tokio `Command`.
    pub fn apply_to_tokio_command(&self, command: &mut tokio::process::Command) {
        command.env_clear();
        command.envs(self.sanitized_env());
    }

    fn is_allowed(&self, name: &str) -> bool {
        if BLOCKED_VARS.contains(&name) {
            return false;
        }
        ALLOWED_EXACT.contains(&name)
            || ALLOWED_PREFIXES.iter().any(|p| name.starts_with(p))
            || self.extra_allow.iter().any(|extra| extra == name)
    }

    fn would_drop(&self, base: &HashMap<String, String>) -> Vec<String> {
        let mut dropped: Vec<String> = base
            .keys()
            .filter(|name| !self.is_allowed(name))
            .cloned()
            .collect();
        dropped.sort();
        dropped
    }
}
