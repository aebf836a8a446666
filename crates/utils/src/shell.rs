//! Cross-platform shell and executable resolution.

use std::path::{Path, PathBuf};

/// Returns the shell invocation used for caller-configured command strings
/// (the test command is a shell string by contract).
///
/// Returns (shell_program, shell_arg):
/// - Windows: ("cmd", "/C")
/// - Unix-like: ("sh", "-c")
pub fn get_shell_command() -> (&'static str, &'static str) {
    if cfg!(windows) { ("cmd", "/C") } else { ("sh", "-c") }
}

/// Resolve an executable by name against the current PATH.
///
/// Explicit paths (absolute or containing a separator) are returned as-is
/// when they exist; bare names go through a PATH lookup. Callers run this
/// from blocking contexts (the git runners live inside `spawn_blocking`).
pub fn resolve_executable(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }
    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    which::which(executable).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_ubiquitous_binary() {
        let name = if cfg!(windows) { "cmd" } else { "sh" };
        assert!(resolve_executable(name).is_some());
    }

    #[test]
    fn empty_name_resolves_to_none() {
        assert!(resolve_executable("").is_none());
        assert!(resolve_executable("  ").is_none());
    }
}
