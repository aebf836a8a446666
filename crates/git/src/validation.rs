use regex::Regex;
use std::sync::OnceLock;

fn branch_charset() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._/-]+$").unwrap())
}

/// Validate a branch name against the character allowlist plus the refname
/// rules git itself enforces: no leading `-`, no trailing `.lock`, no `..`,
/// no `@{`, and never the literal `HEAD`.
pub fn is_valid_branch_name(name: &str) -> bool {
    if name.is_empty() || name == "HEAD" {
        return false;
    }
    if name.starts_with('-') || name.ends_with(".lock") {
        return false;
    }
    if name.contains("..") || name.contains("@{") {
        return false;
    }
    branch_charset().is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_branch_name("main"));
        assert!(is_valid_branch_name("feature/repair-loop"));
        assert!(is_valid_branch_name("hotfix-123"));
        assert!(is_valid_branch_name("foo.bar"));
        assert!(is_valid_branch_name("foo_bar"));
        assert!(is_valid_branch_name("FOO-Bar"));
        assert!(is_valid_branch_name("head"));
    }

    #[test]
    fn test_invalid_names() {
        assert!(!is_valid_branch_name(""));
        assert!(!is_valid_branch_name("HEAD"));
        assert!(!is_valid_branch_name("-leading-dash"));
        assert!(!is_valid_branch_name("foo.lock"));
        assert!(!is_valid_branch_name("foo..bar"));
        assert!(!is_valid_branch_name("foo@{1}"));
        assert!(!is_valid_branch_name("foo bar"));
        assert!(!is_valid_branch_name("foo?"));
        assert!(!is_valid_branch_name("foo*"));
        assert!(!is_valid_branch_name("foo~"));
        assert!(!is_valid_branch_name("foo^"));
        assert!(!is_valid_branch_name("foo:"));
        assert!(!is_valid_branch_name("foo["));
    }
}
