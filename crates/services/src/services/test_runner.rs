//! Test execution, failure parsing, and progress comparison.
//!
//! The runner executes the caller's test command inside the worktree (a
//! shell string by contract, unbounded runtime by design) and condenses the
//! outcome into a [`TestResult`]. Parsing is heuristic: a framework tag, a
//! failure count (`-1` when unparseable, approximate when only a loose parse
//! matched), a bounded excerpt, and a set of failure signatures used to tell
//! "same bug" from "different bug at the same count".

use std::{collections::BTreeSet, path::Path, sync::OnceLock, time::Instant};

use executors::generator::{CodeRef, FailureContext};
use regex::Regex;
use serde::Serialize;
use strum_macros::Display;
use thiserror::Error;
use utils::{
    env::EnvPolicy,
    path::validate_staging_path,
    shell::get_shell_command,
    text::tail_to_char_boundary,
};

pub const EXCERPT_MAX_CHARS: usize = 4_000;
const ENRICH_MAX_REFS: usize = 5;
const ENRICH_CONTEXT_LINES: usize = 3;

#[derive(Debug, Error)]
pub enum TestRunnerError {
    #[error("failed to spawn test command: {0}")]
    Spawn(std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub exit_code: i64,
    /// `-1` means the output could not be parsed into a count.
    pub failure_count: i64,
    pub failure_count_approx: bool,
    pub framework: String,
    pub duration_ms: u64,
    pub excerpt: String,
    /// Normalised failing-test identifiers; not part of the event contract.
    #[serde(skip)]
    pub failure_signatures: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Delta {
    Improved,
    Same,
    Worse,
}

pub struct TestRunner {
    env: EnvPolicy,
}

impl TestRunner {
    pub fn new(env: EnvPolicy) -> Self {
        Self { env }
    }

    /// Run the test command in the worktree and parse the outcome.
    pub async fn run(&self, worktree: &Path, test_cmd: &str) -> Result<TestResult, TestRunnerError> {
        let (shell, flag) = get_shell_command();
        let started = Instant::now();
        let mut cmd = tokio::process::Command::new(shell);
        cmd.arg(flag)
            .arg(test_cmd)
            .current_dir(worktree)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        self.env.apply_to_tokio_command(&mut cmd);

        let out = cmd.output().await.map_err(TestRunnerError::Spawn)?;
        let duration_ms = started.elapsed().as_millis() as u64;
        let exit_code = i64::from(out.status.code().unwrap_or(-1));

        let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        Ok(parse_test_output(exit_code, duration_ms, &combined))
    }
}

/// Pure parsing half of the runner, split out for testability.
pub fn parse_test_output(exit_code: i64, duration_ms: u64, raw: &str) -> TestResult {
    let clean = strip_ansi(raw);
    let framework = detect_framework(&clean);
    let (failure_count, failure_count_approx) =
        parse_failure_count(framework, &clean, exit_code);
    let failure_signatures = failure_signatures(framework, &clean);
    TestResult {
        exit_code,
        failure_count,
        failure_count_approx,
        framework: framework.to_string(),
        duration_ms,
        excerpt: tail_to_char_boundary(&clean, EXCERPT_MAX_CHARS).to_string(),
        failure_signatures,
    }
}

fn strip_ansi(raw: &str) -> String {
    String::from_utf8_lossy(&strip_ansi_escapes::strip(raw.as_bytes())).into_owned()
}

fn detect_framework(output: &str) -> &'static str {
    static PYTEST_BAR: OnceLock<Regex> = OnceLock::new();
    let pytest_bar =
        PYTEST_BAR.get_or_init(|| Regex::new(r"=+ .*(passed|failed|error).* =+").unwrap());

    if output.contains("Test Files") {
        "vitest"
    } else if output.contains("Test Suites:") || output.contains("Ran all test suites") {
        "jest"
    } else if Regex::new(r"\d+ (passing|failing|pending)")
        .map(|re| re.is_match(output))
        .unwrap_or(false)
    {
        "mocha"
    } else if output.contains("short test summary info") || pytest_bar.is_match(output) {
        "pytest"
    } else if output.contains("test result:") {
        "cargo"
    } else if output.contains("--- FAIL:") || output.contains("--- PASS:") {
        "go"
    } else {
        "unknown"
    }
}

fn parse_failure_count(framework: &str, output: &str, exit_code: i64) -> (i64, bool) {
    if exit_code == 0 {
        return (0, false);
    }
    let exact = match framework {
        "jest" => capture_count(output, r"Tests:.*?(\d+) failed"),
        "vitest" => capture_count(output, r"Tests\s+(\d+) failed"),
        "mocha" => capture_count(output, r"(\d+) failing"),
        "pytest" => capture_count(output, r"(\d+) failed"),
        "cargo" => capture_count(output, r"(\d+) failed"),
        "go" => Some(output.matches("--- FAIL:").count() as i64),
        _ => None,
    };
    if let Some(count) = exact {
        return (count, false);
    }
    // Loose fallback: count lines that look like individual failures.
    let loose = output
        .lines()
        .filter(|line| loose_fail_marker().is_match(line))
        .count() as i64;
    if loose > 0 { (loose, true) } else { (-1, false) }
}

fn capture_count(output: &str, pattern: &str) -> Option<i64> {
    let re = Regex::new(pattern).ok()?;
    re.captures(output)?.get(1)?.as_str().parse().ok()
}

fn loose_fail_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(✗|✕|\bFAILED\b|\bFAIL\b)").unwrap())
}

/// Lines identifying individual failing tests, normalised so reordering and
/// timing noise do not change the set.
fn failure_signatures(framework: &str, output: &str) -> BTreeSet<String> {
    static MOCHA_ITEM: OnceLock<Regex> = OnceLock::new();
    static CARGO_ITEM: OnceLock<Regex> = OnceLock::new();
    let mocha_item = MOCHA_ITEM.get_or_init(|| Regex::new(r"^\s*\d+\)\s").unwrap());
    let cargo_item =
        CARGO_ITEM.get_or_init(|| Regex::new(r"^test .+ \.\.\. FAILED$").unwrap());

    output
        .lines()
        .filter(|line| match framework {
            "jest" | "vitest" => {
                line.contains('✕') || line.contains('✗') || line.trim_start().starts_with("FAIL ")
            }
            "mocha" => mocha_item.is_match(line),
            "pytest" => line.starts_with("FAILED "),
            "cargo" => cargo_item.is_match(line.trim_end()),
            "go" => line.trim_start().starts_with("--- FAIL:"),
            _ => loose_fail_marker().is_match(line),
        })
        .map(normalise_signature)
        .collect()
}

fn normalise_signature(line: &str) -> String {
    static ORDINAL: OnceLock<Regex> = OnceLock::new();
    static DURATION: OnceLock<Regex> = OnceLock::new();
    let ordinal = ORDINAL.get_or_init(|| Regex::new(r"^\d+\)\s*").unwrap());
    let duration = DURATION.get_or_init(|| Regex::new(r"\(\d+(\.\d+)?\s*m?s\)").unwrap());

    let trimmed = line.trim();
    let without_ordinal = ordinal.replace(trimmed, "");
    let without_duration = duration.replace_all(&without_ordinal, "()");
    without_duration.to_lowercase()
}

/// Map two adjacent results to a progress delta. `None` when either count is
/// unparseable. Equal counts with *different* failure signatures count as
/// improvement: progress is measured by the bug set changing, not only by
/// the count dropping.
pub fn compare_results(prev: &TestResult, curr: &TestResult) -> Option<Delta> {
    if prev.failure_count < 0 || curr.failure_count < 0 {
        return None;
    }
    if curr.failure_count < prev.failure_count {
        Some(Delta::Improved)
    } else if curr.failure_count > prev.failure_count {
        Some(Delta::Worse)
    } else if prev.failure_signatures != curr.failure_signatures {
        Some(Delta::Improved)
    } else {
        Some(Delta::Same)
    }
}

/// Scan a failure excerpt for `path:line` references and attach a small code
/// snippet for each one that resolves inside the worktree. At most
/// [`ENRICH_MAX_REFS`] refs; references that fail the path guard are
/// skipped, not errors.
pub fn enrich_failure(worktree: &Path, excerpt: &str) -> FailureContext {
    static REF: OnceLock<Regex> = OnceLock::new();
    let reference =
        REF.get_or_init(|| Regex::new(r"([A-Za-z0-9_./\\-]+\.[A-Za-z0-9]+):(\d+)").unwrap());

    let mut refs: Vec<CodeRef> = Vec::new();
    let mut seen: BTreeSet<(String, usize)> = BTreeSet::new();

    for caps in reference.captures_iter(excerpt) {
        if refs.len() >= ENRICH_MAX_REFS {
            break;
        }
        let raw_path = &caps[1];
        let Ok(line) = caps[2].parse::<usize>() else {
            continue;
        };
        if line == 0 {
            continue;
        }

        // Stack traces cite absolute paths; bring them back inside the
        // worktree before the guard sees them.
        let rel = match Path::new(raw_path).strip_prefix(worktree) {
            Ok(stripped) => stripped.to_string_lossy().into_owned(),
            Err(_) => raw_path.to_string(),
        };
        let Ok(abs) = validate_staging_path(worktree, &rel) else {
            continue;
        };
        if !seen.insert((rel.clone(), line)) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&abs) else {
            continue;
        };
        let lines: Vec<&str> = content.lines().collect();
        if line > lines.len() {
            continue;
        }
        let start = line.saturating_sub(ENRICH_CONTEXT_LINES + 1);
        let end = (line + ENRICH_CONTEXT_LINES).min(lines.len());
        let snippet = lines[start..end]
            .iter()
            .enumerate()
            .map(|(offset, text)| format!("{:>5} | {}", start + offset + 1, text))
            .collect::<Vec<_>>()
            .join("\n");
        refs.push(CodeRef {
            path: rel,
            line,
            snippet,
        });
    }

    FailureContext {
        excerpt: excerpt.to_string(),
        refs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JEST_FAILURE: &str = "\
 FAIL  src/__tests__/formatter.test.js
  ● formatter › rounds to two decimals

    expect(received).toBe(expected)

      at Object.<anonymous> (src/__tests__/formatter.test.js:12:20)

Test Suites: 1 failed, 1 total
Tests:       2 failed, 3 passed, 5 total
Snapshots:   0 total
Time:        1.2 s
Ran all test suites.
";

    #[test]
    fn jest_output_is_parsed_exactly() {
        let result = parse_test_output(1, 1200, JEST_FAILURE);
        assert_eq!(result.framework, "jest");
        assert_eq!(result.failure_count, 2);
        assert!(!result.failure_count_approx);
    }

    #[test]
    fn vitest_output_is_parsed_exactly() {
        let out = "\
 ❯ src/a.test.ts (3 tests | 1 failed)
   ✕ handles negative input

 Test Files  1 failed (1)
      Tests  1 failed | 2 passed (3)
";
        let result = parse_test_output(1, 10, out);
        assert_eq!(result.framework, "vitest");
        assert_eq!(result.failure_count, 1);
        assert!(!result.failure_count_approx);
        assert_eq!(result.failure_signatures.len(), 1);
    }

    #[test]
    fn mocha_output_is_parsed_exactly() {
        let out = "\
  formatter
    1) rounds to two decimals
    2) keeps sign

  1 passing (12ms)
  2 failing
";
        let result = parse_test_output(2, 12, out);
        assert_eq!(result.framework, "mocha");
        assert_eq!(result.failure_count, 2);
        assert_eq!(result.failure_signatures.len(), 2);
    }

    #[test]
    fn pytest_output_is_parsed_exactly() {
        let out = "\
=================================== FAILURES ===================================
________________________________ test_rounding _________________________________
E   assert 1.0 == 1.01
=========================== short test summary info ============================
FAILED tests/test_fmt.py::test_rounding - assert 1.0 == 1.01
========================= 1 failed, 4 passed in 0.21s ==========================
";
        let result = parse_test_output(1, 210, out);
        assert_eq!(result.framework, "pytest");
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.failure_signatures.len(), 1);
    }

    #[test]
    fn cargo_output_is_parsed_exactly() {
        let out = "\
running 3 tests
test fmt::rounds ... FAILED
test fmt::sign ... ok
test fmt::zero ... ok

test result: FAILED. 2 passed; 1 failed; 0 ignored; 0 measured; 0 filtered out
";
        let result = parse_test_output(101, 5, out);
        assert_eq!(result.framework, "cargo");
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.failure_signatures.len(), 1);
    }

    #[test]
    fn go_failures_are_counted_per_marker() {
        let out = "\
--- FAIL: TestRound (0.00s)
--- FAIL: TestSign (0.00s)
FAIL
FAIL\texample.com/fmt\t0.01s
";
        let result = parse_test_output(1, 10, out);
        assert_eq!(result.framework, "go");
        assert_eq!(result.failure_count, 2);
        assert!(!result.failure_count_approx);
    }

    #[test]
    fn unknown_output_falls_back_to_loose_count_or_unparseable() {
        let loose = parse_test_output(1, 1, "something FAILED here\nand FAILED there\n");
        assert_eq!(loose.framework, "unknown");
        assert_eq!(loose.failure_count, 2);
        assert!(loose.failure_count_approx);

        let opaque = parse_test_output(1, 1, "segmentation fault\n");
        assert_eq!(opaque.failure_count, -1);
        assert!(!opaque.failure_count_approx);
    }

    #[test]
    fn passing_run_counts_zero_failures() {
        let result = parse_test_output(0, 1, "Tests: 5 passed, 5 total\nTest Suites: 1 passed\n");
        assert_eq!(result.failure_count, 0);
        assert!(!result.failure_count_approx);
    }

    #[test]
    fn ansi_colour_is_stripped_before_parsing() {
        let out = "\x1b[31mTests:       1 failed\x1b[0m, 1 total\nTest Suites: 1 failed\n";
        let result = parse_test_output(1, 1, out);
        assert_eq!(result.framework, "jest");
        assert_eq!(result.failure_count, 1);
        assert!(!result.excerpt.contains('\x1b'));
    }

    fn result_with(failures: i64, signatures: &[&str]) -> TestResult {
        TestResult {
            exit_code: if failures == 0 { 0 } else { 1 },
            failure_count: failures,
            failure_count_approx: false,
            framework: "jest".to_string(),
            duration_ms: 1,
            excerpt: String::new(),
            failure_signatures: signatures.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn comparer_follows_the_count_rule() {
        let prev = result_with(3, &["a", "b", "c"]);
        assert_eq!(
            compare_results(&prev, &result_with(1, &["a"])),
            Some(Delta::Improved)
        );
        assert_eq!(
            compare_results(&prev, &result_with(5, &["a", "b", "c", "d", "e"])),
            Some(Delta::Worse)
        );
        assert_eq!(
            compare_results(&prev, &result_with(3, &["a", "b", "c"])),
            Some(Delta::Same)
        );
    }

    #[test]
    fn equal_count_with_different_signatures_is_improvement() {
        let prev = result_with(2, &["✕ a", "✕ b"]);
        let curr = result_with(2, &["✕ b", "✕ c"]);
        assert_eq!(compare_results(&prev, &curr), Some(Delta::Improved));
    }

    #[test]
    fn unparseable_counts_compare_to_none() {
        let prev = result_with(-1, &[]);
        let curr = result_with(2, &["x"]);
        assert_eq!(compare_results(&prev, &curr), None);
        assert_eq!(compare_results(&curr, &prev), None);
    }

    #[test]
    fn signature_normalisation_ignores_ordinals_and_durations() {
        assert_eq!(
            normalise_signature("  1) Formatter rounds (23ms)"),
            normalise_signature("  2) formatter ROUNDS (41ms)")
        );
    }

    #[test]
    fn enrichment_reads_snippets_for_worktree_refs() {
        let td = tempfile::TempDir::new().unwrap();
        std::fs::write(
            td.path().join("app.js"),
            "l1\nl2\nl3\nl4\nl5\nl6\nl7\nl8\n",
        )
        .unwrap();

        let excerpt = format!(
            "at broke (app.js:5:3)\nat outside (/etc/shadow.conf:1)\nat gone (missing.js:2)\nat abs ({}/app.js:2:1)",
            td.path().display()
        );
        let enriched = enrich_failure(td.path(), &excerpt);
        assert_eq!(enriched.refs.len(), 2);
        assert_eq!(enriched.refs[0].path, "app.js");
        assert_eq!(enriched.refs[0].line, 5);
        assert!(enriched.refs[0].snippet.contains("5 | l5"));
        assert!(enriched.refs[0].snippet.contains("2 | l2"));
        assert!(enriched.refs[0].snippet.contains("8 | l8"));
        assert_eq!(enriched.refs[1].line, 2);
    }
}
