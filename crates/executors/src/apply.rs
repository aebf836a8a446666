//! Deterministic application of op batches.
//!
//! Application is two-phase: every op locates its anchor and the new file
//! states are computed in memory first; only then does anything touch the
//! filesystem. A batch that fails mid-validation therefore leaves the
//! worktree untouched, which the anchor-recovery ladder relies on.

use std::{
    fs,
    path::{Path, PathBuf},
};

use workspace_utils::path::validate_staging_path;

use crate::ops::{PatchError, PatchOp};

/// Byte index of the `occurrence`-th match of `needle`, scanning left to
/// right. The scan resumes one character past each hit, so overlapping
/// matches count: `"aa"` in `"aaaa"` with occurrence 2 lands on index 1.
pub fn find_nth_occurrence(haystack: &str, needle: &str, occurrence: u64) -> Option<usize> {
    if needle.is_empty() || occurrence == 0 {
        return None;
    }
    let mut from = 0usize;
    let mut seen = 0u64;
    while let Some(rel) = haystack[from..].find(needle) {
        let at = from + rel;
        seen += 1;
        if seen == occurrence {
            return Some(at);
        }
        let step = haystack[at..]
            .chars()
            .next()
            .map(char::len_utf8)
            .unwrap_or(1);
        from = at + step;
    }
    None
}

fn apply_textual_op(content: &str, op: &PatchOp, op_index: usize) -> Result<String, PatchError> {
    match op {
        PatchOp::Replace {
            path,
            old,
            new,
            occurrence,
        } => {
            let at = find_nth_occurrence(content, old, *occurrence)
                .ok_or_else(|| PatchError::anchor_not_found(op_index, path, old))?;
            Ok(format!(
                "{}{}{}",
                &content[..at],
                new,
                &content[at + old.len()..]
            ))
        }
        PatchOp::Delete {
            path,
            old,
            occurrence,
        } => {
            let at = find_nth_occurrence(content, old, *occurrence)
                .ok_or_else(|| PatchError::anchor_not_found(op_index, path, old))?;
            Ok(format!("{}{}", &content[..at], &content[at + old.len()..]))
        }
        PatchOp::InsertAfter {
            path,
            anchor,
            text,
            occurrence,
        } => {
            let at = find_nth_occurrence(content, anchor, *occurrence)
                .ok_or_else(|| PatchError::anchor_not_found(op_index, path, anchor))?;
            let after = at + anchor.len();
            Ok(format!(
                "{}{}{}",
                &content[..after],
                text,
                &content[after..]
            ))
        }
        PatchOp::Create { .. } | PatchOp::DeleteFile { .. } => Err(PatchError::ApplyFailed(
            format!("op #{op_index}: file-level op has no string-mode semantics"),
        )),
    }
}

/// Apply a batch of textual ops to one in-memory content, in declaration
/// order. The empty batch is the identity.
pub fn apply_ops_to_string(content: &str, ops: &[PatchOp]) -> Result<String, PatchError> {
    let mut current = content.to_string();
    for (idx, op) in ops.iter().enumerate() {
        current = apply_textual_op(&current, op, idx)?;
    }
    Ok(current)
}

enum PlannedWrite {
    Write(PathBuf, String),
    Unlink(PathBuf),
}

/// Apply a batch to worktree files. Ops are grouped by path, preserving
/// declaration order within each group:
///
/// - a group containing `delete_file` unlinks the file and skips its
///   textual ops;
/// - a group containing `create` starts from the created content (parent
///   directories are made on write) and applies the remaining textual ops;
/// - otherwise the file is read, patched in order, and written back.
///
/// Returns the touched paths in first-declaration order.
pub async fn apply_ops_to_worktree(
    worktree_root: &Path,
    ops: &[PatchOp],
) -> Result<Vec<String>, PatchError> {
    let root = worktree_root.to_path_buf();
    let ops = ops.to_vec();
    tokio::task::spawn_blocking(move || apply_ops_to_worktree_blocking(&root, &ops))
        .await
        .map_err(|e| PatchError::ApplyFailed(format!("apply task failed: {e}")))?
}

pub fn apply_ops_to_worktree_blocking(
    worktree_root: &Path,
    ops: &[PatchOp],
) -> Result<Vec<String>, PatchError> {
    let mut groups: Vec<(String, Vec<(usize, &PatchOp)>)> = Vec::new();
    for (idx, op) in ops.iter().enumerate() {
        match groups.iter_mut().find(|(p, _)| p == op.path()) {
            Some((_, group)) => group.push((idx, op)),
            None => groups.push((op.path().to_string(), vec![(idx, op)])),
        }
    }

    // Plan phase: resolve paths and compute final contents without writing.
    let mut plan: Vec<PlannedWrite> = Vec::new();
    for (path, group) in &groups {
        let abs = validate_staging_path(worktree_root, path)
            .map_err(|e| PatchError::ApplyFailed(e.to_string()))?;

        if group
            .iter()
            .any(|(_, op)| matches!(op, PatchOp::DeleteFile { .. }))
        {
            plan.push(PlannedWrite::Unlink(abs));
            continue;
        }

        let created = group.iter().find_map(|(_, op)| match op {
            PatchOp::Create { content, .. } => Some(content.clone()),
            _ => None,
        });
        let mut content = match created {
            Some(content) => content,
            None => fs::read_to_string(&abs)
                .map_err(|e| PatchError::ApplyFailed(format!("read {path}: {e}")))?,
        };
        for (idx, op) in group {
            if op.is_textual() {
                content = apply_textual_op(&content, op, *idx)?;
            }
        }
        plan.push(PlannedWrite::Write(abs, content));
    }

    // Commit phase.
    for planned in &plan {
        match planned {
            PlannedWrite::Write(abs, content) => {
                if let Some(parent) = abs.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| PatchError::ApplyFailed(format!("mkdir {}: {e}", parent.display())))?;
                }
                fs::write(abs, content)
                    .map_err(|e| PatchError::ApplyFailed(format!("write {}: {e}", abs.display())))?;
            }
            PlannedWrite::Unlink(abs) => {
                fs::remove_file(abs)
                    .map_err(|e| PatchError::ApplyFailed(format!("unlink {}: {e}", abs.display())))?;
            }
        }
    }

    Ok(groups.into_iter().map(|(path, _)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::parse_patch_ops;
    use tempfile::TempDir;

    fn replace(path: &str, old: &str, new: &str, occurrence: u64) -> PatchOp {
        PatchOp::Replace {
            path: path.into(),
            old: old.into(),
            new: new.into(),
            occurrence,
        }
    }

    #[test]
    fn empty_batch_is_identity() {
        assert_eq!(apply_ops_to_string("unchanged", &[]).unwrap(), "unchanged");
    }

    #[test]
    fn replace_targets_the_nth_occurrence() {
        let out = apply_ops_to_string("x = a; y = a; z = a;", &[replace("f", "a", "b", 2)]).unwrap();
        assert_eq!(out, "x = a; y = b; z = a;");
    }

    #[test]
    fn overlapping_matches_are_counted() {
        // Second hit of "aa" in "aaaa" is at index 1, not the next
        // non-overlapping position.
        assert_eq!(find_nth_occurrence("aaaa", "aa", 1), Some(0));
        assert_eq!(find_nth_occurrence("aaaa", "aa", 2), Some(1));
        assert_eq!(find_nth_occurrence("aaaa", "aa", 3), Some(2));
        assert_eq!(find_nth_occurrence("aaaa", "aa", 4), None);
    }

    #[test]
    fn multibyte_haystacks_step_by_whole_chars() {
        assert_eq!(find_nth_occurrence("é é é", "é", 2), Some(3));
        let out = apply_ops_to_string("é é", &[replace("f", "é", "e", 2)]).unwrap();
        assert_eq!(out, "é e");
    }

    #[test]
    fn too_few_occurrences_is_anchor_not_found() {
        let err = apply_ops_to_string("one a here", &[replace("f", "a", "b", 2)]).unwrap_err();
        assert_eq!(err.code(), "patch_anchor_not_found");
        match err {
            PatchError::AnchorNotFound {
                op_index, path, ..
            } => {
                assert_eq!(op_index, 0);
                assert_eq!(path, "f");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_needle_reports_a_truncated_preview() {
        let long_needle = "x".repeat(500);
        let err =
            apply_ops_to_string("short", &[replace("f", &long_needle, "y", 1)]).unwrap_err();
        match err {
            PatchError::AnchorNotFound { needle_preview, .. } => {
                assert!(needle_preview.len() <= 80);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn insert_after_lands_immediately_after_the_anchor() {
        let ops = vec![PatchOp::InsertAfter {
            path: "f".into(),
            anchor: "import a;".into(),
            text: "\nimport b;".into(),
            occurrence: 1,
        }];
        let out = apply_ops_to_string("import a;\ncode", &ops).unwrap();
        assert_eq!(out, "import a;\nimport b;\ncode");
    }

    #[test]
    fn delete_removes_exactly_the_needle() {
        let ops = vec![PatchOp::Delete {
            path: "f".into(),
            old: "dead();\n".into(),
            occurrence: 1,
        }];
        let out = apply_ops_to_string("live();\ndead();\nmore();\n", &ops).unwrap();
        assert_eq!(out, "live();\nmore();\n");
    }

    #[test]
    fn ops_within_a_file_apply_in_declaration_order() {
        let ops = vec![replace("f", "a", "b", 1), replace("f", "b", "c", 1)];
        let out = apply_ops_to_string("a", &ops).unwrap();
        assert_eq!(out, "c");
    }

    #[tokio::test]
    async fn worktree_apply_handles_create_modify_delete() {
        let td = TempDir::new().unwrap();
        std::fs::write(td.path().join("keep.js"), "let v = 1;\n").unwrap();
        std::fs::write(td.path().join("gone.js"), "obsolete\n").unwrap();

        let raw = r#"[
            {"kind": "create", "path": "sub/fresh.js", "content": "export const x = 1;\n"},
            {"kind": "replace", "path": "sub/fresh.js", "old": "x = 1", "new": "x = 2"},
            {"kind": "replace", "path": "keep.js", "old": "v = 1", "new": "v = 9"},
            {"kind": "delete_file", "path": "gone.js"}
        ]"#;
        let ops = parse_patch_ops(raw, td.path()).unwrap();
        let touched = apply_ops_to_worktree(td.path(), &ops).await.unwrap();

        assert_eq!(touched, vec!["sub/fresh.js", "keep.js", "gone.js"]);
        assert_eq!(
            std::fs::read_to_string(td.path().join("sub/fresh.js")).unwrap(),
            "export const x = 2;\n"
        );
        assert_eq!(
            std::fs::read_to_string(td.path().join("keep.js")).unwrap(),
            "let v = 9;\n"
        );
        assert!(!td.path().join("gone.js").exists());
    }

    #[tokio::test]
    async fn delete_file_wins_over_textual_ops_on_the_same_path() {
        let td = TempDir::new().unwrap();
        std::fs::write(td.path().join("a.js"), "content\n").unwrap();
        let ops = vec![
            replace("a.js", "content", "patched", 1),
            PatchOp::DeleteFile { path: "a.js".into() },
        ];
        apply_ops_to_worktree(td.path(), &ops).await.unwrap();
        assert!(!td.path().join("a.js").exists());
    }

    #[tokio::test]
    async fn failed_batch_leaves_the_worktree_untouched() {
        let td = TempDir::new().unwrap();
        std::fs::write(td.path().join("a.js"), "alpha\n").unwrap();
        std::fs::write(td.path().join("b.js"), "beta\n").unwrap();
        let ops = vec![
            replace("a.js", "alpha", "ALPHA", 1),
            replace("b.js", "no such anchor", "x", 1),
        ];
        let err = apply_ops_to_worktree(td.path(), &ops).await.unwrap_err();
        assert_eq!(err.code(), "patch_anchor_not_found");
        // The valid first op must not have been committed.
        assert_eq!(
            std::fs::read_to_string(td.path().join("a.js")).unwrap(),
            "alpha\n"
        );
    }

    #[tokio::test]
    async fn string_and_worktree_application_agree() {
        let td = TempDir::new().unwrap();
        let original = "fn a() {}\nfn b() {}\nfn a_caller() { a(); }\n";
        std::fs::write(td.path().join("m.rs"), original).unwrap();
        let ops = vec![
            replace("m.rs", "fn a()", "fn renamed()", 1),
            replace("m.rs", "a();", "renamed();", 1),
        ];
        let via_string = apply_ops_to_string(original, &ops).unwrap();
        apply_ops_to_worktree(td.path(), &ops).await.unwrap();
        let via_worktree = std::fs::read_to_string(td.path().join("m.rs")).unwrap();
        assert_eq!(via_string, via_worktree);
    }

    #[tokio::test]
    async fn missing_file_is_apply_failed_not_anchor() {
        let td = TempDir::new().unwrap();
        let ops = vec![replace("absent.js", "x", "y", 1)];
        let err = apply_ops_to_worktree(td.path(), &ops).await.unwrap_err();
        assert_eq!(err.code(), "ops_apply_failed");
    }
}
