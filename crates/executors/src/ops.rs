//! Patch-op codec: the typed form of the model's edit output.
//!
//! Ops address their edit sites by snippet, not by line number, so a batch
//! survives unrelated drift in the file. Parsing is the single validation
//! surface: anything that got through [`parse_patch_ops`] is safe to hand to
//! the applier.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use workspace_utils::{path::validate_staging_path, text::truncate_to_char_boundary};

const NEEDLE_PREVIEW_MAX: usize = 80;

fn default_occurrence() -> u64 {
    1
}

/// One edit. `occurrence` selects the *n*-th match (1-indexed) when the
/// needle repeats; overlapping matches count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchOp {
    Replace {
        path: String,
        old: String,
        new: String,
        #[serde(default = "default_occurrence")]
        occurrence: u64,
    },
    InsertAfter {
        path: String,
        anchor: String,
        text: String,
        #[serde(default = "default_occurrence")]
        occurrence: u64,
    },
    Delete {
        path: String,
        old: String,
        #[serde(default = "default_occurrence")]
        occurrence: u64,
    },
    Create {
        path: String,
        content: String,
    },
    DeleteFile {
        path: String,
    },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Replace { path, .. }
            | PatchOp::InsertAfter { path, .. }
            | PatchOp::Delete { path, .. }
            | PatchOp::Create { path, .. }
            | PatchOp::DeleteFile { path } => path,
        }
    }

    pub fn occurrence(&self) -> Option<u64> {
        match self {
            PatchOp::Replace { occurrence, .. }
            | PatchOp::InsertAfter { occurrence, .. }
            | PatchOp::Delete { occurrence, .. } => Some(*occurrence),
            PatchOp::Create { .. } | PatchOp::DeleteFile { .. } => None,
        }
    }

    /// True for the snippet-addressed kinds that rewrite file text in place.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            PatchOp::Replace { .. } | PatchOp::InsertAfter { .. } | PatchOp::Delete { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("model output is not valid patch JSON: {detail}")]
    JsonInvalid { detail: String, model_declared: bool },
    #[error("patch schema invalid: {0}")]
    SchemaInvalid(String),
    #[error("anchor not found for op #{op_index} on {path}: {needle_preview:?}")]
    AnchorNotFound {
        op_index: usize,
        path: String,
        needle_preview: String,
    },
    #[error("failed to apply ops: {0}")]
    ApplyFailed(String),
}

impl PatchError {
    /// Stable error-taxonomy tag.
    pub fn code(&self) -> &'static str {
        match self {
            PatchError::JsonInvalid { .. } => "patch_json_invalid",
            PatchError::SchemaInvalid(_) => "patch_schema_invalid",
            PatchError::AnchorNotFound { .. } => "patch_anchor_not_found",
            PatchError::ApplyFailed(_) => "ops_apply_failed",
        }
    }

    /// True when the model returned `{"error": "..."}` instead of ops.
    pub fn is_model_declared(&self) -> bool {
        matches!(
            self,
            PatchError::JsonInvalid {
                model_declared: true,
                ..
            }
        )
    }

    pub(crate) fn anchor_not_found(op_index: usize, path: &str, needle: &str) -> Self {
        PatchError::AnchorNotFound {
            op_index,
            path: path.to_string(),
            needle_preview: truncate_to_char_boundary(needle, NEEDLE_PREVIEW_MAX).to_string(),
        }
    }
}

/// Parse raw model text into a validated op batch.
///
/// Accepts a bare JSON array, or `{"error": "<reason>"}` as a model-declared
/// failure. Any other top-level shape is a schema error.
pub fn parse_patch_ops(raw: &str, worktree_root: &Path) -> Result<Vec<PatchOp>, PatchError> {
    let value: Value = serde_json::from_str(raw.trim()).map_err(|e| PatchError::JsonInvalid {
        detail: e.to_string(),
        model_declared: false,
    })?;
    parse_patch_ops_value(&value, worktree_root)
}

/// Parse an already-decoded JSON value (the `submit_ops` tool input path).
pub fn parse_patch_ops_value(
    value: &Value,
    worktree_root: &Path,
) -> Result<Vec<PatchOp>, PatchError> {
    if let Some(obj) = value.as_object()
        && let Some(reason) = obj.get("error").and_then(Value::as_str)
    {
        return Err(PatchError::JsonInvalid {
            detail: reason.to_string(),
            model_declared: true,
        });
    }
    let Some(items) = value.as_array() else {
        return Err(PatchError::SchemaInvalid(
            "top-level value must be an array of ops".to_string(),
        ));
    };

    let mut ops = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let op: PatchOp = serde_json::from_value(item.clone())
            .map_err(|e| PatchError::SchemaInvalid(format!("op #{idx}: {e}")))?;
        ops.push(op);
    }
    validate_batch(&ops, worktree_root)?;
    Ok(ops)
}

fn validate_batch(ops: &[PatchOp], worktree_root: &Path) -> Result<(), PatchError> {
    for (idx, op) in ops.iter().enumerate() {
        if op.occurrence() == Some(0) {
            return Err(PatchError::SchemaInvalid(format!(
                "op #{idx}: occurrence must be a positive integer"
            )));
        }
        validate_staging_path(worktree_root, op.path())
            .map_err(|e| PatchError::SchemaInvalid(format!("op #{idx}: {e}")))?;
    }
    // Creating and deleting the same path in one batch has no coherent
    // ordering; reject it outright.
    for (idx, op) in ops.iter().enumerate() {
        if matches!(op, PatchOp::Create { .. })
            && ops
                .iter()
                .any(|other| matches!(other, PatchOp::DeleteFile { path } if path == op.path()))
        {
            return Err(PatchError::SchemaInvalid(format!(
                "op #{idx}: create and delete_file both target {}",
                op.path()
            )));
        }
    }
    Ok(())
}

/// Ordered unique set of paths an op batch touches. `delete_file` paths are
/// included: a deleted path still counts as changed for the next iteration's
/// context.
pub fn changed_paths(ops: &[PatchOp]) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for op in ops {
        if !paths.iter().any(|p| p == op.path()) {
            paths.push(op.path().to_string());
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> std::path::PathBuf {
        if cfg!(windows) {
            std::path::PathBuf::from("C:\\wt")
        } else {
            std::path::PathBuf::from("/wt")
        }
    }

    #[test]
    fn parses_all_five_kinds() {
        let raw = r#"[
            {"kind": "replace", "path": "a.js", "old": "x", "new": "y"},
            {"kind": "insert_after", "path": "a.js", "anchor": "x", "text": "z", "occurrence": 2},
            {"kind": "delete", "path": "b.js", "old": "dead"},
            {"kind": "create", "path": "c.js", "content": "new file"},
            {"kind": "delete_file", "path": "d.js"}
        ]"#;
        let ops = parse_patch_ops(raw, &root()).unwrap();
        assert_eq!(ops.len(), 5);
        assert_eq!(ops[0].occurrence(), Some(1), "occurrence defaults to 1");
        assert_eq!(ops[1].occurrence(), Some(2));
        assert_eq!(ops[4], PatchOp::DeleteFile { path: "d.js".into() });
    }

    #[test]
    fn non_json_is_json_invalid() {
        let err = parse_patch_ops("not json at all", &root()).unwrap_err();
        assert_eq!(err.code(), "patch_json_invalid");
        assert!(!err.is_model_declared());
    }

    #[test]
    fn error_object_is_model_declared() {
        let err = parse_patch_ops(r#"{"error": "file looks unrelated to the plan"}"#, &root())
            .unwrap_err();
        assert_eq!(err.code(), "patch_json_invalid");
        assert!(err.is_model_declared());
    }

    #[test]
    fn non_array_top_level_is_schema_invalid() {
        let err = parse_patch_ops(r#"{"kind": "replace"}"#, &root()).unwrap_err();
        assert_eq!(err.code(), "patch_schema_invalid");
        let err = parse_patch_ops("42", &root()).unwrap_err();
        assert_eq!(err.code(), "patch_schema_invalid");
    }

    #[test]
    fn unknown_kind_and_missing_fields_are_schema_invalid() {
        let err = parse_patch_ops(r#"[{"kind": "rename", "path": "a.js"}]"#, &root()).unwrap_err();
        assert_eq!(err.code(), "patch_schema_invalid");
        let err =
            parse_patch_ops(r#"[{"kind": "replace", "path": "a.js", "old": "x"}]"#, &root())
                .unwrap_err();
        assert_eq!(err.code(), "patch_schema_invalid");
    }

    #[test]
    fn occurrence_must_be_positive() {
        let err = parse_patch_ops(
            r#"[{"kind": "replace", "path": "a.js", "old": "x", "new": "y", "occurrence": 0}]"#,
            &root(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "patch_schema_invalid");
        let err = parse_patch_ops(
            r#"[{"kind": "replace", "path": "a.js", "old": "x", "new": "y", "occurrence": -1}]"#,
            &root(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "patch_schema_invalid");
    }

    #[test]
    fn unsafe_paths_are_schema_invalid() {
        for path in ["../escape.js", "/abs.js", ".git/hooks/x", "a\\..\\b"] {
            let raw = format!(r#"[{{"kind": "delete_file", "path": "{}"}}]"#, path.replace('\\', "\\\\"));
            let err = parse_patch_ops(&raw, &root()).unwrap_err();
            assert_eq!(err.code(), "patch_schema_invalid", "path {path} got through");
        }
    }

    #[test]
    fn create_plus_delete_file_conflict_is_rejected() {
        let raw = r#"[
            {"kind": "create", "path": "a.js", "content": "x"},
            {"kind": "delete_file", "path": "a.js"}
        ]"#;
        let err = parse_patch_ops(raw, &root()).unwrap_err();
        assert_eq!(err.code(), "patch_schema_invalid");
    }

    #[test]
    fn parsed_ops_round_trip_through_json() {
        let raw = r#"[
            {"kind": "replace", "path": "a.js", "old": "x", "new": "y", "occurrence": 3},
            {"kind": "create", "path": "c.js", "content": "body"}
        ]"#;
        let ops = parse_patch_ops(raw, &root()).unwrap();
        let serialised = serde_json::to_string(&ops).unwrap();
        let reparsed = parse_patch_ops(&serialised, &root()).unwrap();
        assert_eq!(ops, reparsed);
    }

    #[test]
    fn changed_paths_is_ordered_unique_and_includes_deletions() {
        let raw = r#"[
            {"kind": "replace", "path": "a.js", "old": "x", "new": "y"},
            {"kind": "delete_file", "path": "b.js"},
            {"kind": "delete", "path": "a.js", "old": "z"}
        ]"#;
        let ops = parse_patch_ops(raw, &root()).unwrap();
        assert_eq!(changed_paths(&ops), vec!["a.js", "b.js"]);
    }
}
