//! Anchor-recovery ladder.
//!
//! Entered when an op batch fails to apply because an anchor no longer
//! matches the file. Three rungs, all within the same iteration:
//!
//! 1. the ordinary apply of the generator's ops;
//! 2. B1 — regenerate with the anchor error spelled out in the context;
//! 3. B2 — tool-free full-file rewrite of the failing file, then apply the
//!    remaining ops that target other files.
//!
//! When a rung fails in a way the ladder cannot absorb, the error surfaced
//! is the *anchor* error that put us on that rung, not the internal failure
//! of the rung itself.

use std::path::Path;

use executors::{
    apply::apply_ops_to_worktree,
    generator::{AnchorError, IterationContext, OpsGenerator},
    ops::{PatchError, PatchOp},
};
use tracing::warn;
use utils::path::validate_staging_path;

use crate::services::events::{EventSender, RepairEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryFailureKind {
    /// The ladder was exhausted by anchor misses.
    InvalidAnchor,
    /// A non-anchor failure (I/O, unsafe path) stopped an apply.
    ApplyFailed,
}

#[derive(Debug)]
pub struct RecoveryFailure {
    pub kind: RecoveryFailureKind,
    pub error: PatchError,
    /// The batch that was being applied when the ladder gave up.
    pub last_ops: Vec<PatchOp>,
}

impl RecoveryFailure {
    pub fn code(&self) -> &'static str {
        match self.kind {
            RecoveryFailureKind::InvalidAnchor => "ops_invalid_anchor",
            RecoveryFailureKind::ApplyFailed => "ops_apply_failed",
        }
    }
}

#[derive(Debug)]
pub struct RecoveryOutcome {
    /// The batch that ultimately applied (B1's regenerated ops when it ran).
    pub ops: Vec<PatchOp>,
    pub applied_paths: Vec<String>,
    /// Path rewritten whole by B2, when that rung ran.
    pub rewritten: Option<String>,
}

/// Apply `ops`, climbing the recovery ladder on anchor misses.
pub async fn apply_with_recovery(
    generator: &OpsGenerator<'_>,
    worktree_root: &Path,
    ops: Vec<PatchOp>,
    base_ctx: &IterationContext,
    events: &EventSender,
) -> Result<RecoveryOutcome, RecoveryFailure> {
    // Rung 1: plain apply.
    let first_error = match apply_ops_to_worktree(worktree_root, &ops).await {
        Ok(applied_paths) => {
            return Ok(RecoveryOutcome {
                ops,
                applied_paths,
                rewritten: None,
            });
        }
        Err(err @ PatchError::AnchorNotFound { .. }) => err,
        Err(err) => {
            return Err(RecoveryFailure {
                kind: RecoveryFailureKind::ApplyFailed,
                error: err,
                last_ops: ops,
            });
        }
    };

    // Rung 2 (B1): regenerate with the anchor error in context.
    let (path, op_index) = anchor_site(&first_error);
    events.send(RepairEvent::AnchorRetry {
        attempt: 1,
        path: path.clone(),
        op_index,
    });
    let mut retry_ctx = base_ctx.clone();
    retry_ctx.previous_ops = Some(ops.clone());
    retry_ctx.anchor_error = Some(AnchorError {
        path,
        op_index,
        message: first_error.to_string(),
    });

    let regenerated = match generator.generate(&retry_ctx).await {
        Ok(regenerated) => regenerated,
        Err(gen_err) => {
            // The regeneration failure is not the story; the anchor miss is.
            warn!("anchor-retry generation failed, surfacing the original anchor error: {gen_err}");
            return Err(RecoveryFailure {
                kind: RecoveryFailureKind::InvalidAnchor,
                error: first_error,
                last_ops: ops,
            });
        }
    };

    let second_error = match apply_ops_to_worktree(worktree_root, &regenerated).await {
        Ok(applied_paths) => {
            return Ok(RecoveryOutcome {
                ops: regenerated,
                applied_paths,
                rewritten: None,
            });
        }
        Err(err @ PatchError::AnchorNotFound { .. }) => err,
        Err(err) => {
            return Err(RecoveryFailure {
                kind: RecoveryFailureKind::ApplyFailed,
                error: err,
                last_ops: regenerated,
            });
        }
    };

    // Rung 3 (B2): rewrite the failing file whole.
    let (rewrite_path, _) = anchor_site(&second_error);
    events.send(RepairEvent::AnchorFallback {
        attempt: 2,
        path: rewrite_path.clone(),
    });

    let invalid_anchor = |error: PatchError, last_ops: Vec<PatchOp>| RecoveryFailure {
        kind: RecoveryFailureKind::InvalidAnchor,
        error,
        last_ops,
    };

    let abs = match validate_staging_path(worktree_root, &rewrite_path) {
        Ok(abs) => abs,
        Err(e) => {
            warn!("rewrite target failed the path guard: {e}");
            return Err(invalid_anchor(second_error, regenerated));
        }
    };
    let current = match tokio::fs::read_to_string(&abs).await {
        Ok(current) => current,
        Err(e) => {
            warn!("cannot read rewrite target {rewrite_path}: {e}");
            return Err(invalid_anchor(second_error, regenerated));
        }
    };
    let new_content = match generator
        .rewrite_file(&retry_ctx, &rewrite_path, &current)
        .await
    {
        Ok(new_content) => new_content,
        Err(gen_err) => {
            warn!("full-file rewrite failed, surfacing the anchor error: {gen_err}");
            return Err(invalid_anchor(second_error, regenerated));
        }
    };
    if let Err(e) = tokio::fs::write(&abs, &new_content).await {
        return Err(RecoveryFailure {
            kind: RecoveryFailureKind::ApplyFailed,
            error: PatchError::ApplyFailed(format!("write {rewrite_path}: {e}")),
            last_ops: regenerated,
        });
    }
    events.send(RepairEvent::FullFileRewrite {
        path: rewrite_path.clone(),
    });

    // Remaining ops that do not touch the rewritten file still apply; a
    // failure here is surfaced as-is.
    let remaining: Vec<PatchOp> = regenerated
        .iter()
        .filter(|op| op.path() != rewrite_path)
        .cloned()
        .collect();
    match apply_ops_to_worktree(worktree_root, &remaining).await {
        Ok(paths) => {
            let mut applied_paths = vec![rewrite_path.clone()];
            applied_paths.extend(paths);
            Ok(RecoveryOutcome {
                ops: regenerated,
                applied_paths,
                rewritten: Some(rewrite_path),
            })
        }
        Err(err @ PatchError::AnchorNotFound { .. }) => Err(invalid_anchor(err, regenerated)),
        Err(err) => Err(RecoveryFailure {
            kind: RecoveryFailureKind::ApplyFailed,
            error: err,
            last_ops: regenerated,
        }),
    }
}

fn anchor_site(error: &PatchError) -> (String, usize) {
    match error {
        PatchError::AnchorNotFound { path, op_index, .. } => (path.clone(), *op_index),
        _ => (String::new(), 0),
    }
}
