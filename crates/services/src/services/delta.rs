//! Continue-or-bail policy.
//!
//! Deliberately tiny and pure: the decision is a total function of the
//! iteration number, the progress delta, and the current failure count.
//! Nothing else — not timing, not op counts — may influence it.

use crate::services::{events::BailReason, test_runner::Delta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Bail(BailReason),
}

impl Decision {
    /// Stable label used in the `evaluate` event.
    pub fn label(&self) -> String {
        match self {
            Decision::Continue => "continue".to_string(),
            Decision::Bail(reason) => reason.to_string(),
        }
    }
}

/// Iteration 1 continues unless the failure count is unparseable. From
/// iteration 2 on, the delta alone decides: improved continues, same and
/// worse bail, an unknown comparison bails as unknown.
pub fn evaluate_delta(iteration: u32, delta: Option<Delta>, failure_count: i64) -> Decision {
    if iteration <= 1 {
        return if failure_count == -1 {
            Decision::Bail(BailReason::BailUnknown)
        } else {
            Decision::Continue
        };
    }
    match delta {
        Some(Delta::Improved) => Decision::Continue,
        Some(Delta::Same) => Decision::Bail(BailReason::BailSame),
        Some(Delta::Worse) => Decision::Bail(BailReason::BailWorse),
        None => Decision::Bail(BailReason::BailUnknown),
    }
}
