//! Structured events emitted while the repair loop runs.
//!
//! Events are the only side channel between the conductor and its caller.
//! They travel over an unbounded channel so the producer never blocks; a
//! consumer that went away downgrades emission to a debug log. Field names
//! are a public contract.

use serde::Serialize;
use strum_macros::Display;
use tokio::sync::mpsc;

use crate::services::test_runner::{Delta, TestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    WorktreeCreate,
    IterationReset,
    GenerateOps,
    ApplyOps,
    RunTests,
    Evaluate,
    Pass,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BailReason {
    ModelDeclaredFailure,
    ModelStructuralFailure,
    OpsInvalidAnchor,
    OpsApplyFailed,
    BailSame,
    BailWorse,
    BailUnknown,
    MaxIterations,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RepairEvent {
    IterationStarted {
        iteration: u32,
    },
    State {
        state: LoopState,
    },
    OpsGenerated {
        op_count: usize,
        paths: Vec<String>,
    },
    AnchorRetry {
        attempt: u32,
        path: String,
        op_index: usize,
    },
    AnchorFallback {
        attempt: u32,
        path: String,
    },
    FullFileRewrite {
        path: String,
    },
    ApplyComplete {
        paths: Vec<String>,
    },
    TestsComplete {
        result: TestResult,
    },
    Evaluate {
        iteration: u32,
        delta: Option<Delta>,
        decision: String,
        failure_count: i64,
    },
    Bail {
        reason: BailReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    DiffReady {
        diff: String,
        pass: bool,
        modified_paths: Vec<String>,
    },
}

/// Producer half handed to the conductor. `disabled()` gives a sender that
/// drops everything, for callers that do not observe the loop.
#[derive(Clone)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<RepairEvent>>,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<RepairEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Build a sender plus its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RepairEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, event: RepairEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).is_err()
        {
            tracing::debug!("event receiver dropped; emission disabled for this loop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialise_with_stable_field_names() {
        let ev = RepairEvent::OpsGenerated {
            op_count: 2,
            paths: vec!["a.js".to_string()],
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "ops_generated");
        assert_eq!(json["opCount"], 2);

        let ev = RepairEvent::Evaluate {
            iteration: 2,
            delta: Some(Delta::Same),
            decision: "bail_same".to_string(),
            failure_count: 2,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["failureCount"], 2);
        assert_eq!(json["delta"], "same");

        let ev = RepairEvent::State {
            state: LoopState::Pass,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["state"], "PASS");

        let ev = RepairEvent::Bail {
            reason: BailReason::MaxIterations,
            message: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["reason"], "max_iterations");
    }

    #[test]
    fn send_after_receiver_drop_is_silent() {
        let (sender, rx) = EventSender::channel();
        drop(rx);
        sender.send(RepairEvent::IterationStarted { iteration: 1 });
    }
}
