pub mod conductor;
pub mod delta;
pub mod events;
pub mod recovery;
pub mod test_runner;

pub use conductor::{ConductorError, LoopResult, RepairConductor, RepairRequest};
pub use delta::{Decision, evaluate_delta};
pub use events::{BailReason, EventSender, LoopState, RepairEvent};
pub use test_runner::{Delta, TestResult, TestRunner, compare_results, enrich_failure};
