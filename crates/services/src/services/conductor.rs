//! The repair loop itself.
//!
//! One conductor invocation owns one worktree:
//!
//! ```text
//! WORKTREE_CREATE → (ITERATION_RESET → GENERATE_OPS → APPLY_OPS →
//!                    RUN_TESTS → EVALUATE)×N → PASS | bail → CLEANUP
//! ```
//!
//! The worktree is removed on every exit path: the explicit removal covers
//! returns and errors, the handle's drop guard covers panics. The conductor
//! never commits; on PASS it emits the diff and the modified-path list for
//! the caller's review gate and stops.

use std::{path::PathBuf, sync::Arc};

use executors::{
    client::{ModelClient, ModelClientError, ModelSettings},
    generator::{AffectedFile, FileAction, FileContent, GeneratorError, IterationContext, OpsGenerator},
    ops::{PatchOp, changed_paths},
    tools::{CommandMap, ToolDispatcher},
};
use git::{DiffError, GitCli, GitCliError, Worktree, WorktreeError, unified_diff};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use utils::env::EnvPolicy;

use crate::services::{
    delta::{Decision, evaluate_delta},
    events::{BailReason, EventSender, LoopState, RepairEvent},
    recovery::{RecoveryFailureKind, apply_with_recovery},
    test_runner::{TestResult, TestRunner, TestRunnerError, compare_results, enrich_failure},
};

pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Git(#[from] GitCliError),
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error(transparent)]
    TestRunner(#[from] TestRunnerError),
    #[error(transparent)]
    Client(#[from] ModelClientError),
    #[error("repair loop cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub repo_path: PathBuf,
    pub plan: String,
    pub affected_files: Vec<AffectedFile>,
    pub repo_understanding: Option<String>,
    /// Shell string run inside the worktree; exit 0 is the success signal.
    pub test_cmd: String,
    pub commands: CommandMap,
    pub max_iterations: u32,
    pub settings: ModelSettings,
}

impl RepairRequest {
    pub fn new(repo_path: PathBuf, plan: impl Into<String>, test_cmd: impl Into<String>) -> Self {
        Self {
            repo_path,
            plan: plan.into(),
            affected_files: Vec::new(),
            repo_understanding: None,
            test_cmd: test_cmd.into(),
            commands: CommandMap::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            settings: ModelSettings::default(),
        }
    }
}

/// Terminal outcome of one loop. `pass == false` always carries a reason.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopResult {
    pub pass: bool,
    pub bail_reason: Option<BailReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bail_error: Option<String>,
    pub iteration: u32,
    pub last_result: Option<TestResult>,
    pub last_ops: Option<Vec<PatchOp>>,
}

pub struct RepairConductor {
    client: Arc<dyn ModelClient>,
    env: EnvPolicy,
    events: EventSender,
    cancel: CancellationToken,
}

impl RepairConductor {
    pub fn new(client: Arc<dyn ModelClient>, events: EventSender) -> Self {
        Self {
            client,
            env: EnvPolicy::from_env(),
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_env(mut self, env: EnvPolicy) -> Self {
        self.env = env;
        self
    }

    /// Cooperative cancellation: checked between states; cleanup still runs.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run_repair_loop(&self, request: RepairRequest) -> Result<LoopResult, ConductorError> {
        let git = GitCli::new(self.env.clone());
        self.events.send(RepairEvent::State {
            state: LoopState::WorktreeCreate,
        });
        let worktree = Worktree::create(git.clone(), &request.repo_path).await?;

        let outcome = self.run_iterations(&git, &worktree, &request).await;

        self.events.send(RepairEvent::State {
            state: LoopState::Cleanup,
        });
        worktree.remove().await;
        outcome
    }

    async fn run_iterations(
        &self,
        git: &GitCli,
        worktree: &Worktree,
        request: &RepairRequest,
    ) -> Result<LoopResult, ConductorError> {
        let dispatcher = ToolDispatcher::new(
            worktree.path().to_path_buf(),
            request.commands.clone(),
            self.env.clone(),
            git.clone(),
        );
        let generator =
            OpsGenerator::new(self.client.as_ref(), &dispatcher, request.settings.clone());
        let runner = TestRunner::new(self.env.clone());

        let mut prev_result: Option<TestResult> = None;
        let mut prev_ops: Option<Vec<PatchOp>> = None;
        let max_iterations = request.max_iterations.max(1);

        for iteration in 1..=max_iterations {
            self.check_cancelled()?;
            self.events
                .send(RepairEvent::IterationStarted { iteration });
            self.events.send(RepairEvent::State {
                state: LoopState::IterationReset,
            });
            worktree.reset_hard().await?;

            self.events.send(RepairEvent::State {
                state: LoopState::GenerateOps,
            });
            let ctx = self
                .build_context(worktree, request, iteration, &prev_result, &prev_ops)
                .await?;
            let ops = match generator.generate(&ctx).await {
                Ok(ops) => ops,
                Err(GeneratorError::ModelDeclaredFailure(msg)) => {
                    return Ok(self.bail(
                        BailReason::ModelDeclaredFailure,
                        Some(msg),
                        iteration,
                        prev_result,
                        prev_ops,
                    ));
                }
                Err(GeneratorError::ModelStructuralFailure(msg)) => {
                    return Ok(self.bail(
                        BailReason::ModelStructuralFailure,
                        Some(msg),
                        iteration,
                        prev_result,
                        prev_ops,
                    ));
                }
                Err(GeneratorError::Client(e)) => return Err(e.into()),
            };
            self.events.send(RepairEvent::OpsGenerated {
                op_count: ops.len(),
                paths: changed_paths(&ops),
            });

            self.events.send(RepairEvent::State {
                state: LoopState::ApplyOps,
            });
            self.check_cancelled()?;
            let applied =
                match apply_with_recovery(&generator, worktree.path(), ops, &ctx, &self.events)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(failure) => {
                        let reason = match failure.kind {
                            RecoveryFailureKind::InvalidAnchor => BailReason::OpsInvalidAnchor,
                            RecoveryFailureKind::ApplyFailed => BailReason::OpsApplyFailed,
                        };
                        return Ok(self.bail(
                            reason,
                            Some(failure.error.to_string()),
                            iteration,
                            prev_result,
                            Some(failure.last_ops),
                        ));
                    }
                };
            self.events.send(RepairEvent::ApplyComplete {
                paths: applied.applied_paths.clone(),
            });

            self.events.send(RepairEvent::State {
                state: LoopState::RunTests,
            });
            self.check_cancelled()?;
            let result = runner.run(worktree.path(), &request.test_cmd).await?;
            self.events.send(RepairEvent::TestsComplete {
                result: result.clone(),
            });

            if result.exit_code == 0 {
                self.events.send(RepairEvent::State {
                    state: LoopState::Pass,
                });
                let diff = unified_diff(git, worktree.path(), None)?;
                let modified_paths = changed_paths(&applied.ops);
                self.events.send(RepairEvent::DiffReady {
                    diff,
                    pass: true,
                    modified_paths,
                });
                return Ok(LoopResult {
                    pass: true,
                    bail_reason: None,
                    bail_error: None,
                    iteration,
                    last_result: Some(result),
                    last_ops: Some(applied.ops),
                });
            }

            self.events.send(RepairEvent::State {
                state: LoopState::Evaluate,
            });
            let delta = prev_result
                .as_ref()
                .and_then(|prev| compare_results(prev, &result));
            let decision = evaluate_delta(iteration, delta, result.failure_count);
            self.events.send(RepairEvent::Evaluate {
                iteration,
                delta,
                decision: decision.label(),
                failure_count: result.failure_count,
            });
            match decision {
                Decision::Continue => {
                    debug!("iteration {iteration} continues: {} failure(s)", result.failure_count);
                    prev_result = Some(result);
                    prev_ops = Some(applied.ops);
                }
                Decision::Bail(reason) => {
                    return Ok(self.bail(
                        reason,
                        None,
                        iteration,
                        Some(result),
                        Some(applied.ops),
                    ));
                }
            }
        }

        Ok(self.bail(
            BailReason::MaxIterations,
            None,
            max_iterations,
            prev_result,
            prev_ops,
        ))
    }

    /// Assemble the generator's context from the worktree's current state.
    async fn build_context(
        &self,
        worktree: &Worktree,
        request: &RepairRequest,
        iteration: u32,
        prev_result: &Option<TestResult>,
        prev_ops: &Option<Vec<PatchOp>>,
    ) -> Result<IterationContext, ConductorError> {
        let head_sha = worktree.head_sha().await?;

        let mut file_contents = Vec::new();
        for file in &request.affected_files {
            if file.action != FileAction::Modify {
                continue;
            }
            let Ok(abs) = utils::path::validate_staging_path(worktree.path(), &file.path) else {
                debug!("affected file {} failed the path guard, skipping", file.path);
                continue;
            };
            match tokio::fs::read_to_string(&abs).await {
                Ok(content) => file_contents.push(FileContent {
                    path: file.path.clone(),
                    content,
                }),
                Err(e) => debug!("affected file {} not readable: {e}", file.path),
            }
        }

        let last_failure = prev_result
            .as_ref()
            .map(|result| enrich_failure(worktree.path(), &result.excerpt));

        Ok(IterationContext {
            iteration,
            plan: request.plan.clone(),
            affected_files: request.affected_files.clone(),
            file_contents,
            repo_understanding: request.repo_understanding.clone(),
            last_failure,
            previous_ops: prev_ops.clone(),
            head_sha,
            test_cmd: request.test_cmd.clone(),
            anchor_error: None,
        })
    }

    fn bail(
        &self,
        reason: BailReason,
        message: Option<String>,
        iteration: u32,
        last_result: Option<TestResult>,
        last_ops: Option<Vec<PatchOp>>,
    ) -> LoopResult {
        self.events.send(RepairEvent::Bail {
            reason,
            message: message.clone(),
        });
        LoopResult {
            pass: false,
            bail_reason: Some(reason),
            bail_error: message,
            iteration,
            last_result,
            last_ops,
        }
    }

    fn check_cancelled(&self) -> Result<(), ConductorError> {
        if self.cancel.is_cancelled() {
            Err(ConductorError::Cancelled)
        } else {
            Ok(())
        }
    }
}
