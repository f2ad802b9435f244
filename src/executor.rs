use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::AgentRunner;
use crate::agent_loop::{self, LoopParams};
use crate::bus::{emit, Event, EventBus};
use crate::config::{CompletionAction, MaestroConfig, SyncStrategy};
use crate::gate;
use crate::git::{self, GitOps, SyncOutcome};
use crate::hosting::{HostingClient, MergeMethod};
use crate::retry::{self, RetryDecision};
use crate::store::{PhaseStatusExpectation, Store};
use crate::template::TemplateSet;
use crate::types::{
    now_rfc3339, ExecutionState, GateAwait, GateDecision, GateResolution, GateWait, PhaseOutcome,
    PhasePlan, PhaseStatus, Plan, PrIntent, Task, TaskFailure, TaskStatus,
};
use crate::worktree::{ReleaseOutcome, WorktreeManager};
use crate::{log_info, log_warn};

/// How a task's executor run ended, for the scheduler's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunOutcome {
    Completed,
    Paused,
    Blocked,
    Failed,
    Cancelled,
}

/// Collaborators handed to every executor. Explicit dependencies, no
/// globals; tests build minimal graphs out of the mocks.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub store: Arc<dyn Store>,
    pub runner: Arc<dyn AgentRunner>,
    pub git: Arc<dyn GitOps>,
    pub hosting: Arc<dyn HostingClient>,
    pub worktrees: Arc<WorktreeManager>,
    pub templates: Arc<TemplateSet>,
    pub bus: Arc<EventBus>,
    pub config: Arc<MaestroConfig>,
}

/// The per-task state machine: worktree, phase loop, gates, retries,
/// checkpoint commits, finalization.
///
/// Every transition is persisted before the next step begins, so a
/// crash between any two steps resumes at the last persisted state.
pub struct TaskExecutor {
    deps: ExecutorDeps,
    cancel: CancellationToken,
}

impl TaskExecutor {
    pub fn new(deps: ExecutorDeps, cancel: CancellationToken) -> Self {
        Self { deps, cancel }
    }

    fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.deps.config.execution.iteration_timeout_minutes as u64 * 60)
    }

    fn event_store(&self) -> Option<&dyn Store> {
        if self.deps.config.events.persist {
            Some(self.deps.store.as_ref())
        } else {
            None
        }
    }

    async fn publish_task_change(&self, task_id: &str, old: TaskStatus, new: TaskStatus) {
        emit(
            &self.deps.bus,
            self.event_store(),
            Event::TaskStateChanged {
                task_id: task_id.to_string(),
                old,
                new,
            },
        )
        .await;
    }

    async fn publish_phase_change(
        &self,
        task_id: &str,
        phase_id: &str,
        old: PhaseStatus,
        new: PhaseStatus,
    ) {
        emit(
            &self.deps.bus,
            self.event_store(),
            Event::PhaseStateChanged {
                task_id: task_id.to_string(),
                phase_id: phase_id.to_string(),
                old,
                new,
            },
        )
        .await;
    }

    /// Run a claimed task to its next stopping point.
    pub async fn run(&self, task: Task) -> TaskRunOutcome {
        let task_id = task.id.clone();

        let Some(plan) = task.plan.clone() else {
            return self
                .fail_task(&task_id, "plan", "task has no plan (re-plan it)")
                .await;
        };

        let mut exec = match self.deps.store.load_execution_state(&task_id).await {
            Ok(Some(exec)) => exec,
            Ok(None) => ExecutionState::new(&task_id),
            Err(e) => {
                return self
                    .fail_task(&task_id, "startup", &format!("load execution state: {}", e))
                    .await;
            }
        };

        // 1. Acquire the worktree; the path is persisted before any
        //    work begins so cleanup can always find it.
        let worktree = match self
            .deps
            .worktrees
            .acquire(&task_id, exec.worktree_path.as_deref())
            .await
        {
            Ok(wt) => wt,
            Err(e) => return self.fail_task(&task_id, "worktree", &e).await,
        };
        exec.worktree_path = Some(worktree.path.clone());
        if let Err(e) = self.deps.store.save_execution_state(exec.clone()).await {
            return self
                .fail_task(&task_id, "worktree", &format!("persist worktree path: {}", e))
                .await;
        }

        // 2. A resumed task may be sitting on an answered (or
        //    unanswered) human gate.
        if let Some(wait) = exec.gate_wait.clone() {
            match self
                .consume_gate_wait(&task, &plan, &mut exec, wait)
                .await
            {
                GateStep::Continue => {}
                GateStep::Finished(outcome) => return outcome,
            }
        }

        // 3. Phase loop from the persisted cursor.
        while exec.current_phase_index < plan.len() {
            if self.cancel.is_cancelled() {
                return self.cancel_task(&task_id, &mut exec).await;
            }

            let phase = plan.phases[exec.current_phase_index].clone();
            match self
                .run_one_phase(&task, &plan, &mut exec, &phase, &worktree.path)
                .await
            {
                GateStep::Continue => {}
                GateStep::Finished(outcome) => return outcome,
            }
        }

        // 4. All phases done: finalize.
        self.finalize(&task, &plan, &mut exec, &worktree.path).await
    }

    async fn run_one_phase(
        &self,
        task: &Task,
        plan: &Plan,
        exec: &mut ExecutionState,
        phase: &PhasePlan,
        workspace: &std::path::Path,
    ) -> GateStep {
        let task_id = &task.id;
        let phase_id = &phase.phase_id;

        // Branch sync before the phase, per strategy.
        match self.deps.config.sync.strategy {
            SyncStrategy::Phase => {
                let mode = match self.deps.config.sync.mode {
                    crate::config::SyncMode::Rebase => git::SyncMode::Rebase,
                    crate::config::SyncMode::Merge => git::SyncMode::Merge,
                };
                match self
                    .deps
                    .worktrees
                    .sync(workspace, &self.deps.config.project.target_branch, mode)
                    .await
                {
                    Ok(SyncOutcome::Clean) => {}
                    Ok(SyncOutcome::Conflicts(files)) => {
                        return GateStep::Finished(
                            self.block_task(
                                task_id,
                                exec,
                                phase_id,
                                &format!("sync conflicts in: {}", files.join(", ")),
                            )
                            .await,
                        );
                    }
                    Err(e) => {
                        return GateStep::Finished(self.fail_task(task_id, phase_id, &e).await)
                    }
                }
            }
            SyncStrategy::Detect => {
                match self
                    .deps
                    .worktrees
                    .sync(
                        workspace,
                        &self.deps.config.project.target_branch,
                        git::SyncMode::Detect,
                    )
                    .await
                {
                    Ok(SyncOutcome::Clean) => {}
                    Ok(SyncOutcome::Conflicts(files)) => {
                        if self.deps.config.sync.fail_on_conflict {
                            return GateStep::Finished(
                                self.fail_task(
                                    task_id,
                                    phase_id,
                                    &format!(
                                        "target branch conflicts detected in: {}",
                                        files.join(", ")
                                    ),
                                )
                                .await,
                            );
                        }
                        // Advisory only: record and proceed.
                        emit(
                            &self.deps.bus,
                            self.event_store(),
                            Event::SyncAdvisory {
                                task_id: task_id.clone(),
                                phase_id: phase_id.clone(),
                                conflicts: files,
                            },
                        )
                        .await;
                    }
                    Err(e) => {
                        log_warn!("[{}] detect sync failed (ignored): {}", task_id, e);
                    }
                }
            }
            SyncStrategy::None | SyncStrategy::Completion => {}
        }

        // Mark the phase running (idempotent across resume).
        let current_status = exec
            .phases
            .get(phase_id.as_str())
            .map(|r| r.status)
            .unwrap_or(PhaseStatus::Pending);
        if current_status == PhaseStatus::Pending {
            match self
                .deps
                .store
                .transition_phase(
                    task_id,
                    phase_id,
                    PhaseStatusExpectation::Exactly(PhaseStatus::Pending),
                    PhaseStatus::Running,
                    None,
                )
                .await
            {
                Ok(()) => {
                    self.publish_phase_change(
                        task_id,
                        phase_id,
                        PhaseStatus::Pending,
                        PhaseStatus::Running,
                    )
                    .await;
                }
                Err(e) => return GateStep::Finished(self.fail_task(task_id, phase_id, &format!("{}", e)).await),
            }
        } else if current_status != PhaseStatus::Running {
            return GateStep::Finished(
                self.fail_task(
                    task_id,
                    phase_id,
                    &format!("phase record is {} at cursor", current_status),
                )
                .await,
            );
        }

        // Refresh the record for the resume point.
        if let Ok(Some(latest)) = self.deps.store.load_execution_state(task_id).await {
            *exec = latest;
        }
        let start_iteration = exec
            .phases
            .get(phase_id.as_str())
            .map(|r| r.next_iteration_index())
            .unwrap_or(1);

        log_info!(
            "[{}][{}] starting phase (iteration {} of at most {})",
            task_id,
            phase_id.to_uppercase(),
            start_iteration,
            phase.max_iterations
        );

        let result = agent_loop::run_phase(
            self.deps.store.as_ref(),
            self.deps.runner.as_ref(),
            self.deps.templates.as_ref(),
            &self.deps.bus,
            &self.cancel,
            LoopParams {
                task,
                phase,
                retry_context: exec.retry_context.as_ref(),
                workspace,
                session_key: exec.session_key.clone(),
                start_iteration,
                iteration_timeout: self.iteration_timeout(),
            },
        )
        .await;

        let session_key = result.session_key.clone();
        // Refresh: the loop appended iterations the in-memory copy
        // does not have.
        if let Ok(Some(latest)) = self.deps.store.load_execution_state(task_id).await {
            *exec = latest;
        }
        exec.session_key = session_key;

        match result.outcome {
            PhaseOutcome::Paused { .. } => {
                GateStep::Finished(self.pause_task(task_id, exec, None).await)
            }
            PhaseOutcome::Cancelled => GateStep::Finished(self.cancel_task(task_id, exec).await),
            PhaseOutcome::Blocked { reason } => {
                GateStep::Finished(self.block_task(task_id, exec, phase_id, &reason).await)
            }
            outcome @ (PhaseOutcome::Completed { .. }
            | PhaseOutcome::Stuck { .. }
            | PhaseOutcome::Exhausted
            | PhaseOutcome::Failed { .. }) => {
                let decision = gate::evaluate(
                    self.deps.runner.as_ref(),
                    task,
                    phase,
                    &outcome,
                    self.iteration_timeout(),
                )
                .await;
                self.apply_gate_decision(task, plan, exec, phase, decision, &outcome)
                    .await
            }
        }
    }

    async fn apply_gate_decision(
        &self,
        task: &Task,
        plan: &Plan,
        exec: &mut ExecutionState,
        phase: &PhasePlan,
        decision: GateDecision,
        outcome: &PhaseOutcome,
    ) -> GateStep {
        let task_id = &task.id;
        let phase_id = &phase.phase_id;

        match decision {
            GateDecision::Proceed => {
                match self.checkpoint_phase(task_id, exec, phase_id).await {
                    Ok(()) => GateStep::Continue,
                    Err(e) => GateStep::Finished(self.fail_task(task_id, phase_id, &e).await),
                }
            }
            GateDecision::Retry { reason } => {
                let excerpt = failing_excerpt(outcome, exec, phase_id);
                let decision = retry::decide(
                    &self.deps.config.retry,
                    plan,
                    exec,
                    phase_id,
                    &reason,
                    excerpt.as_deref(),
                );
                match decision {
                    RetryDecision::RetryFrom {
                        reentry_phase,
                        context,
                    } => {
                        if plan.retry_needs_confirmation {
                            let wait = GateWait {
                                phase_id: phase_id.clone(),
                                awaiting: GateAwait::RetryConfirmation {
                                    reentry_phase: reentry_phase.clone(),
                                },
                                reason: reason.clone(),
                                resolution: None,
                            };
                            return GateStep::Finished(
                                self.pause_task(task_id, exec, Some(wait)).await,
                            );
                        }
                        match self
                            .apply_rewind(task_id, plan, exec, phase_id, &reentry_phase, context)
                            .await
                        {
                            Ok(()) => GateStep::Continue,
                            Err(e) => {
                                GateStep::Finished(self.fail_task(task_id, phase_id, &e).await)
                            }
                        }
                    }
                    RetryDecision::Fail { reason } => {
                        GateStep::Finished(self.fail_task(task_id, phase_id, &reason).await)
                    }
                }
            }
            GateDecision::PauseForHuman { awaiting, reason } => {
                let wait = GateWait {
                    phase_id: phase_id.clone(),
                    awaiting,
                    reason,
                    resolution: None,
                };
                GateStep::Finished(self.pause_task(task_id, exec, Some(wait)).await)
            }
            GateDecision::Fail { reason } => {
                GateStep::Finished(self.fail_task(task_id, phase_id, &reason).await)
            }
        }
    }

    /// Commit the phase checkpoint and advance the cursor. The commit
    /// is idempotent (clean tree returns HEAD), so a crash between
    /// commit and record replays harmlessly.
    async fn checkpoint_phase(
        &self,
        task_id: &str,
        exec: &mut ExecutionState,
        phase_id: &str,
    ) -> Result<(), String> {
        let workspace = exec
            .worktree_path
            .clone()
            .ok_or_else(|| "no worktree path recorded".to_string())?;

        let message = format!("[orc] {}: {} - completed", task_id, phase_id);
        let sha = self
            .deps
            .git
            .commit(&workspace, &message)
            .await
            .map_err(|e| format!("phase checkpoint commit: {}", e))?;

        self.deps
            .store
            .transition_phase(
                task_id,
                phase_id,
                PhaseStatusExpectation::Exactly(PhaseStatus::Running),
                PhaseStatus::Completed,
                Some(sha.clone()),
            )
            .await
            .map_err(|e| format!("record phase completion: {}", e))?;
        self.publish_phase_change(task_id, phase_id, PhaseStatus::Running, PhaseStatus::Completed)
            .await;

        log_info!(
            "[{}][{}] completed (checkpoint {})",
            task_id,
            phase_id.to_uppercase(),
            &sha[..sha.len().min(10)]
        );

        exec.current_phase_index += 1;
        exec.retry_context = None;
        self.deps
            .store
            .save_execution_state(exec.clone())
            .await
            .map_err(|e| format!("persist cursor: {}", e))?;
        Ok(())
    }

    /// Rewind to an earlier phase: bump the retry counter, reset the
    /// records from the re-entry point forward, move the cursor, and
    /// persist it all before continuing.
    async fn apply_rewind(
        &self,
        task_id: &str,
        plan: &Plan,
        exec: &mut ExecutionState,
        failing_phase: &str,
        reentry_phase: &str,
        context: crate::types::RetryContext,
    ) -> Result<(), String> {
        let reentry_idx = plan
            .phase_index(reentry_phase)
            .ok_or_else(|| format!("re-entry phase {} not in plan", reentry_phase))?;

        log_info!(
            "[{}] rewinding {} -> {} (attempt {})",
            task_id,
            failing_phase,
            reentry_phase,
            context.previous_attempt_count + 1
        );

        *exec.retry_counts.entry(failing_phase.to_string()).or_insert(0) += 1;
        exec.retry_context = Some(context);
        exec.current_phase_index = reentry_idx;
        // Fresh conversation for the re-entered phase.
        exec.session_key = None;
        self.deps
            .store
            .save_execution_state(exec.clone())
            .await
            .map_err(|e| format!("persist rewind: {}", e))?;

        // Reset the re-entered phase and everything after it.
        for phase in &plan.phases[reentry_idx..] {
            let old = exec
                .phases
                .get(phase.phase_id.as_str())
                .map(|r| r.status)
                .unwrap_or(PhaseStatus::Pending);
            if old == PhaseStatus::Pending {
                continue;
            }
            self.deps
                .store
                .transition_phase(
                    task_id,
                    &phase.phase_id,
                    PhaseStatusExpectation::Any,
                    PhaseStatus::Pending,
                    None,
                )
                .await
                .map_err(|e| format!("reset phase {}: {}", phase.phase_id, e))?;
            self.publish_phase_change(task_id, &phase.phase_id, old, PhaseStatus::Pending)
                .await;
        }

        // Reload so in-memory records match the resets.
        if let Ok(Some(latest)) = self.deps.store.load_execution_state(task_id).await {
            *exec = latest;
        }
        Ok(())
    }

    /// Resume path: a gate wait exists from a previous run. Consume its
    /// resolution, or park again when nothing was answered.
    async fn consume_gate_wait(
        &self,
        task: &Task,
        plan: &Plan,
        exec: &mut ExecutionState,
        wait: GateWait,
    ) -> GateStep {
        let task_id = &task.id;

        let Some(resolution) = wait.resolution else {
            // Resumed without an answer: park right back.
            return GateStep::Finished(self.pause_task(task_id, exec, Some(wait)).await);
        };

        exec.gate_wait = None;
        if let Err(e) = self.deps.store.save_execution_state(exec.clone()).await {
            return GateStep::Finished(
                self.fail_task(task_id, &wait.phase_id, &format!("clear gate wait: {}", e))
                    .await,
            );
        }

        match (wait.awaiting.clone(), resolution) {
            (GateAwait::PhaseApproval, GateResolution::Approved) => {
                match self.checkpoint_phase(task_id, exec, &wait.phase_id).await {
                    Ok(()) => GateStep::Continue,
                    Err(e) => {
                        GateStep::Finished(self.fail_task(task_id, &wait.phase_id, &e).await)
                    }
                }
            }
            (GateAwait::PhaseApproval, GateResolution::Rejected) => {
                // Rejection is a retry request against the same phase.
                let phase = plan
                    .phases
                    .iter()
                    .find(|p| p.phase_id == wait.phase_id)
                    .cloned();
                match phase {
                    Some(phase) => {
                        self.apply_gate_decision(
                            task,
                            plan,
                            exec,
                            &phase,
                            GateDecision::Retry {
                                reason: format!("human rejected phase {}", wait.phase_id),
                            },
                            &PhaseOutcome::Failed {
                                reason: "human rejected the phase output".to_string(),
                            },
                        )
                        .await
                    }
                    None => GateStep::Finished(
                        self.fail_task(task_id, &wait.phase_id, "rejected phase not in plan")
                            .await,
                    ),
                }
            }
            (GateAwait::MergeApproval, GateResolution::Approved) => {
                // Cursor is already past the last phase; fall through to
                // finalization with the gate satisfied.
                exec.merge_gate_passed = true;
                match self.deps.store.save_execution_state(exec.clone()).await {
                    Ok(()) => GateStep::Continue,
                    Err(e) => GateStep::Finished(
                        self.fail_task(task_id, "merge", &format!("persist gate pass: {}", e))
                            .await,
                    ),
                }
            }
            (GateAwait::MergeApproval, GateResolution::Rejected) => GateStep::Finished(
                self.fail_task(task_id, &wait.phase_id, "human rejected the final merge")
                    .await,
            ),
            (GateAwait::RetryConfirmation { reentry_phase }, GateResolution::Approved) => {
                let context = exec.retry_context.clone().unwrap_or_default();
                match self
                    .apply_rewind(task_id, plan, exec, &wait.phase_id, &reentry_phase, context)
                    .await
                {
                    Ok(()) => GateStep::Continue,
                    Err(e) => {
                        GateStep::Finished(self.fail_task(task_id, &wait.phase_id, &e).await)
                    }
                }
            }
            (GateAwait::RetryConfirmation { .. }, GateResolution::Rejected) => GateStep::Finished(
                self.fail_task(task_id, &wait.phase_id, &wait.reason).await,
            ),
        }
    }

    /// Finalization: merge gate, completion sync, then PR or merge with
    /// at-most-once creation.
    async fn finalize(
        &self,
        task: &Task,
        plan: &Plan,
        exec: &mut ExecutionState,
        workspace: &std::path::Path,
    ) -> TaskRunOutcome {
        let task_id = &task.id;
        let action = self.deps.config.completion.action;

        // The merge gate applies whenever finalization will touch the
        // outside world. A gate already consumed on resume is gone from
        // exec and is not re-evaluated.
        if action != CompletionAction::None {
            if let Some(policy) = plan.merge_gate {
                if !exec.merge_gate_passed {
                    let decision = gate::evaluate_merge_gate(
                        self.deps.runner.as_ref(),
                        task,
                        policy,
                        self.iteration_timeout(),
                    )
                    .await;
                    match decision {
                        GateDecision::Proceed => {
                            exec.merge_gate_passed = true;
                            if let Err(e) =
                                self.deps.store.save_execution_state(exec.clone()).await
                            {
                                return self
                                    .fail_task(
                                        task_id,
                                        "merge",
                                        &format!("persist gate pass: {}", e),
                                    )
                                    .await;
                            }
                        }
                        GateDecision::PauseForHuman { awaiting, reason } => {
                            let wait = GateWait {
                                phase_id: "merge".to_string(),
                                awaiting,
                                reason,
                                resolution: None,
                            };
                            return self.pause_task(task_id, exec, Some(wait)).await;
                        }
                        GateDecision::Retry { reason } | GateDecision::Fail { reason } => {
                            return self.fail_task(task_id, "merge", &reason).await;
                        }
                    }
                }
            }
        }

        if self.deps.config.sync.strategy == SyncStrategy::Completion {
            let mode = match self.deps.config.sync.mode {
                crate::config::SyncMode::Rebase => git::SyncMode::Rebase,
                crate::config::SyncMode::Merge => git::SyncMode::Merge,
            };
            match self
                .deps
                .worktrees
                .sync(workspace, &self.deps.config.project.target_branch, mode)
                .await
            {
                Ok(SyncOutcome::Clean) => {}
                Ok(SyncOutcome::Conflicts(files)) => {
                    return self
                        .block_task(
                            task_id,
                            exec,
                            "merge",
                            &format!("completion sync conflicts in: {}", files.join(", ")),
                        )
                        .await;
                }
                Err(e) => return self.fail_task(task_id, "merge", &e).await,
            }
        }

        match action {
            CompletionAction::None => {}
            CompletionAction::Pr => {
                if let Err(e) = self.ensure_pr(task, exec).await {
                    return self.fail_task(task_id, "merge", &e).await;
                }
            }
            CompletionAction::Merge => {
                if let Err(e) = self.ensure_pr(task, exec).await {
                    return self.fail_task(task_id, "merge", &e).await;
                }
                let pr_id = exec
                    .pr_intent
                    .as_ref()
                    .and_then(|p| p.pr_id.clone())
                    .unwrap_or_default();
                if let Err(e) = self
                    .deps
                    .hosting
                    .merge(&pr_id, MergeMethod::Merge)
                    .await
                {
                    return self.fail_task(task_id, "merge", &e).await;
                }
            }
        }

        // Done: release the worktree, clear the session, mark completed.
        self.deps
            .worktrees
            .release(task_id, ReleaseOutcome::Completed)
            .await;
        if let Some(ref key) = exec.session_key {
            let _ = self.deps.runner.abort(key).await;
        }
        exec.session_key = None;
        if let Err(e) = self.deps.store.save_execution_state(exec.clone()).await {
            log_warn!("[{}] failed to persist final state: {}", task_id, e);
        }

        match self
            .deps
            .store
            .update_task_status(task_id, TaskStatus::Running, TaskStatus::Completed)
            .await
        {
            Ok(_) => {
                self.publish_task_change(task_id, TaskStatus::Running, TaskStatus::Completed)
                    .await;
                log_info!("[{}] completed", task_id);
                TaskRunOutcome::Completed
            }
            Err(e) => {
                log_warn!("[{}] completion transition lost: {}", task_id, e);
                TaskRunOutcome::Cancelled
            }
        }
    }

    /// At-most-once PR creation: skip when already recorded; otherwise
    /// probe the hosting provider for a PR on the branch (a crash may
    /// have created one before recording) and reconcile; only then
    /// create, with the intent recorded first.
    async fn ensure_pr(&self, task: &Task, exec: &mut ExecutionState) -> Result<(), String> {
        let branch = self.deps.worktrees.branch_name(&task.id);

        if exec
            .pr_intent
            .as_ref()
            .map(|p| p.pr_id.is_some())
            .unwrap_or(false)
        {
            return Ok(());
        }

        if let Some(existing) = self.deps.hosting.find_pr_for_branch(&branch).await? {
            log_info!(
                "[{}] reconciled existing PR {} ({})",
                task.id,
                existing.pr_id,
                existing.url
            );
            exec.pr_intent = Some(PrIntent {
                branch,
                pr_id: Some(existing.pr_id),
                url: Some(existing.url),
                recorded_at: now_rfc3339(),
            });
            self.deps
                .store
                .save_execution_state(exec.clone())
                .await
                .map_err(|e| format!("record reconciled PR: {}", e))?;
            return Ok(());
        }

        // Record the intent before the side effect.
        exec.pr_intent = Some(PrIntent {
            branch: branch.clone(),
            pr_id: None,
            url: None,
            recorded_at: now_rfc3339(),
        });
        self.deps
            .store
            .save_execution_state(exec.clone())
            .await
            .map_err(|e| format!("record PR intent: {}", e))?;

        let title = format!("[orc] {}: {}", task.id, task.title);
        let pr = self
            .deps
            .hosting
            .create_pr(
                &branch,
                &self.deps.config.project.target_branch,
                &title,
                &task.description,
                &self.deps.config.completion.pr_labels,
            )
            .await?;

        log_info!("[{}] opened PR {} ({})", task.id, pr.pr_id, pr.url);
        exec.pr_intent = Some(PrIntent {
            branch,
            pr_id: Some(pr.pr_id),
            url: Some(pr.url),
            recorded_at: now_rfc3339(),
        });
        self.deps
            .store
            .save_execution_state(exec.clone())
            .await
            .map_err(|e| format!("record PR completion: {}", e))?;
        Ok(())
    }

    // --- Terminal and parked paths ---

    async fn pause_task(
        &self,
        task_id: &str,
        exec: &mut ExecutionState,
        wait: Option<GateWait>,
    ) -> TaskRunOutcome {
        if let Some(wait) = wait {
            exec.gate_wait = Some(wait);
        }
        exec.resume_requested = false;
        if let Err(e) = self.deps.store.save_execution_state(exec.clone()).await {
            log_warn!("[{}] failed to persist pause state: {}", task_id, e);
        }

        self.deps
            .worktrees
            .release(task_id, ReleaseOutcome::Parked)
            .await;

        match self
            .deps
            .store
            .update_task_status(task_id, TaskStatus::Running, TaskStatus::Paused)
            .await
        {
            Ok(_) => {
                self.publish_task_change(task_id, TaskStatus::Running, TaskStatus::Paused)
                    .await;
                log_info!("[{}] paused", task_id);
                TaskRunOutcome::Paused
            }
            Err(e) => {
                // A racing cancel wins; nothing to undo.
                log_warn!("[{}] pause transition lost: {}", task_id, e);
                TaskRunOutcome::Cancelled
            }
        }
    }

    async fn block_task(
        &self,
        task_id: &str,
        exec: &mut ExecutionState,
        phase_id: &str,
        reason: &str,
    ) -> TaskRunOutcome {
        exec.resume_requested = false;
        if let Err(e) = self.deps.store.save_execution_state(exec.clone()).await {
            log_warn!("[{}] failed to persist blocked state: {}", task_id, e);
        }
        let _ = self
            .deps
            .store
            .record_task_failure(
                task_id,
                TaskFailure {
                    phase_id: phase_id.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await;

        self.deps
            .worktrees
            .release(task_id, ReleaseOutcome::Parked)
            .await;

        match self
            .deps
            .store
            .update_task_status(task_id, TaskStatus::Running, TaskStatus::Blocked)
            .await
        {
            Ok(_) => {
                self.publish_task_change(task_id, TaskStatus::Running, TaskStatus::Blocked)
                    .await;
                log_info!("[{}] blocked at {}: {}", task_id, phase_id, reason);
                TaskRunOutcome::Blocked
            }
            Err(e) => {
                log_warn!("[{}] blocked transition lost: {}", task_id, e);
                TaskRunOutcome::Cancelled
            }
        }
    }

    async fn fail_task(&self, task_id: &str, phase_id: &str, reason: &str) -> TaskRunOutcome {
        log_info!("[{}] failed at {}: {}", task_id, phase_id, reason);

        // The phase record may or may not exist; best effort.
        let _ = self
            .deps
            .store
            .transition_phase(
                task_id,
                phase_id,
                PhaseStatusExpectation::Any,
                PhaseStatus::Failed,
                None,
            )
            .await;
        self.publish_phase_change(task_id, phase_id, PhaseStatus::Running, PhaseStatus::Failed)
            .await;

        let _ = self
            .deps
            .store
            .record_task_failure(
                task_id,
                TaskFailure {
                    phase_id: phase_id.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await;

        self.deps
            .worktrees
            .release(task_id, ReleaseOutcome::Failed)
            .await;

        match self
            .deps
            .store
            .update_task_status(task_id, TaskStatus::Running, TaskStatus::Failed)
            .await
        {
            Ok(_) => {
                self.publish_task_change(task_id, TaskStatus::Running, TaskStatus::Failed)
                    .await;
                TaskRunOutcome::Failed
            }
            Err(e) => {
                log_warn!("[{}] failed transition lost: {}", task_id, e);
                TaskRunOutcome::Cancelled
            }
        }
    }

    async fn cancel_task(&self, task_id: &str, exec: &mut ExecutionState) -> TaskRunOutcome {
        log_info!("[{}] cancelled", task_id);

        if let Some(ref key) = exec.session_key {
            let _ = self.deps.runner.abort(key).await;
        }
        exec.session_key = None;
        if let Err(e) = self.deps.store.save_execution_state(exec.clone()).await {
            log_warn!("[{}] failed to persist cancel state: {}", task_id, e);
        }

        self.deps
            .worktrees
            .release(task_id, ReleaseOutcome::Cancelled)
            .await;

        match self
            .deps
            .store
            .update_task_status(task_id, TaskStatus::Running, TaskStatus::Cancelled)
            .await
        {
            Ok(_) => {
                self.publish_task_change(task_id, TaskStatus::Running, TaskStatus::Cancelled)
                    .await;
            }
            Err(e) => {
                // Already terminal (e.g. cancelled through the store).
                log_warn!("[{}] cancel transition lost: {}", task_id, e);
            }
        }
        TaskRunOutcome::Cancelled
    }
}

enum GateStep {
    Continue,
    Finished(TaskRunOutcome),
}

/// Pull the last failing iteration's output as a diagnostic excerpt for
/// the retry handoff.
fn failing_excerpt(
    outcome: &PhaseOutcome,
    exec: &ExecutionState,
    phase_id: &str,
) -> Option<String> {
    if let PhaseOutcome::Failed { reason } = outcome {
        return Some(reason.clone());
    }
    exec.phases
        .get(phase_id)
        .and_then(|r| r.iterations.iter().rev().find(|i| i.error_signature.is_some()))
        .map(|i| i.output_text.clone())
}
