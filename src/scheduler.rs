use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent;
use crate::bus::{Event, SeqEvent, SessionSnapshot};
use crate::error::StoreError;
use crate::executor::{ExecutorDeps, TaskExecutor, TaskRunOutcome};
use crate::types::{PhaseStatus, TaskStatus, TokenUsage};
use crate::{log_debug, log_info, log_warn};

/// Interval of the `session.update` heartbeat while tasks run.
const SESSION_TICK_SECONDS: u64 = 10;

/// Result of a scheduler run, returned to the caller for display.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub tasks_completed: Vec<String>,
    pub tasks_failed: Vec<String>,
    pub tasks_blocked: Vec<String>,
    pub tasks_paused: Vec<String>,
    pub tasks_cancelled: Vec<String>,
    /// Phase executions started this run, re-runs after a rewind
    /// included.
    pub phases_executed: u32,
    pub halt_reason: HaltReason,
}

#[derive(Debug, PartialEq, Eq, Default)]
pub enum HaltReason {
    /// Nothing left that is claimable: everything is terminal or
    /// parked behind a pause/block/gate.
    #[default]
    AllDoneOrParked,
    ShutdownRequested,
}

/// Run the scheduler until the backlog drains or shutdown.
///
/// Admission control: claims from the store while active executors are
/// under the parallelism cap; each executor gets a child cancellation
/// token. Claims are linearizable in the store, FIFO within priority.
/// One worktree prune and one stale-session scan happen before the
/// first claim.
pub async fn run_scheduler(
    deps: ExecutorDeps,
    cancel: CancellationToken,
) -> Result<RunSummary, String> {
    let parallelism = deps.config.execution.parallelism as usize;
    let worker_id = format!("maestro-{}", std::process::id());

    // Startup hygiene: prune worktrees, recover orphaned sessions.
    deps.worktrees.prune().await;
    match deps.store.recover_orphaned_running().await {
        Ok(ids) if !ids.is_empty() => {
            log_warn!(
                "Recovered {} task(s) left running by a previous process: {}",
                ids.len(),
                ids.join(", ")
            );
        }
        Ok(_) => {}
        Err(e) => return Err(format!("stale-session scan failed: {}", e)),
    }

    log_info!("Scheduler started (parallelism={}).", parallelism);

    let mut join_set: JoinSet<(String, TaskRunOutcome)> = JoinSet::new();
    let mut summary = RunSummary::default();
    let session_start = Instant::now();
    let mut session_tokens = TokenUsage::default();
    let mut session_cost = 0.0_f64;

    let (_, mut bus_rx) = deps.bus.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(SESSION_TICK_SECONDS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if cancel.is_cancelled() || agent::is_shutdown_requested() {
            cancel.cancel();
            shutdown(&deps, &mut join_set, &mut summary, &cancel).await;
            drain_bus(&mut bus_rx, &mut summary, &mut session_tokens, &mut session_cost);
            summary.halt_reason = HaltReason::ShutdownRequested;
            return Ok(summary);
        }

        // Admit tasks up to the cap.
        let mut claim_blip = false;
        while join_set.len() < parallelism {
            match deps.store.claim_ready_task(&worker_id).await {
                Ok(Some(claimed)) => {
                    let task = claimed.task;
                    log_info!("[{}] claimed ({} / {})", task.id, task.weight, task.title);
                    deps.bus.publish(Event::TaskStateChanged {
                        task_id: task.id.clone(),
                        old: claimed.claimed_from,
                        new: TaskStatus::Running,
                    });

                    let child_cancel = cancel.child_token();
                    spawn_task_timeout_watchdog(&deps, &task.id, &child_cancel);

                    let task_deps = deps.clone();
                    join_set.spawn(async move {
                        let id = task.id.clone();
                        let executor = TaskExecutor::new(task_deps, child_cancel);
                        let outcome = executor.run(task).await;
                        (id, outcome)
                    });
                }
                Ok(None) => break,
                Err(StoreError::Unavailable(msg)) => {
                    log_warn!("claim failed (transient): {}", msg);
                    claim_blip = true;
                    break;
                }
                Err(StoreError::Conflict(msg)) => {
                    log_debug!("claim conflict, retrying next loop: {}", msg);
                    claim_blip = true;
                    break;
                }
                Err(e) => return Err(format!("claim failed: {}", e)),
            }
        }

        if join_set.is_empty() && claim_blip {
            // Nothing running but the claim path hiccuped; back off and
            // try again instead of declaring the backlog drained.
            tokio::time::sleep(Duration::from_millis(500)).await;
            continue;
        }

        if join_set.is_empty() {
            log_info!("No claimable tasks and nothing running.");
            drain_bus(&mut bus_rx, &mut summary, &mut session_tokens, &mut session_cost);
            emit_session_update(&deps, 0, &session_tokens, session_cost, session_start, true);
            return Ok(summary);
        }

        tokio::select! {
            joined = join_set.join_next() => {
                match joined {
                    Some(Ok((task_id, outcome))) => {
                        record_outcome(&mut summary, &task_id, outcome);
                        emit_session_update(
                            &deps,
                            join_set.len(),
                            &session_tokens,
                            session_cost,
                            session_start,
                            false,
                        );
                    }
                    Some(Err(e)) => {
                        log_warn!("executor task join error: {}", e);
                    }
                    None => {}
                }
            }
            event = bus_rx.recv() => {
                match event {
                    Ok(seq_event) => {
                        let refresh = observe_event(
                            &seq_event.event,
                            &mut summary,
                            &mut session_tokens,
                            &mut session_cost,
                        );
                        if refresh {
                            emit_session_update(
                                &deps,
                                join_set.len(),
                                &session_tokens,
                                session_cost,
                                session_start,
                                false,
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log_debug!("scheduler bus subscription lagged by {}", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
            _ = ticker.tick() => {
                if !join_set.is_empty() {
                    emit_session_update(
                        &deps,
                        join_set.len(),
                        &session_tokens,
                        session_cost,
                        session_start,
                        false,
                    );
                }
            }
            _ = cancel.cancelled() => {
                shutdown(&deps, &mut join_set, &mut summary, &cancel).await;
                drain_bus(&mut bus_rx, &mut summary, &mut session_tokens, &mut session_cost);
                summary.halt_reason = HaltReason::ShutdownRequested;
                return Ok(summary);
            }
        }
    }
}

/// Fold one bus event into the run's counters. Returns true for
/// task/phase transitions, which refresh the session stream; the
/// scheduler's own `session.update` events are skipped to avoid echo.
fn observe_event(
    event: &Event,
    summary: &mut RunSummary,
    session_tokens: &mut TokenUsage,
    session_cost: &mut f64,
) -> bool {
    match event {
        Event::IterationAppended { tokens, cost_usd, .. } => {
            session_tokens.fold(tokens);
            *session_cost += cost_usd;
            false
        }
        Event::PhaseStateChanged { new, .. } => {
            if *new == PhaseStatus::Running {
                summary.phases_executed += 1;
            }
            true
        }
        Event::SessionUpdate(_) => false,
        _ => true,
    }
}

/// Consume whatever the bus still holds so late events (a phase start
/// right before the last executor joined) still land in the summary.
fn drain_bus(
    bus_rx: &mut broadcast::Receiver<SeqEvent>,
    summary: &mut RunSummary,
    session_tokens: &mut TokenUsage,
    session_cost: &mut f64,
) {
    loop {
        match bus_rx.try_recv() {
            Ok(seq_event) => {
                observe_event(&seq_event.event, summary, session_tokens, session_cost);
            }
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                log_debug!("scheduler bus drain lagged by {}", missed);
            }
            Err(_) => break,
        }
    }
}

/// Cancel all executors, give them the grace window to reach a
/// suspension point, then force-terminate.
async fn shutdown(
    deps: &ExecutorDeps,
    join_set: &mut JoinSet<(String, TaskRunOutcome)>,
    summary: &mut RunSummary,
    cancel: &CancellationToken,
) {
    cancel.cancel();
    let grace = Duration::from_secs(deps.config.execution.shutdown_grace_seconds as u64);
    log_info!(
        "Shutdown requested; waiting up to {}s for {} running task(s).",
        grace.as_secs(),
        join_set.len()
    );

    let deadline = Instant::now() + grace;
    while !join_set.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            log_warn!("Grace window expired; force-terminating {} task(s).", join_set.len());
            join_set.abort_all();
            agent::kill_all_children();
        }
        match tokio::time::timeout(remaining.max(Duration::from_millis(50)), join_set.join_next())
            .await
        {
            Ok(Some(Ok((task_id, outcome)))) => record_outcome(summary, &task_id, outcome),
            Ok(Some(Err(e))) => log_debug!("executor join error during shutdown: {}", e),
            Ok(None) => break,
            Err(_) => {
                // Timed out; next loop iteration hits the force path.
            }
        }
    }
}

fn record_outcome(summary: &mut RunSummary, task_id: &str, outcome: TaskRunOutcome) {
    log_debug!("[{}] executor finished: {:?}", task_id, outcome);
    let bucket = match outcome {
        TaskRunOutcome::Completed => &mut summary.tasks_completed,
        TaskRunOutcome::Failed => &mut summary.tasks_failed,
        TaskRunOutcome::Blocked => &mut summary.tasks_blocked,
        TaskRunOutcome::Paused => &mut summary.tasks_paused,
        TaskRunOutcome::Cancelled => &mut summary.tasks_cancelled,
    };
    bucket.push(task_id.to_string());
}

fn emit_session_update(
    deps: &ExecutorDeps,
    active: usize,
    tokens: &TokenUsage,
    cost_usd: f64,
    session_start: Instant,
    is_paused: bool,
) {
    deps.bus.publish(Event::SessionUpdate(SessionSnapshot {
        active_tasks: active as u32,
        tokens: *tokens,
        cost_usd,
        is_paused,
        duration_secs: session_start.elapsed().as_secs(),
    }));
}

/// Arm the per-task wall-clock timeout, when configured. The watchdog
/// cancels the task's own token; a finished task makes the cancel a
/// no-op.
fn spawn_task_timeout_watchdog(deps: &ExecutorDeps, task_id: &str, child: &CancellationToken) {
    let minutes = deps.config.execution.task_timeout_minutes;
    if minutes == 0 {
        return;
    }
    let token = child.clone();
    let task_id = task_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(minutes as u64 * 60)).await;
        if !token.is_cancelled() {
            log_warn!("[{}] wall-clock timeout reached; cancelling", task_id);
            token.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_starts_count_as_executions() {
        let mut summary = RunSummary::default();
        let mut tokens = TokenUsage::default();
        let mut cost = 0.0;

        let started = Event::PhaseStateChanged {
            task_id: "T-001".to_string(),
            phase_id: "implement".to_string(),
            old: PhaseStatus::Pending,
            new: PhaseStatus::Running,
        };
        let completed = Event::PhaseStateChanged {
            task_id: "T-001".to_string(),
            phase_id: "implement".to_string(),
            old: PhaseStatus::Running,
            new: PhaseStatus::Completed,
        };

        assert!(observe_event(&started, &mut summary, &mut tokens, &mut cost));
        assert!(observe_event(&completed, &mut summary, &mut tokens, &mut cost));
        // A rewound phase starting again counts a second execution.
        assert!(observe_event(&started, &mut summary, &mut tokens, &mut cost));
        assert_eq!(summary.phases_executed, 2);

        let iteration = Event::IterationAppended {
            task_id: "T-001".to_string(),
            phase_id: "implement".to_string(),
            index: 1,
            tokens: TokenUsage {
                input: 10,
                output: 2,
                cache_read: 0,
                cache_write: 0,
            },
            cost_usd: 0.5,
        };
        assert!(!observe_event(&iteration, &mut summary, &mut tokens, &mut cost));
        assert_eq!(tokens.input, 10);
        assert!((cost - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn outcomes_land_in_their_buckets() {
        let mut summary = RunSummary::default();
        record_outcome(&mut summary, "T-001", TaskRunOutcome::Completed);
        record_outcome(&mut summary, "T-002", TaskRunOutcome::Failed);
        record_outcome(&mut summary, "T-003", TaskRunOutcome::Paused);
        record_outcome(&mut summary, "T-004", TaskRunOutcome::Blocked);
        record_outcome(&mut summary, "T-005", TaskRunOutcome::Cancelled);
        assert_eq!(summary.tasks_completed, vec!["T-001"]);
        assert_eq!(summary.tasks_failed, vec!["T-002"]);
        assert_eq!(summary.tasks_paused, vec!["T-003"]);
        assert_eq!(summary.tasks_blocked, vec!["T-004"]);
        assert_eq!(summary.tasks_cancelled, vec!["T-005"]);
    }
}
