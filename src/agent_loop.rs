use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::AgentRunner;
use crate::bus::{Event, EventBus};
use crate::error::AgentError;
use crate::signal;
use crate::store::Store;
use crate::stuck::StuckDetector;
use crate::template::{TemplateSet, TemplateVars};
use crate::types::{
    now_rfc3339, CompletionSignal, ControlRequest, Iteration, PhaseOutcome, PhasePlan,
    RetryContext, Task, TokenUsage,
};
use crate::{log_debug, log_info, log_warn};

/// Transport retries per iteration before the phase fails.
const TRANSPORT_RETRY_MAX: u32 = 3;
const TRANSPORT_BACKOFF_MS: u64 = 500;

/// Inputs for one phase run.
pub struct LoopParams<'a> {
    pub task: &'a Task,
    pub phase: &'a PhasePlan,
    pub retry_context: Option<&'a RetryContext>,
    pub workspace: &'a Path,
    /// Session carried over from a paused run of this phase.
    pub session_key: Option<String>,
    /// First iteration index to run (continues past persisted ones).
    pub start_iteration: u32,
    pub iteration_timeout: Duration,
}

/// What the loop hands back to the executor.
pub struct LoopResult {
    pub outcome: PhaseOutcome,
    pub session_key: Option<String>,
    pub iterations_run: u32,
}

/// Drive one phase to a terminal signal.
///
/// Strictly sequential: one agent turn at a time. Suspension (pause,
/// cancel) happens only between iterations; a turn that is already in
/// flight finishes and its iteration is persisted before the loop
/// yields. Every iteration is appended to the store before the next
/// one starts.
pub async fn run_phase(
    store: &dyn Store,
    runner: &dyn AgentRunner,
    templates: &TemplateSet,
    bus: &EventBus,
    cancel: &CancellationToken,
    params: LoopParams<'_>,
) -> LoopResult {
    let task_id = params.task.id.as_str();
    let phase_id = params.phase.phase_id.as_str();

    let mut session_key = params.session_key;
    let mut stuck = StuckDetector::default();
    let mut usage_totals = TokenUsage::default();
    let mut cost_totals = 0.0_f64;
    let mut iterations_run = 0u32;

    let finish = |outcome: PhaseOutcome, session_key: Option<String>, iterations_run: u32| {
        LoopResult {
            outcome,
            session_key,
            iterations_run,
        }
    };

    let mut i = params.start_iteration.max(1);
    while i <= params.phase.max_iterations {
        // Suspension points: shutdown/cancel token, then store-level
        // pause/cancel requests, all between iterations only.
        if cancel.is_cancelled() {
            return finish(PhaseOutcome::Cancelled, session_key, iterations_run);
        }
        match store.take_control(task_id).await {
            Ok(Some(ControlRequest::Cancel)) => {
                return finish(PhaseOutcome::Cancelled, session_key, iterations_run);
            }
            Ok(Some(ControlRequest::Pause)) => {
                log_info!("[{}][{}] pause requested", task_id, phase_id.to_uppercase());
                return finish(
                    PhaseOutcome::Paused {
                        completed_iterations: i - 1,
                    },
                    session_key,
                    iterations_run,
                );
            }
            Ok(None) => {}
            Err(e) => {
                log_warn!("[{}] control check failed: {}", task_id, e);
            }
        }

        let prompt = match templates.render(&TemplateVars {
            task: params.task,
            phase: phase_id,
            iteration: i,
            workspace: params.workspace,
            retry_context: params.retry_context,
        }) {
            Ok(p) => p,
            Err(e) => {
                // Malformed template: config error, the phase fails loud.
                return finish(
                    PhaseOutcome::Failed {
                        reason: e.to_string(),
                    },
                    session_key,
                    iterations_run,
                );
            }
        };

        log_debug!(
            "[{}][{}] iteration {}/{} (session: {})",
            task_id,
            phase_id.to_uppercase(),
            i,
            params.phase.max_iterations,
            session_key.as_deref().unwrap_or("new")
        );

        let started = std::time::Instant::now();
        // The turn itself is never interrupted: cancellation is
        // cooperative at the iteration boundary, and an uncancellable
        // in-flight call finishes and gets persisted.
        let turn = run_turn_with_retry(
            runner,
            session_key.as_deref(),
            &prompt,
            params.iteration_timeout,
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let iteration = match turn {
            TurnResult::Response(response) => {
                if let Some(ref key) = response.session_key {
                    if session_key.as_deref() != Some(key.as_str()) {
                        session_key = Some(key.clone());
                        if let Err(e) = store
                            .set_session_key(task_id, session_key.clone())
                            .await
                        {
                            log_warn!("[{}] failed to persist session key: {}", task_id, e);
                        }
                    }
                }
                usage_totals.fold(&response.usage);
                cost_totals += response.cost_usd;

                let extracted = signal::extract_signal(&response.output_text, templates.sentinel());
                let error_signature = if extracted.signal == CompletionSignal::Complete {
                    None
                } else {
                    signal::error_signature(&response.output_text)
                };
                Iteration {
                    index: i,
                    output_text: response.output_text,
                    completion_signal: extracted.signal,
                    blocked_reason: extracted.blocked_reason,
                    error_signature,
                    tokens: response.usage,
                    cost_usd: response.cost_usd,
                    duration_ms,
                    created: now_rfc3339(),
                }
            }
            TurnResult::Timeout => Iteration {
                index: i,
                output_text: format!(
                    "(agent timed out after {}s)",
                    params.iteration_timeout.as_secs()
                ),
                completion_signal: CompletionSignal::Continue,
                blocked_reason: None,
                error_signature: Some(signal::timeout_signature()),
                tokens: TokenUsage::default(),
                cost_usd: 0.0,
                duration_ms,
                created: now_rfc3339(),
            },
            TurnResult::Protocol(message) => Iteration {
                index: i,
                output_text: format!("(agent protocol error: {})", message),
                completion_signal: CompletionSignal::ParseError,
                blocked_reason: None,
                error_signature: Some(signal::fingerprint_text(&message)),
                tokens: TokenUsage::default(),
                cost_usd: 0.0,
                duration_ms,
                created: now_rfc3339(),
            },
            TurnResult::Fatal(reason) => {
                return finish(
                    PhaseOutcome::Failed { reason },
                    session_key,
                    iterations_run,
                );
            }
        };

        let signal_kind = iteration.completion_signal.clone();
        let blocked_reason = iteration.blocked_reason.clone();
        let final_output = iteration.output_text.clone();
        let signature = iteration.error_signature.clone();
        let iter_tokens = iteration.tokens;
        let iter_cost = iteration.cost_usd;

        if let Err(e) = append_with_retry(store, task_id, phase_id, iteration).await {
            return finish(
                PhaseOutcome::Failed {
                    reason: format!("failed to persist iteration {}: {}", i, e),
                },
                session_key,
                iterations_run,
            );
        }
        iterations_run += 1;
        bus.publish(Event::IterationAppended {
            task_id: task_id.to_string(),
            phase_id: phase_id.to_string(),
            index: i,
            tokens: iter_tokens,
            cost_usd: iter_cost,
        });

        if stuck.observe(signature.as_deref()) {
            let signature = signature.unwrap_or_default();
            log_info!(
                "[{}][{}] stuck: signature {} repeated",
                task_id,
                phase_id.to_uppercase(),
                signature
            );
            return finish(PhaseOutcome::Stuck { signature }, session_key, iterations_run);
        }

        match signal_kind {
            CompletionSignal::Complete => {
                return finish(
                    PhaseOutcome::Completed {
                        final_output,
                        session_key: session_key.clone(),
                        usage: usage_totals,
                        cost_usd: cost_totals,
                    },
                    session_key,
                    iterations_run,
                );
            }
            CompletionSignal::Blocked => {
                let reason = blocked_reason.unwrap_or_else(|| "(no reason given)".to_string());
                return finish(PhaseOutcome::Blocked { reason }, session_key, iterations_run);
            }
            CompletionSignal::Continue | CompletionSignal::ParseError => {}
        }

        i += 1;
    }

    finish(PhaseOutcome::Exhausted, session_key, iterations_run)
}

enum TurnResult {
    Response(crate::agent::AgentResponse),
    Timeout,
    Protocol(String),
    Fatal(String),
}

/// One agent turn with bounded retry on transport blips. Rate limits
/// are surfaced immediately so credential rotation can happen outside
/// the engine.
async fn run_turn_with_retry(
    runner: &dyn AgentRunner,
    session_key: Option<&str>,
    prompt: &str,
    timeout: Duration,
) -> TurnResult {
    let mut attempt = 0;
    loop {
        match runner.run(session_key, prompt, timeout).await {
            Ok(response) => return TurnResult::Response(response),
            Err(AgentError::Timeout(_)) => return TurnResult::Timeout,
            Err(AgentError::Protocol(msg)) => return TurnResult::Protocol(msg),
            Err(AgentError::RateLimited(msg)) => {
                return TurnResult::Fatal(format!("agent rate limited: {}", msg));
            }
            Err(AgentError::Transport(msg)) => {
                attempt += 1;
                if attempt >= TRANSPORT_RETRY_MAX {
                    return TurnResult::Fatal(format!(
                        "agent transport failed after {} attempts: {}",
                        attempt, msg
                    ));
                }
                log_warn!(
                    "agent transport error (attempt {}/{}): {}",
                    attempt,
                    TRANSPORT_RETRY_MAX,
                    msg
                );
                tokio::time::sleep(Duration::from_millis(
                    TRANSPORT_BACKOFF_MS * (1 << attempt.min(4)),
                ))
                .await;
            }
        }
    }
}

/// Append an iteration with bounded retry on transient store errors.
async fn append_with_retry(
    store: &dyn Store,
    task_id: &str,
    phase_id: &str,
    iteration: Iteration,
) -> Result<u64, crate::error::StoreError> {
    let mut attempt = 0;
    loop {
        match store
            .append_iteration(task_id, phase_id, iteration.clone())
            .await
        {
            Ok(seq) => return Ok(seq),
            Err(crate::error::StoreError::Unavailable(msg)) if attempt < 2 => {
                attempt += 1;
                log_warn!(
                    "store unavailable appending iteration (attempt {}): {}",
                    attempt,
                    msg
                );
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
