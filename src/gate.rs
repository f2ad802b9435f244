use std::time::Duration;

use crate::agent::AgentRunner;
use crate::types::{GateAwait, GateDecision, GatePolicy, PhaseOutcome, PhasePlan, Task};
use crate::log_warn;

/// Decide what happens after a phase, per the phase's gate policy.
///
/// Paused and cancelled outcomes never reach the gate; the executor
/// short-circuits them. The `ai` policy spends exactly one bounded
/// review turn and cannot recurse.
pub async fn evaluate(
    runner: &dyn AgentRunner,
    task: &Task,
    phase: &PhasePlan,
    outcome: &PhaseOutcome,
    review_timeout: Duration,
) -> GateDecision {
    match outcome {
        PhaseOutcome::Completed { final_output, .. } => match phase.gate_policy {
            GatePolicy::Auto => GateDecision::Proceed,
            GatePolicy::Human => GateDecision::PauseForHuman {
                awaiting: GateAwait::PhaseApproval,
                reason: format!("phase {} awaits human approval", phase.phase_id),
            },
            GatePolicy::Ai => {
                run_review_turn(runner, task, &phase.phase_id, final_output, review_timeout).await
            }
        },
        // Failure-shaped outcomes route the same under every policy:
        // there is nothing for a reviewer to approve.
        PhaseOutcome::Exhausted => GateDecision::Retry {
            reason: format!(
                "phase {} ran out of iterations without a completion marker",
                phase.phase_id
            ),
        },
        PhaseOutcome::Stuck { signature } => GateDecision::Retry {
            reason: format!(
                "phase {} stuck on repeated failure signature {}",
                phase.phase_id, signature
            ),
        },
        PhaseOutcome::Blocked { reason } => GateDecision::PauseForHuman {
            awaiting: GateAwait::PhaseApproval,
            reason: reason.clone(),
        },
        PhaseOutcome::Failed { reason } => GateDecision::Fail {
            reason: reason.clone(),
        },
        PhaseOutcome::Paused { .. } | PhaseOutcome::Cancelled => GateDecision::Fail {
            reason: format!(
                "internal: {} outcome reached the gate evaluator",
                outcome_name(outcome)
            ),
        },
    }
}

/// Gate before the final PR/merge step. `None` policy (fast profile)
/// is handled by the caller and never reaches here.
pub async fn evaluate_merge_gate(
    runner: &dyn AgentRunner,
    task: &Task,
    policy: GatePolicy,
    review_timeout: Duration,
) -> GateDecision {
    match policy {
        GatePolicy::Auto => GateDecision::Proceed,
        GatePolicy::Human => GateDecision::PauseForHuman {
            awaiting: GateAwait::MergeApproval,
            reason: "final merge awaits human approval".to_string(),
        },
        GatePolicy::Ai => {
            let summary = format!(
                "All phases of task {} ({}) completed; the branch is ready to merge.",
                task.id, task.title
            );
            run_review_turn(runner, task, "merge", &summary, review_timeout).await
        }
    }
}

/// One bounded review turn. The verdict is parsed from well-known
/// tokens; an unreadable verdict is conservatively a retry.
async fn run_review_turn(
    runner: &dyn AgentRunner,
    task: &Task,
    phase_id: &str,
    work_summary: &str,
    timeout: Duration,
) -> GateDecision {
    let prompt = review_prompt(task, phase_id, work_summary);

    // Always a fresh session: the reviewer must not share the worker's
    // conversation, and the review step cannot recurse.
    match runner.run(None, &prompt, timeout).await {
        Ok(response) => parse_verdict(&response.output_text, phase_id),
        Err(e) => {
            log_warn!("[{}] review turn failed: {}", task.id, e);
            GateDecision::Retry {
                reason: format!("review agent failed for phase {}: {}", phase_id, e),
            }
        }
    }
}

fn review_prompt(task: &Task, phase_id: &str, work_summary: &str) -> String {
    format!(
        "# Review Gate\n\n\
        You are a review agent deciding whether the `{}` phase of task {} ({}) \
        may proceed. You get exactly one turn; do not attempt further work.\n\n\
        ## Work Summary\n\n{}\n\n\
        ## Verdict\n\n\
        Reply with exactly one line, one of:\n\n\
        VERDICT: APPROVE\n\
        VERDICT: CHANGES_REQUESTED <reasons>\n\
        VERDICT: REJECT <reason>\n",
        phase_id, task.id, task.title, work_summary,
    )
}

/// Map approve / changes_requested / reject onto proceed / retry / fail.
fn parse_verdict(output: &str, phase_id: &str) -> GateDecision {
    for line in output.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("VERDICT:") else {
            continue;
        };
        let rest = rest.trim();
        if rest.starts_with("APPROVE") {
            return GateDecision::Proceed;
        }
        if let Some(reasons) = rest.strip_prefix("CHANGES_REQUESTED") {
            return GateDecision::Retry {
                reason: format!(
                    "review requested changes for {}: {}",
                    phase_id,
                    reasons.trim()
                ),
            };
        }
        if let Some(reason) = rest.strip_prefix("REJECT") {
            return GateDecision::Fail {
                reason: format!("review rejected {}: {}", phase_id, reason.trim()),
            };
        }
    }
    GateDecision::Retry {
        reason: format!("review verdict for {} was unreadable", phase_id),
    }
}

fn outcome_name(outcome: &PhaseOutcome) -> &'static str {
    match outcome {
        PhaseOutcome::Completed { .. } => "completed",
        PhaseOutcome::Blocked { .. } => "blocked",
        PhaseOutcome::Stuck { .. } => "stuck",
        PhaseOutcome::Exhausted => "exhausted",
        PhaseOutcome::Paused { .. } => "paused",
        PhaseOutcome::Cancelled => "cancelled",
        PhaseOutcome::Failed { .. } => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgentRunner;
    use crate::types::{GatePolicy, PhasePlan, TokenUsage};

    fn phase(policy: GatePolicy) -> PhasePlan {
        PhasePlan {
            phase_id: "implement".to_string(),
            gate_policy: policy,
            max_iterations: 5,
        }
    }

    fn completed() -> PhaseOutcome {
        PhaseOutcome::Completed {
            final_output: "done".to_string(),
            session_key: Some("s1".to_string()),
            usage: TokenUsage::default(),
            cost_usd: 0.0,
        }
    }

    fn no_agent() -> MockAgentRunner {
        MockAgentRunner::new(vec![])
    }

    #[tokio::test]
    async fn auto_proceeds_on_completed() {
        let decision = evaluate(
            &no_agent(),
            &Task::default(),
            &phase(GatePolicy::Auto),
            &completed(),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(decision, GateDecision::Proceed);
    }

    #[tokio::test]
    async fn auto_retries_on_exhausted_and_stuck() {
        for outcome in [
            PhaseOutcome::Exhausted,
            PhaseOutcome::Stuck {
                signature: "abc".to_string(),
            },
        ] {
            let decision = evaluate(
                &no_agent(),
                &Task::default(),
                &phase(GatePolicy::Auto),
                &outcome,
                Duration::from_secs(1),
            )
            .await;
            assert!(matches!(decision, GateDecision::Retry { .. }));
        }
    }

    #[tokio::test]
    async fn blocked_pauses_for_human() {
        let decision = evaluate(
            &no_agent(),
            &Task::default(),
            &phase(GatePolicy::Auto),
            &PhaseOutcome::Blocked {
                reason: "need a decision".to_string(),
            },
            Duration::from_secs(1),
        )
        .await;
        match decision {
            GateDecision::PauseForHuman { reason, .. } => assert_eq!(reason, "need a decision"),
            other => panic!("expected pause, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn human_gate_pauses_on_completed() {
        let decision = evaluate(
            &no_agent(),
            &Task::default(),
            &phase(GatePolicy::Human),
            &completed(),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(
            decision,
            GateDecision::PauseForHuman {
                awaiting: GateAwait::PhaseApproval,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn ai_gate_maps_verdicts() {
        let cases = [
            ("VERDICT: APPROVE", GateDecision::Proceed),
            (
                "thinking...\nVERDICT: CHANGES_REQUESTED tests are thin",
                GateDecision::Retry {
                    reason: "review requested changes for implement: tests are thin".to_string(),
                },
            ),
            (
                "VERDICT: REJECT wrong approach",
                GateDecision::Fail {
                    reason: "review rejected implement: wrong approach".to_string(),
                },
            ),
        ];
        for (verdict, expected) in cases {
            let runner =
                MockAgentRunner::new(vec![Ok(MockAgentRunner::response(verdict, "review-1"))]);
            let decision = evaluate(
                &runner,
                &Task::default(),
                &phase(GatePolicy::Ai),
                &completed(),
                Duration::from_secs(1),
            )
            .await;
            assert_eq!(decision, expected);
        }
    }

    #[tokio::test]
    async fn unreadable_verdict_is_a_retry() {
        let runner = MockAgentRunner::new(vec![Ok(MockAgentRunner::response("hmm", "review-1"))]);
        let decision = evaluate(
            &runner,
            &Task::default(),
            &phase(GatePolicy::Ai),
            &completed(),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(decision, GateDecision::Retry { .. }));
    }

    #[tokio::test]
    async fn merge_gate_policies() {
        let decision = evaluate_merge_gate(
            &no_agent(),
            &Task::default(),
            GatePolicy::Auto,
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(decision, GateDecision::Proceed);

        let decision = evaluate_merge_gate(
            &no_agent(),
            &Task::default(),
            GatePolicy::Human,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(
            decision,
            GateDecision::PauseForHuman {
                awaiting: GateAwait::MergeApproval,
                ..
            }
        ));
    }
}
