use crate::config::RetryConfig;
use crate::types::{ExecutionState, Plan, RetryContext};

/// How many characters of failure output travel in the retry handoff.
const EXCERPT_LIMIT: usize = 2_000;

/// Decision produced when a phase ends in retry or failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-enter `reentry_phase` carrying the context; phase records
    /// from there forward reset to pending.
    RetryFrom {
        reentry_phase: String,
        context: RetryContext,
    },
    /// The retry budget for this task is spent.
    Fail { reason: String },
}

/// Decide whether a failed phase rewinds or fails the task.
///
/// Pure over its inputs: the persisted per-phase retry counts travel in
/// ExecutionState so restarts keep the budget. The budget is checked
/// per (task, phase) pair; retries spent on other phases do not count
/// against this one.
pub fn decide(
    config: &RetryConfig,
    plan: &Plan,
    state: &ExecutionState,
    failing_phase: &str,
    failure_summary: &str,
    diagnostic_excerpt: Option<&str>,
) -> RetryDecision {
    let attempts = state.retry_count(failing_phase);

    if !plan.retry_enabled {
        return RetryDecision::Fail {
            reason: format!(
                "Phase {} failed and the {} profile does not retry: {}",
                failing_phase,
                profile_name(plan),
                failure_summary
            ),
        };
    }

    if attempts >= config.max_per_phase {
        return RetryDecision::Fail {
            reason: format!(
                "Phase {} failed after {} retries: {}",
                failing_phase, attempts, failure_summary
            ),
        };
    }

    let reentry = reentry_phase(config, plan, failing_phase);
    let Some(reentry) = reentry else {
        return RetryDecision::Fail {
            reason: format!(
                "Phase {} failed with no valid re-entry phase: {}",
                failing_phase, failure_summary
            ),
        };
    };

    RetryDecision::RetryFrom {
        reentry_phase: reentry,
        context: RetryContext {
            failing_phase: failing_phase.to_string(),
            failure_summary: failure_summary.to_string(),
            previous_attempt_count: attempts,
            diagnostic_excerpts: diagnostic_excerpt
                .map(|d| vec![truncate(d, EXCERPT_LIMIT)])
                .unwrap_or_default(),
        },
    }
}

/// Resolve the phase to re-enter for a failing phase: the configured
/// mapping when it names a phase that exists earlier in (or at) the
/// failing position, otherwise the failing phase itself.
fn reentry_phase(config: &RetryConfig, plan: &Plan, failing_phase: &str) -> Option<String> {
    let failing_idx = plan.phase_index(failing_phase)?;

    if let Some(mapped) = config.reentry.get(failing_phase) {
        if let Some(mapped_idx) = plan.phase_index(mapped) {
            if mapped_idx <= failing_idx {
                return Some(mapped.clone());
            }
        }
        // Mapping points outside this plan (e.g. `test -> implement` on
        // a plan without implement); fall through to self re-entry.
    }

    Some(failing_phase.to_string())
}

fn profile_name(plan: &Plan) -> String {
    format!("{:?}", plan.profile).to_lowercase()
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::types::{Profile, TaskWeight};

    fn small_plan() -> Plan {
        catalog::plan_for(TaskWeight::Small, Profile::Auto)
    }

    fn state_with_counts(counts: &[(&str, u32)]) -> ExecutionState {
        let mut state = ExecutionState::new("T-001");
        for (phase, n) in counts {
            state.retry_counts.insert(phase.to_string(), *n);
        }
        state
    }

    #[test]
    fn test_phase_rewinds_to_implement() {
        let decision = decide(
            &RetryConfig::default(),
            &small_plan(),
            &ExecutionState::new("T-001"),
            "test",
            "2 tests failed",
            Some("assertion failed"),
        );
        match decision {
            RetryDecision::RetryFrom {
                reentry_phase,
                context,
            } => {
                assert_eq!(reentry_phase, "implement");
                assert_eq!(context.failing_phase, "test");
                assert_eq!(context.previous_attempt_count, 0);
                assert_eq!(context.diagnostic_excerpts.len(), 1);
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn unmapped_phase_reenters_itself() {
        let decision = decide(
            &RetryConfig::default(),
            &small_plan(),
            &ExecutionState::new("T-001"),
            "implement",
            "stuck",
            None,
        );
        match decision {
            RetryDecision::RetryFrom { reentry_phase, .. } => {
                assert_eq!(reentry_phase, "implement")
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn exhausted_phase_budget_fails() {
        let state = state_with_counts(&[("test", 5)]);
        let decision = decide(
            &RetryConfig::default(),
            &small_plan(),
            &state,
            "test",
            "still failing",
            None,
        );
        match decision {
            RetryDecision::Fail { reason } => {
                assert!(reason.contains("after 5 retries"), "reason: {}", reason)
            }
            other => panic!("expected fail, got {:?}", other),
        }
    }

    #[test]
    fn other_phases_do_not_consume_this_phases_budget() {
        // implement has burned most of its own budget; test is fresh
        // and must still be allowed to rewind.
        let state = state_with_counts(&[("implement", 4)]);
        let decision = decide(
            &RetryConfig::default(),
            &small_plan(),
            &state,
            "test",
            "first failure",
            None,
        );
        match decision {
            RetryDecision::RetryFrom { context, .. } => {
                assert_eq!(context.previous_attempt_count, 0)
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn fast_profile_never_retries() {
        let plan = catalog::plan_for(TaskWeight::Small, Profile::Fast);
        let decision = decide(
            &RetryConfig::default(),
            &plan,
            &ExecutionState::new("T-001"),
            "test",
            "failed",
            None,
        );
        assert!(matches!(decision, RetryDecision::Fail { .. }));
    }

    #[test]
    fn excerpt_is_truncated() {
        let long = "x".repeat(10_000);
        let decision = decide(
            &RetryConfig::default(),
            &small_plan(),
            &ExecutionState::new("T-001"),
            "test",
            "failed",
            Some(&long),
        );
        match decision {
            RetryDecision::RetryFrom { context, .. } => {
                assert!(context.diagnostic_excerpts[0].len() <= EXCERPT_LIMIT + '…'.len_utf8());
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }
}
