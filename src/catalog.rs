use crate::types::{GatePolicy, PhasePlan, Plan, Profile, TaskWeight};

/// Phase names in pipeline order for each weight.
///
/// - trivial:    implement
/// - small:      implement, test
/// - medium:     spec, implement, review, test, docs
/// - large:      research, spec, design, implement, review, test, docs, validate
/// - greenfield: large + finalize
pub fn phases_for(weight: TaskWeight) -> &'static [&'static str] {
    match weight {
        TaskWeight::Trivial => &["implement"],
        TaskWeight::Small => &["implement", "test"],
        TaskWeight::Medium => &["spec", "implement", "review", "test", "docs"],
        TaskWeight::Large => &[
            "research", "spec", "design", "implement", "review", "test", "docs", "validate",
        ],
        TaskWeight::Greenfield => &[
            "research", "spec", "design", "implement", "review", "test", "docs", "validate",
            "finalize",
        ],
    }
}

/// Iteration budget per phase, scaled by weight.
pub fn max_iterations_for(weight: TaskWeight) -> u32 {
    match weight {
        TaskWeight::Trivial => 5,
        TaskWeight::Small => 12,
        TaskWeight::Medium => 25,
        TaskWeight::Large => 50,
        TaskWeight::Greenfield => 100,
    }
}

/// Gate policy for a named phase under a profile.
///
/// strict escalates the authoring phases (spec, design) and the merge
/// gate to a human; everything else is automatic. The `ai` policy is
/// never a default: it is opted into per task via config overrides.
fn gate_policy_for(profile: Profile, phase: &str) -> GatePolicy {
    match profile {
        Profile::Auto | Profile::Fast | Profile::Safe => GatePolicy::Auto,
        Profile::Strict => match phase {
            "spec" | "design" => GatePolicy::Human,
            _ => GatePolicy::Auto,
        },
    }
}

/// Gate applied before the final PR/merge step. `None` means no merge
/// gate at all (fast profile merges/PRs straight away).
fn merge_gate_for(profile: Profile) -> Option<GatePolicy> {
    match profile {
        Profile::Auto => Some(GatePolicy::Auto),
        Profile::Fast => None,
        Profile::Safe | Profile::Strict => Some(GatePolicy::Human),
    }
}

/// Derive the full phase plan for a (weight, profile) pair.
///
/// Pure function; the result is persisted on the task and immutable
/// afterwards (re-derived only on an explicit re-plan).
pub fn plan_for(weight: TaskWeight, profile: Profile) -> Plan {
    let max_iterations = max_iterations_for(weight);
    let phases = phases_for(weight)
        .iter()
        .map(|phase| PhasePlan {
            phase_id: phase.to_string(),
            gate_policy: gate_policy_for(profile, phase),
            max_iterations,
        })
        .collect();

    Plan {
        profile,
        phases,
        retry_enabled: profile != Profile::Fast,
        retry_needs_confirmation: profile == Profile::Strict,
        merge_gate: merge_gate_for(profile),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_selects_phase_list() {
        assert_eq!(phases_for(TaskWeight::Trivial), &["implement"]);
        assert_eq!(phases_for(TaskWeight::Small), &["implement", "test"]);
        assert_eq!(phases_for(TaskWeight::Medium).len(), 5);
        assert_eq!(phases_for(TaskWeight::Large).len(), 8);
        assert_eq!(phases_for(TaskWeight::Greenfield).len(), 9);
        assert_eq!(*phases_for(TaskWeight::Greenfield).last().unwrap(), "finalize");
    }

    #[test]
    fn iteration_budgets_scale_with_weight() {
        assert_eq!(max_iterations_for(TaskWeight::Trivial), 5);
        assert_eq!(max_iterations_for(TaskWeight::Large), 50);
        assert_eq!(max_iterations_for(TaskWeight::Greenfield), 100);
    }

    #[test]
    fn auto_profile_is_fully_automatic_with_merge_gate() {
        let plan = plan_for(TaskWeight::Medium, Profile::Auto);
        assert!(plan.phases.iter().all(|p| p.gate_policy == GatePolicy::Auto));
        assert!(plan.retry_enabled);
        assert!(!plan.retry_needs_confirmation);
        assert_eq!(plan.merge_gate, Some(GatePolicy::Auto));
    }

    #[test]
    fn fast_profile_skips_merge_gate_and_retries() {
        let plan = plan_for(TaskWeight::Small, Profile::Fast);
        assert_eq!(plan.merge_gate, None);
        assert!(!plan.retry_enabled);
    }

    #[test]
    fn safe_profile_has_human_merge_gate() {
        let plan = plan_for(TaskWeight::Small, Profile::Safe);
        assert_eq!(plan.merge_gate, Some(GatePolicy::Human));
        assert!(plan.phases.iter().all(|p| p.gate_policy == GatePolicy::Auto));
    }

    #[test]
    fn strict_profile_escalates_spec_and_design() {
        let plan = plan_for(TaskWeight::Large, Profile::Strict);
        let policy = |phase: &str| {
            plan.phases
                .iter()
                .find(|p| p.phase_id == phase)
                .map(|p| p.gate_policy)
                .unwrap()
        };
        assert_eq!(policy("spec"), GatePolicy::Human);
        assert_eq!(policy("design"), GatePolicy::Human);
        assert_eq!(policy("implement"), GatePolicy::Auto);
        assert_eq!(plan.merge_gate, Some(GatePolicy::Human));
        assert!(plan.retry_needs_confirmation);
    }

    #[test]
    fn plan_indexing() {
        let plan = plan_for(TaskWeight::Medium, Profile::Auto);
        assert_eq!(plan.phase_index("implement"), Some(1));
        assert_eq!(plan.phase_index("nonexistent"), None);
        assert_eq!(plan.len(), 5);
    }
}
