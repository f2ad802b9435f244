use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Current UTC time as an RFC-3339 string, the form all persisted
/// timestamps use.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// --- Enums ---

/// Task lifecycle status. Persisted as lowercase snake_case strings;
/// in-memory code only ever sees these variants.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    Planned,
    Running,
    Paused,
    Blocked,
    Failed,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// True for the sink states of the status DAG.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Validates whether a transition from this status to `to` is allowed.
    ///
    /// Rules:
    /// - Any non-terminal status can transition to Cancelled
    /// - created -> planned -> running
    /// - running <-> paused, running <-> blocked
    /// - running -> failed / completed (terminal)
    /// - Terminal states have no outgoing transitions
    pub fn is_valid_transition(&self, to: &TaskStatus) -> bool {
        use TaskStatus::*;

        if self.is_terminal() {
            return false;
        }

        if *to == Cancelled {
            return true;
        }

        matches!(
            (self, to),
            (Created, Planned)
                | (Planned, Running)
                | (Running, Paused)
                | (Running, Blocked)
                | (Running, Failed)
                | (Running, Completed)
                | (Paused, Running)
                | (Blocked, Running)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Planned => "planned",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Failed => "failed",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

pub fn parse_task_status(s: &str) -> Result<TaskStatus, String> {
    match s.to_lowercase().as_str() {
        "created" => Ok(TaskStatus::Created),
        "planned" => Ok(TaskStatus::Planned),
        "running" => Ok(TaskStatus::Running),
        "paused" => Ok(TaskStatus::Paused),
        "blocked" => Ok(TaskStatus::Blocked),
        "failed" => Ok(TaskStatus::Failed),
        "completed" => Ok(TaskStatus::Completed),
        "cancelled" => Ok(TaskStatus::Cancelled),
        _ => Err(format!(
            "Invalid status '{}': expected created, planned, running, paused, blocked, failed, completed, or cancelled",
            s
        )),
    }
}

/// Qualitative task size. Selects the phase plan and iteration budgets.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskWeight {
    Trivial,
    #[default]
    Small,
    Medium,
    Large,
    Greenfield,
}

impl std::fmt::Display for TaskWeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskWeight::Trivial => "trivial",
            TaskWeight::Small => "small",
            TaskWeight::Medium => "medium",
            TaskWeight::Large => "large",
            TaskWeight::Greenfield => "greenfield",
        };
        write!(f, "{}", s)
    }
}

pub fn parse_weight(s: &str) -> Result<TaskWeight, String> {
    match s.to_lowercase().as_str() {
        "trivial" | "t" => Ok(TaskWeight::Trivial),
        "small" | "s" => Ok(TaskWeight::Small),
        "medium" | "m" => Ok(TaskWeight::Medium),
        "large" | "l" => Ok(TaskWeight::Large),
        "greenfield" | "g" => Ok(TaskWeight::Greenfield),
        _ => Err(format!(
            "Invalid weight '{}': expected trivial, small, medium, large, or greenfield",
            s
        )),
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Sort value for claim ordering: higher claims first.
    pub fn sort_value(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
        }
    }
}

pub fn parse_priority(s: &str) -> Result<Priority, String> {
    match s.to_lowercase().as_str() {
        "low" => Ok(Priority::Low),
        "normal" => Ok(Priority::Normal),
        "high" => Ok(Priority::High),
        _ => Err(format!(
            "Invalid priority '{}': expected low, normal, or high",
            s
        )),
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Queue {
    #[default]
    Active,
    Backlog,
}

/// Gate/retry policy bundle selected per run or per task.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Auto,
    Fast,
    Safe,
    Strict,
}

pub fn parse_profile(s: &str) -> Result<Profile, String> {
    match s.to_lowercase().as_str() {
        "auto" => Ok(Profile::Auto),
        "fast" => Ok(Profile::Fast),
        "safe" => Ok(Profile::Safe),
        "strict" => Ok(Profile::Strict),
        _ => Err(format!(
            "Invalid profile '{}': expected auto, fast, safe, or strict",
            s
        )),
    }
}

/// How the decision point after a phase is resolved.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    #[default]
    Auto,
    Ai,
    Human,
}

/// Per-phase execution status within a task's plan.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
    Skipped,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Blocked => "blocked",
            PhaseStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Phase signal extracted from one agent turn's output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    Complete,
    Blocked,
    Continue,
    ParseError,
}

// --- Plans ---

/// One entry of a task's phase plan. Immutable once derived.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PhasePlan {
    pub phase_id: String,
    pub gate_policy: GatePolicy,
    pub max_iterations: u32,
}

/// A task's full phase sequence plus the profile-level retry switches.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    pub profile: Profile,
    pub phases: Vec<PhasePlan>,
    /// Whether failed/exhausted phases may rewind to an earlier phase.
    pub retry_enabled: bool,
    /// Strict profile: rewinds wait for human confirmation first.
    pub retry_needs_confirmation: bool,
    /// Gate applied before the final PR/merge step. `None` skips the
    /// merge gate entirely (fast profile).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_gate: Option<GatePolicy>,
}

impl Plan {
    pub fn phase_index(&self, phase_id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.phase_id == phase_id)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

// --- Iterations and phase records ---

/// Token counts for one agent turn, or a fold of many.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenUsage {
    pub fn fold(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }

    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_write
    }
}

/// One agent turn within a phase run. Append-only in the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Iteration {
    /// 1-based index within the phase run, strictly increasing.
    pub index: u32,
    pub output_text: String,
    pub completion_signal: CompletionSignal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    /// Normalized, timestamp-stripped failure fingerprint; `None` for
    /// iterations that did not report a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_signature: Option<String>,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub created: String,
}

/// Per-phase execution record.
///
/// Invariant: `commit_sha` is set iff `status == Completed`. Iterations
/// are append-only within a run; a rewind resets the whole record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    #[serde(default)]
    pub iterations: Vec<Iteration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl PhaseRecord {
    /// Index the next appended iteration must carry.
    pub fn next_iteration_index(&self) -> u32 {
        self.iterations.len() as u32 + 1
    }
}

// --- Retry handoff ---

/// Structured handoff carried into a phase re-entered after a
/// downstream failure.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct RetryContext {
    pub failing_phase: String,
    pub failure_summary: String,
    pub previous_attempt_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostic_excerpts: Vec<String>,
}

// --- Gates ---

/// What the executor is parked on while a task sits at a human gate.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum GateAwait {
    /// Approval to proceed past a completed phase.
    PhaseApproval,
    /// Approval to run the final PR/merge step.
    MergeApproval,
    /// Strict profile: confirmation before rewinding to an earlier phase.
    RetryConfirmation { reentry_phase: String },
}

/// External answer to a human gate, written through the store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateResolution {
    Approved,
    Rejected,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GateWait {
    pub phase_id: String,
    pub awaiting: GateAwait,
    pub reason: String,
    /// Filled in by approve/reject; consumed on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<GateResolution>,
}

/// Decision emitted by the gate evaluator between phases.
#[derive(Clone, Debug, PartialEq)]
pub enum GateDecision {
    Proceed,
    Retry { reason: String },
    PauseForHuman { awaiting: GateAwait, reason: String },
    Fail { reason: String },
}

// --- Phase outcomes ---

/// Terminal result of driving one phase through the agent loop.
#[derive(Clone, Debug, PartialEq)]
pub enum PhaseOutcome {
    Completed {
        final_output: String,
        session_key: Option<String>,
        usage: TokenUsage,
        cost_usd: f64,
    },
    Blocked {
        reason: String,
    },
    /// The same failure signature repeated across consecutive iterations.
    Stuck {
        signature: String,
    },
    /// The iteration budget ran out without a completion marker.
    Exhausted,
    Paused {
        completed_iterations: u32,
    },
    Cancelled,
    /// Non-iteration failure (template error, store failure, ...).
    Failed {
        reason: String,
    },
}

// --- Execution state ---

/// Record of a pending or completed PR creation. `pr_id == None` means
/// the intent was recorded but completion was never observed; resume
/// must reconcile against the hosting provider before creating again.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PrIntent {
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub recorded_at: String,
}

/// The resumable execution cursor, at most one per task.
///
/// Invariants: `current_phase_index <= plan.len()` (equal means all
/// phases are done and only finalization remains); at most one phase
/// record is `Running` at a time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ExecutionState {
    pub task_id: String,
    pub current_phase_index: usize,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_context: Option<RetryContext>,
    /// Rewind counts per phase, persisted so restarts keep the budget.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub retry_counts: HashMap<String, u32>,
    /// Opaque handle to an in-flight agent conversation. Never parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_intent: Option<PrIntent>,
    /// Set when a paused task may be claimed again.
    #[serde(default)]
    pub resume_requested: bool,
    /// The merge gate was answered (or auto-passed); finalization must
    /// not ask again on resume.
    #[serde(default)]
    pub merge_gate_passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_wait: Option<GateWait>,
    pub updated: String,
}

impl ExecutionState {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            updated: now_rfc3339(),
            ..Default::default()
        }
    }

    pub fn phase_record(&self, phase_id: &str) -> Option<&PhaseRecord> {
        self.phases.get(phase_id)
    }

    pub fn retry_count(&self, phase_id: &str) -> u32 {
        self.retry_counts.get(phase_id).copied().unwrap_or(0)
    }
}

// --- Tasks ---

/// Aggregated token/cost totals across all of a task's iterations.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct TaskTotals {
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub iterations: u32,
}

/// Actionable failure detail recorded when a task ends `failed` or
/// `blocked`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskFailure {
    pub phase_id: String,
    pub reason: String,
}

/// Out-of-band request against a running task, honored at the next
/// iteration boundary.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    Pause,
    Cancel,
}

/// The unit of work.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_text: Option<String>,
    pub weight: TaskWeight,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub queue: Queue,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub blocked_by: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub related_to: BTreeSet<String>,
    /// Phase sequence derived at plan time; regenerated only on an
    /// explicit re-plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    /// Identity of the worker that claimed this task, while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Pending pause/cancel request, consumed at iteration boundaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    #[serde(default)]
    pub totals: TaskTotals,
    pub created: String,
    pub updated: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(!terminal.is_valid_transition(&TaskStatus::Running));
            assert!(!terminal.is_valid_transition(&TaskStatus::Cancelled));
        }
    }

    #[test]
    fn cancel_allowed_from_any_non_terminal() {
        for from in [
            TaskStatus::Created,
            TaskStatus::Planned,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Blocked,
        ] {
            assert!(
                from.is_valid_transition(&TaskStatus::Cancelled),
                "{} -> cancelled should be allowed",
                from
            );
        }
    }

    #[test]
    fn forward_progression() {
        assert!(TaskStatus::Created.is_valid_transition(&TaskStatus::Planned));
        assert!(TaskStatus::Planned.is_valid_transition(&TaskStatus::Running));
        assert!(TaskStatus::Running.is_valid_transition(&TaskStatus::Completed));
        assert!(!TaskStatus::Created.is_valid_transition(&TaskStatus::Running));
        assert!(!TaskStatus::Paused.is_valid_transition(&TaskStatus::Completed));
    }

    #[test]
    fn pause_and_block_round_trip() {
        assert!(TaskStatus::Running.is_valid_transition(&TaskStatus::Paused));
        assert!(TaskStatus::Paused.is_valid_transition(&TaskStatus::Running));
        assert!(TaskStatus::Running.is_valid_transition(&TaskStatus::Blocked));
        assert!(TaskStatus::Blocked.is_valid_transition(&TaskStatus::Running));
    }

    #[test]
    fn enum_string_forms_are_stable() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&TaskWeight::Greenfield).unwrap(),
            "\"greenfield\""
        );
        assert_eq!(
            serde_json::to_string(&CompletionSignal::ParseError).unwrap(),
            "\"parse_error\""
        );
        assert_eq!(
            serde_json::to_string(&PhaseStatus::Pending).unwrap(),
            "\"pending\""
        );
    }

    #[test]
    fn parse_helpers_accept_shorthand() {
        assert_eq!(parse_weight("m").unwrap(), TaskWeight::Medium);
        assert_eq!(parse_weight("GREENFIELD").unwrap(), TaskWeight::Greenfield);
        assert!(parse_weight("huge").is_err());
        assert_eq!(parse_profile("strict").unwrap(), Profile::Strict);
        assert!(parse_profile("yolo").is_err());
    }

    #[test]
    fn token_usage_folds() {
        let mut a = TokenUsage {
            input: 10,
            output: 5,
            cache_read: 2,
            cache_write: 1,
        };
        let b = TokenUsage {
            input: 1,
            output: 2,
            cache_read: 3,
            cache_write: 4,
        };
        a.fold(&b);
        assert_eq!(a.input, 11);
        assert_eq!(a.output, 7);
        assert_eq!(a.total(), 28);
    }
}
