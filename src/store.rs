use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::StoreError;
use crate::types::{
    now_rfc3339, ControlRequest, ExecutionState, GateResolution, Iteration, Plan, Priority, Queue,
    Task, TaskFailure, TaskStatus, TaskTotals, TaskWeight, TokenUsage,
};

pub type StoreResult<T> = Result<T, StoreError>;

// --- Store-facing records ---

/// Inputs for creating a task. Ids are issued by the store.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub spec_text: Option<String>,
    pub weight: TaskWeight,
    pub category: Option<String>,
    pub priority: Priority,
    pub queue: Queue,
    pub blocked_by: BTreeSet<String>,
    pub related_to: BTreeSet<String>,
}

/// Token/cost totals folded per calendar month (`YYYY-MM`).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct CostPeriod {
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub iterations: u32,
}

/// A successful claim: the task (now `running`) plus the status it was
/// claimed out of, for event reporting.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    pub claimed_from: TaskStatus,
}

/// One persisted event, for replay by resubscribing clients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventRecord {
    /// Assigned by the store, monotonically increasing.
    #[serde(default)]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created: String,
}

// --- Trait ---

/// Typed persistence operations the engine relies on.
///
/// The three atomic operations (`claim_ready_task`, `append_iteration`,
/// `transition_phase`) carry the engine's correctness: claims are
/// linearizable so two workers never take the same task, iteration
/// appends fold counters in the same transaction, and phase
/// transitions are compare-and-set so stale writers lose with
/// `Conflict` instead of clobbering terminal state.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_task(&self, new: NewTask) -> StoreResult<Task>;
    async fn get_task(&self, id: &str) -> StoreResult<Task>;
    async fn list_tasks(&self) -> StoreResult<Vec<Task>>;

    /// Attach the derived plan and move `created` -> `planned`.
    async fn set_plan(&self, id: &str, plan: Plan) -> StoreResult<Task>;

    /// Compare-and-set status transition, validated against the status
    /// DAG. Stamps `started`/`finished`, clears the worker on terminal.
    async fn update_task_status(
        &self,
        id: &str,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> StoreResult<Task>;

    async fn record_task_failure(&self, id: &str, failure: TaskFailure) -> StoreResult<()>;

    /// Ask a running task to pause or cancel at its next iteration
    /// boundary.
    async fn request_control(&self, id: &str, control: ControlRequest) -> StoreResult<()>;

    /// Read and clear any pending control request (atomic take).
    async fn take_control(&self, id: &str) -> StoreResult<Option<ControlRequest>>;

    /// Atomically claim the next ready task for `worker_id`: `planned`,
    /// or `paused`/`blocked` with a resume request, with all
    /// `blocked_by` dependencies completed. FIFO by creation within
    /// priority.
    async fn claim_ready_task(&self, worker_id: &str) -> StoreResult<Option<ClaimedTask>>;

    /// Append one iteration and fold its tokens/cost into the phase
    /// record, the task totals, and the current cost period, in one
    /// transaction. Returns the iteration's sequence number.
    async fn append_iteration(
        &self,
        task_id: &str,
        phase_id: &str,
        iteration: Iteration,
    ) -> StoreResult<u64>;

    /// Compare-and-set on a phase record's status. `commit_sha` is
    /// accepted only together with `Completed`.
    async fn transition_phase(
        &self,
        task_id: &str,
        phase_id: &str,
        expected: PhaseStatusExpectation,
        new: crate::types::PhaseStatus,
        commit_sha: Option<String>,
    ) -> StoreResult<()>;

    async fn load_execution_state(&self, task_id: &str) -> StoreResult<Option<ExecutionState>>;

    /// Persist the agent session handle as soon as it is known, so a
    /// crash mid-phase can resume the same conversation.
    async fn set_session_key(&self, task_id: &str, session_key: Option<String>) -> StoreResult<()>;

    /// Upsert the execution cursor. The owning executor is the only
    /// writer while the task runs.
    async fn save_execution_state(&self, state: ExecutionState) -> StoreResult<()>;

    /// Answer a human gate and mark the task resumable.
    async fn resolve_gate(&self, task_id: &str, resolution: GateResolution) -> StoreResult<Task>;

    /// Mark a paused task claimable again.
    async fn request_resume(&self, task_id: &str) -> StoreResult<Task>;

    /// Startup stale-session scan: tasks left `running` by a dead
    /// process become `paused` + resumable. Returns the affected ids.
    async fn recover_orphaned_running(&self) -> StoreResult<Vec<String>>;

    async fn append_event(&self, event: EventRecord) -> StoreResult<u64>;
    async fn events_since(&self, cursor: u64, limit: usize) -> StoreResult<Vec<EventRecord>>;

    async fn cost_periods(&self) -> StoreResult<BTreeMap<String, CostPeriod>>;
}

/// Expected status for the phase CAS. `Any` is for recovery paths that
/// legitimately do not know the current status (e.g. resetting records
/// on a rewind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatusExpectation {
    Exactly(crate::types::PhaseStatus),
    Any,
}

// --- File-backed implementation ---

const SCHEMA_VERSION: u32 = 1;
const STATE_FILE: &str = "state.json";
const STATE_LOCK: &str = "state.lock";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
struct StateFile {
    schema_version: u32,
    prefix: String,
    /// Highest numeric suffix ever issued, so archived ids are never
    /// reused.
    next_task_id: u32,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    execution: BTreeMap<String, ExecutionState>,
    #[serde(default)]
    cost_periods: BTreeMap<String, CostPeriod>,
    #[serde(default)]
    events: Vec<EventRecord>,
    #[serde(default)]
    next_event_seq: u64,
}

impl StateFile {
    fn task(&self, id: &str) -> StoreResult<&Task> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))
    }

    fn task_mut(&mut self, id: &str) -> StoreResult<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))
    }
}

/// Store persisting one JSON state document per project under
/// `.maestro/`, mirroring the relational layout (tasks,
/// execution_state, phase_record, iteration, cost_period, event) as
/// nested documents.
///
/// Every operation is a read-modify-write of the whole document under
/// an OS file lock, so claims are linearizable across workers and
/// across processes (control commands run in their own process while
/// the orchestrator holds the run lock). Writes use the
/// write-temp-sync-rename pattern: the file is always either the old
/// state or the new state, never partial.
pub struct FileStore {
    dir: PathBuf,
    /// Serializes operations within this process; the file lock covers
    /// other processes.
    op_lock: tokio::sync::Mutex<()>,
    prefix: String,
}

impl FileStore {
    /// Open (or initialize) the store in `<project_root>/.maestro/`.
    pub fn open(project_root: &Path, prefix: &str) -> StoreResult<Self> {
        let dir = project_root.join(".maestro");
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Unavailable(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            op_lock: tokio::sync::Mutex::new(()),
            prefix: prefix.to_string(),
        })
    }

    async fn with_state<R, F>(&self, mutate: bool, f: F) -> StoreResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut StateFile) -> StoreResult<R> + Send + 'static,
    {
        let _guard = self.op_lock.lock().await;
        let dir = self.dir.clone();
        let prefix = self.prefix.clone();

        tokio::task::spawn_blocking(move || {
            let lock_path = dir.join(STATE_LOCK);
            let mut lock = fslock::LockFile::open(&lock_path)
                .map_err(|e| StoreError::Unavailable(format!("open lock: {}", e)))?;
            lock.lock()
                .map_err(|e| StoreError::Unavailable(format!("acquire lock: {}", e)))?;

            let state_path = dir.join(STATE_FILE);
            let mut state = load_state(&state_path, &prefix)?;
            let result = f(&mut state)?;
            if mutate {
                save_state(&state_path, &state)?;
            }
            // lock releases on drop
            Ok(result)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task panicked: {}", e)))?
    }
}

fn load_state(path: &Path, prefix: &str) -> StoreResult<StateFile> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StateFile {
                schema_version: SCHEMA_VERSION,
                prefix: prefix.to_string(),
                ..Default::default()
            });
        }
        Err(e) => {
            return Err(StoreError::Unavailable(format!(
                "read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let state: StateFile = serde_json::from_str(&contents)
        .map_err(|e| StoreError::Corruption(format!("parse {}: {}", path.display(), e)))?;

    if state.schema_version != SCHEMA_VERSION {
        return Err(StoreError::Corruption(format!(
            "unsupported schema_version {} in {} (expected {})",
            state.schema_version,
            path.display(),
            SCHEMA_VERSION
        )));
    }

    Ok(state)
}

/// Atomic write: temp file in the same directory, fsync, rename.
fn save_state(path: &Path, state: &StateFile) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Unavailable(format!("no parent for {}", path.display())))?;

    let json = serde_json::to_string_pretty(state)
        .map_err(|e| StoreError::Unavailable(format!("serialize state: {}", e)))?;

    let temp = NamedTempFile::new_in(parent)
        .map_err(|e| StoreError::Unavailable(format!("create temp file: {}", e)))?;
    fs::write(temp.path(), &json)
        .map_err(|e| StoreError::Unavailable(format!("write temp file: {}", e)))?;
    let file = fs::File::open(temp.path())
        .map_err(|e| StoreError::Unavailable(format!("open temp for sync: {}", e)))?;
    file.sync_all()
        .map_err(|e| StoreError::Unavailable(format!("sync temp file: {}", e)))?;
    temp.persist(path)
        .map_err(|e| StoreError::Unavailable(format!("rename into place: {}", e)))?;
    Ok(())
}

// --- Pure helpers ---

/// Next sequential id: max(numeric suffixes, high-water mark) + 1.
fn generate_next_id(state: &StateFile) -> (String, u32) {
    let max_existing = state
        .tasks
        .iter()
        .filter_map(|t| t.id.rsplit('-').next())
        .filter_map(|s| s.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    let next = max_existing.max(state.next_task_id) + 1;
    (format!("{}-{:03}", state.prefix, next), next)
}

/// Reject dependency sets that would create a cycle among the known
/// tasks (treating the new task's edges as already inserted).
fn check_acyclic(tasks: &[Task], new_id: &str, blocked_by: &BTreeSet<String>) -> StoreResult<()> {
    if blocked_by.contains(new_id) {
        return Err(StoreError::Conflict(format!(
            "task {} cannot depend on itself",
            new_id
        )));
    }

    // DFS from each new dependency; reaching new_id means a cycle.
    let mut stack: Vec<&str> = blocked_by.iter().map(|s| s.as_str()).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(id) = stack.pop() {
        if id == new_id {
            return Err(StoreError::Conflict(format!(
                "dependency cycle through task {}",
                new_id
            )));
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(task) = tasks.iter().find(|t| t.id == id) {
            stack.extend(task.blocked_by.iter().map(|s| s.as_str()));
        }
    }
    Ok(())
}

/// A dependency is met if the blocker is completed, or absent from the
/// store (archived).
fn deps_met(task: &Task, all: &[Task]) -> bool {
    task.blocked_by.iter().all(|dep| {
        match all.iter().find(|t| t.id == *dep) {
            Some(blocker) => blocker.status == TaskStatus::Completed,
            None => true,
        }
    })
}

fn cas_status(task: &mut Task, expected: TaskStatus, new: TaskStatus) -> StoreResult<()> {
    if task.status != expected {
        return Err(StoreError::Conflict(format!(
            "task {} is {} (expected {})",
            task.id, task.status, expected
        )));
    }
    if !task.status.is_valid_transition(&new) {
        return Err(StoreError::Conflict(format!(
            "invalid transition {} -> {} for task {}",
            task.status, new, task.id
        )));
    }
    task.status = new;
    task.updated = now_rfc3339();
    if new == TaskStatus::Running && task.started.is_none() {
        task.started = Some(now_rfc3339());
    }
    if new.is_terminal() {
        task.finished = Some(now_rfc3339());
        task.worker_id = None;
        task.control = None;
    }
    Ok(())
}

fn current_period_key() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

// --- Trait implementation ---

#[async_trait]
impl Store for FileStore {
    async fn create_task(&self, new: NewTask) -> StoreResult<Task> {
        self.with_state(true, move |state| {
            let (id, suffix) = generate_next_id(state);
            check_acyclic(&state.tasks, &id, &new.blocked_by)?;
            state.next_task_id = suffix;

            let now = now_rfc3339();
            let task = Task {
                id,
                title: new.title,
                description: new.description,
                spec_text: new.spec_text,
                weight: new.weight,
                category: new.category,
                priority: new.priority,
                queue: new.queue,
                status: TaskStatus::Created,
                blocked_by: new.blocked_by,
                related_to: new.related_to,
                plan: None,
                worker_id: None,
                control: None,
                failure: None,
                totals: TaskTotals::default(),
                created: now.clone(),
                updated: now,
                started: None,
                finished: None,
            };
            state.tasks.push(task.clone());
            Ok(task)
        })
        .await
    }

    async fn get_task(&self, id: &str) -> StoreResult<Task> {
        let id = id.to_string();
        self.with_state(false, move |state| state.task(&id).cloned())
            .await
    }

    async fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        self.with_state(false, |state| Ok(state.tasks.clone())).await
    }

    async fn set_plan(&self, id: &str, plan: Plan) -> StoreResult<Task> {
        let id = id.to_string();
        self.with_state(true, move |state| {
            let task = state.task_mut(&id)?;
            cas_status(task, TaskStatus::Created, TaskStatus::Planned)?;
            task.plan = Some(plan);
            Ok(task.clone())
        })
        .await
    }

    async fn update_task_status(
        &self,
        id: &str,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> StoreResult<Task> {
        let id = id.to_string();
        self.with_state(true, move |state| {
            let task = state.task_mut(&id)?;
            cas_status(task, expected, new)?;
            Ok(task.clone())
        })
        .await
    }

    async fn record_task_failure(&self, id: &str, failure: TaskFailure) -> StoreResult<()> {
        let id = id.to_string();
        self.with_state(true, move |state| {
            let task = state.task_mut(&id)?;
            task.failure = Some(failure);
            task.updated = now_rfc3339();
            Ok(())
        })
        .await
    }

    async fn request_control(&self, id: &str, control: ControlRequest) -> StoreResult<()> {
        let id = id.to_string();
        self.with_state(true, move |state| {
            let task = state.task_mut(&id)?;
            if task.status.is_terminal() {
                return Err(StoreError::Conflict(format!(
                    "task {} is already {}",
                    task.id, task.status
                )));
            }
            task.control = Some(control);
            task.updated = now_rfc3339();
            Ok(())
        })
        .await
    }

    async fn take_control(&self, id: &str) -> StoreResult<Option<ControlRequest>> {
        let id = id.to_string();
        self.with_state(true, move |state| {
            let task = state.task_mut(&id)?;
            Ok(task.control.take())
        })
        .await
    }

    async fn claim_ready_task(&self, worker_id: &str) -> StoreResult<Option<ClaimedTask>> {
        let worker_id = worker_id.to_string();
        self.with_state(true, move |state| {
            let tasks_snapshot = state.tasks.clone();

            let mut candidates: Vec<usize> = state
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.queue == Queue::Active && t.plan.is_some())
                .filter(|(_, t)| match t.status {
                    TaskStatus::Planned => true,
                    // Paused and blocked tasks wait for an explicit
                    // resume/resolve before they are claimable again.
                    TaskStatus::Paused | TaskStatus::Blocked => state
                        .execution
                        .get(&t.id)
                        .map(|e| e.resume_requested)
                        .unwrap_or(false),
                    _ => false,
                })
                .filter(|(_, t)| deps_met(t, &tasks_snapshot))
                .map(|(i, _)| i)
                .collect();

            // Priority first, then FIFO by creation time.
            candidates.sort_by(|&a, &b| {
                let (ta, tb) = (&state.tasks[a], &state.tasks[b]);
                tb.priority
                    .sort_value()
                    .cmp(&ta.priority.sort_value())
                    .then_with(|| ta.created.cmp(&tb.created))
                    .then_with(|| ta.id.cmp(&tb.id))
            });

            let Some(&idx) = candidates.first() else {
                return Ok(None);
            };

            let id = state.tasks[idx].id.clone();
            let expected = state.tasks[idx].status;
            {
                let task = &mut state.tasks[idx];
                cas_status(task, expected, TaskStatus::Running)?;
                task.worker_id = Some(worker_id);
            }

            let exec = state
                .execution
                .entry(id.clone())
                .or_insert_with(|| ExecutionState::new(&id));
            exec.resume_requested = false;
            exec.updated = now_rfc3339();

            Ok(Some(ClaimedTask {
                task: state.tasks[idx].clone(),
                claimed_from: expected,
            }))
        })
        .await
    }

    async fn append_iteration(
        &self,
        task_id: &str,
        phase_id: &str,
        iteration: Iteration,
    ) -> StoreResult<u64> {
        let task_id = task_id.to_string();
        let phase_id = phase_id.to_string();
        self.with_state(true, move |state| {
            let exec = state
                .execution
                .get_mut(&task_id)
                .ok_or_else(|| StoreError::NotFound(format!("execution state {}", task_id)))?;
            let record = exec.phases.entry(phase_id.clone()).or_default();

            let expected_index = record.next_iteration_index();
            if iteration.index != expected_index {
                return Err(StoreError::Conflict(format!(
                    "iteration index {} for {}/{} (expected {})",
                    iteration.index, task_id, phase_id, expected_index
                )));
            }
            if record
                .iterations
                .last()
                .map(|last| last.completion_signal == crate::types::CompletionSignal::Complete)
                .unwrap_or(false)
            {
                return Err(StoreError::Conflict(format!(
                    "phase {}/{} already saw a completion marker",
                    task_id, phase_id
                )));
            }

            let tokens = iteration.tokens;
            let cost = iteration.cost_usd;
            record.iterations.push(iteration);
            exec.updated = now_rfc3339();

            let task = state.task_mut(&task_id)?;
            task.totals.tokens.fold(&tokens);
            task.totals.cost_usd += cost;
            task.totals.iterations += 1;
            task.updated = now_rfc3339();

            let period = state.cost_periods.entry(current_period_key()).or_default();
            period.tokens.fold(&tokens);
            period.cost_usd += cost;
            period.iterations += 1;

            Ok(expected_index as u64)
        })
        .await
    }

    async fn transition_phase(
        &self,
        task_id: &str,
        phase_id: &str,
        expected: PhaseStatusExpectation,
        new: crate::types::PhaseStatus,
        commit_sha: Option<String>,
    ) -> StoreResult<()> {
        use crate::types::PhaseStatus;

        let task_id = task_id.to_string();
        let phase_id = phase_id.to_string();
        self.with_state(true, move |state| {
            if commit_sha.is_some() && new != PhaseStatus::Completed {
                return Err(StoreError::Conflict(format!(
                    "commit sha only accompanies completed (got {})",
                    new
                )));
            }

            let exec = state
                .execution
                .get_mut(&task_id)
                .ok_or_else(|| StoreError::NotFound(format!("execution state {}", task_id)))?;

            // At most one running phase record per task.
            if new == PhaseStatus::Running {
                if let Some((other, _)) = exec
                    .phases
                    .iter()
                    .find(|(id, r)| **id != phase_id && r.status == PhaseStatus::Running)
                {
                    return Err(StoreError::Conflict(format!(
                        "phase {} is already running for task {}",
                        other, task_id
                    )));
                }
            }

            let record = exec.phases.entry(phase_id.clone()).or_default();
            match expected {
                PhaseStatusExpectation::Exactly(status) if record.status != status => {
                    return Err(StoreError::Conflict(format!(
                        "phase {}/{} is {} (expected {})",
                        task_id, phase_id, record.status, status
                    )));
                }
                _ => {}
            }

            record.status = new;
            match new {
                PhaseStatus::Running => {
                    if record.started_at.is_none() {
                        record.started_at = Some(now_rfc3339());
                    }
                    record.finished_at = None;
                }
                PhaseStatus::Completed => {
                    record.commit_sha = commit_sha;
                    record.finished_at = Some(now_rfc3339());
                }
                PhaseStatus::Failed | PhaseStatus::Blocked | PhaseStatus::Skipped => {
                    record.finished_at = Some(now_rfc3339());
                }
                PhaseStatus::Pending => {
                    // Rewind: the record starts over.
                    record.iterations.clear();
                    record.commit_sha = None;
                    record.started_at = None;
                    record.finished_at = None;
                }
            }
            exec.updated = now_rfc3339();
            Ok(())
        })
        .await
    }

    async fn load_execution_state(&self, task_id: &str) -> StoreResult<Option<ExecutionState>> {
        let task_id = task_id.to_string();
        self.with_state(false, move |state| {
            Ok(state.execution.get(&task_id).cloned())
        })
        .await
    }

    async fn set_session_key(&self, task_id: &str, session_key: Option<String>) -> StoreResult<()> {
        let task_id = task_id.to_string();
        self.with_state(true, move |state| {
            let exec = state
                .execution
                .get_mut(&task_id)
                .ok_or_else(|| StoreError::NotFound(format!("execution state {}", task_id)))?;
            exec.session_key = session_key;
            exec.updated = now_rfc3339();
            Ok(())
        })
        .await
    }

    async fn save_execution_state(&self, exec: ExecutionState) -> StoreResult<()> {
        self.with_state(true, move |state| {
            state.task(&exec.task_id)?;
            let mut exec = exec;
            exec.updated = now_rfc3339();
            state.execution.insert(exec.task_id.clone(), exec);
            Ok(())
        })
        .await
    }

    async fn resolve_gate(&self, task_id: &str, resolution: GateResolution) -> StoreResult<Task> {
        let task_id = task_id.to_string();
        self.with_state(true, move |state| {
            let exec = state
                .execution
                .get_mut(&task_id)
                .ok_or_else(|| StoreError::NotFound(format!("execution state {}", task_id)))?;
            let Some(ref mut wait) = exec.gate_wait else {
                return Err(StoreError::Conflict(format!(
                    "task {} is not waiting at a gate",
                    task_id
                )));
            };
            wait.resolution = Some(resolution);
            exec.resume_requested = true;
            exec.updated = now_rfc3339();

            let task = state.task(&task_id)?.clone();
            if task.status != TaskStatus::Paused {
                return Err(StoreError::Conflict(format!(
                    "task {} is {} (expected paused)",
                    task_id, task.status
                )));
            }
            Ok(task)
        })
        .await
    }

    async fn request_resume(&self, task_id: &str) -> StoreResult<Task> {
        let task_id = task_id.to_string();
        self.with_state(true, move |state| {
            let task = state.task(&task_id)?.clone();
            if !matches!(task.status, TaskStatus::Paused | TaskStatus::Blocked) {
                return Err(StoreError::Conflict(format!(
                    "task {} is {} (only paused or blocked tasks resume)",
                    task_id, task.status
                )));
            }
            let exec = state
                .execution
                .entry(task_id.clone())
                .or_insert_with(|| ExecutionState::new(&task_id));
            exec.resume_requested = true;
            exec.updated = now_rfc3339();
            Ok(task)
        })
        .await
    }

    async fn recover_orphaned_running(&self) -> StoreResult<Vec<String>> {
        self.with_state(true, |state| {
            let mut recovered = Vec::new();
            let ids: Vec<String> = state
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Running)
                .map(|t| t.id.clone())
                .collect();

            for id in ids {
                let task = state.task_mut(&id)?;
                cas_status(task, TaskStatus::Running, TaskStatus::Paused)?;
                task.worker_id = None;
                let exec = state
                    .execution
                    .entry(id.clone())
                    .or_insert_with(|| ExecutionState::new(&id));
                exec.resume_requested = true;
                exec.updated = now_rfc3339();
                recovered.push(id);
            }
            Ok(recovered)
        })
        .await
    }

    async fn append_event(&self, event: EventRecord) -> StoreResult<u64> {
        self.with_state(true, move |state| {
            let seq = state.next_event_seq + 1;
            state.next_event_seq = seq;
            let mut event = event;
            event.seq = seq;
            state.events.push(event);
            Ok(seq)
        })
        .await
    }

    async fn events_since(&self, cursor: u64, limit: usize) -> StoreResult<Vec<EventRecord>> {
        self.with_state(false, move |state| {
            Ok(state
                .events
                .iter()
                .filter(|e| e.seq > cursor)
                .take(limit)
                .cloned()
                .collect())
        })
        .await
    }

    async fn cost_periods(&self) -> StoreResult<BTreeMap<String, CostPeriod>> {
        self.with_state(false, |state| Ok(state.cost_periods.clone()))
            .await
    }
}
