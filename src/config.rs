use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::types::Profile;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MaestroConfig {
    pub project: ProjectConfig,
    pub execution: ExecutionConfig,
    pub agent: AgentConfig,
    pub sync: SyncConfig,
    pub completion: CompletionConfig,
    pub worktree: WorktreeConfig,
    pub templates: TemplatesConfig,
    pub sentinel: SentinelConfig,
    pub retry: RetryConfig,
    pub events: EventsConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Prefix for monotonically issued task ids (e.g. `T` -> `T-001`).
    pub prefix: String,
    /// Branch that task branches fork from and sync against.
    pub target_branch: String,
    /// Optional grouping segment inserted into branch and worktree
    /// names (`orc/<initiative>/<task-id>`).
    pub initiative: Option<String>,
    /// Default profile applied at plan time unless overridden per task.
    pub profile: Profile,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            prefix: "T".to_string(),
            target_branch: "main".to_string(),
            initiative: None,
            profile: Profile::Auto,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Parallelism cap: concurrently running tasks.
    pub parallelism: u32,
    /// Timeout applied to each individual agent turn.
    pub iteration_timeout_minutes: u32,
    /// Optional wall-clock budget per task; 0 disables.
    pub task_timeout_minutes: u32,
    /// Grace window before force-terminating executors on shutdown.
    pub shutdown_grace_seconds: u32,
    /// Backoff cap for transient store/hosting retries.
    pub transient_retry_max: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: 2,
            iteration_timeout_minutes: 30,
            task_timeout_minutes: 0,
            shutdown_grace_seconds: 10,
            transient_retry_max: 3,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Binary of the agent CLI driven by the runner.
    pub binary: String,
    pub model: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: None,
        }
    }
}

/// When the task branch is synced against the target branch.
#[derive(Default, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    #[default]
    None,
    /// Before each phase.
    Phase,
    /// Only before finalization.
    Completion,
    /// Check for conflicts without resolving.
    Detect,
}

#[derive(Default, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Rebase,
    Merge,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub strategy: SyncStrategy,
    pub mode: SyncMode,
    /// With `strategy = detect`: fail the phase on conflicts instead of
    /// recording an advisory and proceeding.
    pub fail_on_conflict: bool,
}

/// What happens when the last phase completes.
#[derive(Default, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionAction {
    #[default]
    Pr,
    Merge,
    None,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CompletionConfig {
    pub action: CompletionAction,
    pub pr_labels: Vec<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            action: CompletionAction::Pr,
            pr_labels: vec!["maestro".to_string()],
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Base directory for worktrees; relative paths resolve from the
    /// project root. Defaults to `.maestro/worktrees`.
    pub base_dir: String,
    /// Remove the worktree when a task fails. Leave false to keep it
    /// for forensic inspection.
    pub cleanup_on_fail: bool,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: ".maestro/worktrees".to_string(),
            cleanup_on_fail: true,
        }
    }
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TemplatesConfig {
    /// Directory of per-phase prompt templates (`<phase>.md`). Missing
    /// files fall back to the built-in template.
    pub dir: Option<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SentinelConfig {
    /// Marker whose presence in agent output completes the phase.
    pub complete_marker: String,
    /// Marker prefix signalling a blocked phase; the remainder of the
    /// line is the reason.
    pub blocked_marker: String,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            complete_marker: "MAESTRO_PHASE_COMPLETE".to_string(),
            blocked_marker: "MAESTRO_PHASE_BLOCKED:".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Rewinds allowed per (task, phase) pair before the task fails.
    pub max_per_phase: u32,
    /// Failing phase -> phase to re-enter. Phases absent from the map
    /// re-enter themselves.
    pub reentry: HashMap<String, String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let mut reentry = HashMap::new();
        reentry.insert("test".to_string(), "implement".to_string());
        reentry.insert("validate".to_string(), "implement".to_string());
        reentry.insert("review".to_string(), "implement".to_string());
        Self {
            max_per_phase: 5,
            reentry,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Mirror bus events into the store for replay.
    pub persist: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { persist: true }
    }
}

pub fn normalize(config: &mut MaestroConfig) {
    if let Some(ref model) = config.agent.model {
        let trimmed = model.trim();
        if trimmed.is_empty() {
            config.agent.model = None;
        } else {
            config.agent.model = Some(trimmed.to_string());
        }
    }
    if let Some(ref initiative) = config.project.initiative {
        if initiative.trim().is_empty() {
            config.project.initiative = None;
        }
    }
}

pub fn validate(config: &MaestroConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.execution.parallelism < 1 {
        errors.push("execution.parallelism must be >= 1".to_string());
    }

    if config.execution.iteration_timeout_minutes < 1 {
        errors.push("execution.iteration_timeout_minutes must be >= 1".to_string());
    }

    if config.project.prefix.is_empty()
        || !config
            .project
            .prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        errors.push(
            "project.prefix must be non-empty and contain only alphanumerics, '-', '_'"
                .to_string(),
        );
    }

    if config.project.target_branch.trim().is_empty() {
        errors.push("project.target_branch must not be empty".to_string());
    }

    if let Some(ref model) = config.agent.model {
        let is_valid = !model.is_empty()
            && model
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
        if !is_valid {
            errors.push(
                "agent.model contains invalid characters (allowed: alphanumeric, '.', '_', '/', '-')"
                    .to_string(),
            );
        } else if model.starts_with('-') {
            errors.push(
                "agent.model must not start with '-' (flag-like values are rejected)".to_string(),
            );
        }
    }

    if config.sentinel.complete_marker.trim().is_empty() {
        errors.push("sentinel.complete_marker must not be empty".to_string());
    }
    if config.sentinel.blocked_marker.trim().is_empty() {
        errors.push("sentinel.blocked_marker must not be empty".to_string());
    }
    if config.sentinel.complete_marker == config.sentinel.blocked_marker {
        errors.push("sentinel markers must be distinct".to_string());
    }

    if config.retry.max_per_phase == 0 {
        errors.push("retry.max_per_phase must be >= 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load config from an explicit path (if provided) or fall back to
/// `{project_root}/maestro.toml`.
///
/// When `config_path` is `Some`, the file MUST exist. When `None` and
/// the default file is missing, defaults are returned.
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<MaestroConfig, String> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(format!("Config file not found: {}", path.display()));
            }
            load_config_at(path)
        }
        None => load_config(project_root),
    }
}

pub fn load_config(project_root: &Path) -> Result<MaestroConfig, String> {
    let config_path = project_root.join("maestro.toml");

    if !config_path.exists() {
        return Ok(MaestroConfig::default());
    }

    load_config_at(&config_path)
}

fn load_config_at(path: &Path) -> Result<MaestroConfig, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let mut config: MaestroConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    normalize(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

/// Resolve the worktree base directory against the project root.
pub fn worktree_base(config: &MaestroConfig, project_root: &Path) -> PathBuf {
    let base = Path::new(&config.worktree.base_dir);
    if base.is_absolute() {
        base.to_path_buf()
    } else {
        project_root.join(base)
    }
}

/// Runtime directory for lock files and orchestrator state.
pub fn runtime_dir(project_root: &Path) -> PathBuf {
    project_root.join(".maestro")
}
