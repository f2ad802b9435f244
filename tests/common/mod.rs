#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use maestro::agent::{AgentResponse, MockAgentRunner};
use maestro::bus::EventBus;
use maestro::catalog;
use maestro::config::MaestroConfig;
use maestro::error::AgentError;
use maestro::executor::ExecutorDeps;
use maestro::git::MockGit;
use maestro::hosting::MockHosting;
use maestro::store::{FileStore, NewTask, Store};
use maestro::template::TemplateSet;
use maestro::types::{Priority, Profile, Task, TaskWeight, TokenUsage};
use maestro::worktree::WorktreeManager;

/// Agent output that completes a phase.
pub fn complete_output() -> String {
    "work is done\nMAESTRO_PHASE_COMPLETE".to_string()
}

/// Agent output that keeps iterating.
pub fn continue_output() -> String {
    "still going".to_string()
}

/// Agent output reporting a failing test run; same text yields the same
/// error signature.
pub fn failing_output(detail: &str) -> String {
    format!("test result: FAILED. {}", detail)
}

pub fn blocked_output(reason: &str) -> String {
    format!("MAESTRO_PHASE_BLOCKED: {}", reason)
}

pub fn response(output: &str, session: &str) -> Result<AgentResponse, AgentError> {
    Ok(AgentResponse {
        output_text: output.to_string(),
        usage: TokenUsage {
            input: 100,
            output: 50,
            cache_read: 10,
            cache_write: 5,
        },
        cost_usd: 0.01,
        session_key: Some(session.to_string()),
    })
}

/// A full mock dependency graph over a store in a tempdir. Keep the
/// TempDir alive for the duration of the test.
pub struct TestHarness {
    pub dir: TempDir,
    pub store: Arc<FileStore>,
    pub git: Arc<MockGit>,
    pub hosting: Arc<MockHosting>,
    pub bus: Arc<EventBus>,
    pub config: Arc<MaestroConfig>,
}

impl TestHarness {
    pub fn new(config: MaestroConfig) -> Self {
        let dir = TempDir::new().expect("create tempdir");
        let store = Arc::new(FileStore::open(dir.path(), "T").expect("open store"));
        Self {
            dir,
            store,
            git: Arc::new(MockGit::new()),
            hosting: Arc::new(MockHosting::new()),
            bus: Arc::new(EventBus::default()),
            config: Arc::new(config),
        }
    }

    pub fn deps(&self, runner: Arc<MockAgentRunner>) -> ExecutorDeps {
        self.deps_with_runner(runner)
    }

    pub fn deps_with_runner(
        &self,
        runner: Arc<dyn maestro::agent::AgentRunner>,
    ) -> ExecutorDeps {
        let worktrees = Arc::new(WorktreeManager::new(
            self.git.clone(),
            self.dir.path().join("worktrees"),
            self.config.project.initiative.clone(),
            self.config.worktree.cleanup_on_fail,
        ));
        ExecutorDeps {
            store: self.store.clone(),
            runner,
            git: self.git.clone(),
            hosting: self.hosting.clone(),
            worktrees,
            templates: Arc::new(TemplateSet::new(None, self.config.sentinel.clone())),
            bus: self.bus.clone(),
            config: self.config.clone(),
        }
    }

    /// Create and plan a task, returning it in `planned`.
    pub async fn planned_task(&self, title: &str, weight: TaskWeight, profile: Profile) -> Task {
        let task = self
            .store
            .create_task(NewTask {
                title: title.to_string(),
                description: format!("description of {}", title),
                weight,
                ..Default::default()
            })
            .await
            .expect("create task");
        self.store
            .set_plan(&task.id, catalog::plan_for(weight, profile))
            .await
            .expect("plan task")
    }

    /// Create+plan with explicit priority and dependencies.
    pub async fn planned_task_full(
        &self,
        title: &str,
        weight: TaskWeight,
        profile: Profile,
        priority: Priority,
        blocked_by: BTreeSet<String>,
    ) -> Task {
        let task = self
            .store
            .create_task(NewTask {
                title: title.to_string(),
                description: format!("description of {}", title),
                weight,
                priority,
                blocked_by,
                ..Default::default()
            })
            .await
            .expect("create task");
        self.store
            .set_plan(&task.id, catalog::plan_for(weight, profile))
            .await
            .expect("plan task")
    }

    /// Claim the next ready task as a test worker.
    pub async fn claim(&self) -> Option<Task> {
        self.store
            .claim_ready_task("test-worker")
            .await
            .expect("claim")
            .map(|claimed| claimed.task)
    }

    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.dir.path().join("worktrees").join(task_id)
    }
}

/// Baseline config for tests; individual tests override fields
/// (retry budget, retention) before building the harness.
pub fn test_config() -> MaestroConfig {
    MaestroConfig::default()
}
