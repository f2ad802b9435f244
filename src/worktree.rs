use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::git::{GitOps, SyncMode, SyncOutcome};
use crate::types::now_rfc3339;
use crate::{log_debug, log_warn};

/// An isolated working copy bound to a single task branch.
#[derive(Debug, Clone, PartialEq)]
pub struct Worktree {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: String,
    pub in_use: bool,
}

/// Terminal outcome driving the release policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Completed,
    Cancelled,
    Failed,
    /// Task is merely parked (paused/blocked): keep the worktree for
    /// resume, only release the ownership mark.
    Parked,
}

/// Allocates and tears down per-task worktrees.
///
/// Branch and path are deterministic from the task id (plus the
/// optional initiative segment), so a restart re-derives them when the
/// stored path went missing. The in-use registry is the ownership lock:
/// a second acquire for a task already holding a worktree is refused.
pub struct WorktreeManager {
    git: Arc<dyn GitOps>,
    base: PathBuf,
    initiative: Option<String>,
    cleanup_on_fail: bool,
    in_use: Mutex<HashMap<String, Worktree>>,
    orphaned: Mutex<Vec<PathBuf>>,
}

impl WorktreeManager {
    pub fn new(
        git: Arc<dyn GitOps>,
        base: PathBuf,
        initiative: Option<String>,
        cleanup_on_fail: bool,
    ) -> Self {
        Self {
            git,
            base,
            initiative,
            cleanup_on_fail,
            in_use: Mutex::new(HashMap::new()),
            orphaned: Mutex::new(Vec::new()),
        }
    }

    /// Branch for a task: `orc/<task-id>`, or `orc/<initiative>/<task-id>`.
    pub fn branch_name(&self, task_id: &str) -> String {
        match self.initiative {
            Some(ref initiative) => format!("orc/{}/{}", initiative, task_id),
            None => format!("orc/{}", task_id),
        }
    }

    /// Deterministic worktree directory for a task id.
    pub fn path_for(&self, task_id: &str) -> PathBuf {
        match self.initiative {
            Some(ref initiative) => self.base.join(format!("{}-{}", initiative, task_id)),
            None => self.base.join(task_id),
        }
    }

    /// Create (or re-attach to) the task's worktree.
    ///
    /// `stored_path` is the path recorded in the task's execution
    /// state from a previous run; when absent, the id-derived path is
    /// used and a warning is logged, since a recorded path should have
    /// survived any crash that left work behind.
    pub async fn acquire(
        &self,
        task_id: &str,
        stored_path: Option<&Path>,
    ) -> Result<Worktree, String> {
        {
            let in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
            if in_use.contains_key(task_id) {
                return Err(format!("worktree for {} is already in use", task_id));
            }
        }

        let path = match stored_path {
            Some(p) => p.to_path_buf(),
            None => self.path_for(task_id),
        };
        let branch = self.branch_name(task_id);

        if stored_path.is_none() {
            log_debug!("[{}] no stored worktree path, deriving {}", task_id, path.display());
        } else if stored_path != Some(self.path_for(task_id).as_path()) {
            log_warn!(
                "[{}] stored worktree path {} differs from derived path",
                task_id,
                path.display()
            );
        }

        self.git
            .create_worktree(&branch, &path)
            .await
            .map_err(|e| format!("acquire worktree for {}: {}", task_id, e))?;

        let worktree = Worktree {
            task_id: task_id.to_string(),
            path,
            branch,
            created_at: now_rfc3339(),
            in_use: true,
        };

        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        in_use.insert(task_id.to_string(), worktree.clone());
        Ok(worktree)
    }

    /// Release a task's worktree per the retention policy. Idempotent;
    /// a removal failure is non-fatal — the path is marked orphaned and
    /// retried by the next prune.
    pub async fn release(&self, task_id: &str, outcome: ReleaseOutcome) {
        let worktree = {
            let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
            in_use.remove(task_id)
        };

        let remove = match outcome {
            ReleaseOutcome::Completed | ReleaseOutcome::Cancelled => true,
            ReleaseOutcome::Failed => self.cleanup_on_fail,
            ReleaseOutcome::Parked => false,
        };
        if !remove {
            return;
        }

        let path = worktree
            .map(|w| w.path)
            .unwrap_or_else(|| self.path_for(task_id));

        if let Err(e) = self.git.remove_worktree_at_path(&path).await {
            log_warn!(
                "[{}] failed to remove worktree {} (marked orphaned): {}",
                task_id,
                path.display(),
                e
            );
            let mut orphaned = self.orphaned.lock().unwrap_or_else(|e| e.into_inner());
            orphaned.push(path);
        }
    }

    /// Sync the worktree's branch against the target branch.
    pub async fn sync(
        &self,
        path: &Path,
        target_branch: &str,
        mode: SyncMode,
    ) -> Result<SyncOutcome, String> {
        self.git
            .sync(path, target_branch, mode)
            .await
            .map_err(|e| format!("sync against {}: {}", target_branch, e))
    }

    /// Prune dangling worktree entries and retry orphaned removals.
    /// Invoked once at startup; failures warn but never block.
    pub async fn prune(&self) {
        if let Err(e) = self.git.prune_worktrees().await {
            log_warn!("worktree prune failed: {}", e);
        }

        let orphans: Vec<PathBuf> = {
            let mut orphaned = self.orphaned.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *orphaned)
        };
        for path in orphans {
            if let Err(e) = self.git.remove_worktree_at_path(&path).await {
                log_warn!("orphaned worktree {} still stuck: {}", path.display(), e);
                let mut orphaned = self.orphaned.lock().unwrap_or_else(|e| e.into_inner());
                orphaned.push(path);
            }
        }
    }

    /// Paths currently registered as owned, for invariant checks.
    pub fn active_paths(&self) -> Vec<PathBuf> {
        let in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        in_use.values().map(|w| w.path.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::MockGit;

    fn manager(cleanup_on_fail: bool) -> (Arc<MockGit>, WorktreeManager) {
        let git = Arc::new(MockGit::new());
        let mgr = WorktreeManager::new(
            git.clone(),
            PathBuf::from("/tmp/maestro-wt"),
            None,
            cleanup_on_fail,
        );
        (git, mgr)
    }

    #[test]
    fn branch_and_path_are_deterministic() {
        let (_, mgr) = manager(true);
        assert_eq!(mgr.branch_name("T-001"), "orc/T-001");
        assert_eq!(mgr.path_for("T-001"), PathBuf::from("/tmp/maestro-wt/T-001"));

        let git = Arc::new(MockGit::new());
        let mgr = WorktreeManager::new(
            git,
            PathBuf::from("/tmp/maestro-wt"),
            Some("auth".to_string()),
            true,
        );
        assert_eq!(mgr.branch_name("T-001"), "orc/auth/T-001");
        assert_eq!(
            mgr.path_for("T-001"),
            PathBuf::from("/tmp/maestro-wt/auth-T-001")
        );
    }

    #[tokio::test]
    async fn second_acquire_refused_while_in_use() {
        let (_, mgr) = manager(true);
        mgr.acquire("T-001", None).await.unwrap();
        let err = mgr.acquire("T-001", None).await.unwrap_err();
        assert!(err.contains("already in use"));
    }

    #[tokio::test]
    async fn release_respects_retention_on_failure() {
        let (git, mgr) = manager(false);
        mgr.acquire("T-001", None).await.unwrap();
        mgr.release("T-001", ReleaseOutcome::Failed).await;
        let calls = git.recorded();
        assert!(
            !calls.iter().any(|c| c.starts_with("remove_worktree")),
            "failed task worktree must be retained: {:?}",
            calls
        );

        // Completed releases remove regardless.
        mgr.acquire("T-001", None).await.unwrap();
        mgr.release("T-001", ReleaseOutcome::Completed).await;
        assert!(git
            .recorded()
            .iter()
            .any(|c| c.starts_with("remove_worktree")));
    }

    #[tokio::test]
    async fn parked_release_keeps_worktree_but_frees_ownership() {
        let (git, mgr) = manager(true);
        mgr.acquire("T-001", None).await.unwrap();
        mgr.release("T-001", ReleaseOutcome::Parked).await;
        assert!(!git
            .recorded()
            .iter()
            .any(|c| c.starts_with("remove_worktree")));
        // Ownership is free again.
        mgr.acquire("T-001", None).await.unwrap();
    }

    #[tokio::test]
    async fn stored_path_wins_over_derived() {
        let (git, mgr) = manager(true);
        let stored = PathBuf::from("/elsewhere/T-001");
        let wt = mgr.acquire("T-001", Some(&stored)).await.unwrap();
        assert_eq!(wt.path, stored);
        assert!(git
            .recorded()
            .iter()
            .any(|c| c.contains("/elsewhere/T-001")));
    }
}
