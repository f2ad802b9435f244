use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;

use crate::error::GitError;

/// Result of syncing a task branch against the target branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Clean,
    Conflicts(Vec<String>),
}

/// How a sync is performed. `Detect` checks for conflicts without
/// leaving any change behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Rebase,
    Merge,
    Detect,
}

/// Git operations the engine consumes. One implementation shells out
/// to `git`; tests use the recording mock.
#[async_trait]
pub trait GitOps: Send + Sync {
    /// Create a worktree at `path` on `branch` (creating the branch if
    /// needed). Re-attaching to an existing worktree on the same branch
    /// is not an error.
    async fn create_worktree(&self, branch: &str, path: &Path) -> Result<(), GitError>;

    /// Remove the worktree at `path`. Idempotent: a missing or already
    /// unregistered worktree is success.
    async fn remove_worktree_at_path(&self, path: &Path) -> Result<(), GitError>;

    /// Drop references to worktrees whose directories disappeared.
    async fn prune_worktrees(&self) -> Result<(), GitError>;

    /// Stage everything in `path` and commit. Committing a clean tree
    /// is a no-op that returns the current HEAD, so replays after a
    /// crash are harmless.
    async fn commit(&self, path: &Path, message: &str) -> Result<String, GitError>;

    async fn current_sha(&self, path: &Path) -> Result<String, GitError>;

    async fn sync(
        &self,
        path: &Path,
        target_branch: &str,
        mode: SyncMode,
    ) -> Result<SyncOutcome, GitError>;

    async fn branch_exists(&self, branch: &str) -> Result<bool, GitError>;
}

// --- Subprocess implementation ---

/// `GitOps` backed by the `git` binary, rooted at the main repository.
pub struct CommandGit {
    repo_root: PathBuf,
}

impl CommandGit {
    /// Verify `repo_root` is a git repository and build the wrapper.
    pub fn open(repo_root: &Path) -> Result<Self, GitError> {
        run_git(repo_root, &["rev-parse", "--git-dir"])
            .map_err(|_| GitError::NotARepo(repo_root.display().to_string()))?;
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
        })
    }

    async fn run_blocking<R, F>(&self, f: F) -> Result<R, GitError>
    where
        R: Send + 'static,
        F: FnOnce(&Path) -> Result<R, GitError> + Send + 'static,
    {
        let root = self.repo_root.clone();
        tokio::task::spawn_blocking(move || f(&root))
            .await
            .map_err(|e| GitError::Command {
                command: "spawn_blocking".to_string(),
                detail: e.to_string(),
            })?
    }
}

/// Run a git command and return trimmed stdout.
fn run_git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| GitError::Command {
            command: format!("git {}", args.first().unwrap_or(&"")),
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::Command {
            command: format!("git {}", args.join(" ")),
            detail: stderr.trim().to_string(),
        });
    }

    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|e| GitError::Command {
            command: format!("git {}", args.first().unwrap_or(&"")),
            detail: format!("output is not valid UTF-8: {}", e),
        })
}

/// Files left in conflicted state after a failed merge/rebase.
fn conflicted_files(dir: &Path) -> Vec<String> {
    run_git(dir, &["diff", "--name-only", "--diff-filter=U"])
        .map(|out| {
            out.lines()
                .filter(|l| !l.is_empty())
                .map(|l| l.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn branch_exists_sync(root: &Path, branch: &str) -> Result<bool, GitError> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", "--quiet"])
        .arg(format!("refs/heads/{}", branch))
        .current_dir(root)
        .output()
        .map_err(|e| GitError::Command {
            command: "git rev-parse --verify".to_string(),
            detail: e.to_string(),
        })?;
    Ok(output.status.success())
}

#[async_trait]
impl GitOps for CommandGit {
    async fn create_worktree(&self, branch: &str, path: &Path) -> Result<(), GitError> {
        let branch = branch.to_string();
        let path = path.to_path_buf();
        self.run_blocking(move |root| {
            if path.exists() {
                // Re-attach: accept an existing worktree already on the
                // task branch.
                let head = run_git(&path, &["rev-parse", "--abbrev-ref", "HEAD"])?;
                if head == branch {
                    return Ok(());
                }
                return Err(GitError::Command {
                    command: "worktree add".to_string(),
                    detail: format!(
                        "{} exists on branch {} (expected {})",
                        path.display(),
                        head,
                        branch
                    ),
                });
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| GitError::Command {
                    command: "worktree add".to_string(),
                    detail: format!("create {}: {}", parent.display(), e),
                })?;
            }

            let path_str = path.display().to_string();
            if branch_exists_sync(root, &branch)? {
                run_git(root, &["worktree", "add", &path_str, &branch])?;
            } else {
                run_git(root, &["worktree", "add", "-b", &branch, &path_str])?;
            }
            Ok(())
        })
        .await
    }

    async fn remove_worktree_at_path(&self, path: &Path) -> Result<(), GitError> {
        let path = path.to_path_buf();
        self.run_blocking(move |root| {
            let path_str = path.display().to_string();
            match run_git(root, &["worktree", "remove", "--force", &path_str]) {
                Ok(_) => Ok(()),
                Err(GitError::Command { detail, .. })
                    if detail.contains("is not a working tree")
                        || detail.contains("No such file") =>
                {
                    // Already gone; clean any leftover directory.
                    if path.exists() {
                        let _ = std::fs::remove_dir_all(&path);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn prune_worktrees(&self) -> Result<(), GitError> {
        self.run_blocking(|root| run_git(root, &["worktree", "prune"]).map(|_| ()))
            .await
    }

    async fn commit(&self, path: &Path, message: &str) -> Result<String, GitError> {
        let path = path.to_path_buf();
        let message = message.to_string();
        self.run_blocking(move |_root| {
            run_git(&path, &["add", "-A"])?;
            let status = run_git(&path, &["status", "--porcelain"])?;
            if status.is_empty() {
                // Nothing to commit: idempotent replay after a crash.
                return run_git(&path, &["rev-parse", "HEAD"]);
            }
            run_git(&path, &["commit", "-m", &message])?;
            run_git(&path, &["rev-parse", "HEAD"])
        })
        .await
    }

    async fn current_sha(&self, path: &Path) -> Result<String, GitError> {
        let path = path.to_path_buf();
        self.run_blocking(move |_root| run_git(&path, &["rev-parse", "HEAD"]))
            .await
    }

    async fn sync(
        &self,
        path: &Path,
        target_branch: &str,
        mode: SyncMode,
    ) -> Result<SyncOutcome, GitError> {
        let path = path.to_path_buf();
        let target = target_branch.to_string();
        self.run_blocking(move |_root| match mode {
            SyncMode::Rebase => match run_git(&path, &["rebase", &target]) {
                Ok(_) => Ok(SyncOutcome::Clean),
                Err(_) => {
                    let files = conflicted_files(&path);
                    let _ = run_git(&path, &["rebase", "--abort"]);
                    Ok(SyncOutcome::Conflicts(files))
                }
            },
            SyncMode::Merge => match run_git(&path, &["merge", "--no-ff", &target]) {
                Ok(_) => Ok(SyncOutcome::Clean),
                Err(_) => {
                    let files = conflicted_files(&path);
                    let _ = run_git(&path, &["merge", "--abort"]);
                    Ok(SyncOutcome::Conflicts(files))
                }
            },
            SyncMode::Detect => {
                // Trial merge, never kept.
                let result = run_git(&path, &["merge", "--no-commit", "--no-ff", &target]);
                let outcome = match result {
                    Ok(_) => SyncOutcome::Clean,
                    Err(_) => SyncOutcome::Conflicts(conflicted_files(&path)),
                };
                let _ = run_git(&path, &["merge", "--abort"]);
                Ok(outcome)
            }
        })
        .await
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let branch = branch.to_string();
        self.run_blocking(move |root| branch_exists_sync(root, &branch))
            .await
    }
}

// --- Mock for tests ---

/// Recording `GitOps` double: every call is logged, commits return
/// deterministic fake shas, sync returns a scripted outcome.
pub struct MockGit {
    pub calls: std::sync::Mutex<Vec<String>>,
    commit_counter: std::sync::atomic::AtomicU32,
    sync_outcome: std::sync::Mutex<SyncOutcome>,
}

impl Default for MockGit {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGit {
    pub fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            commit_counter: std::sync::atomic::AtomicU32::new(0),
            sync_outcome: std::sync::Mutex::new(SyncOutcome::Clean),
        }
    }

    pub fn set_sync_outcome(&self, outcome: SyncOutcome) {
        *self.sync_outcome.lock().unwrap() = outcome;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn recorded(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitOps for MockGit {
    async fn create_worktree(&self, branch: &str, path: &Path) -> Result<(), GitError> {
        self.record(format!("create_worktree {} {}", branch, path.display()));
        Ok(())
    }

    async fn remove_worktree_at_path(&self, path: &Path) -> Result<(), GitError> {
        self.record(format!("remove_worktree {}", path.display()));
        Ok(())
    }

    async fn prune_worktrees(&self) -> Result<(), GitError> {
        self.record("prune_worktrees".to_string());
        Ok(())
    }

    async fn commit(&self, path: &Path, message: &str) -> Result<String, GitError> {
        self.record(format!("commit {} {}", path.display(), message));
        let n = self
            .commit_counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        Ok(format!("sha{:07}", n))
    }

    async fn current_sha(&self, path: &Path) -> Result<String, GitError> {
        self.record(format!("current_sha {}", path.display()));
        Ok("shahead0".to_string())
    }

    async fn sync(
        &self,
        path: &Path,
        target_branch: &str,
        mode: SyncMode,
    ) -> Result<SyncOutcome, GitError> {
        self.record(format!(
            "sync {} {} {:?}",
            path.display(),
            target_branch,
            mode
        ));
        Ok(self.sync_outcome.lock().unwrap().clone())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        self.record(format!("branch_exists {}", branch));
        Ok(false)
    }
}
