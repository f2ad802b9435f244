use std::path::PathBuf;
use std::process::Command;

use async_trait::async_trait;
use serde::Deserialize;

/// A created or discovered pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub pr_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrStatus {
    pub state: String,
    pub review_state: String,
    pub check_state: String,
    pub mergeable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

/// Hosting provider operations the engine consumes.
///
/// `find_pr_for_branch` exists for at-most-once PR creation: before
/// creating, the executor probes for an existing PR on the task branch
/// and reconciles rather than duplicating.
#[async_trait]
pub trait HostingClient: Send + Sync {
    async fn create_pr(
        &self,
        branch: &str,
        target: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<PullRequest, String>;

    async fn find_pr_for_branch(&self, branch: &str) -> Result<Option<PullRequest>, String>;

    async fn fetch_pr_status(&self, pr_id: &str) -> Result<PrStatus, String>;

    async fn merge(&self, pr_id: &str, method: MergeMethod) -> Result<(), String>;
}

// --- gh CLI implementation ---

/// `HostingClient` backed by the `gh` CLI.
pub struct GhCli {
    repo_root: PathBuf,
}

impl GhCli {
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    async fn run_gh<R, F>(&self, f: F) -> Result<R, String>
    where
        R: Send + 'static,
        F: FnOnce(&std::path::Path) -> Result<R, String> + Send + 'static,
    {
        let root = self.repo_root.clone();
        tokio::task::spawn_blocking(move || f(&root))
            .await
            .map_err(|e| format!("gh task panicked: {}", e))?
    }
}

fn gh(dir: &std::path::Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("gh")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| format!("failed to run gh {}: {}", args.first().unwrap_or(&""), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "gh {} failed: {}",
            args.join(" "),
            stderr.trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[derive(Deserialize)]
struct GhPrListEntry {
    number: u64,
    url: String,
}

#[derive(Deserialize)]
struct GhPrView {
    #[serde(default)]
    state: String,
    #[serde(default, rename = "reviewDecision")]
    review_decision: String,
    #[serde(default)]
    mergeable: String,
    #[serde(default, rename = "statusCheckRollup")]
    status_check_rollup: serde_json::Value,
}

#[async_trait]
impl HostingClient for GhCli {
    async fn create_pr(
        &self,
        branch: &str,
        target: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<PullRequest, String> {
        let branch = branch.to_string();
        let target = target.to_string();
        let title = title.to_string();
        let body = body.to_string();
        let labels = labels.to_vec();
        self.run_gh(move |root| {
            let mut args: Vec<String> = [
                "pr",
                "create",
                "--head",
                branch.as_str(),
                "--base",
                target.as_str(),
                "--title",
                title.as_str(),
                "--body",
                body.as_str(),
            ]
            .iter()
            .map(|s| s.to_string())
            .collect();
            for label in &labels {
                args.push("--label".to_string());
                args.push(label.clone());
            }
            let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            let url = gh(root, &arg_refs)?;

            // `gh pr create` prints the PR URL; the trailing segment is
            // the number.
            let pr_id = url
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            Ok(PullRequest { pr_id, url })
        })
        .await
    }

    async fn find_pr_for_branch(&self, branch: &str) -> Result<Option<PullRequest>, String> {
        let branch = branch.to_string();
        self.run_gh(move |root| {
            let out = gh(
                root,
                &[
                    "pr", "list", "--head", &branch, "--state", "all", "--json", "number,url",
                ],
            )?;
            let entries: Vec<GhPrListEntry> = serde_json::from_str(&out)
                .map_err(|e| format!("failed to parse gh pr list output: {}", e))?;
            Ok(entries.into_iter().next().map(|e| PullRequest {
                pr_id: e.number.to_string(),
                url: e.url,
            }))
        })
        .await
    }

    async fn fetch_pr_status(&self, pr_id: &str) -> Result<PrStatus, String> {
        let pr_id = pr_id.to_string();
        self.run_gh(move |root| {
            let out = gh(
                root,
                &[
                    "pr",
                    "view",
                    &pr_id,
                    "--json",
                    "state,reviewDecision,mergeable,statusCheckRollup",
                ],
            )?;
            let view: GhPrView = serde_json::from_str(&out)
                .map_err(|e| format!("failed to parse gh pr view output: {}", e))?;

            let check_state = match &view.status_check_rollup {
                serde_json::Value::Array(checks) if checks.is_empty() => "none".to_string(),
                serde_json::Value::Array(checks) => {
                    let any_failed = checks.iter().any(|c| {
                        c.get("conclusion").and_then(|v| v.as_str()) == Some("FAILURE")
                    });
                    if any_failed { "failing" } else { "passing" }.to_string()
                }
                _ => "unknown".to_string(),
            };

            Ok(PrStatus {
                state: view.state.to_lowercase(),
                review_state: view.review_decision.to_lowercase(),
                check_state,
                mergeable: view.mergeable.eq_ignore_ascii_case("mergeable"),
            })
        })
        .await
    }

    async fn merge(&self, pr_id: &str, method: MergeMethod) -> Result<(), String> {
        let pr_id = pr_id.to_string();
        self.run_gh(move |root| {
            let flag = match method {
                MergeMethod::Merge => "--merge",
                MergeMethod::Squash => "--squash",
                MergeMethod::Rebase => "--rebase",
            };
            gh(root, &["pr", "merge", &pr_id, flag]).map(|_| ())
        })
        .await
    }
}

// --- Mock for tests ---

/// Scripted hosting double tracking every PR ever created, so tests
/// can assert at-most-once creation across crash/resume.
#[derive(Default)]
pub struct MockHosting {
    created: std::sync::Mutex<Vec<(String, PullRequest)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl MockHosting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed an existing PR on a branch (simulates a crash after
    /// creation but before the completion record).
    pub fn seed_pr(&self, branch: &str, pr: PullRequest) {
        self.created
            .lock()
            .unwrap()
            .push((branch.to_string(), pr));
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn prs_for_branch(&self, branch: &str) -> Vec<PullRequest> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(b, _)| b == branch)
            .map(|(_, pr)| pr.clone())
            .collect()
    }
}

#[async_trait]
impl HostingClient for MockHosting {
    async fn create_pr(
        &self,
        branch: &str,
        _target: &str,
        _title: &str,
        _body: &str,
        _labels: &[String],
    ) -> Result<PullRequest, String> {
        let n = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let pr = PullRequest {
            pr_id: n.to_string(),
            url: format!("https://example.test/pr/{}", n),
        };
        self.created
            .lock()
            .unwrap()
            .push((branch.to_string(), pr.clone()));
        Ok(pr)
    }

    async fn find_pr_for_branch(&self, branch: &str) -> Result<Option<PullRequest>, String> {
        Ok(self.prs_for_branch(branch).into_iter().next())
    }

    async fn fetch_pr_status(&self, _pr_id: &str) -> Result<PrStatus, String> {
        Ok(PrStatus {
            state: "open".to_string(),
            review_state: "".to_string(),
            check_state: "none".to_string(),
            mergeable: true,
        })
    }

    async fn merge(&self, _pr_id: &str, _method: MergeMethod) -> Result<(), String> {
        Ok(())
    }
}
