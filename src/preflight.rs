use std::path::Path;
use std::process::Command;

use crate::agent::CliAgentRunner;
use crate::config::MaestroConfig;

/// Verify only that a git repository exists in the given directory.
pub fn is_git_repo(repo_dir: &Path) -> Result<(), String> {
    let output = Command::new("git")
        .args(["rev-parse", "--git-dir"])
        .current_dir(repo_dir)
        .output()
        .map_err(|e| format!("Failed to run git: {}", e))?;
    if !output.status.success() {
        return Err("Not a git repository (or git is not installed)".to_string());
    }
    Ok(())
}

/// Preconditions checked before a scheduler run. All problems are
/// collected so the user fixes everything in one pass.
///
/// Checks:
/// - git repository exists, HEAD is not detached, no rebase/merge in
///   progress (task branches fork from the target branch)
/// - the target branch exists
/// - the agent CLI is on PATH
/// - the templates directory, when configured, is readable
pub fn check(project_root: &Path, config: &MaestroConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if let Err(e) = is_git_repo(project_root) {
        errors.push(e);
        // Everything else needs the repo; stop here.
        return Err(errors);
    }

    let head_check = Command::new("git")
        .args(["symbolic-ref", "--quiet", "HEAD"])
        .current_dir(project_root)
        .output();
    match head_check {
        Ok(out) if !out.status.success() => {
            errors.push(
                "Detached HEAD state detected. Check out a branch before running.".to_string(),
            );
        }
        Ok(_) => {}
        Err(e) => errors.push(format!("Failed to check HEAD: {}", e)),
    }

    if let Ok(out) = Command::new("git")
        .args(["rev-parse", "--git-dir"])
        .current_dir(project_root)
        .output()
    {
        let git_dir = project_root.join(String::from_utf8_lossy(&out.stdout).trim());
        if git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists() {
            errors.push("Rebase in progress. Complete or abort it before running.".to_string());
        }
        if git_dir.join("MERGE_HEAD").exists() {
            errors.push("Merge in progress. Complete or abort it before running.".to_string());
        }
    }

    let branch_check = Command::new("git")
        .args(["rev-parse", "--verify", "--quiet"])
        .arg(format!("refs/heads/{}", config.project.target_branch))
        .current_dir(project_root)
        .output();
    if !matches!(branch_check, Ok(ref out) if out.status.success()) {
        errors.push(format!(
            "Target branch '{}' does not exist",
            config.project.target_branch
        ));
    }

    if let Err(e) = CliAgentRunner::verify_available(&config.agent.binary) {
        errors.push(e);
    }

    if let Some(ref dir) = config.templates.dir {
        let path = if Path::new(dir).is_absolute() {
            std::path::PathBuf::from(dir)
        } else {
            project_root.join(dir)
        };
        if !path.is_dir() {
            errors.push(format!(
                "Templates directory {} does not exist",
                path.display()
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
