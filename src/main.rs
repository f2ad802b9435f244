use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use maestro::agent::{install_signal_handlers, CliAgentRunner};
use maestro::bus::EventBus;
use maestro::catalog;
use maestro::config::{self, MaestroConfig};
use maestro::error::{MaestroError, StoreError};
use maestro::executor::ExecutorDeps;
use maestro::git::CommandGit;
use maestro::hosting::GhCli;
use maestro::lock;
use maestro::log::LogLevel;
use maestro::preflight;
use maestro::scheduler::{self, HaltReason};
use maestro::store::{FileStore, NewTask, Store};
use maestro::template::TemplateSet;
use maestro::types::{
    parse_priority, parse_profile, parse_weight, ControlRequest, GateResolution, TaskStatus,
};
use maestro::worktree::WorktreeManager;
use maestro::log_info;

#[derive(Parser)]
#[command(name = "maestro", about = "Autonomous phased task orchestrator")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/maestro.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the maestro runtime directory and config
    Init,
    /// Add a task to the project
    Add {
        /// Task title
        title: String,
        /// Longer description of the work
        #[arg(short, long, default_value = "")]
        description: String,
        /// Weight (trivial, small, medium, large, greenfield)
        #[arg(short, long, default_value = "small")]
        weight: String,
        /// Priority (low, normal, high)
        #[arg(short, long, default_value = "normal")]
        priority: String,
        /// Category label
        #[arg(long)]
        category: Option<String>,
        /// Blocking task ids (repeatable)
        #[arg(long = "blocked-by", action = clap::ArgAction::Append)]
        blocked_by: Vec<String>,
        /// Plan immediately with this profile instead of leaving the
        /// task in created
        #[arg(long)]
        plan: bool,
    },
    /// Derive the phase plan for a created task
    Plan {
        task_id: String,
        /// Profile override (auto, fast, safe, strict)
        #[arg(long)]
        profile: Option<String>,
    },
    /// Run the scheduler until the backlog drains
    Run,
    /// Show tasks and their phase cursors
    Status,
    /// Show token/cost totals per month
    Costs,
    /// Pause a running task at its next iteration boundary
    Pause { task_id: String },
    /// Resume a paused or blocked task
    Resume { task_id: String },
    /// Cancel a task
    Cancel { task_id: String },
    /// Approve a task waiting at a human gate
    Approve { task_id: String },
    /// Reject a task waiting at a human gate
    Reject { task_id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.log_level.parse::<LogLevel>() {
        Ok(level) => maestro::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let root = cli.root.clone();
    let config = match config::load_config_from(cli.config.as_deref(), &root) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Init => handle_init(&root, &config),
        Commands::Add {
            title,
            description,
            weight,
            priority,
            category,
            blocked_by,
            plan,
        } => {
            handle_add(
                &root,
                &config,
                &title,
                &description,
                &weight,
                &priority,
                category,
                blocked_by,
                plan,
            )
            .await
        }
        Commands::Plan { task_id, profile } => {
            handle_plan(&root, &config, &task_id, profile.as_deref()).await
        }
        Commands::Run => handle_run(&root, &config).await,
        Commands::Status => handle_status(&root, &config).await,
        Commands::Costs => handle_costs(&root, &config).await,
        Commands::Pause { task_id } => {
            handle_control(&root, &config, &task_id, ControlRequest::Pause).await
        }
        Commands::Resume { task_id } => handle_resume(&root, &config, &task_id).await,
        Commands::Cancel { task_id } => handle_cancel(&root, &config, &task_id).await,
        Commands::Approve { task_id } => {
            handle_gate(&root, &config, &task_id, GateResolution::Approved).await
        }
        Commands::Reject { task_id } => {
            handle_gate(&root, &config, &task_id, GateResolution::Rejected).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open_store(root: &Path, config: &MaestroConfig) -> Result<FileStore, String> {
    FileStore::open(root, &config.project.prefix).map_err(store_err)
}

/// Route store failures through the error taxonomy so user errors
/// carry their remediation hint.
fn store_err(e: StoreError) -> String {
    MaestroError::from(e).into()
}

fn handle_init(root: &Path, _config: &MaestroConfig) -> Result<(), String> {
    preflight::is_git_repo(root).map_err(|_| "Not a git repository. Run `git init` first.".to_string())?;

    let runtime = config::runtime_dir(root);
    std::fs::create_dir_all(&runtime)
        .map_err(|e| format!("Failed to create {}: {}", runtime.display(), e))?;

    let config_path = root.join("maestro.toml");
    if !config_path.exists() {
        let stub = "\
[project]
prefix = \"T\"
target_branch = \"main\"

[execution]
parallelism = 2
iteration_timeout_minutes = 30

[completion]
action = \"pr\"
";
        std::fs::write(&config_path, stub)
            .map_err(|e| format!("Failed to write {}: {}", config_path.display(), e))?;
        log_info!("Wrote {}", config_path.display());
    }

    log_info!("Initialized maestro in {}", root.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_add(
    root: &Path,
    config: &MaestroConfig,
    title: &str,
    description: &str,
    weight: &str,
    priority: &str,
    category: Option<String>,
    blocked_by: Vec<String>,
    plan_now: bool,
) -> Result<(), String> {
    let weight = parse_weight(weight)?;
    let priority = parse_priority(priority)?;
    let store = open_store(root, config)?;

    let task = store
        .create_task(NewTask {
            title: title.to_string(),
            description: description.to_string(),
            weight,
            priority,
            category,
            blocked_by: blocked_by.into_iter().collect::<BTreeSet<_>>(),
            ..Default::default()
        })
        .await
        .map_err(store_err)?;

    log_info!("Created {} ({})", task.id, task.weight);

    if plan_now {
        let plan = catalog::plan_for(weight, config.project.profile);
        store
            .set_plan(&task.id, plan)
            .await
            .map_err(store_err)?;
        log_info!("{} planned with profile {:?}", task.id, config.project.profile);
    }
    Ok(())
}

async fn handle_plan(
    root: &Path,
    config: &MaestroConfig,
    task_id: &str,
    profile: Option<&str>,
) -> Result<(), String> {
    let profile = match profile {
        Some(p) => parse_profile(p)?,
        None => config.project.profile,
    };
    let store = open_store(root, config)?;
    let task = store.get_task(task_id).await.map_err(store_err)?;

    let plan = catalog::plan_for(task.weight, profile);
    let phases: Vec<&str> = plan.phases.iter().map(|p| p.phase_id.as_str()).collect();
    store
        .set_plan(task_id, plan.clone())
        .await
        .map_err(store_err)?;

    log_info!(
        "{} planned: [{}] (profile {:?})",
        task_id,
        phases.join(", "),
        profile
    );
    Ok(())
}

async fn handle_run(root: &Path, config: &MaestroConfig) -> Result<(), String> {
    preflight::check(root, config).map_err(|errors| {
        format!(
            "Preflight failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    let worker = format!("maestro-{}", std::process::id());
    let _lock = lock::acquire(&config::runtime_dir(root), &worker)?;
    install_signal_handlers()?;

    let store = Arc::new(open_store(root, config)?);
    let git = Arc::new(CommandGit::open(root).map_err(|e| e.to_string())?);
    let worktrees = Arc::new(WorktreeManager::new(
        git.clone(),
        config::worktree_base(config, root),
        config.project.initiative.clone(),
        config.worktree.cleanup_on_fail,
    ));
    let templates_dir = config.templates.dir.as_ref().map(|d| {
        let p = Path::new(d);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    });
    let deps = ExecutorDeps {
        store,
        runner: Arc::new(CliAgentRunner::new(
            &config.agent.binary,
            config.agent.model.clone(),
            root.to_path_buf(),
        )),
        git,
        hosting: Arc::new(GhCli::new(root.to_path_buf())),
        worktrees,
        templates: Arc::new(TemplateSet::new(templates_dir, config.sentinel.clone())),
        bus: Arc::new(EventBus::default()),
        config: Arc::new(config.clone()),
    };

    let cancel = CancellationToken::new();
    let summary = scheduler::run_scheduler(deps, cancel).await?;

    log_info!(
        "\nRun finished ({:?}): {} phase execution(s)",
        summary.halt_reason,
        summary.phases_executed
    );
    print_list("completed", &summary.tasks_completed);
    print_list("failed", &summary.tasks_failed);
    print_list("blocked", &summary.tasks_blocked);
    print_list("paused", &summary.tasks_paused);
    print_list("cancelled", &summary.tasks_cancelled);

    if summary.halt_reason == HaltReason::ShutdownRequested {
        maestro::agent::kill_all_children();
    }
    Ok(())
}

fn print_list(label: &str, ids: &[String]) {
    if !ids.is_empty() {
        log_info!("  {}: {}", label, ids.join(", "));
    }
}

async fn handle_status(root: &Path, config: &MaestroConfig) -> Result<(), String> {
    let store = open_store(root, config)?;
    let tasks = store.list_tasks().await.map_err(store_err)?;

    if tasks.is_empty() {
        log_info!("No tasks.");
        return Ok(());
    }

    for task in &tasks {
        let cursor = match (&task.plan, store.load_execution_state(&task.id).await) {
            (Some(plan), Ok(Some(exec))) if exec.current_phase_index < plan.len() => {
                format!(
                    " @ {} ({}/{})",
                    plan.phases[exec.current_phase_index].phase_id,
                    exec.current_phase_index + 1,
                    plan.len()
                )
            }
            _ => String::new(),
        };
        let failure = task
            .failure
            .as_ref()
            .map(|f| format!(" [{}: {}]", f.phase_id, f.reason))
            .unwrap_or_default();
        log_info!(
            "{}  {:<10} {}{}{}",
            task.id,
            task.status.to_string(),
            task.title,
            cursor,
            failure
        );
    }
    Ok(())
}

async fn handle_costs(root: &Path, config: &MaestroConfig) -> Result<(), String> {
    let store = open_store(root, config)?;
    let periods = store.cost_periods().await.map_err(store_err)?;

    if periods.is_empty() {
        log_info!("No recorded cost periods.");
        return Ok(());
    }
    for (period, totals) in periods {
        log_info!(
            "{}: {} iterations, {} tokens, ${:.2}",
            period,
            totals.iterations,
            totals.tokens.total(),
            totals.cost_usd
        );
    }
    Ok(())
}

async fn handle_control(
    root: &Path,
    config: &MaestroConfig,
    task_id: &str,
    control: ControlRequest,
) -> Result<(), String> {
    let store = open_store(root, config)?;
    store
        .request_control(task_id, control)
        .await
        .map_err(store_err)?;
    log_info!("{} will {:?} at its next iteration boundary", task_id, control);
    Ok(())
}

async fn handle_resume(root: &Path, config: &MaestroConfig, task_id: &str) -> Result<(), String> {
    let store = open_store(root, config)?;
    store
        .request_resume(task_id)
        .await
        .map_err(store_err)?;
    log_info!("{} marked resumable; run `maestro run` to pick it up", task_id);
    Ok(())
}

async fn handle_cancel(root: &Path, config: &MaestroConfig, task_id: &str) -> Result<(), String> {
    let store = open_store(root, config)?;
    let task = store.get_task(task_id).await.map_err(store_err)?;

    match task.status {
        TaskStatus::Running => {
            // A live executor consumes the request at its next boundary.
            store
                .request_control(task_id, ControlRequest::Cancel)
                .await
                .map_err(store_err)?;
            log_info!("{} will cancel at its next iteration boundary", task_id);
        }
        status if status.is_terminal() => {
            return Err(format!("{} is already {}", task_id, status));
        }
        status => {
            store
                .update_task_status(task_id, status, TaskStatus::Cancelled)
                .await
                .map_err(store_err)?;
            log_info!("{} cancelled", task_id);
        }
    }
    Ok(())
}

async fn handle_gate(
    root: &Path,
    config: &MaestroConfig,
    task_id: &str,
    resolution: GateResolution,
) -> Result<(), String> {
    let store = open_store(root, config)?;
    store
        .resolve_gate(task_id, resolution)
        .await
        .map_err(store_err)?;
    log_info!(
        "{} gate {:?}; run `maestro run` to continue it",
        task_id,
        resolution
    );
    Ok(())
}
