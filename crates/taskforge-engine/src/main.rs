//! `TaskForge` command line.
//!
//! Drives tasks through planning and development against the configured
//! agent backends. User-facing output uses writeln! to stdout; logs go to
//! stderr.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use taskforge_core::config::{Config, load_config};
use taskforge_core::tracing_init::{default_filter, init_tracing};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use taskforge_engine::adapter::{DefaultAdapterFactory, Provider, preflight};
use taskforge_engine::agent::AgentRegistry;
use taskforge_engine::audit::AuditLog;
use taskforge_engine::generation::{Orchestrator, Planned};
use taskforge_engine::storage::{NewTask, Task, TaskDatabase};
use taskforge_engine::worktree::{Worktree, WorktreeManager};

#[derive(Parser, Debug)]
#[command(name = "taskforge")]
#[command(version, about = "TaskForge - orchestrate coding agents in isolated worktrees")]
struct Cli {
    /// Project (git repository) directory
    #[arg(long, env = "TASKFORGE_PROJECT")]
    project: Option<PathBuf>,

    /// Where the task database and audit logs live (default: <project>/.taskforge)
    #[arg(long, env = "TASKFORGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Concurrent agents per manager (overrides settings)
    #[arg(long)]
    max_agents: Option<usize>,

    /// Backend used when a task names none (overrides settings)
    #[arg(long)]
    default_provider: Option<String>,

    /// Log level filter (overrides settings)
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Generate a plan (and, without human review, its subtasks)
    Plan { id: String },
    /// Approve a plan awaiting review and generate subtasks
    Approve { id: String },
    /// Regenerate subtasks from the stored plan
    Subtasks { id: String },
    /// Start development and wait for the agent
    Develop { id: String },
    /// Run a one-off prompt in the task's workspace and stream its events
    Run {
        id: String,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        provider: Option<String>,
    },
    /// Check whether a backend is ready to use
    Preflight { provider: String },
    /// Manage task worktrees
    Worktree {
        #[command(subcommand)]
        action: WorktreeAction,
    },
    /// Print a task's audit log
    Audit { id: String },
}

#[derive(Subcommand, Debug)]
enum TaskAction {
    /// Create a task
    Create {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Explicit task id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        /// Wait for `approve` after the plan is generated
        #[arg(long)]
        human_review: bool,
    },
    /// Show one task
    Show { id: String },
    /// List tasks
    List,
}

#[derive(Subcommand, Debug)]
enum WorktreeAction {
    /// Create the worktree for a task
    Create { id: String },
    /// Show a task's worktree
    Status { id: String },
    /// Delete a task's worktree
    Delete {
        id: String,
        /// Delete even with uncommitted changes
        #[arg(long)]
        force: bool,
    },
    /// List worktrees under the isolation root
    List,
    /// Delete every worktree
    Cleanup {
        #[arg(long)]
        force: bool,
    },
}

struct App {
    config: Config,
    project: PathBuf,
    orchestrator: Orchestrator,
    worktrees: Arc<WorktreeManager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let project = match cli.project.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let mut config = load_config(Some(&project))?;
    if let Some(n) = cli.max_agents {
        config.orchestrator.max_concurrent_agents = n;
    }
    if let Some(provider) = cli.default_provider.clone() {
        config.orchestrator.default_provider = provider;
    }
    if let Some(level) = cli.log_level.clone() {
        config.logging.level = level;
    }

    init_tracing(
        &default_filter("taskforge_engine", &config.logging.level),
        cli.log_json || config.logging.json,
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        project = %project.display(),
        "Starting taskforge"
    );

    let app = App::open(config, project, cli.data_dir.as_deref()).await?;
    app.dispatch(cli.command).await
}

impl App {
    async fn open(config: Config, project: PathBuf, data_dir: Option<&Path>) -> anyhow::Result<Self> {
        let data_dir = data_dir.map_or_else(|| project.join(".taskforge"), Path::to_path_buf);
        let store = TaskDatabase::open(&data_dir.join("tasks.db")).await?;
        let audit = AuditLog::new(data_dir.join("audit"));
        let registry = Arc::new(AgentRegistry::new(
            Arc::new(DefaultAdapterFactory::new(config.clone())),
            config.clone(),
            Some(audit.clone()),
        ));
        let worktrees = Arc::new(WorktreeManager::new(&project, config.worktrees.clone()));

        let mut orchestrator = Orchestrator::new(
            store,
            registry,
            audit,
            config.orchestrator.clone(),
            &project,
        );
        if config.orchestrator.use_worktrees {
            if WorktreeManager::verify_git_available().await {
                orchestrator = orchestrator.with_worktrees(Arc::clone(&worktrees));
            } else {
                warn!("git not found; agents run in the project directory");
            }
        }

        Ok(Self {
            config,
            project,
            orchestrator,
            worktrees,
        })
    }

    async fn dispatch(&self, command: Command) -> anyhow::Result<()> {
        let mut out = io::stdout();
        match command {
            Command::Task { action } => self.task(action).await?,
            Command::Plan { id } => {
                let planned = self.orchestrator.generate_plan(&id).await?;
                write_planned(&mut out, planned).await?;
            }
            Command::Approve { id } => {
                let planned = self.orchestrator.approve_plan(&id).await?;
                write_planned(&mut out, planned).await?;
            }
            Command::Subtasks { id } => {
                let planned = self.orchestrator.generate_subtasks(&id).await?;
                write_planned(&mut out, planned).await?;
            }
            Command::Develop { id } => {
                let run = self.orchestrator.start_development(&id).await?;
                writeln!(out, "Development agent {} started.", run.thread_id)?;
                let task = run.wait().await?;
                write_task(&mut out, &task)?;
            }
            Command::Run {
                id,
                prompt,
                provider,
            } => self.run(&id, &prompt, provider.as_deref()).await?,
            Command::Preflight { provider } => {
                let provider = Provider::resolve(&provider);
                let readiness = preflight::preflight(provider, &self.config.providers).await;
                writeln!(
                    out,
                    "{provider}: {}",
                    if readiness.ready { "ready" } else { "not ready" }
                )?;
                if let Some(binary) = &readiness.binary {
                    writeln!(out, "  Binary:  {}", binary.display())?;
                }
                if let Some(version) = &readiness.version {
                    writeln!(out, "  Version: {version}")?;
                }
                for line in &readiness.instructions {
                    writeln!(out, "  - {line}")?;
                }
            }
            Command::Worktree { action } => self.worktree(action).await?,
            Command::Audit { id } => {
                let log = self.orchestrator.audit().read(&id).await?;
                if log.is_empty() {
                    writeln!(out, "No audit entries for {id}.")?;
                } else {
                    write!(out, "{log}")?;
                }
            }
        }
        Ok(())
    }

    async fn task(&self, action: TaskAction) -> anyhow::Result<()> {
        let mut out = io::stdout();
        let store = self.orchestrator.store();
        match action {
            TaskAction::Create {
                title,
                description,
                id,
                provider,
                human_review,
            } => {
                let task = store
                    .create_task(&NewTask {
                        id,
                        title,
                        description,
                        provider,
                        requires_human_review: human_review,
                    })
                    .await?;
                writeln!(out, "Created task {}.", task.id)?;
            }
            TaskAction::Show { id } => {
                let task = store.get_task(&id).await?;
                write_task(&mut out, &task)?;
            }
            TaskAction::List => {
                let tasks = store.list_tasks().await?;
                if tasks.is_empty() {
                    writeln!(out, "No tasks.")?;
                    return Ok(());
                }
                writeln!(
                    out,
                    "{:<16}  {:<12}  {:<10}  {:<20}  TITLE",
                    "ID", "PHASE", "STATUS", "PLANNING"
                )?;
                for task in &tasks {
                    writeln!(
                        out,
                        "{:<16}  {:<12}  {:<10}  {:<20}  {}",
                        task.id, task.phase, task.status, task.planning_status, task.title
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Stream a one-off run until its terminal event or Ctrl+C.
    async fn run(&self, id: &str, prompt: &str, provider: Option<&str>) -> anyhow::Result<()> {
        let mut out = io::stdout();
        let registry = self.orchestrator.registry();
        let thread_id = self.orchestrator.run_prompt(id, prompt, provider).await?;
        let manager = registry
            .manager_for_thread(&thread_id)
            .await
            .context("agent manager disappeared")?;
        let Some((backlog, live)) = manager.follow(&thread_id).await else {
            anyhow::bail!("session {thread_id} not found");
        };

        for event in &backlog {
            writeln!(out, "{}", serde_json::to_string(event)?)?;
        }
        let Some(mut live) = live else {
            return Ok(());
        };

        loop {
            tokio::select! {
                received = live.recv() => match received {
                    Ok(event) => {
                        writeln!(out, "{}", serde_json::to_string(&event)?)?;
                        if event.is_terminal() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(thread_id = %thread_id, skipped, "Event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!(thread_id = %thread_id, "Ctrl+C, stopping agent");
                    registry.stop_agent_by_thread_id(&thread_id).await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn worktree(&self, action: WorktreeAction) -> anyhow::Result<()> {
        let mut out = io::stdout();
        match action {
            WorktreeAction::Create { id } => {
                let worktree = self.worktrees.create_worktree(&id).await?;
                writeln!(out, "Created worktree:")?;
                write_worktree(&mut out, &worktree)?;
            }
            WorktreeAction::Status { id } => match self.worktrees.get_worktree_status(&id).await? {
                Some(worktree) => write_worktree(&mut out, &worktree)?,
                None => writeln!(out, "No worktree for {id}.")?,
            },
            WorktreeAction::Delete { id, force } => {
                if self.worktrees.delete_worktree(&id, force).await? {
                    writeln!(out, "Worktree for {id} deleted.")?;
                } else {
                    writeln!(out, "No worktree for {id}.")?;
                }
            }
            WorktreeAction::List => {
                let live: HashSet<String> = self
                    .orchestrator
                    .store()
                    .list_tasks()
                    .await?
                    .into_iter()
                    .map(|t| t.id)
                    .collect();
                let worktrees = self.worktrees.list_worktrees(Some(&live)).await?;
                if worktrees.is_empty() {
                    writeln!(out, "No worktrees under {}.", self.project.display())?;
                    return Ok(());
                }
                writeln!(
                    out,
                    "{:<16}  {:<28}  {:<5}  {:<6}  {:>10}",
                    "TASK", "BRANCH", "DIRTY", "ORPHAN", "BYTES"
                )?;
                for wt in &worktrees {
                    writeln!(
                        out,
                        "{:<16}  {:<28}  {:<5}  {:<6}  {:>10}",
                        wt.task_id,
                        wt.branch,
                        yes_no(wt.dirty),
                        yes_no(wt.orphan),
                        wt.disk_usage_bytes
                    )?;
                }
            }
            WorktreeAction::Cleanup { force } => {
                let report = self.worktrees.cleanup_all_worktrees(force).await?;
                for task_id in &report.removed {
                    writeln!(out, "removed  {task_id}")?;
                }
                for (task_id, error) in &report.failed {
                    writeln!(out, "failed   {task_id}: {error}")?;
                }
                if !report.is_complete() {
                    anyhow::bail!("{} worktree(s) could not be removed", report.failed.len());
                }
            }
        }
        Ok(())
    }
}

const fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

/// Print the planning result, then follow any development run it started.
async fn write_planned(w: &mut impl Write, planned: Planned) -> anyhow::Result<()> {
    write_task(w, &planned.task)?;
    if let Some(run) = planned.development {
        writeln!(w, "\nDevelopment agent {} started.", run.thread_id)?;
        let task = run.wait().await?;
        write_task(w, &task)?;
    }
    Ok(())
}

fn write_task(w: &mut impl Write, task: &Task) -> io::Result<()> {
    writeln!(w, "  ID:        {}", task.id)?;
    writeln!(w, "  Title:     {}", task.title)?;
    writeln!(w, "  Phase:     {}", task.phase)?;
    writeln!(w, "  Status:    {}", task.status)?;
    writeln!(w, "  Planning:  {}", task.planning_status)?;
    if let Some(provider) = &task.provider {
        writeln!(w, "  Provider:  {provider}")?;
    }
    if let Some(dir) = &task.working_dir {
        writeln!(w, "  Workdir:   {dir}")?;
    }
    if let Some(thread) = &task.thread_id {
        writeln!(w, "  Thread:    {thread}")?;
    }
    if let Some(error) = &task.last_error {
        writeln!(w, "  Error:     {error}")?;
    }
    if let Some(plan) = &task.plan {
        writeln!(w, "\n{plan}")?;
    }
    let subtasks = task.subtask_specs();
    if !subtasks.is_empty() {
        writeln!(w, "\nSubtasks:")?;
        for s in &subtasks {
            writeln!(w, "  {}. {}", s.id, s.title)?;
        }
    }
    Ok(())
}

fn write_worktree(w: &mut impl Write, wt: &Worktree) -> io::Result<()> {
    writeln!(w, "  Task:    {}", wt.task_id)?;
    writeln!(w, "  Branch:  {}", wt.branch)?;
    writeln!(w, "  Path:    {}", wt.path.display())?;
    writeln!(w, "  Dirty:   {}", yes_no(wt.dirty))?;
    writeln!(w, "  Disk:    {} bytes", wt.disk_usage_bytes)?;
    Ok(())
}
