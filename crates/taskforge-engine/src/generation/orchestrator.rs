//! Plan / subtask generation with a bounded validate-and-retry loop, and
//! the development run that follows it.
//!
//! Every transition is written to the task's audit log. Retry counters live
//! only for one invocation chain; a restart begins a fresh chain.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use taskforge_core::config::OrchestratorConfig;
use taskforge_core::events::{EventKind, StreamEvent};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::artifacts::{Artifact, ArtifactKind, extract, scan_fallback};
use super::prompts::{corrective_prompt, development_prompt, planning_prompt, subtask_prompt};
use crate::agent::{AgentRegistry, CompletionOutcome, RegistryError, StartOptions};
use crate::audit::AuditLog;
use crate::storage::{DatabaseError, Phase, PlanningStatus, Task, TaskDatabase, TaskStatus};
use crate::worktree::{WorktreeError, WorktreeManager};

/// Errors from the generation orchestrator. A blocked task is a normal
/// outcome, not an error: inspect the returned task's status.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Task {task_id} cannot {operation} while {state}")]
    InvalidState {
        task_id: String,
        operation: &'static str,
        state: String,
    },

    #[error(transparent)]
    Store(#[from] DatabaseError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error("Failed to encode subtasks: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Background(String),
}

/// A development agent running in the background.
#[derive(Debug)]
pub struct DevelopmentRun {
    pub thread_id: String,
    completion: JoinHandle<Result<Task, OrchestratorError>>,
}

impl DevelopmentRun {
    /// Wait for the agent and the resulting task update.
    pub async fn wait(self) -> Result<Task, OrchestratorError> {
        self.completion
            .await
            .map_err(|e| OrchestratorError::Background(e.to_string()))?
    }
}

/// Result of a planning step. Without human review, accepted subtasks start
/// development at once and `development` carries that run.
#[derive(Debug)]
pub struct Planned {
    pub task: Task,
    pub development: Option<DevelopmentRun>,
}

impl Planned {
    const fn settled(task: Task) -> Self {
        Self {
            task,
            development: None,
        }
    }

    /// The task once any development run it started has finished.
    pub async fn finish(self) -> Result<Task, OrchestratorError> {
        match self.development {
            Some(run) => run.wait().await,
            None => Ok(self.task),
        }
    }
}

/// Drives tasks through planning and into development.
#[derive(Clone)]
pub struct Orchestrator {
    store: TaskDatabase,
    registry: Arc<AgentRegistry>,
    audit: AuditLog,
    worktrees: Option<Arc<WorktreeManager>>,
    config: OrchestratorConfig,
    project_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        store: TaskDatabase,
        registry: Arc<AgentRegistry>,
        audit: AuditLog,
        config: OrchestratorConfig,
        project_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            registry,
            audit,
            worktrees: None,
            config,
            project_dir: project_dir.into(),
        }
    }

    /// Run every agent in the task's own worktree.
    #[must_use]
    pub fn with_worktrees(mut self, worktrees: Arc<WorktreeManager>) -> Self {
        self.worktrees = Some(worktrees);
        self
    }

    pub const fn store(&self) -> &TaskDatabase {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub const fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Generate a plan. Without human review the subtask run and then
    /// development follow immediately.
    pub async fn generate_plan(&self, task_id: &str) -> Result<Planned, OrchestratorError> {
        let mut task = self.store.get_task(task_id).await?;
        ensure(
            &task,
            "generate a plan",
            task.phase == Phase::Planning
                && task.status != TaskStatus::Running
                && task.planning_status != PlanningStatus::AwaitingApproval,
        )?;

        let working_dir = self.prepare_workspace(&mut task).await?;
        task.status = TaskStatus::Running;
        task.planning_status = PlanningStatus::GeneratingPlan;
        task.last_error = None;
        self.store.save_task(&task).await?;
        info!(task_id, "Plan generation started");
        self.record(task_id, "plan", "plan generation started").await;

        let prompt = planning_prompt(&task);
        let Some(artifact) = self
            .generate(&mut task, &working_dir, ArtifactKind::Plan, prompt)
            .await?
        else {
            return Ok(Planned::settled(task));
        };
        if let Artifact::Plan(markdown) = artifact {
            task.plan = Some(markdown);
        }

        if task.requires_human_review {
            task.status = TaskStatus::Idle;
            task.planning_status = PlanningStatus::AwaitingApproval;
            self.store.save_task(&task).await?;
            self.record(task_id, "plan", "plan stored; awaiting approval").await;
            return Ok(Planned::settled(task));
        }

        task.planning_status = PlanningStatus::GeneratingSubtasks;
        self.store.save_task(&task).await?;
        self.record(task_id, "plan", "plan stored; generating subtasks").await;
        self.run_subtasks(task, &working_dir).await
    }

    /// Human sign-off on a plan; starts subtask generation. Development
    /// stays an explicit step for reviewed tasks.
    pub async fn approve_plan(&self, task_id: &str) -> Result<Planned, OrchestratorError> {
        let mut task = self.store.get_task(task_id).await?;
        ensure(
            &task,
            "approve a plan",
            task.planning_status == PlanningStatus::AwaitingApproval && task.plan.is_some(),
        )?;
        self.record(task_id, "plan", "plan approved").await;

        let working_dir = self.prepare_workspace(&mut task).await?;
        task.status = TaskStatus::Running;
        task.planning_status = PlanningStatus::GeneratingSubtasks;
        task.last_error = None;
        self.store.save_task(&task).await?;
        self.run_subtasks(task, &working_dir).await
    }

    /// (Re)generate subtasks from the stored plan.
    pub async fn generate_subtasks(&self, task_id: &str) -> Result<Planned, OrchestratorError> {
        let mut task = self.store.get_task(task_id).await?;
        ensure(
            &task,
            "generate subtasks",
            task.phase == Phase::Planning
                && task.plan.is_some()
                && task.status != TaskStatus::Running
                && task.planning_status != PlanningStatus::AwaitingApproval,
        )?;

        let working_dir = self.prepare_workspace(&mut task).await?;
        task.status = TaskStatus::Running;
        task.planning_status = PlanningStatus::GeneratingSubtasks;
        task.last_error = None;
        self.store.save_task(&task).await?;
        self.run_subtasks(task, &working_dir).await
    }

    async fn run_subtasks(
        &self,
        mut task: Task,
        working_dir: &Path,
    ) -> Result<Planned, OrchestratorError> {
        let plan = task.plan.clone().unwrap_or_default();
        self.record(&task.id, "subtasks", "subtask generation started").await;

        let prompt = subtask_prompt(&task, &plan);
        let Some(artifact) = self
            .generate(&mut task, working_dir, ArtifactKind::Subtasks, prompt)
            .await?
        else {
            return Ok(Planned::settled(task));
        };

        let subtasks = artifact.subtasks();
        task.set_subtasks(&subtasks)?;
        task.status = TaskStatus::Idle;
        task.planning_status = PlanningStatus::Ready;
        self.store.save_task(&task).await?;
        info!(task_id = %task.id, count = subtasks.len(), "Subtasks stored");
        self.record(
            &task.id,
            "subtasks",
            &format!("{} subtasks stored; planning ready", subtasks.len()),
        )
        .await;

        if task.requires_human_review {
            return Ok(Planned::settled(task));
        }
        let run = self.begin_development(&mut task, working_dir).await?;
        Ok(Planned {
            task,
            development: Some(run),
        })
    }

    /// Move a planned task into development and start the implementation
    /// agent. Success moves the task to `ai_review`; failure blocks it.
    pub async fn start_development(&self, task_id: &str) -> Result<DevelopmentRun, OrchestratorError> {
        let mut task = self.store.get_task(task_id).await?;
        ensure(
            &task,
            "start development",
            task.planning_status == PlanningStatus::Ready
                && task.status != TaskStatus::Running
                && matches!(task.phase, Phase::Planning | Phase::Development),
        )?;

        let working_dir = self.prepare_workspace(&mut task).await?;
        self.begin_development(&mut task, &working_dir).await
    }

    async fn begin_development(
        &self,
        task: &mut Task,
        working_dir: &Path,
    ) -> Result<DevelopmentRun, OrchestratorError> {
        let prompt = development_prompt(
            task,
            task.plan.as_deref().unwrap_or_default(),
            &task.subtask_specs(),
        );
        task.phase = Phase::Development;
        task.status = TaskStatus::Running;
        task.last_error = None;
        self.store.save_task(task).await?;
        info!(task_id = %task.id, "Development started");
        self.record(&task.id, "development", "development started").await;

        let (thread_id, rx) = self
            .start(task, working_dir, &prompt, "development")
            .await?;

        let this = self.clone();
        let id = task.id.clone();
        let completion =
            tokio::spawn(async move { this.finish_development(&id, rx.await.ok()).await });
        Ok(DevelopmentRun {
            thread_id,
            completion,
        })
    }

    async fn finish_development(
        &self,
        task_id: &str,
        outcome: Option<CompletionOutcome>,
    ) -> Result<Task, OrchestratorError> {
        let mut task = self.store.get_task(task_id).await?;
        match outcome {
            Some(outcome) if outcome.success => {
                task.phase = Phase::AiReview;
                task.status = TaskStatus::Idle;
                task.last_error = None;
                self.store.save_task(&task).await?;
                info!(task_id, "Development completed");
                self.record(task_id, "development", "development completed; moved to ai_review")
                    .await;
            }
            Some(outcome) => {
                let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
                self.block(&mut task, "development", &format!("development agent failed: {error}"))
                    .await?;
            }
            None => {
                task.status = TaskStatus::Idle;
                task.last_error = Some("development agent stopped".to_string());
                self.store.save_task(&task).await?;
                self.record(task_id, "development", "development agent stopped").await;
            }
        }
        Ok(task)
    }

    /// Start a one-off agent on the task's workspace. Returns the thread id;
    /// the task record is not advanced.
    pub async fn run_prompt(
        &self,
        task_id: &str,
        prompt: &str,
        provider: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let mut task = self.store.get_task(task_id).await?;
        let working_dir = self.prepare_workspace(&mut task).await?;
        if let Some(provider) = provider {
            task.provider = Some(provider.to_string());
        }
        let (thread_id, _) = self.start(&mut task, &working_dir, prompt, "run").await?;
        Ok(thread_id)
    }

    /// The retry loop. `Ok(None)` means the task was blocked.
    async fn generate(
        &self,
        task: &mut Task,
        working_dir: &Path,
        kind: ArtifactKind,
        original: String,
    ) -> Result<Option<Artifact>, OrchestratorError> {
        let scope = kind.as_str();
        let max_parse = self.config.max_parse_retries;
        let max_validation = self.config.max_validation_retries;
        let mut parse_retries = 0;
        let mut validation_retries = 0;
        let mut attempt = 0;
        let mut prompt = original.clone();

        loop {
            attempt += 1;
            let (thread_id, rx) = self
                .start(task, working_dir, &prompt, scope)
                .await?;
            self.record(&task.id, scope, &format!("attempt {attempt} on {thread_id}"))
                .await;

            let Some(outcome) = rx.await.ok() else {
                self.block(task, scope, "agent was stopped before it finished")
                    .await?;
                return Ok(None);
            };
            if !outcome.success {
                let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
                self.block(task, scope, &format!("agent failed: {error}"))
                    .await?;
                return Ok(None);
            }

            let extracted = match extract(kind, &outcome.output) {
                Ok(artifact) => Ok(artifact),
                Err(err) => match scan_fallback(kind, working_dir).await {
                    Some((path, artifact)) => {
                        self.record(
                            &task.id,
                            scope,
                            &format!("{kind} recovered from {}", path.display()),
                        )
                        .await;
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            debug!(path = %path.display(), error = %e, "Could not remove fallback artifact");
                        }
                        Ok(artifact)
                    }
                    None => Err(err),
                },
            };

            let artifact = match extracted {
                Ok(artifact) => artifact,
                Err(err) => {
                    self.annotate(
                        &thread_id,
                        EventKind::Validation,
                        json!({ "artifact": scope, "valid": false, "errors": [err.to_string()] }),
                    )
                    .await;
                    if parse_retries >= max_parse {
                        self.block(
                            task,
                            scope,
                            &format!("no usable {kind} after {attempt} attempts: {err}"),
                        )
                        .await?;
                        return Ok(None);
                    }
                    parse_retries += 1;
                    warn!(task_id = %task.id, attempt, error = %err, "Unparseable {kind} output");
                    self.record(
                        &task.id,
                        scope,
                        &format!("retry {parse_retries}/{max_parse}: {err}"),
                    )
                    .await;
                    prompt = corrective_prompt(&original, &err.to_string(), &outcome.output, None);
                    self.annotate(
                        &thread_id,
                        EventKind::Feedback,
                        json!({ "artifact": scope, "error": err.to_string() }),
                    )
                    .await;
                    continue;
                }
            };

            let result = artifact.validate();
            self.annotate(
                &thread_id,
                EventKind::Validation,
                json!({
                    "artifact": scope,
                    "valid": result.valid,
                    "errors": &result.errors,
                    "warnings": &result.warnings,
                }),
            )
            .await;

            if result.valid {
                self.record(
                    &task.id,
                    scope,
                    &format!("{kind} accepted with {} warnings", result.warnings.len()),
                )
                .await;
                return Ok(Some(artifact));
            }
            if kind == ArtifactKind::Plan && task.requires_human_review {
                self.record(
                    &task.id,
                    scope,
                    &format!(
                        "{kind} has validation errors, left for human review: {}",
                        result.errors.join("; ")
                    ),
                )
                .await;
                return Ok(Some(artifact));
            }
            if validation_retries >= max_validation {
                self.block(
                    task,
                    scope,
                    &format!(
                        "{kind} failed validation after {attempt} attempts: {}",
                        result.errors.join("; ")
                    ),
                )
                .await?;
                return Ok(None);
            }

            validation_retries += 1;
            warn!(task_id = %task.id, attempt, errors = result.errors.len(), "Invalid {kind}");
            self.record(
                &task.id,
                scope,
                &format!(
                    "retry {validation_retries}/{max_validation}: validation failed: {}",
                    result.errors.join("; ")
                ),
            )
            .await;
            let feedback = artifact.feedback(&result);
            prompt = corrective_prompt(
                &original,
                "the answer failed validation",
                &outcome.output,
                Some(&feedback),
            );
            self.annotate(
                &thread_id,
                EventKind::Feedback,
                json!({ "artifact": scope, "feedback": feedback }),
            )
            .await;
        }
    }

    /// Start an agent for the task and record its thread. A registry failure
    /// is written back to the task before it is returned.
    async fn start(
        &self,
        task: &mut Task,
        working_dir: &Path,
        prompt: &str,
        scope: &str,
    ) -> Result<(String, oneshot::Receiver<CompletionOutcome>), OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        let options = StartOptions::default().on_complete(move |outcome| {
            let _ = tx.send(outcome);
        });

        let started = self
            .registry
            .start_agent_for_task(
                &task.id,
                task.provider.as_deref(),
                working_dir,
                prompt,
                options,
            )
            .await;
        let thread_id = match started {
            Ok(thread_id) => thread_id,
            Err(e) => {
                let message = e.to_string();
                if matches!(e, RegistryError::NotReady { .. }) {
                    task.block(message.clone());
                } else {
                    task.status = TaskStatus::Idle;
                    task.last_error = Some(message.clone());
                }
                self.store.save_task(task).await?;
                self.record(&task.id, scope, &format!("agent start failed: {message}"))
                    .await;
                return Err(e.into());
            }
        };

        task.thread_id = Some(thread_id.clone());
        self.store.save_task(task).await?;
        Ok((thread_id, rx))
    }

    /// Working directory for the task's agents, stored on the task.
    async fn prepare_workspace(&self, task: &mut Task) -> Result<PathBuf, OrchestratorError> {
        let path = match &self.worktrees {
            Some(worktrees) => match worktrees.get_worktree_status(&task.id).await? {
                Some(existing) => existing.path,
                None => {
                    let created = worktrees.create_worktree(&task.id).await?;
                    self.record(
                        &task.id,
                        "workspace",
                        &format!(
                            "worktree created at {} on {}",
                            created.path.display(),
                            created.branch
                        ),
                    )
                    .await;
                    created.path
                }
            },
            None => task
                .working_dir_path()
                .unwrap_or_else(|| self.project_dir.clone()),
        };

        let stored = path.to_string_lossy().into_owned();
        if task.working_dir.as_deref() != Some(stored.as_str()) {
            task.working_dir = Some(stored);
            self.store.save_task(task).await?;
        }
        Ok(path)
    }

    async fn block(&self, task: &mut Task, scope: &str, reason: &str) -> Result<(), OrchestratorError> {
        warn!(task_id = %task.id, reason, "Task blocked");
        task.block(reason);
        self.store.save_task(task).await?;
        self.record(&task.id, scope, &format!("blocked: {reason}")).await;
        Ok(())
    }

    async fn annotate(&self, thread_id: &str, kind: EventKind, payload: serde_json::Value) {
        let Some(manager) = self.registry.manager_for_thread(thread_id).await else {
            return;
        };
        manager
            .append_event(thread_id, StreamEvent::new(kind, thread_id, payload))
            .await;
    }

    async fn record(&self, task_id: &str, scope: &str, message: &str) {
        if let Err(e) = self.audit.append(task_id, scope, message).await {
            warn!(task_id, error = %e, "Failed to write audit line");
        }
    }
}

fn ensure(task: &Task, operation: &'static str, allowed: bool) -> Result<(), OrchestratorError> {
    if allowed {
        return Ok(());
    }
    Err(OrchestratorError::InvalidState {
        task_id: task.id.clone(),
        operation,
        state: format!(
            "{} / {} / {}",
            task.phase, task.status, task.planning_status
        ),
    })
}
