//! Agent registry.
//!
//! Maps each task to the [`AgentManager`] currently serving it, and every
//! issued thread id to the manager that owns it. A task whose backend or
//! working directory changes gets a fresh manager; the old one stays
//! reachable through the thread ids it issued.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use taskforge_core::config::Config;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::manager::{AgentManager, ManagerError, StartOptions};
use super::session::AgentSession;
use crate::adapter::{AdapterConfig, AdapterError, AdapterFactory, AdapterMode, Provider};
use crate::audit::AuditLog;

/// Errors from the agent registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{provider} is not ready: {}", join_lines(.instructions))]
    NotReady {
        provider: Provider,
        instructions: Vec<String>,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

fn join_lines(lines: &[String]) -> String {
    lines.join("; ")
}

/// Process-wide lookup from tasks and threads to managers.
pub struct AgentRegistry {
    factory: Arc<dyn AdapterFactory>,
    config: Config,
    audit: Option<AuditLog>,
    by_task: RwLock<HashMap<String, Arc<AgentManager>>>,
    by_thread: RwLock<HashMap<String, Arc<AgentManager>>>,
}

impl AgentRegistry {
    pub fn new(factory: Arc<dyn AdapterFactory>, config: Config, audit: Option<AuditLog>) -> Self {
        Self {
            factory,
            config,
            audit,
            by_task: RwLock::new(HashMap::new()),
            by_thread: RwLock::new(HashMap::new()),
        }
    }

    /// Backend for a request; `None` means the configured default. Total.
    pub fn resolve_provider(&self, requested: Option<&str>) -> Provider {
        Provider::resolve(requested.unwrap_or(&self.config.orchestrator.default_provider))
    }

    /// Manager serving `task_id`, created (and the previous one replaced)
    /// when the backend or working directory differs from the last use.
    pub async fn manager_for_task(
        &self,
        task_id: &str,
        provider: Option<&str>,
        working_dir: &Path,
    ) -> Result<Arc<AgentManager>, RegistryError> {
        let provider = self.resolve_provider(provider);

        if let Some(existing) = self.by_task.read().await.get(task_id) {
            if existing.provider() == provider && existing.working_dir() == working_dir {
                debug!(task_id, instance_id = existing.instance_id(), "Reusing AgentManager");
                return Ok(Arc::clone(existing));
            }
        }

        let readiness = self.factory.preflight(provider).await;
        if !readiness.ready {
            return Err(RegistryError::NotReady {
                provider,
                instructions: readiness.instructions,
            });
        }

        let adapter = self.factory.create(provider);
        adapter
            .initialize(AdapterConfig {
                credential: readiness.credential,
                working_dir: working_dir.to_path_buf(),
                mode: AdapterMode::Build,
            })
            .await?;

        let manager = Arc::new(AgentManager::new(
            adapter,
            working_dir.to_path_buf(),
            self.config.orchestrator.max_concurrent_agents,
        ));
        let previous = self
            .by_task
            .write()
            .await
            .insert(task_id.to_string(), Arc::clone(&manager));

        if let Some(previous) = previous {
            info!(
                task_id,
                old_instance = previous.instance_id(),
                new_instance = manager.instance_id(),
                provider = %provider,
                "Replaced AgentManager"
            );
        }
        self.audit(
            task_id,
            &format!(
                "manager {} ({provider}) serving {}",
                manager.instance_id(),
                working_dir.display()
            ),
        )
        .await;
        Ok(manager)
    }

    /// Start an agent for a task and record its thread id.
    pub async fn start_agent_for_task(
        &self,
        task_id: &str,
        provider: Option<&str>,
        working_dir: &Path,
        prompt: &str,
        options: StartOptions,
    ) -> Result<String, RegistryError> {
        let manager = self.manager_for_task(task_id, provider, working_dir).await?;
        let thread_id = manager.start_agent(task_id, prompt, options).await?;
        self.by_thread
            .write()
            .await
            .insert(thread_id.clone(), manager);
        self.audit(task_id, &format!("agent {thread_id} started")).await;
        Ok(thread_id)
    }

    /// Manager that issued `thread_id`.
    pub async fn manager_for_thread(&self, thread_id: &str) -> Option<Arc<AgentManager>> {
        self.by_thread.read().await.get(thread_id).cloned()
    }

    /// Stop a thread. `false` when the thread is unknown.
    pub async fn stop_agent_by_thread_id(&self, thread_id: &str) -> bool {
        let Some(manager) = self.manager_for_thread(thread_id).await else {
            debug!(thread_id, "Stop for unknown thread");
            return false;
        };
        match manager.stop_agent(thread_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(thread_id, error = %e, "Stop failed");
                false
            }
        }
    }

    pub async fn get_agent_session_by_thread_id(&self, thread_id: &str) -> Option<AgentSession> {
        let manager = self.manager_for_thread(thread_id).await?;
        manager.get_agent_status(thread_id).await
    }

    /// Running sessions across every manager, replaced ones included.
    pub async fn list_active_agents(&self) -> Vec<AgentSession> {
        let managers: Vec<Arc<AgentManager>> = {
            let by_thread = self.by_thread.read().await;
            let by_task = self.by_task.read().await;
            let mut seen = HashSet::new();
            by_task
                .values()
                .chain(by_thread.values())
                .filter(|m| seen.insert(m.instance_id().to_string()))
                .cloned()
                .collect()
        };
        let mut active = Vec::new();
        for manager in managers {
            active.extend(manager.list_active_agents().await);
        }
        active.sort_by_key(|s| s.started_at);
        active
    }

    /// Drop every manager and thread mapping.
    pub async fn reset(&self) {
        self.by_task.write().await.clear();
        self.by_thread.write().await.clear();
        info!("AgentRegistry reset");
    }

    async fn audit(&self, task_id: &str, message: &str) {
        if let Some(ref audit) = self.audit {
            if let Err(e) = audit.append(task_id, "registry", message).await {
                warn!(task_id, error = %e, "Failed to write audit line");
            }
        }
    }
}
