//! Shared fixtures for the engine integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use taskforge_core::config::Config;
use taskforge_engine::adapter::{
    AdapterFactory, CliAdapter, Provider, Readiness, SimulatedTurn, SimulatorAdapter,
};
use taskforge_engine::agent::{AgentManager, AgentRegistry, SessionState};
use taskforge_engine::audit::AuditLog;
use taskforge_engine::generation::Orchestrator;
use taskforge_engine::storage::{NewTask, TaskDatabase};

/// Hands out one shared scripted simulator for every provider.
pub struct ScriptedFactory {
    pub adapter: Arc<SimulatorAdapter>,
}

impl ScriptedFactory {
    pub fn new(turns: Vec<SimulatedTurn>) -> Self {
        Self {
            adapter: Arc::new(SimulatorAdapter::scripted(turns)),
        }
    }
}

#[async_trait]
impl AdapterFactory for ScriptedFactory {
    async fn preflight(&self, provider: Provider) -> Readiness {
        Readiness::ready(provider)
    }

    fn create(&self, _provider: Provider) -> Arc<dyn CliAdapter> {
        Arc::clone(&self.adapter) as Arc<dyn CliAdapter>
    }
}

pub const PLAN: &str = "# Rate limiting\n\n\
    ## Overview\nAdd a token bucket per client in front of the HTTP router.\n\n\
    ## Files\n- src/limiter.rs\n- src/router.rs\n\n\
    ## Implementation Steps\n1. Add the limiter type with refill logic.\n2. Wire it into the router middleware.\n3. Cover both with tests.\n\n\
    ## Acceptance Criteria\n- Requests over the limit get 429.\n- Existing tests keep passing.\n\n\
    ## Risks\n- Clock skew in tests.\n";

pub fn plan_answer() -> String {
    format!("Here is the plan:\n```json\n{}\n```", json!({ "plan": PLAN }))
}

pub fn subtasks_answer() -> String {
    json!({ "subtasks": [
        { "id": "1", "title": "Limiter", "description": "Add a token bucket limiter type.", "dependsOn": [] },
        { "id": "2", "title": "Router", "description": "Wire the limiter into the request router.", "dependsOn": ["1"] }
    ]})
    .to_string()
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub adapter: Arc<SimulatorAdapter>,
    pub task_id: String,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new(turns: Vec<SimulatedTurn>, config: Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::new(turns);
        let adapter = Arc::clone(&factory.adapter);
        let audit = AuditLog::new(dir.path().join("audit"));
        let registry = Arc::new(AgentRegistry::new(
            Arc::new(factory),
            config.clone(),
            Some(audit.clone()),
        ));
        let store = TaskDatabase::open_in_memory().await.unwrap();
        let task = store
            .create_task(&NewTask {
                title: "Add rate limiting".into(),
                description: "Limit requests per client.".into(),
                ..NewTask::default()
            })
            .await
            .unwrap();
        let orchestrator =
            Orchestrator::new(store, registry, audit, config.orchestrator, dir.path());
        Self {
            orchestrator,
            adapter,
            task_id: task.id,
            dir,
        }
    }

    pub async fn audit_log(&self) -> String {
        self.orchestrator.audit().read(&self.task_id).await.unwrap()
    }
}

/// Lines of an audit log that record a retry.
pub fn retry_lines(log: &str) -> Vec<&str> {
    log.lines().filter(|l| l.contains("retry")).collect()
}

pub async fn wait_for_state(manager: &AgentManager, thread_id: &str, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if manager.get_agent_status(thread_id).await.map(|s| s.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session did not reach the expected state");
}

pub fn git(dir: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git");
    assert!(output.status.success(), "git {args:?}: {output:?}");
}

/// Throwaway repository with one commit, or `None` when git is missing.
pub fn init_repo() -> Option<tempfile::TempDir> {
    which::which("git").ok()?;
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-q"]);
    std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
    git(dir.path(), &["add", "README.md"]);
    git(
        dir.path(),
        &[
            "-c",
            "user.email=dev@example.com",
            "-c",
            "user.name=dev",
            "commit",
            "-q",
            "-m",
            "init",
        ],
    );
    Some(dir)
}
