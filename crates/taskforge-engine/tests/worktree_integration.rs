#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Worktree isolation against a throwaway git repository. Every test
//! returns early when git is not installed.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{Harness, init_repo, plan_answer, subtasks_answer};
use taskforge_core::config::{Config, WorktreeConfig};
use taskforge_engine::adapter::SimulatedTurn;
use taskforge_engine::storage::PlanningStatus;
use taskforge_engine::worktree::{WorktreeError, WorktreeManager, sanitize_task_id};

#[tokio::test]
async fn dirty_worktree_needs_force() {
    let Some(repo) = init_repo() else { return };
    let mgr = WorktreeManager::new(repo.path(), WorktreeConfig::default());

    let wt = mgr.create_worktree("task-7").await.unwrap();
    std::fs::write(wt.path.join("README.md"), "edited\n").unwrap();
    assert!(mgr.get_worktree_status("task-7").await.unwrap().unwrap().dirty);

    let err = mgr.delete_worktree("task-7", false).await.unwrap_err();
    assert!(matches!(err, WorktreeError::Dirty { ref path } if path == &wt.path));
    assert!(wt.path.exists());
    assert_eq!(
        std::fs::read_to_string(wt.path.join("README.md")).unwrap(),
        "edited\n"
    );

    assert!(mgr.delete_worktree("task-7", true).await.unwrap());
    assert!(!wt.path.exists());
    assert!(mgr.get_worktree_status("task-7").await.unwrap().is_none());
}

#[tokio::test]
async fn branch_and_path_are_deterministic() {
    let Some(repo) = init_repo() else { return };
    let mgr = WorktreeManager::new(repo.path(), WorktreeConfig::default());

    let name = sanitize_task_id("feature/login").unwrap();
    assert!(name.starts_with("feature-login-"));
    let expected_path = mgr.worktree_path("feature/login").await.unwrap();
    let wt = mgr.create_worktree("feature/login").await.unwrap();
    assert_eq!(wt.branch, format!("taskforge/{name}"));
    assert_eq!(wt.path, expected_path);
    assert!(expected_path.ends_with(&name));

    let other = WorktreeManager::new(repo.path(), WorktreeConfig::default());
    let listed = other.list_worktrees(Some(&HashSet::new())).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].task_id, name);
    assert_eq!(listed[0].branch, format!("taskforge/{name}"));
    assert!(listed[0].orphan);
    assert!(listed[0].disk_usage_bytes > 0);

    let report = other.cleanup_all_worktrees(false).await.unwrap();
    assert!(report.is_complete());
    assert!(!wt.path.exists());
}

#[tokio::test]
async fn orchestrator_runs_agents_in_the_task_worktree() {
    let Some(repo) = init_repo() else { return };
    let h = Harness::new(
        vec![
            SimulatedTurn::respond(plan_answer()),
            SimulatedTurn::respond(subtasks_answer()),
        ],
        Config::default(),
    )
    .await;
    let worktrees = Arc::new(WorktreeManager::new(repo.path(), WorktreeConfig::default()));
    let orchestrator = h.orchestrator.clone().with_worktrees(Arc::clone(&worktrees));

    let task = orchestrator
        .generate_plan(&h.task_id)
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    assert_eq!(task.planning_status, PlanningStatus::Ready);

    let wt = worktrees.get_worktree_status(&h.task_id).await.unwrap().unwrap();
    assert_eq!(task.working_dir.as_deref(), wt.path.to_str());
    let session = orchestrator
        .registry()
        .get_agent_session_by_thread_id(task.thread_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(session.working_dir, wt.path);
    assert!(h.audit_log().await.contains("[workspace] worktree created"));
}
