#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Agent pool and registry behaviour across managers.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{ScriptedFactory, wait_for_state};
use taskforge_core::config::Config;
use taskforge_engine::adapter::{Provider, SimulatedTurn};
use taskforge_engine::agent::{
    AgentRegistry, ManagerError, RegistryError, SessionState, StartOptions,
};

fn registry(turns: Vec<SimulatedTurn>) -> AgentRegistry {
    AgentRegistry::new(
        Arc::new(ScriptedFactory::new(turns)),
        Config::default(),
        None,
    )
}

#[tokio::test]
async fn working_dir_change_replaces_the_manager() {
    let r = registry(vec![SimulatedTurn::Hang, SimulatedTurn::Hang]);

    let first = r
        .start_agent_for_task("task-1", None, Path::new("/repo"), "one", StartOptions::default())
        .await
        .unwrap();
    let old = r.manager_for_thread(&first).await.unwrap();
    assert_eq!(old.provider(), Provider::Simulator);

    let second = r
        .start_agent_for_task(
            "task-1",
            None,
            Path::new("/repo/.taskforge/worktrees/task-1"),
            "two",
            StartOptions::default(),
        )
        .await
        .unwrap();
    let new = r.manager_for_thread(&second).await.unwrap();
    assert_ne!(old.instance_id(), new.instance_id());

    let old_session = r.get_agent_session_by_thread_id(&first).await.unwrap();
    assert_eq!(old_session.state, SessionState::Running);
    assert_eq!(old_session.working_dir, Path::new("/repo"));
    assert!(new.get_agent_status(&first).await.is_none());
    assert_eq!(r.list_active_agents().await.len(), 2);

    assert!(r.stop_agent_by_thread_id(&first).await);
    assert_eq!(
        r.get_agent_session_by_thread_id(&first).await.unwrap().state,
        SessionState::Stopped
    );
    assert_eq!(
        r.get_agent_session_by_thread_id(&second).await.unwrap().state,
        SessionState::Running
    );
    assert!(r.stop_agent_by_thread_id(&second).await);
}

#[tokio::test]
async fn thirteenth_concurrent_start_is_rejected() {
    let r = registry(vec![SimulatedTurn::Hang; 13]);
    let dir = Path::new("/repo");

    let mut threads = Vec::new();
    for i in 0..12 {
        threads.push(
            r.start_agent_for_task("task-1", None, dir, &format!("job {i}"), StartOptions::default())
                .await
                .unwrap(),
        );
    }
    let manager = r.manager_for_task("task-1", None, dir).await.unwrap();
    assert_eq!(manager.active_count(), 12);

    let err = r
        .start_agent_for_task("task-1", None, dir, "one too many", StartOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        RegistryError::Manager(ManagerError::CapacityExceeded { max: 12 })
    ));
    assert_eq!(manager.active_count(), 12);
    assert_eq!(r.list_active_agents().await.len(), 12);

    // Stopping frees a slot immediately.
    assert!(r.stop_agent_by_thread_id(&threads[0]).await);
    assert_eq!(manager.active_count(), 11);
    let replacement = r
        .start_agent_for_task("task-1", None, dir, "replacement", StartOptions::default())
        .await
        .unwrap();
    assert_eq!(manager.active_count(), 12);

    for thread in threads.iter().skip(1).chain([&replacement]) {
        assert!(r.stop_agent_by_thread_id(thread).await);
    }
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn double_stop_is_benign() {
    let r = registry(vec![SimulatedTurn::Hang]);
    let thread = r
        .start_agent_for_task("task-1", None, Path::new("/repo"), "hang", StartOptions::default())
        .await
        .unwrap();
    let manager = r.manager_for_thread(&thread).await.unwrap();

    assert!(r.stop_agent_by_thread_id(&thread).await);
    assert!(r.stop_agent_by_thread_id(&thread).await);
    assert!(manager.stop_agent(&thread).await.is_ok());
    assert_eq!(manager.active_count(), 0);
    wait_for_state(&manager, &thread, SessionState::Stopped).await;

    assert!(!r.stop_agent_by_thread_id("sim-1-00000000").await);
    assert!(r.get_agent_session_by_thread_id("sim-1-00000000").await.is_none());
}

#[tokio::test]
async fn completed_session_frees_its_slot_and_stays_queryable() {
    let r = registry(vec![SimulatedTurn::respond("{\"ok\": true}")]);
    let (tx, rx) = tokio::sync::oneshot::channel();
    let thread = r
        .start_agent_for_task(
            "task-1",
            None,
            Path::new("/repo"),
            "go",
            StartOptions::default().on_complete(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )
        .await
        .unwrap();

    let outcome = rx.await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.output, "{\"ok\": true}");

    let manager = r.manager_for_thread(&thread).await.unwrap();
    assert_eq!(manager.active_count(), 0);
    let session = r.get_agent_session_by_thread_id(&thread).await.unwrap();
    assert_eq!(session.state, SessionState::Completed);
    assert!(session.completed_at.is_some());
    assert!(r.stop_agent_by_thread_id(&thread).await);
    assert_eq!(
        r.get_agent_session_by_thread_id(&thread).await.unwrap().state,
        SessionState::Completed
    );
}
