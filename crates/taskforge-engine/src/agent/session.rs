//! Agent session record and its state machine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use taskforge_core::events::{EventKind, StreamEvent};

use crate::adapter::Provider;

/// Lifecycle state of a session.
///
/// `Running` moves to exactly one of the other three; none of them has an
/// outgoing transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Completed,
    Error,
    Stopped,
}

impl SessionState {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Passed to a session's completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub thread_id: String,
    pub task_id: String,
    pub success: bool,
    /// Accumulated assistant output (output so far on failure).
    pub output: String,
    pub error: Option<String>,
}

/// One execution of one backend against one task.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSession {
    pub thread_id: String,
    pub task_id: String,
    pub provider: Provider,
    pub working_dir: PathBuf,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Adapter events in emission order; the terminal event is last.
    pub log: Vec<StreamEvent>,
    /// `validation` / `feedback` records added by the orchestrator.
    pub annotations: Vec<StreamEvent>,
    /// Assistant messages joined by newlines. Streamed deltas of one message
    /// are concatenated as they arrive.
    pub output: String,
    pub error: Option<String>,
}

impl AgentSession {
    pub fn new(thread_id: String, task_id: String, provider: Provider, working_dir: PathBuf) -> Self {
        Self {
            thread_id,
            task_id,
            provider,
            working_dir,
            state: SessionState::Running,
            started_at: Utc::now(),
            completed_at: None,
            log: Vec::new(),
            annotations: Vec::new(),
            output: String::new(),
            error: None,
        }
    }

    pub const fn is_running(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Apply one adapter event. Returns the outcome when the event ended the
    /// session. Events arriving after a terminal state are ignored.
    pub fn apply(&mut self, event: StreamEvent) -> Option<CompletionOutcome> {
        if self.state.is_terminal() {
            return None;
        }

        if let Some(text) = event.text() {
            let continues_message = event.is_delta() && self.last_assistant_was_delta();
            if !continues_message && !self.output.is_empty() {
                self.output.push('\n');
            }
            self.output.push_str(text);
        }

        let outcome = match event.kind {
            EventKind::Result => {
                if self.output.trim().is_empty() {
                    if let Some(text) = event.payload.get("text").and_then(Value::as_str) {
                        self.output = text.to_string();
                    }
                }
                Some(self.finish(SessionState::Completed, None))
            }
            EventKind::Error => {
                let message = event
                    .error_message()
                    .unwrap_or("agent failed without a message")
                    .to_string();
                Some(self.finish(SessionState::Error, Some(message)))
            }
            _ => None,
        };
        self.log.push(event);
        outcome
    }

    fn last_assistant_was_delta(&self) -> bool {
        self.log
            .iter()
            .rev()
            .find(|e| e.kind == EventKind::Assistant)
            .is_some_and(StreamEvent::is_delta)
    }

    /// Fail a running session without an adapter event (stream ended early or
    /// the consumer task died).
    pub fn fail(&mut self, message: impl Into<String>) -> Option<CompletionOutcome> {
        if self.state.is_terminal() {
            return None;
        }
        Some(self.finish(SessionState::Error, Some(message.into())))
    }

    /// Mark as stopped. Returns `false` when already terminal.
    pub fn stop(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Stopped;
        self.completed_at = Some(Utc::now());
        true
    }

    fn finish(&mut self, state: SessionState, error: Option<String>) -> CompletionOutcome {
        self.state = state;
        self.completed_at = Some(Utc::now());
        self.error.clone_from(&error);
        CompletionOutcome {
            thread_id: self.thread_id.clone(),
            task_id: self.task_id.clone(),
            success: state == SessionState::Completed,
            output: self.output.clone(),
            error,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> AgentSession {
        AgentSession::new("sim-1".into(), "task-1".into(), Provider::Simulator, "/w".into())
    }

    #[test]
    fn assistant_text_is_accumulated_and_result_completes() {
        let mut s = session();
        assert!(s.apply(StreamEvent::system("sim-1", json!({}))).is_none());
        assert!(s.apply(StreamEvent::assistant_text("sim-1", "Looking around.")).is_none());
        assert!(s.apply(StreamEvent::assistant_text("sim-1", "{\"a\":1}")).is_none());
        let outcome = s.apply(StreamEvent::result("sim-1", json!({}))).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output, "Looking around.\n{\"a\":1}");
        assert_eq!(s.state, SessionState::Completed);
        assert_eq!(s.log.last().unwrap().kind, EventKind::Result);
    }

    #[test]
    fn streamed_deltas_join_without_separators() {
        let mut s = session();
        s.apply(StreamEvent::assistant_text("sim-1", "Planning."));
        s.apply(StreamEvent::assistant_delta("sim-1", "{\"plan\":"));
        s.apply(StreamEvent::tool("sim-1", json!({ "name": "Read" })));
        s.apply(StreamEvent::assistant_delta("sim-1", "\"# P\"}"));
        s.apply(StreamEvent::assistant_text("sim-1", "Done."));
        let outcome = s.apply(StreamEvent::result("sim-1", json!({}))).unwrap();
        assert_eq!(outcome.output, "Planning.\n{\"plan\":\"# P\"}\nDone.");
    }

    #[test]
    fn result_text_fills_empty_output() {
        let mut s = session();
        let outcome = s
            .apply(StreamEvent::result("sim-1", json!({ "text": "final" })))
            .unwrap();
        assert_eq!(outcome.output, "final");
    }

    #[test]
    fn error_keeps_output_so_far() {
        let mut s = session();
        s.apply(StreamEvent::assistant_text("sim-1", "partial"));
        let outcome = s.apply(StreamEvent::error("sim-1", "crashed")).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.output, "partial");
        assert_eq!(outcome.error.as_deref(), Some("crashed"));
        assert_eq!(s.error.as_deref(), Some("crashed"));
    }

    #[test]
    fn terminal_states_have_no_exit() {
        let mut s = session();
        assert!(s.stop());
        assert!(!s.stop());
        assert!(s.apply(StreamEvent::result("sim-1", json!({}))).is_none());
        assert!(s.fail("late").is_none());
        assert_eq!(s.state, SessionState::Stopped);
        assert!(s.log.is_empty());
    }
}
