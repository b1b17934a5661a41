//! Deterministic simulator backend.
//!
//! Emits a fixed event sequence with small delays and no external process.
//! Tests script it turn by turn with [`SimulatorAdapter::scripted`].

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use taskforge_core::events::StreamEvent;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    AdapterConfig, AdapterError, AdapterMode, Capabilities, CliAdapter, EventSink, EventStream,
    ExecuteRequest, Provider, ThreadTable, event_channel, is_planning_prompt, prompt_with_memory,
};

/// Canned answer: valid for both the plan and the subtask contract.
const CANNED_RESPONSE: &str = r##"{
  "plan": "# Simulated implementation plan\n\n## Overview\nThis plan was produced by the TaskForge simulator so that workflows can be exercised without an external agent.\n\n## Files\n- src/lib.rs\n\n## Implementation Steps\n1. Inspect the existing code paths touched by the task.\n2. Implement the change behind a small, testable function.\n3. Add unit tests covering the new behaviour.\n\n## Acceptance Criteria\n- The new behaviour is covered by passing tests.\n- Existing tests keep passing.\n\n## Risks\n- None beyond the usual review risk.\n",
  "subtasks": [
    {"id": "1", "title": "Inspect existing code", "description": "Read the modules touched by the task and note the extension points.", "dependsOn": []},
    {"id": "2", "title": "Implement the change", "description": "Implement the behaviour described in the approved plan.", "dependsOn": ["1"]},
    {"id": "3", "title": "Add tests", "description": "Cover the new behaviour with focused unit tests.", "dependsOn": ["2"]}
  ]
}"##;

/// One scripted simulator turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedTurn {
    /// Answer with this assistant text, then `result`.
    Respond(String),
    /// Stream the answer as assistant deltas, then `result`.
    Stream(Vec<String>),
    /// End the invocation with an `error` event.
    Fail(String),
    /// Emit `system` and then wait until stopped.
    Hang,
}

impl SimulatedTurn {
    pub fn respond(text: impl Into<String>) -> Self {
        Self::Respond(text.into())
    }
}

/// In-process simulator adapter.
pub struct SimulatorAdapter {
    step_delay: Duration,
    max_concurrency: usize,
    threads: Arc<ThreadTable>,
    script: Arc<Mutex<VecDeque<SimulatedTurn>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    config: Arc<Mutex<AdapterConfig>>,
}

impl SimulatorAdapter {
    /// Simulator answering every prompt with the canned response.
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            max_concurrency: 12,
            threads: Arc::new(ThreadTable::default()),
            script: Arc::new(Mutex::new(VecDeque::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
            config: Arc::new(Mutex::new(AdapterConfig::default())),
        }
    }

    /// Simulator that plays `turns` in order, one per `execute`, then falls
    /// back to the canned response.
    pub fn scripted(turns: impl IntoIterator<Item = SimulatedTurn>) -> Self {
        let mut adapter = Self::new(Duration::ZERO);
        adapter.script = Arc::new(Mutex::new(turns.into_iter().collect()));
        adapter
    }

    #[must_use]
    pub const fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    #[must_use]
    pub const fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Prompts received so far, after memory injection.
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }

    /// The text the unscripted simulator answers with.
    pub const fn canned_response() -> &'static str {
        CANNED_RESPONSE
    }
}

#[async_trait]
impl CliAdapter for SimulatorAdapter {
    fn provider(&self) -> Provider {
        Provider::Simulator
    }

    async fn initialize(&self, config: AdapterConfig) -> Result<(), AdapterError> {
        debug!(working_dir = %config.working_dir.display(), "Simulator initialized");
        *self.config.lock().await = config;
        Ok(())
    }

    fn execute(&self, request: ExecuteRequest) -> EventStream {
        let (sink, stream) = event_channel(request.thread_id.clone());
        let threads = Arc::clone(&self.threads);
        let script = Arc::clone(&self.script);
        let prompts = Arc::clone(&self.prompts);
        let config = Arc::clone(&self.config);
        let delay = self.step_delay;

        tokio::spawn(async move {
            let thread_id = request.thread_id.clone();
            let (default_dir, mode) = {
                let config = config.lock().await;
                (config.working_dir.clone(), config.mode)
            };
            let working_dir = threads
                .begin(&thread_id, sink.cancellation_token(), &default_dir)
                .await;
            let prompt = prompt_with_memory(&request.prompt, request.context.as_ref());
            let planning = mode == AdapterMode::Plan || is_planning_prompt(&prompt);
            prompts.lock().await.push(prompt);
            let turn = script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| SimulatedTurn::respond(CANNED_RESPONSE));

            info!(thread_id = %thread_id, planning, "Simulated agent started");
            play(sink, turn, delay, &working_dir, planning).await;
            threads.finish(&thread_id).await;
        });

        stream
    }

    async fn create_thread(&self, working_dir: &Path) -> String {
        self.threads
            .create(Provider::Simulator.thread_prefix(), working_dir)
            .await
    }

    async fn resume_thread(&self, thread_id: &str) -> bool {
        self.threads.contains(thread_id).await
    }

    async fn stop_thread(&self, thread_id: &str) {
        if self.threads.stop(thread_id).await {
            debug!(thread_id, "Simulated agent stopped");
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_threads: true,
            modes: vec![AdapterMode::Plan, AdapterMode::Build],
            max_concurrency: self.max_concurrency,
            supports_permission_rules: false,
        }
    }
}

async fn pause(sink: &EventSink, delay: Duration) -> bool {
    if delay.is_zero() {
        return !sink.is_cancelled();
    }
    tokio::select! {
        () = sink.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

async fn play(
    mut sink: EventSink,
    turn: SimulatedTurn,
    delay: Duration,
    working_dir: &Path,
    planning: bool,
) {
    let thread_id = sink.thread_id().to_string();
    let init = StreamEvent::system(
        thread_id.clone(),
        json!({
            "provider": Provider::Simulator.as_str(),
            "cwd": working_dir.display().to_string(),
            "mode": if planning { "plan" } else { "build" },
        }),
    );
    if !sink.emit(init).await || !pause(&sink, delay).await {
        return;
    }

    match turn {
        SimulatedTurn::Hang => {
            sink.cancelled().await;
        }
        SimulatedTurn::Fail(message) => {
            sink.fail(message).await;
        }
        SimulatedTurn::Respond(text) => {
            let answer = vec![StreamEvent::assistant_text(thread_id.clone(), text)];
            respond(sink, answer, delay).await;
        }
        SimulatedTurn::Stream(chunks) => {
            let answer = chunks
                .into_iter()
                .map(|chunk| StreamEvent::assistant_delta(thread_id.clone(), chunk))
                .collect();
            respond(sink, answer, delay).await;
        }
    }
}

/// Tool call, the assistant events, then `result`.
async fn respond(mut sink: EventSink, answer: Vec<StreamEvent>, delay: Duration) {
    let thread_id = sink.thread_id().to_string();
    let tool = StreamEvent::tool(
        thread_id.clone(),
        json!({ "name": "Read", "input": { "path": "." }, "decision": "allow" }),
    );
    if !sink.emit(tool).await || !pause(&sink, delay).await {
        return;
    }
    for event in answer {
        if !sink.emit(event).await || !pause(&sink, delay).await {
            return;
        }
    }
    sink.emit(StreamEvent::result(
        thread_id,
        json!({
            "duration_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "simulated": true,
        }),
    ))
    .await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use taskforge_core::events::EventKind;
    use taskforge_core::validation::{validate_plan_markdown, validate_subtask_list};

    async fn run(adapter: &SimulatorAdapter, prompt: &str) -> Vec<StreamEvent> {
        let thread_id = adapter.create_thread(Path::new("/tmp")).await;
        adapter
            .execute(ExecuteRequest {
                thread_id,
                prompt: prompt.to_string(),
                ..ExecuteRequest::default()
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn canned_sequence_is_deterministic() {
        let adapter = SimulatorAdapter::new(Duration::ZERO);
        let kinds: Vec<EventKind> = run(&adapter, "go").await.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::System,
                EventKind::Tool,
                EventKind::Assistant,
                EventKind::Result
            ]
        );
    }

    #[test]
    fn canned_response_satisfies_both_contracts() {
        let value: serde_json::Value =
            serde_json::from_str(SimulatorAdapter::canned_response()).unwrap();
        assert!(validate_subtask_list(&value).valid);
        let plan = value["plan"].as_str().unwrap();
        let result = validate_plan_markdown(plan);
        assert!(result.valid, "{:?}", result.errors);
    }

    #[tokio::test]
    async fn script_is_played_in_order_then_canned() {
        let adapter = SimulatorAdapter::scripted([
            SimulatedTurn::Fail("boom".into()),
            SimulatedTurn::respond("first"),
        ]);
        let first = run(&adapter, "a").await;
        assert_eq!(first.last().unwrap().error_message(), Some("boom"));
        let second = run(&adapter, "b").await;
        assert_eq!(second[2].text(), Some("first"));
        let third = run(&adapter, "c").await;
        assert_eq!(third[2].text(), Some(CANNED_RESPONSE));
        assert_eq!(adapter.prompts().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn streamed_turn_emits_deltas() {
        let adapter = SimulatorAdapter::scripted([SimulatedTurn::Stream(vec![
            "{\"plan\":".into(),
            "\"# P\"}".into(),
        ])]);
        let events = run(&adapter, "go").await;
        let deltas: Vec<&str> = events
            .iter()
            .filter(|e| e.is_delta())
            .filter_map(StreamEvent::text)
            .collect();
        assert_eq!(deltas, vec!["{\"plan\":", "\"# P\"}"]);
        assert_eq!(events.last().unwrap().kind, EventKind::Result);
    }

    #[tokio::test]
    async fn stop_thread_ends_a_hanging_turn() {
        let adapter = SimulatorAdapter::scripted([SimulatedTurn::Hang]);
        let thread_id = adapter.create_thread(Path::new("/tmp")).await;
        let mut stream = adapter.execute(ExecuteRequest {
            thread_id: thread_id.clone(),
            prompt: "wait".into(),
            ..ExecuteRequest::default()
        });
        assert_eq!(stream.next().await.unwrap().kind, EventKind::System);
        adapter.stop_thread(&thread_id).await;
        assert!(stream.next().await.is_none());
        adapter.stop_thread(&thread_id).await;
    }
}
