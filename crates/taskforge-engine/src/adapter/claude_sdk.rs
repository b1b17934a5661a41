//! SDK-backed Claude adapter.
//!
//! Consumes [`AgentSdk`] messages and bridges them to normalized events.
//! Tool permissions are answered inside the SDK; the adapter only reports
//! the decisions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use taskforge_core::events::{EventKind, StreamEvent};
use taskforge_core::ndjson::{ContentBlock, ControlRequestType, Message, SessionResult};
use taskforge_core::permissions::PermissionEngine;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::sdk::{AgentSdk, SdkEvent, SdkQuery};
use super::{
    AdapterConfig, AdapterError, AdapterMode, Capabilities, CliAdapter, EventSink, EventStream,
    ExecuteRequest, Provider, ThreadTable, event_channel, is_planning_prompt, prompt_with_memory,
};

/// Adapter over an in-process agent SDK.
pub struct ClaudeSdkAdapter {
    sdk: Arc<dyn AgentSdk>,
    max_concurrency: usize,
    threads: Arc<ThreadTable>,
    config: Arc<Mutex<AdapterConfig>>,
}

impl ClaudeSdkAdapter {
    pub fn new(sdk: Arc<dyn AgentSdk>, max_concurrency: usize) -> Self {
        Self {
            sdk,
            max_concurrency,
            threads: Arc::new(ThreadTable::default()),
            config: Arc::new(Mutex::new(AdapterConfig::default())),
        }
    }
}

#[async_trait]
impl CliAdapter for ClaudeSdkAdapter {
    fn provider(&self) -> Provider {
        Provider::ClaudeSdk
    }

    async fn initialize(&self, config: AdapterConfig) -> Result<(), AdapterError> {
        self.sdk.check().await?;
        info!(
            working_dir = %config.working_dir.display(),
            mode = ?config.mode,
            "Claude SDK adapter initialized"
        );
        *self.config.lock().await = config;
        Ok(())
    }

    fn execute(&self, request: ExecuteRequest) -> EventStream {
        let (sink, stream) = event_channel(request.thread_id.clone());
        let sdk = Arc::clone(&self.sdk);
        let threads = Arc::clone(&self.threads);
        let config = Arc::clone(&self.config);

        tokio::spawn(async move {
            let thread_id = request.thread_id.clone();
            let config = config.lock().await.clone();
            let working_dir = threads
                .begin(&thread_id, sink.cancellation_token(), &config.working_dir)
                .await;

            let prompt = prompt_with_memory(&request.prompt, request.context.as_ref());
            let planning = config.mode == AdapterMode::Plan || is_planning_prompt(&prompt);
            let permissions = if planning {
                PermissionEngine::planning_read_only()
            } else {
                PermissionEngine::permissive()
            };

            let resume_session = match request.resume_thread_id.as_deref() {
                Some(previous) => {
                    let session = threads.native_session(previous).await;
                    if session.is_none() {
                        warn!(thread_id = %thread_id, previous, "No backend session to resume, starting fresh");
                    }
                    session
                }
                None => None,
            };

            let query = SdkQuery {
                thread_id: thread_id.clone(),
                prompt,
                working_dir,
                resume_session,
                permissions: permissions.clone(),
                credential: config.credential,
                cancel: sink.cancellation_token(),
            };
            run(sdk, query, sink, &threads, permissions).await;
            threads.finish(&thread_id).await;
        });

        stream
    }

    async fn create_thread(&self, working_dir: &Path) -> String {
        self.threads
            .create(Provider::ClaudeSdk.thread_prefix(), working_dir)
            .await
    }

    async fn resume_thread(&self, thread_id: &str) -> bool {
        self.threads.contains(thread_id).await
    }

    async fn stop_thread(&self, thread_id: &str) {
        if self.threads.stop(thread_id).await {
            info!(thread_id, "Claude query stopped");
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_threads: true,
            modes: vec![AdapterMode::Plan, AdapterMode::Build],
            max_concurrency: self.max_concurrency,
            supports_permission_rules: true,
        }
    }
}

async fn run(
    sdk: Arc<dyn AgentSdk>,
    query: SdkQuery,
    mut sink: EventSink,
    threads: &ThreadTable,
    permissions: PermissionEngine,
) {
    let thread_id = query.thread_id.clone();
    let mut rx = match sdk.query(query).await {
        Ok(rx) => rx,
        Err(e) => {
            sink.fail(e.to_string()).await;
            return;
        }
    };
    let mut bridge = MessageBridge::new(thread_id.clone(), permissions);

    loop {
        let item = tokio::select! {
            () = sink.cancelled() => return,
            item = rx.recv() => item,
        };
        match item {
            Some(SdkEvent::Message(message)) => {
                if let Message::SystemInit(init) = &message {
                    threads.set_native_session(&thread_id, &init.session_id).await;
                }
                for event in bridge.translate(&message) {
                    if !sink.emit(event).await {
                        return;
                    }
                }
            }
            Some(SdkEvent::Exited { code, stderr }) => {
                if !sink.is_terminated() {
                    let event = StreamEvent::new(
                        EventKind::Error,
                        thread_id.clone(),
                        json!({
                            "message": exit_message(code),
                            "exit_code": code,
                            "stderr": stderr,
                        }),
                    );
                    sink.emit(event).await;
                }
                return;
            }
            // Dropping the sink reports the missing terminal event.
            None => return,
        }
    }
}

fn exit_message(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("claude exited with status {code} before finishing"),
        None => "claude was terminated before finishing".to_string(),
    }
}

/// Converts SDK messages into normalized events.
///
/// Remembers tool names by call id so tool results can be labelled.
pub(crate) struct MessageBridge {
    thread_id: String,
    permissions: PermissionEngine,
    pending_tools: HashMap<String, String>,
}

impl MessageBridge {
    pub(crate) fn new(thread_id: String, permissions: PermissionEngine) -> Self {
        Self {
            thread_id,
            permissions,
            pending_tools: HashMap::new(),
        }
    }

    pub(crate) fn translate(&mut self, message: &Message) -> Vec<StreamEvent> {
        let id = self.thread_id.clone();
        match message {
            Message::SystemInit(init) => vec![StreamEvent::system(
                id,
                json!({
                    "provider": Provider::ClaudeSdk.as_str(),
                    "session_id": init.session_id,
                    "model": init.model,
                    "cwd": init.cwd.display().to_string(),
                    "tools": init.tools,
                    "permission_profile": self.permissions.name(),
                }),
            )],
            Message::Assistant(msg) => msg
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => {
                        Some(StreamEvent::assistant_text(id.clone(), text.clone()))
                    }
                    ContentBlock::ToolUse { id: call_id, name, input } => {
                        self.pending_tools.insert(call_id.clone(), name.clone());
                        Some(StreamEvent::tool(
                            id.clone(),
                            json!({ "phase": "call", "id": call_id, "name": name, "input": input }),
                        ))
                    }
                    ContentBlock::Thinking => None,
                })
                .collect(),
            Message::User(msg) => msg
                .content
                .iter()
                .map(|result| {
                    let name = self.pending_tools.remove(&result.tool_use_id);
                    StreamEvent::tool(
                        id.clone(),
                        json!({
                            "phase": "result",
                            "id": result.tool_use_id,
                            "name": name,
                            "output": result.content,
                            "is_error": result.is_error,
                        }),
                    )
                })
                .collect(),
            Message::ControlRequest(req) => match &req.request {
                ControlRequestType::CanUseTool { tool_name, input } => {
                    let decision = self.permissions.evaluate(tool_name, input);
                    vec![StreamEvent::tool(
                        id,
                        json!({
                            "phase": "permission",
                            "name": tool_name,
                            "input": input,
                            "decision": if decision.is_allowed() { "allow" } else { "deny" },
                            "reason": decision.reason,
                        }),
                    )]
                }
                ControlRequestType::Unknown(raw) => {
                    debug!(thread_id = %id, ?raw, "Ignoring unknown control request");
                    Vec::new()
                }
            },
            Message::Result(result) => vec![result_event(id, result)],
            Message::Unknown { msg_type, .. } => {
                debug!(thread_id = %id, msg_type, "Skipping unknown message type");
                Vec::new()
            }
        }
    }
}

fn result_event(thread_id: String, result: &SessionResult) -> StreamEvent {
    if result.failed() {
        let message = result
            .result
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| format!("claude run ended with {}", result.subtype.as_str()));
        return StreamEvent::new(
            EventKind::Error,
            thread_id,
            json!({ "message": message, "subtype": result.subtype.as_str() }),
        );
    }
    StreamEvent::result(
        thread_id,
        json!({
            "text": result.result,
            "session_id": result.session_id,
            "duration_ms": result.duration_ms,
            "num_turns": result.num_turns,
            "cost_usd": result.cost_usd,
            "usage": result.usage,
        }),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use taskforge_core::ndjson::parse_line;
    use tokio::sync::mpsc;

    const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"sess-1","model":"m","cwd":"/w","tools":["Read"]}"#;
    const TEXT: &str = r##"{"type":"assistant","message":{"content":[{"type":"text","text":"{\"plan\":\"# P\"}"},{"type":"tool_use","id":"tu1","name":"Read","input":{"file_path":"a"}}]}}"##;
    const TOOL_RESULT: &str = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu1","content":"data"}]}}"#;
    const DONE: &str = r#"{"type":"result","subtype":"success","result":"ok","session_id":"sess-1","duration_ms":12,"num_turns":1}"#;

    /// Replays canned lines and records every query it receives.
    struct CannedSdk {
        lines: Vec<&'static str>,
        exit_code: Option<i32>,
        queries: std::sync::Mutex<Vec<SdkQuery>>,
    }

    impl CannedSdk {
        fn new(lines: Vec<&'static str>) -> Self {
            Self {
                lines,
                exit_code: Some(0),
                queries: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentSdk for CannedSdk {
        async fn check(&self) -> Result<(), AdapterError> {
            Ok(())
        }

        async fn query(&self, query: SdkQuery) -> Result<mpsc::Receiver<SdkEvent>, AdapterError> {
            self.queries.lock().unwrap().push(query);
            let (tx, rx) = mpsc::channel(16);
            for line in &self.lines {
                tx.send(SdkEvent::Message(parse_line(line).unwrap()))
                    .await
                    .unwrap();
            }
            tx.send(SdkEvent::Exited {
                code: self.exit_code,
                stderr: "boom".into(),
            })
            .await
            .unwrap();
            Ok(rx)
        }
    }

    async fn run_prompt(
        adapter: &ClaudeSdkAdapter,
        prompt: &str,
        resume: Option<String>,
    ) -> (String, Vec<StreamEvent>) {
        let thread_id = adapter.create_thread(Path::new("/w")).await;
        let events = adapter
            .execute(ExecuteRequest {
                thread_id: thread_id.clone(),
                prompt: prompt.into(),
                resume_thread_id: resume,
                context: None,
            })
            .collect()
            .await;
        (thread_id, events)
    }

    #[tokio::test]
    async fn full_run_is_translated_in_order() {
        let sdk = Arc::new(CannedSdk::new(vec![INIT, TEXT, TOOL_RESULT, DONE]));
        let adapter = ClaudeSdkAdapter::new(sdk, 12);
        let (thread_id, events) = run_prompt(&adapter, "go", None).await;

        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::System,
                EventKind::Assistant,
                EventKind::Tool,
                EventKind::Tool,
                EventKind::Result
            ]
        );
        assert!(events.iter().all(|e| e.thread_id == thread_id));
        assert_eq!(events[1].text(), Some(r##"{"plan":"# P"}"##));
        assert_eq!(events[3].payload["name"], "Read");
        assert_eq!(events[4].payload["text"], "ok");
    }

    #[tokio::test]
    async fn exit_without_result_is_an_error_with_stderr() {
        let mut canned = CannedSdk::new(vec![INIT]);
        canned.exit_code = Some(2);
        let adapter = ClaudeSdkAdapter::new(Arc::new(canned), 12);
        let (_, events) = run_prompt(&adapter, "go", None).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Error);
        assert_eq!(last.payload["exit_code"], 2);
        assert_eq!(last.payload["stderr"], "boom");
    }

    #[tokio::test]
    async fn planning_prompt_uses_read_only_profile_and_resume_maps_session() {
        let sdk = Arc::new(CannedSdk::new(vec![INIT, DONE]));
        let adapter = ClaudeSdkAdapter::new(Arc::clone(&sdk) as Arc<dyn AgentSdk>, 12);

        let (first, _) = run_prompt(&adapter, "[taskforge:planning]\nPlan", None).await;
        let (_, _) = run_prompt(&adapter, "again", Some(first)).await;

        let queries = sdk.queries.lock().unwrap();
        assert_eq!(queries[0].permissions.name(), "planning-read-only");
        assert!(queries[0].resume_session.is_none());
        assert_eq!(queries[1].permissions.name(), "permissive");
        assert_eq!(queries[1].resume_session.as_deref(), Some("sess-1"));
    }

    #[test]
    fn denied_permission_is_reported() {
        let mut bridge = MessageBridge::new("t".into(), PermissionEngine::planning_read_only());
        let msg = parse_line(
            r#"{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"rm -rf /"}}}"#,
        )
        .unwrap();
        let events = bridge.translate(&msg);
        assert_eq!(events[0].payload["decision"], "deny");
    }

    #[test]
    fn failed_result_becomes_error() {
        let mut bridge = MessageBridge::new("t".into(), PermissionEngine::permissive());
        let msg = parse_line(
            r#"{"type":"result","subtype":"error_max_turns","is_error":true,"session_id":"s"}"#,
        )
        .unwrap();
        let events = bridge.translate(&msg);
        assert_eq!(events[0].kind, EventKind::Error);
        assert!(events[0].error_message().unwrap().contains("error_max_turns"));
    }
}
