//! Codex CLI adapter.
//!
//! Runs `codex exec --json` once per invocation, writes the prompt to stdin
//! and classifies the JSONL it prints on stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use taskforge_core::config::ProvidersConfig;
use taskforge_core::events::{EventKind, StreamEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::preflight::{Credential, api_key_var};
use super::process::{LineBuffer, StderrTail, collect_stderr, terminate_child};
use super::{
    AdapterConfig, AdapterError, AdapterMode, Capabilities, CliAdapter, EventSink, EventStream,
    ExecuteRequest, Provider, ThreadTable, event_channel, is_planning_prompt, prompt_with_memory,
};

/// Item types reported as tool activity.
const TOOL_ITEMS: &[&str] = &[
    "command_execution",
    "file_change",
    "mcp_tool_call",
    "web_search",
    "todo_list",
];

/// One classified stdout line.
#[derive(Debug, Default)]
pub struct CodexClassified {
    pub events: Vec<StreamEvent>,
    /// Backend session announced by `thread.started`.
    pub native_thread: Option<String>,
    /// Text of a completed agent message.
    pub agent_text: Option<String>,
}

/// Classify one line of `codex exec --json` output.
///
/// Non-JSON lines classify to nothing.
pub fn classify_codex_line(line: &str, thread_id: &str) -> CodexClassified {
    let mut out = CodexClassified::default();
    let Ok(raw) = serde_json::from_str::<Value>(line) else {
        debug!(thread_id, line, "Ignoring non-JSON codex output");
        return out;
    };
    let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default();

    match kind {
        "thread.started" => {
            let native = raw
                .get("thread_id")
                .and_then(Value::as_str)
                .map(String::from);
            out.events.push(StreamEvent::system(
                thread_id,
                json!({ "provider": Provider::CodexCli.as_str(), "session_id": native }),
            ));
            out.native_thread = native;
        }
        "turn.started" => {
            out.events
                .push(StreamEvent::system(thread_id, json!({ "phase": "turn_started" })));
        }
        "item.started" | "item.updated" | "item.completed" => {
            let phase = kind.trim_start_matches("item.");
            let item = raw.get("item").cloned().unwrap_or(Value::Null);
            classify_item(&mut out, &item, phase, thread_id);
        }
        "turn.completed" => {
            out.events.push(StreamEvent::result(
                thread_id,
                json!({ "usage": raw.get("usage").cloned().unwrap_or(Value::Null) }),
            ));
        }
        "turn.failed" => {
            let message = raw
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("codex turn failed");
            out.events.push(StreamEvent::error(thread_id, message));
        }
        "error" => {
            let message = raw
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("codex reported an error");
            out.events.push(StreamEvent::error(thread_id, message));
        }
        other => {
            debug!(thread_id, event_type = other, "Skipping codex event");
        }
    }
    out
}

fn classify_item(out: &mut CodexClassified, item: &Value, phase: &str, thread_id: &str) {
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
    match item_type {
        "agent_message" => {
            if phase == "completed" {
                let text = item
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                out.events
                    .push(StreamEvent::assistant_text(thread_id, text.clone()));
                out.agent_text = Some(text);
            }
        }
        "reasoning" => {
            if phase == "completed" {
                out.events.push(StreamEvent::system(
                    thread_id,
                    json!({ "reasoning": item.get("text").cloned().unwrap_or(Value::Null) }),
                ));
            }
        }
        "error" => {
            // Item-level errors are non-fatal warnings.
            out.events.push(StreamEvent::system(
                thread_id,
                json!({ "warning": item.get("message").cloned().unwrap_or(Value::Null) }),
            ));
        }
        t if TOOL_ITEMS.contains(&t) => {
            let mut payload = item.clone();
            if let Value::Object(map) = &mut payload {
                map.insert("name".into(), Value::String(t.to_string()));
                map.insert("phase".into(), Value::String(phase.to_string()));
            }
            out.events.push(StreamEvent::tool(thread_id, payload));
        }
        other => debug!(thread_id, item_type = other, "Skipping codex item"),
    }
}

/// Per-invocation state on top of [`classify_codex_line`].
struct CodexTurn {
    thread_id: String,
    last_message: Option<String>,
}

impl CodexTurn {
    fn accept(&mut self, line: &str) -> (Vec<StreamEvent>, Option<String>) {
        let mut classified = classify_codex_line(line, &self.thread_id);
        if let Some(text) = classified.agent_text.take() {
            self.last_message = Some(text);
        }
        for event in &mut classified.events {
            if event.kind == EventKind::Result {
                event.payload["text"] = json!(self.last_message);
            }
        }
        (classified.events, classified.native_thread)
    }
}

/// Adapter over the `codex` executable.
pub struct CodexCliAdapter {
    config: ProvidersConfig,
    max_concurrency: usize,
    threads: Arc<ThreadTable>,
    adapter_config: Arc<Mutex<AdapterConfig>>,
}

impl CodexCliAdapter {
    pub fn new(config: ProvidersConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            max_concurrency,
            threads: Arc::new(ThreadTable::default()),
            adapter_config: Arc::new(Mutex::new(AdapterConfig::default())),
        }
    }
}

/// Arguments for one `codex exec` run.
fn exec_command(
    config: &ProvidersConfig,
    working_dir: &Path,
    planning: bool,
    resume_session: Option<&str>,
    credential: Option<&Credential>,
) -> Command {
    let mut cmd = Command::new(&config.codex_bin);
    cmd.current_dir(working_dir)
        .arg("exec")
        .arg("--json")
        .arg("--skip-git-repo-check")
        .arg("--cd")
        .arg(working_dir)
        .arg("--sandbox")
        .arg(if planning { "read-only" } else { "workspace-write" });
    if let Some(ref model) = config.codex_model {
        cmd.arg("--model").arg(model);
    }
    if let Some(session) = resume_session {
        cmd.arg("resume").arg(session);
    }
    cmd.arg("-");

    if let (Some(Credential::ApiKey(key)), Some(var)) = (credential, api_key_var(Provider::CodexCli))
    {
        cmd.env(var, key);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

#[async_trait]
impl CliAdapter for CodexCliAdapter {
    fn provider(&self) -> Provider {
        Provider::CodexCli
    }

    async fn initialize(&self, config: AdapterConfig) -> Result<(), AdapterError> {
        which::which(&self.config.codex_bin).map_err(|_| AdapterError::NotReady {
            provider: Provider::CodexCli,
            instructions: vec![format!(
                "Install the `{}` executable and make sure it is on PATH",
                self.config.codex_bin
            )],
        })?;
        info!(working_dir = %config.working_dir.display(), "Codex CLI adapter initialized");
        *self.adapter_config.lock().await = config;
        Ok(())
    }

    fn execute(&self, request: ExecuteRequest) -> EventStream {
        let (sink, stream) = event_channel(request.thread_id.clone());
        let providers = self.config.clone();
        let threads = Arc::clone(&self.threads);
        let adapter_config = Arc::clone(&self.adapter_config);

        tokio::spawn(async move {
            let thread_id = request.thread_id.clone();
            let config = adapter_config.lock().await.clone();
            let working_dir = threads
                .begin(&thread_id, sink.cancellation_token(), &config.working_dir)
                .await;
            let prompt = prompt_with_memory(&request.prompt, request.context.as_ref());
            let planning = config.mode == AdapterMode::Plan || is_planning_prompt(&prompt);
            let resume_session = match request.resume_thread_id.as_deref() {
                Some(previous) => threads.native_session(previous).await,
                None => None,
            };

            let run = CodexRun {
                providers: &providers,
                working_dir,
                planning,
                resume_session,
                credential: config.credential,
            };
            run.drive(sink, &threads, prompt).await;
            threads.finish(&thread_id).await;
        });

        stream
    }

    async fn create_thread(&self, working_dir: &Path) -> String {
        self.threads
            .create(Provider::CodexCli.thread_prefix(), working_dir)
            .await
    }

    async fn resume_thread(&self, thread_id: &str) -> bool {
        self.threads.contains(thread_id).await
    }

    async fn stop_thread(&self, thread_id: &str) {
        if self.threads.stop(thread_id).await {
            info!(thread_id, "Codex run stopped");
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

struct CodexRun<'a> {
    providers: &'a ProvidersConfig,
    working_dir: PathBuf,
    planning: bool,
    resume_session: Option<String>,
    credential: Option<Credential>,
}

impl CodexRun<'_> {
    async fn drive(self, mut sink: EventSink, threads: &ThreadTable, prompt: String) {
        let thread_id = sink.thread_id().to_string();
        let grace = Duration::from_secs(self.providers.terminate_timeout_secs);
        info!(
            thread_id = %thread_id,
            working_dir = %self.working_dir.display(),
            planning = self.planning,
            resume_session = ?self.resume_session,
            "Spawning codex subprocess"
        );

        let mut child = match exec_command(
            self.providers,
            &self.working_dir,
            self.planning,
            self.resume_session.as_deref(),
            self.credential.as_ref(),
        )
        .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let err = AdapterError::SpawnFailed {
                    provider: Provider::CodexCli,
                    reason: e.to_string(),
                };
                sink.fail(err.to_string()).await;
                return;
            }
        };

        let tail = child
            .stderr
            .take()
            .map(|stderr| collect_stderr(stderr, thread_id.clone()));
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(thread_id = %thread_id, error = %e, "Failed to write prompt to codex");
            }
            // Dropping stdin signals end of prompt.
        }
        let Some(mut stdout) = child.stdout.take() else {
            sink.fail("Failed to capture codex stdout").await;
            terminate_child(&mut child, grace, &thread_id).await;
            return;
        };

        let mut turn = CodexTurn {
            thread_id: thread_id.clone(),
            last_message: None,
        };
        let mut buffer = LineBuffer::new();
        let mut chunk = vec![0_u8; 8192];

        'read: loop {
            let read = tokio::select! {
                () = sink.cancelled() => {
                    debug!(thread_id = %thread_id, "Codex run cancelled");
                    terminate_child(&mut child, grace, &thread_id).await;
                    return;
                }
                read = stdout.read(&mut chunk) => read,
            };
            let lines = match read {
                Ok(0) => buffer.finish().into_iter().collect(),
                Ok(n) => buffer.push(&chunk[..n]),
                Err(e) => {
                    warn!(thread_id = %thread_id, error = %e, "codex stdout read failed");
                    buffer.clear();
                    break;
                }
            };
            let eof = matches!(read, Ok(0));

            for line in lines {
                let (events, native) = turn.accept(&line);
                if let Some(native) = native {
                    threads.set_native_session(&thread_id, &native).await;
                }
                for mut event in events {
                    if event.kind == EventKind::Error {
                        attach_stderr(&mut event, tail.as_ref()).await;
                    }
                    if !sink.emit(event).await {
                        break 'read;
                    }
                }
            }
            if eof {
                break;
            }
        }

        let code = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => {
                terminate_child(&mut child, grace, &thread_id).await;
                None
            }
        };
        info!(thread_id = %thread_id, ?code, "codex subprocess exited");

        if !sink.is_terminated() && !sink.is_cancelled() {
            let stderr = match &tail {
                Some(tail) => tail.lock().await.render(),
                None => String::new(),
            };
            let message = match code {
                Some(code) => format!("codex exited with status {code} before finishing"),
                None => "codex was terminated before finishing".to_string(),
            };
            sink.emit(StreamEvent::new(
                EventKind::Error,
                thread_id,
                json!({ "message": message, "exit_code": code, "stderr": stderr }),
            ))
            .await;
        }
    }
}

async fn attach_stderr(event: &mut StreamEvent, tail: Option<&Arc<Mutex<StderrTail>>>) {
    let Some(tail) = tail else {
        return;
    };
    let tail = tail.lock().await;
    if !tail.is_empty() {
        event.payload["stderr"] = Value::String(tail.render());
    }
}
