//! CLI adapter protocol.
//!
//! Every agent backend implements [`CliAdapter`] and reduces its output to
//! normalized [`StreamEvent`]s delivered through an [`EventStream`]. A stream
//! always ends with exactly one terminal event (`result` or `error`) unless
//! the consumer abandons it first; abandoning (dropping or cancelling) the
//! stream signals the producer to release its subprocess.

mod claude_sdk;
mod codex_cli;
pub mod preflight;
pub mod process;
mod provider;
pub mod sdk;
mod simulator;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taskforge_core::config::Config;
use taskforge_core::events::StreamEvent;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

pub use claude_sdk::ClaudeSdkAdapter;
pub use codex_cli::{CodexCliAdapter, classify_codex_line};
pub use preflight::{Credential, Readiness};
pub use provider::Provider;
pub use sdk::{AgentSdk, ClaudeProcessSdk, SdkEvent, SdkQuery};
pub use simulator::{SimulatedTurn, SimulatorAdapter};

/// First line of every planning prompt. Adapters switch to the read-only
/// profile when they see it.
pub const PLANNING_PROMPT_MARKER: &str = "[taskforge:planning]";

/// Events buffered between an adapter task and its consumer.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Whether a prompt opens with the planning marker.
pub fn is_planning_prompt(prompt: &str) -> bool {
    prompt
        .lines()
        .find(|l| !l.trim().is_empty())
        .is_some_and(|l| l.trim() == PLANNING_PROMPT_MARKER)
}

/// Errors from adapter setup. Runtime faults are events, not errors.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("{provider} is not ready: {}", join_lines(.instructions))]
    NotReady {
        provider: Provider,
        instructions: Vec<String>,
    },

    #[error("Failed to start {provider} agent: {reason}")]
    SpawnFailed { provider: Provider, reason: String },
}

fn join_lines(lines: &[String]) -> String {
    lines.join("; ")
}

/// Adapter operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    /// Read-only planning.
    Plan,
    /// Normal implementation work.
    #[default]
    Build,
}

/// Passed once to [`CliAdapter::initialize`].
#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    pub credential: Option<Credential>,
    pub working_dir: PathBuf,
    pub mode: AdapterMode,
}

/// Project memory injected ahead of a prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextData {
    #[serde(default)]
    pub learned_patterns: Vec<String>,
    #[serde(default)]
    pub known_issues: Vec<String>,
    #[serde(default)]
    pub recent_history: Vec<String>,
}

impl ContextData {
    pub fn is_empty(&self) -> bool {
        self.learned_patterns.is_empty()
            && self.known_issues.is_empty()
            && self.recent_history.is_empty()
    }

    /// Markdown `## Project Memory` section, or `None` when empty.
    pub fn render(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut out = String::from("## Project Memory\n");
        for (heading, items) in [
            ("Learned patterns", &self.learned_patterns),
            ("Known issues", &self.known_issues),
            ("Recent history", &self.recent_history),
        ] {
            if items.is_empty() {
                continue;
            }
            out.push_str("\n### ");
            out.push_str(heading);
            out.push('\n');
            for item in items {
                out.push_str("- ");
                out.push_str(item);
                out.push('\n');
            }
        }
        Some(out)
    }
}

/// Prefix `prompt` with rendered memory, keeping a planning marker first.
pub fn prompt_with_memory(prompt: &str, context: Option<&ContextData>) -> String {
    let Some(memory) = context.and_then(ContextData::render) else {
        return prompt.to_string();
    };
    if is_planning_prompt(prompt) {
        let body = prompt
            .trim_start()
            .strip_prefix(PLANNING_PROMPT_MARKER)
            .unwrap_or(prompt);
        format!("{PLANNING_PROMPT_MARKER}\n{memory}\n---\n{}", body.trim_start())
    } else {
        format!("{memory}\n---\n{prompt}")
    }
}

/// One `execute` call.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    /// Thread issued by [`CliAdapter::create_thread`]; every event carries it.
    pub thread_id: String,
    pub prompt: String,
    /// Continue the backend conversation of an earlier thread.
    pub resume_thread_id: Option<String>,
    pub context: Option<ContextData>,
}

/// Static adapter descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub supports_threads: bool,
    pub modes: Vec<AdapterMode>,
    pub max_concurrency: usize,
    pub supports_permission_rules: bool,
}

/// Uniform contract over one agent backend.
#[async_trait]
pub trait CliAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Prepare the backend. Fails with [`AdapterError::NotReady`] when a
    /// required binary or credential is missing.
    async fn initialize(&self, config: AdapterConfig) -> Result<(), AdapterError>;

    /// Start an invocation. Never fails: faults arrive as a terminal `error`.
    fn execute(&self, request: ExecuteRequest) -> EventStream;

    /// Allocate a thread id bound to `working_dir`. No backend call.
    async fn create_thread(&self, working_dir: &Path) -> String;

    /// Resumption marker; returns whether the thread is known. Actual
    /// resumption happens by passing the id as `resume_thread_id`.
    async fn resume_thread(&self, thread_id: &str) -> bool;

    /// Best-effort cancellation. A no-op for finished or unknown threads.
    async fn stop_thread(&self, thread_id: &str);

    fn capabilities(&self) -> Capabilities;
}

/// Create a connected sink/stream pair for one invocation.
pub fn event_channel(thread_id: impl Into<String>) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let sink = EventSink {
        thread_id: thread_id.into(),
        tx,
        cancel: cancel.clone(),
        terminated: false,
    };
    (sink, EventStream { rx, cancel })
}

/// Consumer side of an invocation.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl EventStream {
    /// Next event, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Abandon the invocation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain until the terminal event (test and CLI helper).
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Producer side of an invocation. Enforces the single-terminal rule.
#[derive(Debug)]
pub struct EventSink {
    thread_id: String,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    terminated: bool,
}

impl EventSink {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Deliver an event. Returns `false` once nothing more should be
    /// produced: after a terminal event, or when the consumer is gone.
    pub async fn emit(&mut self, event: StreamEvent) -> bool {
        if self.terminated || self.cancel.is_cancelled() {
            return false;
        }
        let terminal = event.is_terminal();
        if self.tx.send(event).await.is_err() {
            self.cancel.cancel();
            return false;
        }
        if terminal {
            self.terminated = true;
        }
        !terminal
    }

    /// Emit a terminal error event for this thread.
    pub async fn fail(&mut self, message: impl Into<String>) {
        let event = StreamEvent::error(self.thread_id.clone(), message);
        self.emit(event).await;
    }

    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the consumer abandons the stream or the thread is stopped.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        if !self.terminated && !self.cancel.is_cancelled() {
            let _ = self.tx.try_send(StreamEvent::error(
                self.thread_id.clone(),
                "adapter stopped without a terminal event",
            ));
        }
    }
}

#[derive(Debug)]
struct ThreadEntry {
    working_dir: PathBuf,
    native_session: Option<String>,
    running: Option<CancellationToken>,
}

/// Thread bookkeeping shared by the adapters.
#[derive(Debug, Default)]
pub(crate) struct ThreadTable {
    inner: RwLock<HashMap<String, ThreadEntry>>,
}

impl ThreadTable {
    pub(crate) async fn create(&self, prefix: &str, working_dir: &Path) -> String {
        let id = process::new_thread_id(prefix);
        self.inner.write().await.insert(
            id.clone(),
            ThreadEntry {
                working_dir: working_dir.to_path_buf(),
                native_session: None,
                running: None,
            },
        );
        id
    }

    pub(crate) async fn contains(&self, thread_id: &str) -> bool {
        self.inner.read().await.contains_key(thread_id)
    }

    /// Mark a thread as executing; unknown threads are registered on the fly.
    /// Returns the thread's working directory.
    pub(crate) async fn begin(
        &self,
        thread_id: &str,
        token: CancellationToken,
        fallback_dir: &Path,
    ) -> PathBuf {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadEntry {
                working_dir: fallback_dir.to_path_buf(),
                native_session: None,
                running: None,
            });
        entry.running = Some(token);
        entry.working_dir.clone()
    }

    pub(crate) async fn finish(&self, thread_id: &str) {
        if let Some(entry) = self.inner.write().await.get_mut(thread_id) {
            entry.running = None;
        }
    }

    pub(crate) async fn native_session(&self, thread_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .get(thread_id)
            .and_then(|e| e.native_session.clone())
    }

    pub(crate) async fn set_native_session(&self, thread_id: &str, session: &str) {
        if let Some(entry) = self.inner.write().await.get_mut(thread_id) {
            entry.native_session = Some(session.to_string());
        }
    }

    /// Cancel the running invocation, if any. Returns whether one was running.
    pub(crate) async fn stop(&self, thread_id: &str) -> bool {
        let token = self
            .inner
            .write()
            .await
            .get_mut(thread_id)
            .and_then(|e| e.running.take());
        token.is_some_and(|t| {
            t.cancel();
            true
        })
    }
}

/// Builds adapters for the registry. Tests inject their own.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Credential/binary readiness for `provider`.
    async fn preflight(&self, provider: Provider) -> Readiness;

    fn create(&self, provider: Provider) -> Arc<dyn CliAdapter>;
}

/// Factory for the real backends.
#[derive(Debug, Clone)]
pub struct DefaultAdapterFactory {
    config: Config,
}

impl DefaultAdapterFactory {
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AdapterFactory for DefaultAdapterFactory {
    async fn preflight(&self, provider: Provider) -> Readiness {
        preflight::preflight(provider, &self.config.providers).await
    }

    fn create(&self, provider: Provider) -> Arc<dyn CliAdapter> {
        let max = self.config.orchestrator.max_concurrent_agents;
        match provider {
            Provider::Simulator => Arc::new(
                SimulatorAdapter::new(Duration::from_millis(self.config.simulator.step_delay_ms))
                    .with_max_concurrency(max),
            ),
            Provider::ClaudeSdk => {
                let sdk = Arc::new(ClaudeProcessSdk::new(self.config.providers.clone()));
                Arc::new(ClaudeSdkAdapter::new(sdk, max))
            }
            Provider::CodexCli => {
                Arc::new(CodexCliAdapter::new(self.config.providers.clone(), max))
            }
        }
    }
}
