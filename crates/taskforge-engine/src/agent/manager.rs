//! Bounded agent pool bound to one adapter.
//!
//! [`AgentManager`] turns fire-and-forget adapter streams into tracked
//! [`AgentSession`]s. Capacity is a semaphore; each running session holds one
//! permit, released the moment the session reaches a terminal state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use taskforge_core::events::StreamEvent;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::session::{AgentSession, CompletionOutcome};
use crate::adapter::{CliAdapter, ContextData, EventStream, ExecuteRequest, Provider};

/// Default pool size when zero is requested.
pub const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 12;

/// Live events buffered per session for subscribers.
const SESSION_BROADCAST_CAPACITY: usize = 256;

/// Finished sessions kept for status queries; the oldest are dropped first.
pub const DEFAULT_SESSION_HISTORY: usize = 256;

/// Invoked once when a session completes or fails. Never invoked for a
/// stopped session.
pub type CompletionCallback = Box<dyn FnOnce(CompletionOutcome) + Send + 'static>;

/// Errors from the agent manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Agent pool is full (max: {max})")]
    CapacityExceeded { max: usize },

    #[error("Agent session not found: {thread_id}")]
    NotFound { thread_id: String },
}

/// Options for [`AgentManager::start_agent`].
#[derive(Default)]
pub struct StartOptions {
    /// Overrides the manager's working directory.
    pub working_dir: Option<PathBuf>,
    pub context: Option<ContextData>,
    /// Continue the backend conversation of an earlier thread.
    pub resume_thread_id: Option<String>,
    pub on_complete: Option<CompletionCallback>,
}

impl StartOptions {
    #[must_use]
    pub fn on_complete(mut self, callback: impl FnOnce(CompletionOutcome) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: ContextData) -> Self {
        self.context = Some(context);
        self
    }
}

struct SessionSlot {
    session: AgentSession,
    permit: Option<OwnedSemaphorePermit>,
    // The callback is only `Send`; the mutex makes the slot shareable.
    on_complete: Mutex<Option<CompletionCallback>>,
    events: broadcast::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl SessionSlot {
    /// Free the pool slot and hand out the callback.
    fn release(&mut self) -> Option<CompletionCallback> {
        self.permit = None;
        self.on_complete
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

type Sessions = Arc<RwLock<HashMap<String, SessionSlot>>>;

/// Bounded pool of agent sessions over one adapter.
pub struct AgentManager {
    instance_id: String,
    adapter: Arc<dyn CliAdapter>,
    provider: Provider,
    working_dir: PathBuf,
    max_concurrency: usize,
    history_limit: usize,
    semaphore: Arc<Semaphore>,
    sessions: Sessions,
}

impl AgentManager {
    /// Create a manager for an initialized adapter.
    pub fn new(adapter: Arc<dyn CliAdapter>, working_dir: PathBuf, max_concurrency: usize) -> Self {
        let limit = if max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENT_AGENTS
        } else {
            max_concurrency
        };
        let provider = adapter.provider();
        let instance_id = Uuid::new_v4().to_string();
        info!(
            instance_id = %instance_id,
            provider = %provider,
            working_dir = %working_dir.display(),
            max_concurrency = limit,
            "AgentManager created"
        );
        Self {
            instance_id,
            adapter,
            provider,
            working_dir,
            max_concurrency: limit,
            history_limit: DEFAULT_SESSION_HISTORY,
            semaphore: Arc::new(Semaphore::new(limit)),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of finished sessions kept queryable.
    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Distinguishes a replacement manager from a reused one.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub const fn provider(&self) -> Provider {
        self.provider
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Sessions currently holding a pool slot.
    pub fn active_count(&self) -> usize {
        self.max_concurrency - self.semaphore.available_permits()
    }

    /// Start an agent. Returns the thread id immediately; the stream is
    /// consumed in the background.
    pub async fn start_agent(
        &self,
        task_id: &str,
        prompt: &str,
        options: StartOptions,
    ) -> Result<String, ManagerError> {
        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| ManagerError::CapacityExceeded {
                max: self.max_concurrency,
            })?;

        let working_dir = options
            .working_dir
            .unwrap_or_else(|| self.working_dir.clone());
        let thread_id = self.adapter.create_thread(&working_dir).await;
        let stream = self.adapter.execute(ExecuteRequest {
            thread_id: thread_id.clone(),
            prompt: prompt.to_string(),
            resume_thread_id: options.resume_thread_id,
            context: options.context,
        });

        let (events, _) = broadcast::channel(SESSION_BROADCAST_CAPACITY);
        let slot = SessionSlot {
            session: AgentSession::new(
                thread_id.clone(),
                task_id.to_string(),
                self.provider,
                working_dir,
            ),
            permit: Some(permit),
            on_complete: Mutex::new(options.on_complete),
            events,
            cancel: stream.cancellation_token(),
        };
        {
            let mut map = self.sessions.write().await;
            prune_history(&mut map, self.history_limit);
            map.insert(thread_id.clone(), slot);
        }

        info!(
            thread_id = %thread_id,
            task_id,
            provider = %self.provider,
            active = self.active_count(),
            "Agent session started"
        );

        let consumer = tokio::spawn(consume(
            Arc::clone(&self.sessions),
            thread_id.clone(),
            stream,
        ));
        let sessions = Arc::clone(&self.sessions);
        let supervised = thread_id.clone();
        tokio::spawn(async move {
            if let Err(e) = consumer.await {
                error!(thread_id = %supervised, error = %e, "Agent consumer task failed");
                let finished = {
                    let mut map = sessions.write().await;
                    map.get_mut(&supervised).and_then(|slot| {
                        let outcome = slot.session.fail(format!("agent task failed: {e}"))?;
                        Some((outcome, slot.release()))
                    })
                };
                if let Some((outcome, Some(callback))) = finished {
                    callback(outcome);
                }
            }
        });

        Ok(thread_id)
    }

    /// Stop a session. The state change and freed slot are visible before
    /// this returns. Stopping a finished session is a no-op.
    pub async fn stop_agent(&self, thread_id: &str) -> Result<(), ManagerError> {
        let cancel = {
            let mut map = self.sessions.write().await;
            let slot = map.get_mut(thread_id).ok_or_else(|| ManagerError::NotFound {
                thread_id: thread_id.to_string(),
            })?;
            if !slot.session.stop() {
                debug!(thread_id, state = %slot.session.state, "Stop on finished session ignored");
                return Ok(());
            }
            // The callback is dropped: stopped sessions never report completion.
            drop(slot.release());
            slot.cancel.clone()
        };

        cancel.cancel();
        self.adapter.stop_thread(thread_id).await;
        info!(thread_id, active = self.active_count(), "Agent session stopped");
        Ok(())
    }

    /// Snapshot of a session, running or historical.
    pub async fn get_agent_status(&self, thread_id: &str) -> Option<AgentSession> {
        self.sessions
            .read()
            .await
            .get(thread_id)
            .map(|slot| slot.session.clone())
    }

    /// Snapshots of all running sessions.
    pub async fn list_active_agents(&self) -> Vec<AgentSession> {
        let map = self.sessions.read().await;
        let mut active: Vec<AgentSession> = map
            .values()
            .filter(|slot| slot.session.is_running())
            .map(|slot| slot.session.clone())
            .collect();
        active.sort_by_key(|s| s.started_at);
        active
    }

    /// Running sessions for one task.
    pub async fn get_agents_for_task(&self, task_id: &str) -> Vec<AgentSession> {
        self.list_active_agents()
            .await
            .into_iter()
            .filter(|s| s.task_id == task_id)
            .collect()
    }

    /// Live events of a running session.
    pub async fn subscribe(&self, thread_id: &str) -> Option<broadcast::Receiver<StreamEvent>> {
        self.sessions
            .read()
            .await
            .get(thread_id)
            .filter(|slot| slot.session.is_running())
            .map(|slot| slot.events.subscribe())
    }

    /// Events logged so far plus a live receiver for the rest, taken under
    /// one lock so nothing is missed or repeated. The receiver is `None`
    /// once the session has finished.
    pub async fn follow(
        &self,
        thread_id: &str,
    ) -> Option<(Vec<StreamEvent>, Option<broadcast::Receiver<StreamEvent>>)> {
        let map = self.sessions.read().await;
        let slot = map.get(thread_id)?;
        let live = slot
            .session
            .is_running()
            .then(|| slot.events.subscribe());
        Some((slot.session.log.clone(), live))
    }

    /// Record a `validation` / `feedback` event on a session. Returns `false`
    /// for unknown threads.
    pub async fn append_event(&self, thread_id: &str, event: StreamEvent) -> bool {
        let mut map = self.sessions.write().await;
        let Some(slot) = map.get_mut(thread_id) else {
            return false;
        };
        let _ = slot.events.send(event.clone());
        slot.session.annotations.push(event);
        true
    }
}

/// Drop the oldest finished sessions beyond `limit`. Running sessions are
/// never dropped.
fn prune_history(map: &mut HashMap<String, SessionSlot>, limit: usize) {
    let mut finished: Vec<_> = map
        .values()
        .filter_map(|slot| {
            let session = &slot.session;
            session
                .completed_at
                .map(|at| (at, session.thread_id.clone()))
        })
        .collect();
    if finished.len() <= limit {
        return;
    }
    finished.sort();
    let excess = finished.len() - limit;
    for (_, thread_id) in finished.into_iter().take(excess) {
        map.remove(&thread_id);
    }
    debug!(dropped = excess, "Pruned finished agent sessions");
}

/// Drain one adapter stream into its session.
async fn consume(sessions: Sessions, thread_id: String, mut stream: EventStream) {
    loop {
        let event = stream.next().await;
        let finished = {
            let mut map = sessions.write().await;
            let Some(slot) = map.get_mut(&thread_id) else {
                return;
            };
            if slot.session.state.is_terminal() {
                return;
            }
            let outcome = match event {
                Some(event) => {
                    let _ = slot.events.send(event.clone());
                    slot.session.apply(event)
                }
                None => slot
                    .session
                    .fail("agent stream ended without a terminal event"),
            };
            outcome.map(|outcome| (outcome, slot.release()))
        };

        if let Some((outcome, callback)) = finished {
            if outcome.success {
                info!(thread_id = %thread_id, output_len = outcome.output.len(), "Agent session completed");
            } else {
                warn!(thread_id = %thread_id, error = ?outcome.error, "Agent session failed");
            }
            if let Some(callback) = callback {
                callback(outcome);
            }
            return;
        }
    }
}
