//! Agent SDK seam.
//!
//! [`AgentSdk`] yields parsed Claude stream-json messages for one query and
//! answers tool-permission requests in-process. [`ClaudeProcessSdk`] is the
//! shipped implementation: it drives the `claude` executable over the
//! bidirectional stream-json control protocol, the same transport the
//! official agent SDKs wrap.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use taskforge_core::config::ProvidersConfig;
use taskforge_core::ndjson::{ControlRequestType, Message, parse_line};
use taskforge_core::permissions::{PermissionDecision, PermissionEngine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::preflight::{Credential, api_key_var};
use super::process::{collect_stderr, terminate_child};
use super::{AdapterError, Provider};

/// One SDK query.
#[derive(Debug, Clone)]
pub struct SdkQuery {
    /// Taskforge thread id, for logging.
    pub thread_id: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Backend session to continue.
    pub resume_session: Option<String>,
    /// Profile answering `can_use_tool` requests.
    pub permissions: PermissionEngine,
    pub credential: Option<Credential>,
    /// Cancelled when the consumer abandons the query.
    pub cancel: CancellationToken,
}

/// Item delivered by a running query.
#[derive(Debug, Clone)]
pub enum SdkEvent {
    Message(Message),
    /// The agent process ended. Always the last item.
    Exited { code: Option<i32>, stderr: String },
}

/// In-process agent SDK.
#[async_trait]
pub trait AgentSdk: Send + Sync {
    /// Cheap readiness check run by `initialize`.
    async fn check(&self) -> Result<(), AdapterError>;

    /// Start a query; messages arrive on the returned receiver.
    async fn query(&self, query: SdkQuery) -> Result<mpsc::Receiver<SdkEvent>, AdapterError>;
}

/// [`AgentSdk`] backed by the `claude` executable.
#[derive(Debug, Clone)]
pub struct ClaudeProcessSdk {
    config: ProvidersConfig,
}

impl ClaudeProcessSdk {
    pub const fn new(config: ProvidersConfig) -> Self {
        Self { config }
    }

    fn command(&self, query: &SdkQuery) -> Command {
        let mut cmd = Command::new(&self.config.claude_bin);
        cmd.current_dir(&query.working_dir)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--permission-prompt-tool")
            .arg("stdio")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref model) = self.config.claude_model {
            cmd.arg("--model").arg(model);
        }
        if let Some(ref session) = query.resume_session {
            cmd.arg("--resume").arg(session);
        }
        let disallowed = query.permissions.disallowed_tools();
        if !disallowed.is_empty() {
            cmd.arg("--disallowedTools").arg(disallowed.join(","));
        }
        if let Some(Credential::ApiKey(key)) = &query.credential {
            if let Some(var) = api_key_var(Provider::ClaudeSdk) {
                cmd.env(var, key);
            }
        }
        cmd
    }
}

#[async_trait]
impl AgentSdk for ClaudeProcessSdk {
    async fn check(&self) -> Result<(), AdapterError> {
        which::which(&self.config.claude_bin).map_err(|_| AdapterError::NotReady {
            provider: Provider::ClaudeSdk,
            instructions: vec![format!(
                "Install the `{}` executable and make sure it is on PATH",
                self.config.claude_bin
            )],
        })?;
        Ok(())
    }

    async fn query(&self, query: SdkQuery) -> Result<mpsc::Receiver<SdkEvent>, AdapterError> {
        let spawn_failed = |reason: String| AdapterError::SpawnFailed {
            provider: Provider::ClaudeSdk,
            reason,
        };

        info!(
            thread_id = %query.thread_id,
            working_dir = %query.working_dir.display(),
            resume_session = ?query.resume_session,
            profile = query.permissions.name(),
            "Spawning claude subprocess"
        );
        let mut child = self
            .command(&query)
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("Failed to capture stdout".to_string()))?;
        let tail = child
            .stderr
            .take()
            .map(|stderr| collect_stderr(stderr, query.thread_id.clone()));

        write_line(&mut stdin, &user_message_line(&query.prompt))
            .await
            .map_err(|e| spawn_failed(format!("Failed to write prompt: {e}")))?;

        let grace = Duration::from_secs(self.config.terminate_timeout_secs);
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let thread_id = query.thread_id;
            let mut stdin = Some(stdin);
            let mut lines = BufReader::new(stdout).lines();

            loop {
                let line = tokio::select! {
                    () = query.cancel.cancelled() => {
                        debug!(thread_id = %thread_id, "Query cancelled, terminating claude");
                        terminate_child(&mut child, grace, &thread_id).await;
                        return;
                    }
                    line = lines.next_line() => line,
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(thread_id = %thread_id, error = %e, "stdout read failed");
                        break;
                    }
                };
                let message = match parse_line(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(thread_id = %thread_id, error = %e, "Skipping unparseable line");
                        continue;
                    }
                };

                if let (Message::ControlRequest(request), Some(pipe)) = (&message, stdin.as_mut())
                {
                    let reply = control_reply(&request.request_id, &request.request, &query.permissions);
                    if let Err(e) = write_line(pipe, &reply).await {
                        warn!(thread_id = %thread_id, error = %e, "Failed to answer control request");
                    }
                }

                let finished = matches!(message, Message::Result(_));
                if tx.send(SdkEvent::Message(message)).await.is_err() {
                    terminate_child(&mut child, grace, &thread_id).await;
                    return;
                }
                if finished {
                    // Closing stdin ends the stream-json session.
                    stdin = None;
                }
            }

            drop(stdin);
            let code = match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                _ => {
                    terminate_child(&mut child, grace, &thread_id).await;
                    None
                }
            };
            let stderr = match tail {
                Some(tail) => tail.lock().await.render(),
                None => String::new(),
            };
            info!(thread_id = %thread_id, ?code, "claude subprocess exited");
            let _ = tx.send(SdkEvent::Exited { code, stderr }).await;
        });

        Ok(rx)
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Stream-json user message carrying the prompt.
pub(crate) fn user_message_line(prompt: &str) -> String {
    json!({
        "type": "user",
        "message": { "role": "user", "content": prompt },
        "session_id": "default",
        "parent_tool_use_id": null,
    })
    .to_string()
}

/// Answer to a control request.
///
/// Allow must echo the original input as `updatedInput`; an empty object
/// would replace the tool arguments.
pub(crate) fn control_reply(
    request_id: &str,
    request: &ControlRequestType,
    permissions: &PermissionEngine,
) -> String {
    let ControlRequestType::CanUseTool { tool_name, input } = request else {
        return json!({
            "type": "control_response",
            "response": {
                "subtype": "error",
                "request_id": request_id,
                "error": "unsupported control request",
            }
        })
        .to_string();
    };

    let decision = permissions.evaluate(tool_name, input);
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": permission_body(&decision, input),
        }
    })
    .to_string()
}

fn permission_body(decision: &PermissionDecision, input: &Value) -> Value {
    if decision.is_allowed() {
        json!({ "behavior": "allow", "updatedInput": input })
    } else {
        json!({ "behavior": "deny", "message": decision.reason, "interrupt": false })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn can_use(tool: &str) -> ControlRequestType {
        ControlRequestType::CanUseTool {
            tool_name: tool.to_string(),
            input: json!({ "file_path": "/x" }),
        }
    }

    #[test]
    fn allow_echoes_original_input() {
        let reply = control_reply("req_1", &can_use("Read"), &PermissionEngine::planning_read_only());
        let v: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["type"], "control_response");
        assert_eq!(v["response"]["request_id"], "req_1");
        assert_eq!(v["response"]["response"]["behavior"], "allow");
        assert_eq!(v["response"]["response"]["updatedInput"]["file_path"], "/x");
    }

    #[test]
    fn planning_denies_writes_without_interrupting() {
        let reply = control_reply("req_2", &can_use("Write"), &PermissionEngine::planning_read_only());
        let v: Value = serde_json::from_str(&reply).unwrap();
        let body = &v["response"]["response"];
        assert_eq!(body["behavior"], "deny");
        assert_eq!(body["interrupt"], false);
        assert!(body["message"].as_str().unwrap().contains("read-only"));
    }

    #[test]
    fn planning_allows_writing_the_plan_answer_file() {
        let request = ControlRequestType::CanUseTool {
            tool_name: "Write".into(),
            input: json!({ "file_path": "/work/.taskforge-plan.json", "content": "{}" }),
        };
        let reply = control_reply("req_4", &request, &PermissionEngine::planning_read_only());
        let v: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["response"]["response"]["behavior"], "allow");
    }

    #[test]
    fn unknown_control_requests_get_an_error_reply() {
        let reply = control_reply(
            "req_3",
            &ControlRequestType::Unknown(json!({ "subtype": "interrupt" })),
            &PermissionEngine::permissive(),
        );
        let v: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["response"]["subtype"], "error");
    }

    #[test]
    fn user_message_shape() {
        let v: Value = serde_json::from_str(&user_message_line("hello")).unwrap();
        assert_eq!(v["type"], "user");
        assert_eq!(v["message"]["content"], "hello");
        assert!(v["parent_tool_use_id"].is_null());
    }

    #[test]
    fn planning_query_disallows_mutating_tools_on_the_command_line() {
        let sdk = ClaudeProcessSdk::new(ProvidersConfig::default());
        let query = SdkQuery {
            thread_id: "claude-1".into(),
            prompt: "p".into(),
            working_dir: PathBuf::from("/tmp"),
            resume_session: Some("abc".into()),
            permissions: PermissionEngine::planning_read_only(),
            credential: None,
            cancel: CancellationToken::new(),
        };
        let cmd = sdk.command(&query);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let resume = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume + 1], "abc");
        let disallowed = args.iter().position(|a| a == "--disallowedTools").unwrap();
        let denied: Vec<&str> = args[disallowed + 1].split(',').collect();
        assert!(denied.contains(&"Edit"));
        assert!(denied.contains(&"Bash"));
        // Write is decided per request so the answer files stay writable.
        assert!(!denied.contains(&"Write"));
    }
}
