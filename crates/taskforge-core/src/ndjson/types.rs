//! Messages of the Claude stream-json protocol, reduced to what the
//! adapters turn into stream events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SystemInit(SystemInit),
    Assistant(AssistantMessage),
    User(UserMessage),
    ControlRequest(ControlRequest),
    Result(SessionResult),
    Unknown { msg_type: String, payload: Value },
}

/// First line of every run; carries the native session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInit {
    pub session_id: String,
    pub model: String,
    pub cwd: PathBuf,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
}

impl AssistantMessage {
    /// Text blocks joined without separators; a JSON answer may be split
    /// across blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolUse { .. } | ContentBlock::Thinking => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text { text: String },
    /// Reasoning is never surfaced.
    Thinking,
    ToolUse { id: String, name: String, input: Value },
}

/// Token counts reported with the final result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Tool results echoed back as a user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub content: Vec<ToolResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_id: String,
    pub request: ControlRequestType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequestType {
    CanUseTool { tool_name: String, input: Value },
    Unknown(Value),
}

/// Last line of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub subtype: ResultSubtype,
    pub is_error: bool,
    pub result: Option<String>,
    pub session_id: String,
    pub duration_ms: u64,
    pub num_turns: u64,
    pub cost_usd: Option<f64>,
    pub usage: Usage,
}

impl SessionResult {
    /// Failed by subtype or by the explicit flag.
    pub fn failed(&self) -> bool {
        self.is_error || self.subtype != ResultSubtype::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultSubtype {
    #[default]
    Success,
    ErrorMaxTurns,
    ErrorDuringExecution,
    Other(String),
}

impl ResultSubtype {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("success") | None => Self::Success,
            Some("error_max_turns") => Self::ErrorMaxTurns,
            Some("error_during_execution") => Self::ErrorDuringExecution,
            Some(other) => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::ErrorMaxTurns => "error_max_turns",
            Self::ErrorDuringExecution => "error_during_execution",
            Self::Other(s) => s,
        }
    }
}

impl From<Option<&str>> for ResultSubtype {
    fn from(raw: Option<&str>) -> Self {
        Self::parse(raw)
    }
}
