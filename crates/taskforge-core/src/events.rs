//! Normalized stream events.
//!
//! Every adapter, whatever its backend, reduces its output to this one
//! taxonomy. Consumers (session logs, streaming endpoints, the generation
//! loop) never look at backend-specific shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Kind of a normalized stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    System,
    Assistant,
    Tool,
    Result,
    Error,
    Validation,
    Feedback,
}

impl EventKind {
    /// `result` and `error` end an invocation; nothing follows them.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Result | Self::Error)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Result => "result",
            Self::Error => "error",
            Self::Validation => "validation",
            Self::Feedback => "feedback",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized unit of adapter output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub thread_id: String,
}

impl StreamEvent {
    pub fn new(kind: EventKind, thread_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload,
            thread_id: thread_id.into(),
        }
    }

    pub fn system(thread_id: impl Into<String>, payload: Value) -> Self {
        Self::new(EventKind::System, thread_id, payload)
    }

    /// Assistant text. The text is what the generation loop later recovers
    /// JSON from.
    pub fn assistant_text(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            EventKind::Assistant,
            thread_id,
            json!({ "text": text.into() }),
        )
    }

    /// A fragment of an assistant message still being streamed. Consecutive
    /// deltas concatenate into one message.
    pub fn assistant_delta(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            EventKind::Assistant,
            thread_id,
            json!({ "text": text.into(), "delta": true }),
        )
    }

    pub fn tool(thread_id: impl Into<String>, payload: Value) -> Self {
        Self::new(EventKind::Tool, thread_id, payload)
    }

    pub fn result(thread_id: impl Into<String>, payload: Value) -> Self {
        Self::new(EventKind::Result, thread_id, payload)
    }

    pub fn error(thread_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            EventKind::Error,
            thread_id,
            json!({ "message": message.into() }),
        )
    }

    pub const fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Text carried by an assistant event, if any.
    pub fn text(&self) -> Option<&str> {
        if self.kind != EventKind::Assistant {
            return None;
        }
        self.payload.get("text").and_then(Value::as_str)
    }

    /// Whether this is a streamed fragment rather than a whole message.
    pub fn is_delta(&self) -> bool {
        self.kind == EventKind::Assistant
            && self.payload.get("delta").and_then(Value::as_bool) == Some(true)
    }

    /// Error message carried by an error event, if any.
    pub fn error_message(&self) -> Option<&str> {
        if self.kind != EventKind::Error {
            return None;
        }
        self.payload.get("message").and_then(Value::as_str)
    }
}
