//! Line parser for the stream-json protocol. Unknown fields are ignored and
//! unknown message types come back as [`Message::Unknown`].

use serde_json::Value;

use super::types::{
    AssistantMessage, ContentBlock, ControlRequest, ControlRequestType, Message, ResultSubtype,
    SessionResult, SystemInit, ToolResult, Usage, UserMessage,
};
use crate::error::{Error, Result};

/// Parse one line of stdout.
pub fn parse_line(line: &str) -> Result<Message> {
    parse_value(&serde_json::from_str(line)?)
}

pub fn parse_value(raw: &Value) -> Result<Message> {
    let Some(msg_type) = raw.get("type").and_then(Value::as_str) else {
        return Err(Error::Protocol("message has no \"type\"".into()));
    };

    Ok(match msg_type {
        "system" if text(raw, "subtype") == "init" => system_init(raw),
        "assistant" => assistant(raw),
        "user" => user(raw),
        "control_request" => control_request(raw)?,
        "result" => result(raw),
        _ => Message::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        },
    })
}

fn text(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn system_init(raw: &Value) -> Message {
    let tools = raw
        .get("tools")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|t| t.as_str().map(String::from))
        .collect();

    Message::SystemInit(SystemInit {
        session_id: text(raw, "session_id"),
        model: text(raw, "model"),
        cwd: text(raw, "cwd").into(),
        tools,
    })
}

/// Assistant and user turns nest their blocks under `message`.
fn blocks(raw: &Value) -> impl Iterator<Item = &Value> {
    raw.get("message")
        .unwrap_or(raw)
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn assistant(raw: &Value) -> Message {
    let content = blocks(raw)
        .filter_map(|block| match block.get("type")?.as_str()? {
            "text" => Some(ContentBlock::Text {
                text: block.get("text")?.as_str()?.to_string(),
            }),
            "thinking" => Some(ContentBlock::Thinking),
            "tool_use" => Some(ContentBlock::ToolUse {
                id: block.get("id")?.as_str()?.to_string(),
                name: block.get("name")?.as_str()?.to_string(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            }),
            _ => None,
        })
        .collect();
    Message::Assistant(AssistantMessage { content })
}

/// Tool output is a string or a list of text blocks.
fn tool_output(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn user(raw: &Value) -> Message {
    let content = blocks(raw)
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
        .filter_map(|b| {
            Some(ToolResult {
                tool_use_id: b.get("tool_use_id")?.as_str()?.to_string(),
                content: tool_output(b.get("content")),
                is_error: b.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            })
        })
        .collect();
    Message::User(UserMessage { content })
}

fn control_request(raw: &Value) -> Result<Message> {
    let request_id = raw
        .get("request_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("control_request has no request_id".into()))?
        .to_string();

    let request = raw.get("request").cloned().unwrap_or(Value::Null);
    let request = if text(&request, "subtype") == "can_use_tool" {
        ControlRequestType::CanUseTool {
            tool_name: text(&request, "tool_name"),
            input: request.get("input").cloned().unwrap_or(Value::Null),
        }
    } else {
        ControlRequestType::Unknown(request)
    };

    Ok(Message::ControlRequest(ControlRequest {
        request_id,
        request,
    }))
}

fn result(raw: &Value) -> Message {
    let usage: Usage = raw
        .get("usage")
        .and_then(|u| serde_json::from_value(u.clone()).ok())
        .unwrap_or_default();

    Message::Result(SessionResult {
        subtype: ResultSubtype::from(raw.get("subtype").and_then(Value::as_str)),
        is_error: raw.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        result: raw.get("result").and_then(Value::as_str).map(String::from),
        session_id: text(raw, "session_id"),
        duration_ms: raw.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
        num_turns: raw.get("num_turns").and_then(Value::as_u64).unwrap_or(0),
        cost_usd: raw.get("total_cost_usd").and_then(Value::as_f64),
        usage,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parse_system_init() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc123","model":"claude-sonnet-4-5","cwd":"/home/user","tools":["Read","Bash"]}"#;
        let Message::SystemInit(init) = parse_line(json).unwrap() else {
            panic!("expected SystemInit");
        };
        assert_eq!(init.session_id, "abc123");
        assert_eq!(init.tools, vec!["Read", "Bash"]);
    }

    #[test]
    fn system_without_init_subtype_is_unknown() {
        let json = r#"{"type":"system","subtype":"compact_boundary"}"#;
        assert!(matches!(parse_line(json).unwrap(), Message::Unknown { .. }));
    }

    #[test]
    fn assistant_text_joins_text_blocks() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"{\"a\":"},{"type":"tool_use","id":"tu1","name":"Read","input":{}},{"type":"text","text":"1}"}]}}"#;
        let Message::Assistant(msg) = parse_line(json).unwrap() else {
            panic!("expected Assistant");
        };
        assert_eq!(msg.text(), r#"{"a":1}"#);
        assert_eq!(msg.content.len(), 3);
    }

    #[test]
    fn parse_control_request_works() {
        let json = r#"{"type":"control_request","request_id":"req_001","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"}}}"#;
        let msg = parse_line(json).unwrap();
        assert!(matches!(
            msg,
            Message::ControlRequest(ControlRequest {
                request: ControlRequestType::CanUseTool { .. },
                ..
            })
        ));
    }

    #[test]
    fn control_request_without_id_is_an_error() {
        let json = r#"{"type":"control_request","request":{"subtype":"can_use_tool"}}"#;
        assert!(parse_line(json).is_err());
    }

    #[test]
    fn parse_result_error_subtype() {
        let json = r#"{"type":"result","subtype":"error_max_turns","is_error":true,"session_id":"s","duration_ms":12,"num_turns":30}"#;
        let Message::Result(result) = parse_line(json).unwrap() else {
            panic!("expected Result");
        };
        assert!(result.failed());
        assert_eq!(result.subtype.as_str(), "error_max_turns");
        assert_eq!(result.num_turns, 30);
    }

    #[test]
    fn tool_result_accepts_block_content() {
        let json = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu1","content":[{"type":"text","text":"line"}]}]}}"#;
        let Message::User(user) = parse_line(json).unwrap() else {
            panic!("expected User");
        };
        assert_eq!(user.content[0].content, "line");
    }

    #[test]
    fn tolerant_reader_ignores_unknown_fields() {
        let json = r#"{"type":"system","subtype":"init","session_id":"x","model":"m","cwd":"/","tools":[],"unknown":"ignored"}"#;
        assert!(parse_line(json).is_ok());
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(parse_line(r#"{"session_id":"x"}"#).is_err());
    }
}
