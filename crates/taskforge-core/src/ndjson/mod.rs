//! NDJSON parser for the Claude Code stream-json protocol.
//!
//! The SDK-backed adapter reads this protocol line by line and turns the
//! parsed messages into normalized [`crate::events::StreamEvent`]s. The reader
//! is tolerant: unknown fields are ignored and unknown message types are kept
//! as [`Message::Unknown`].

mod parser;
mod types;

pub use parser::{parse_line, parse_value};
pub use types::*;
