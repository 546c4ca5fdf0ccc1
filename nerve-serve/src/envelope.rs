//! Newline-delimited JSON wire envelope shared by the Unix socket and TCP
//! transports (spec.md §6 "Wire format (sockets)"). HTTP carries the same
//! command type in a JSON body instead of this framing.

use serde_json::Value;

use nerve::command::{Command, CommandResponse};

/// `{"id": "...", "type": "...", "params": {...}}` — correlation id is opaque
/// to the server except to echo (spec.md §6).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RequestFrame {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub params: Value,
}

/// `{"id": "...", "success": bool, "data": {...}, "error": "..."}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResponseFrame {
    pub id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    pub fn from_response(id: Option<String>, response: CommandResponse) -> Self {
        Self {
            id,
            success: response.success,
            data: response.data,
            error: response.error,
        }
    }

    pub fn parse_error(id: Option<String>, message: impl Into<String>) -> Self {
        Self { id, success: false, data: None, error: Some(message.into()) }
    }
}

impl From<RequestFrame> for Command {
    fn from(frame: RequestFrame) -> Self {
        Command { command_type: frame.command_type, params: frame.params }
    }
}

/// Decodes one line of newline-delimited JSON and returns the framed
/// response, parsing failures included (so the line itself never panics a
/// transport's accept loop).
pub fn decode_line(line: &str) -> Result<RequestFrame, ResponseFrame> {
    serde_json::from_str(line).map_err(|e| ResponseFrame::parse_error(None, format!("parse error: {e}")))
}
