//! LLM node family: `StatelessLLMNode` (one request per `execute`) and
//! `StatefulLLMNode` (persistent, multi-turn, tool-calling) (spec.md §4.2).

pub mod stateful;
pub mod stateless;
pub mod tool;

pub use stateful::StatefulLLMNode;
pub use stateless::{GlmDefaults, OpenRouterDefaults, Provider, RetryConfig, StatelessLLMNode};
pub use tool::{ToolCapable, ToolExecutor, ToolSpec};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One OpenAI-style chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_function_type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

fn default_function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON-encoded argument string, matching the OpenAI wire shape.
    pub arguments: String,
}

/// Token usage for one completion call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Parses the three accepted input shapes (spec.md §4.2 `StatelessLLMNode`):
/// a plain string, a list of messages, or a full request object with a
/// `messages` key and optional sibling parameters.
pub fn messages_from_input(input: &Value) -> (Vec<Message>, Value) {
    match input {
        Value::String(s) => (vec![Message::user(s.clone())], Value::Object(Default::default())),
        Value::Array(_) => {
            let messages: Vec<Message> = serde_json::from_value(input.clone()).unwrap_or_default();
            (messages, Value::Object(Default::default()))
        }
        Value::Object(obj) if obj.contains_key("messages") => {
            let messages: Vec<Message> =
                serde_json::from_value(obj.get("messages").cloned().unwrap_or(Value::Array(vec![])))
                    .unwrap_or_default();
            let mut extra = obj.clone();
            extra.remove("messages");
            (messages, Value::Object(extra))
        }
        _ => (Vec::new(), Value::Object(Default::default())),
    }
}
