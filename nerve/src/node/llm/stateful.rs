//! StatefulLLMNode: persistent, multi-turn chat node with a tool-call loop
//! (spec.md §4.2). Wraps a `StatelessLLMNode` and owns the conversation.

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::ExecutionContext;
use crate::error::ErrorType;
use crate::node::llm::tool::{ToolExecutor, ToolSpec};
use crate::node::llm::{Message, StatelessLLMNode, Usage};
use crate::node::{check_preconditions, ExecError, Node, NodeState};
use crate::result::NodeResult;

/// Schema for `save`/`load` (spec.md §4.2 "A `clear()` operation... `save(path)`
/// and `load(path)` serialize the conversation in a documented schema").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConversationSnapshot {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
}

pub struct StatefulLLMNode {
    id: String,
    inner: StatelessLLMNode,
    system_prompt: Option<String>,
    messages: RwLock<Vec<Message>>,
    max_tool_rounds: u32,
    tool_executor: Option<Box<dyn ToolExecutor>>,
    tool_choice: Option<String>,
    parallel_tool_calls: bool,
    state: RwLock<NodeState>,
}

impl StatefulLLMNode {
    pub fn new(id: impl Into<String>, inner: StatelessLLMNode) -> Self {
        Self {
            id: id.into(),
            inner,
            system_prompt: None,
            messages: RwLock::new(Vec::new()),
            max_tool_rounds: 8,
            tool_executor: None,
            tool_choice: None,
            parallel_tool_calls: true,
            state: RwLock::new(NodeState::Ready),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_tool_rounds(mut self, n: u32) -> Self {
        self.max_tool_rounds = n;
        self
    }

    pub fn with_tool_executor(mut self, executor: Box<dyn ToolExecutor>) -> Self {
        self.tool_executor = Some(executor);
        self
    }

    pub fn with_tool_choice(mut self, choice: impl Into<String>) -> Self {
        self.tool_choice = Some(choice.into());
        self
    }

    pub fn with_parallel_tool_calls(mut self, parallel: bool) -> Self {
        self.parallel_tool_calls = parallel;
        self
    }

    /// Empties the message history (spec.md §4.2).
    pub fn clear(&self) {
        self.messages.write().unwrap().clear();
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.read().unwrap().clone()
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let snapshot = ConversationSnapshot {
            system_prompt: self.system_prompt.clone(),
            messages: self.messages(),
        };
        let json = serde_json::to_string_pretty(&snapshot).unwrap_or_default();
        tokio::fs::write(path, json).await
    }

    pub async fn load(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let contents = tokio::fs::read_to_string(path).await?;
        let snapshot: ConversationSnapshot = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        *self.messages.write().unwrap() = snapshot.messages;
        Ok(())
    }

    fn tool_catalogue(&self) -> Vec<ToolSpec> {
        self.tool_executor.as_ref().map(|e| e.catalogue()).unwrap_or_default()
    }

    fn build_request_input(&self, round_messages: &[Message]) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert(
            "messages".to_string(),
            serde_json::to_value(round_messages).unwrap_or(Value::Array(vec![])),
        );
        let tools = self.tool_catalogue();
        if !tools.is_empty() {
            let tools_json: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {"name": t.name, "description": t.description, "parameters": t.parameters},
                    })
                })
                .collect();
            obj.insert("tools".to_string(), Value::Array(tools_json));
            if let Some(choice) = &self.tool_choice {
                obj.insert("tool_choice".to_string(), Value::String(choice.clone()));
            }
            obj.insert("parallel_tool_calls".to_string(), Value::Bool(self.parallel_tool_calls));
        }
        Value::Object(obj)
    }
}

#[async_trait]
impl Node for StatefulLLMNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &str {
        "llm_chat"
    }

    fn persistent(&self) -> bool {
        true
    }

    fn state(&self) -> NodeState {
        *self.state.read().unwrap()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeResult, ExecError> {
        check_preconditions(ctx)?;
        let input = ctx.input.clone();

        if self.state() == NodeState::Stopped {
            return Ok(NodeResult::err(
                self.node_type(),
                &self.id,
                input,
                "node is stopped",
                ErrorType::NodeStopped,
            ));
        }

        if !input.is_null() {
            let text = match &input {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.messages.write().unwrap().push(Message::user(text));
        }

        *self.state.write().unwrap() = NodeState::Busy;
        let mut total_usage = Usage::default();

        for _round in 0..self.max_tool_rounds {
            let mut round_messages = Vec::new();
            if let Some(sys) = &self.system_prompt {
                round_messages.push(Message::system(sys.clone()));
            }
            round_messages.extend(self.messages());

            let request_input = self.build_request_input(&round_messages);
            let step_ctx = ctx.with_input(request_input);
            let inner_result = self.inner.execute(&step_ctx).await?;

            if !inner_result.success {
                *self.state.write().unwrap() = NodeState::Ready;
                return Ok(NodeResult::err(
                    self.node_type(),
                    &self.id,
                    input,
                    inner_result.error.unwrap_or_default(),
                    inner_result.error_type.unwrap_or(ErrorType::InternalError),
                ));
            }

            if let Ok(usage) = serde_json::from_value::<Usage>(inner_result.attributes["usage"].clone()) {
                total_usage.prompt_tokens += usage.prompt_tokens;
                total_usage.completion_tokens += usage.completion_tokens;
                total_usage.total_tokens += usage.total_tokens;
                ctx.budget.add_tokens(usage.total_tokens);
            }

            let raw_message = inner_result.attributes["raw_message"].clone();
            let tool_calls: Vec<crate::node::llm::ToolCall> =
                serde_json::from_value(raw_message["tool_calls"].clone()).unwrap_or_default();
            let content = inner_result.output.as_str().unwrap_or_default().to_string();

            self.messages
                .write()
                .unwrap()
                .push(Message::assistant(content.clone(), tool_calls.clone()));

            if tool_calls.is_empty() || self.tool_executor.is_none() {
                *self.state.write().unwrap() = NodeState::Ready;
                return Ok(NodeResult::ok(self.node_type(), &self.id, input, Value::String(content))
                    .with_attributes(json!({"usage": total_usage, "model": self.inner.id()})));
            }

            let executor = self.tool_executor.as_ref().unwrap();
            for call in &tool_calls {
                let args: Value = serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
                let outcome = executor.call(ctx, &call.function.name, &args).await;
                let result_text = match outcome {
                    Ok(text) => text,
                    Err(e) => format!("error: {e}"),
                };
                self.messages.write().unwrap().push(Message::tool_result(call.id.clone(), result_text));
            }
        }

        *self.state.write().unwrap() = NodeState::Ready;
        Ok(NodeResult::err(
            self.node_type(),
            &self.id,
            input,
            "max tool rounds reached",
            ErrorType::InternalError,
        ))
    }

    async fn stop(&self) {
        *self.state.write().unwrap() = NodeState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::llm::Provider;

    #[test]
    fn clear_empties_message_history() {
        let inner = StatelessLLMNode::new("llm", Provider::OpenRouter, "m", "k");
        let node = StatefulLLMNode::new("chat", inner);
        node.messages.write().unwrap().push(Message::user("hi"));
        node.clear();
        assert!(node.messages().is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_messages() {
        let inner = StatelessLLMNode::new("llm", Provider::OpenRouter, "m", "k");
        let node = StatefulLLMNode::new("chat", inner).with_system_prompt("be nice");
        node.messages.write().unwrap().push(Message::user("hi"));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conv.json");
        node.save(&path).await.unwrap();

        let inner2 = StatelessLLMNode::new("llm", Provider::OpenRouter, "m", "k");
        let node2 = StatefulLLMNode::new("chat2", inner2);
        node2.load(&path).await.unwrap();
        assert_eq!(node2.messages().len(), node.messages().len());
        assert_eq!(node2.messages()[0].content, node.messages()[0].content);
    }
}
