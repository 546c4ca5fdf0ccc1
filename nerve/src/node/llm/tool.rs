//! Tool-capable facet (spec.md §4.2 "Tool-capable nodes"): an orthogonal
//! capability any node variant may opt into so a `StatefulLLMNode` can
//! present it to an upstream LLM as a callable tool.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::result::NodeResult;

/// `{description, parameters, input-from-args, result-to-string}` (spec.md §3).
pub trait ToolCapable: Send + Sync {
    fn tool_description(&self) -> String;

    /// JSON Schema for the tool's arguments.
    fn tool_parameters(&self) -> Value;

    /// Maps the LLM's tool-call arguments onto this node's `execute` input.
    fn tool_input(&self, args: &Value) -> Value;

    /// Renders this node's result as the string the LLM tool-call loop sees.
    fn tool_result(&self, result: &NodeResult) -> String {
        if result.success {
            result.output.as_str().map(|s| s.to_string()).unwrap_or_else(|| result.output.to_string())
        } else {
            format!("error: {}", result.error.clone().unwrap_or_default())
        }
    }
}

/// One entry in a `StatefulLLMNode`'s tool catalogue, as presented to the
/// wire-format `tools` array.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Resolves a tool name + arguments to a string result (spec.md §4.2
/// "StatefulLLMNode"). A `ToolCapable` node is one concrete way to obtain a
/// `ToolExecutor`; the trait stays separate so the loop can also be driven by
/// hand-written executors that don't need a full node identity.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn catalogue(&self) -> Vec<ToolSpec>;

    async fn call(&self, ctx: &ExecutionContext, name: &str, args: &Value) -> Result<String, String>;
}

/// Adapts a set of `(node_id, ToolCapable-capable node, underlying Node)`
/// triples into one `ToolExecutor`, resolving each tool call by invoking the
/// node's `execute` with `tool_input(args)` and rendering via `tool_result`.
pub struct NodeToolExecutor {
    tools: Vec<(String, std::sync::Arc<dyn ToolCapable>, crate::node::NodeRef)>,
}

impl NodeToolExecutor {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(mut self, name: impl Into<String>, capable: std::sync::Arc<dyn ToolCapable>, node: crate::node::NodeRef) -> Self {
        self.tools.push((name.into(), capable, node));
        self
    }
}

impl Default for NodeToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for NodeToolExecutor {
    fn catalogue(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|(name, capable, _)| ToolSpec {
                name: name.clone(),
                description: capable.tool_description(),
                parameters: capable.tool_parameters(),
            })
            .collect()
    }

    async fn call(&self, ctx: &ExecutionContext, name: &str, args: &Value) -> Result<String, String> {
        let (_, capable, node) = self
            .tools
            .iter()
            .find(|(n, _, _)| n == name)
            .ok_or_else(|| format!("unknown tool: {name}"))?;
        let tool_input = capable.tool_input(args);
        let step_ctx = ctx.with_input(tool_input);
        let result = node
            .execute(&step_ctx)
            .await
            .map_err(|e| e.to_string())?;
        Ok(capable.tool_result(&result))
    }
}
