//! The uniform node contract (spec.md §3 "Node (abstract)", §4.2).

pub mod bash;
pub mod function;
pub mod identity;
pub mod llm;
pub mod terminal;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::{BudgetExceededError, CancelledError};
use crate::result::NodeResult;

/// Persistent-node lifecycle state (spec.md §3). Ephemeral nodes (function,
/// bash, identity, stateless LLM) are implicitly `Ready` and never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Starting,
    Ready,
    Busy,
    Stopped,
}

/// `{id, node_type, state, persistent, metadata}` snapshot (spec.md §4.2 `to_info`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeInfo {
    pub id: String,
    pub node_type: String,
    pub state: NodeState,
    pub persistent: bool,
    pub metadata: Value,
}

/// The only two error types allowed to escape `Node::execute` (spec.md §7
/// "Propagation"). Every other failure is caught, classified, and returned
/// as a `NodeResult` with `success: false`.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceededError),
}

/// Uniform contract implemented by every node variant.
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> &str;

    fn node_type(&self) -> &str;

    /// Lifetime longer than one `execute` call (spec.md §3). Ephemeral nodes
    /// (the default) own no resources between calls.
    fn persistent(&self) -> bool {
        false
    }

    fn state(&self) -> NodeState {
        NodeState::Ready
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeResult, ExecError>;

    /// Fast best-effort interruption of an in-flight `execute` (spec.md §4.2).
    /// Default is a no-op; terminal nodes and long-running backends override it.
    async fn interrupt(&self) {}

    /// Persistent nodes only; releases owned resources. Default is a no-op.
    async fn stop(&self) {}

    fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id().to_string(),
            node_type: self.node_type().to_string(),
            state: self.state(),
            persistent: self.persistent(),
            metadata: Value::Object(Default::default()),
        }
    }

    /// Overridden by `Graph`'s `Node` impl so `collect_persistent_nodes` can
    /// walk nested graphs (spec.md §4.4 "Nested graphs").
    fn as_graph(&self) -> Option<&crate::graph::Graph> {
        None
    }

    /// Overridden by node variants that support `FORK_NODE` (spec.md §4.6),
    /// today only `ClaudeTerminalNode` (spec.md §4.2 "Fork").
    fn as_forkable(&self) -> Option<&dyn Forkable> {
        None
    }

    /// Overridden by node variants that require polling for readiness before
    /// `EXECUTE_INPUT` writes to them (spec.md §4.6 "EXECUTE_INPUT"), today
    /// only `ClaudeTerminalNode` (spec.md §4.2 `execute_when_ready`).
    fn as_ready_aware(&self) -> Option<&dyn ReadyAware> {
        None
    }
}

/// Capability facet for nodes that can produce a sibling node (spec.md §4.2
/// "Fork", §4.6 `FORK_NODE`: "Require the source to support forking").
pub trait Forkable {
    fn fork_into(&self, target_id: &str) -> Result<NodeRef, crate::error::NerveError>;
}

/// Capability facet for nodes that must confirm readiness before `execute`
/// writes to them (spec.md §4.2 `execute_when_ready`, §4.6 "EXECUTE_INPUT").
#[async_trait]
pub trait ReadyAware: Send + Sync {
    async fn execute_when_ready(&self, ctx: &ExecutionContext) -> Result<NodeResult, ExecError>;
}

pub type NodeRef = Arc<dyn Node>;

/// Helper shared by every node's `execute`: build a result for `ctx.check_cancelled()`/
/// `ctx.check_budget()` failures. Node implementations call this right before doing
/// any real work so the two allowed-to-escape errors propagate as `Err`, not a result.
pub fn check_preconditions(ctx: &ExecutionContext) -> Result<(), ExecError> {
    ctx.check_cancelled()?;
    ctx.check_budget()?;
    Ok(())
}
