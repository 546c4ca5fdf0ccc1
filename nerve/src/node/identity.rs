//! IdentityNode: returns its input unchanged (spec.md §4.2).

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::node::{check_preconditions, ExecError, Node};
use crate::result::NodeResult;

pub struct IdentityNode {
    id: String,
}

impl IdentityNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Node for IdentityNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &str {
        "identity"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeResult, ExecError> {
        check_preconditions(ctx)?;
        Ok(NodeResult::ok(self.node_type(), &self.id, ctx.input.clone(), ctx.input.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echoes_input_as_output() {
        let node = IdentityNode::new("echo");
        let ctx = ExecutionContext::new(None, json!({"a": 1}));
        let result = node.execute(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, json!({"a": 1}));
    }
}
