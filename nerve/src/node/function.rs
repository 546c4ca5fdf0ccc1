//! FunctionNode: wraps a pure function of the execution context (spec.md §4.2).

use async_trait::async_trait;
use serde_json::Value;
use std::panic::AssertUnwindSafe;

use crate::context::ExecutionContext;
use crate::error::ErrorType;
use crate::node::{check_preconditions, ExecError, Node};
use crate::result::NodeResult;

type Func = Box<dyn Fn(&ExecutionContext) -> Result<Value, String> + Send + Sync>;

/// Applies a wrapped function to `ctx.input`. Never suspends a real thread;
/// thrown errors are wrapped as `internal_error` (spec.md §4.2).
pub struct FunctionNode {
    id: String,
    func: Func,
}

impl FunctionNode {
    pub fn new(id: impl Into<String>, func: impl Fn(&ExecutionContext) -> Result<Value, String> + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            func: Box::new(func),
        }
    }

    /// Convenience constructor for a function of the input value alone.
    pub fn from_value_fn(
        id: impl Into<String>,
        f: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self::new(id, move |ctx| Ok(f(&ctx.input)))
    }
}

#[async_trait]
impl Node for FunctionNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &str {
        "function"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeResult, ExecError> {
        check_preconditions(ctx)?;
        let input = ctx.input.clone();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| (self.func)(ctx)));
        let result = match outcome {
            Ok(Ok(output)) => NodeResult::ok(self.node_type(), &self.id, input, output),
            Ok(Err(msg)) => NodeResult::err(self.node_type(), &self.id, input, msg, ErrorType::InternalError),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "function panicked".to_string());
                NodeResult::err(self.node_type(), &self.id, input, msg, ErrorType::InternalError)
            }
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn applies_function_to_input() {
        let node = FunctionNode::from_value_fn("double", |v| {
            Value::from(v.as_i64().unwrap_or(0) * 2)
        });
        let ctx = ExecutionContext::new(None, Value::from(5));
        let result = node.execute(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, Value::from(10));
    }

    #[tokio::test]
    async fn wraps_error_as_internal_error() {
        let node = FunctionNode::new("fails", |_ctx| Err("boom".to_string()));
        let ctx = ExecutionContext::new(None, Value::Null);
        let result = node.execute(&ctx).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_type, Some(ErrorType::InternalError));
    }

    #[tokio::test]
    async fn catches_panics() {
        let node = FunctionNode::new("panics", |_ctx| panic!("kaboom"));
        let ctx = ExecutionContext::new(None, Value::Null);
        let result = node.execute(&ctx).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("kaboom"));
    }
}
