//! Graph execution (spec.md §4.4 "Execute semantics"/"Error policy
//! execution"/"Streaming"/"Nested graphs"/"Interruption").

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::context::{CancellationToken, ExecutionContext, StepTrace};
use crate::error::{ErrorType, NerveError};
use crate::graph::{ErrorPolicy, Graph, NodeTarget, OnError, Step};
use crate::node::{ExecError, Node, NodeInfo, NodeRef, NodeState};
use crate::result::NodeResult;
use crate::session::Session;

/// One event in a graph's streamed execution (spec.md §4.4 "Streaming").
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    StepStart { step_id: String, node_id: String, timestamp_ms: u128 },
    StepChunk { step_id: String, node_id: String, data: String, timestamp_ms: u128 },
    StepComplete { step_id: String, node_id: String, data: Value, timestamp_ms: u128 },
    StepError { step_id: String, node_id: String, data: String, timestamp_ms: u128 },
}

fn now_ms() -> u128 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_millis()
}

fn resolve_node(target: &NodeTarget, session: Option<&Session>) -> Result<NodeRef, NerveError> {
    match target {
        NodeTarget::Direct(n) => Ok(n.clone()),
        NodeTarget::Lookup(id) => session
            .and_then(|s| s.get_node(id).or_else(|| s.get_graph(id).map(|g| g as NodeRef)))
            .ok_or_else(|| NerveError::NotFound(format!("node '{id}' not found in session"))),
    }
}

/// Shared with a caller so `interrupt()` can reach the node currently
/// executing inside a graph run (spec.md §4.4/§5 "Interruption").
#[derive(Clone, Default)]
pub struct CurrentNodeHandle(Arc<RwLock<Option<NodeRef>>>);

impl CurrentNodeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, node: Option<NodeRef>) {
        *self.0.write().unwrap() = node;
    }

    /// Cancels `cancellation` and best-effort interrupts whichever node is
    /// currently executing; subsequent steps are never started because the
    /// next `check_cancelled()` observes the token.
    pub async fn interrupt(&self, cancellation: &CancellationToken) {
        cancellation.cancel();
        let current = self.0.read().unwrap().clone();
        if let Some(node) = current {
            node.interrupt().await;
        }
    }
}

impl Graph {
    /// Runs this graph to completion (spec.md §4.4 "Execute semantics"),
    /// tracking the in-flight node and cancellation token on `self` so a
    /// concurrent `Node::interrupt()` call can reach it.
    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeResult, NerveError> {
        *self.active_cancellation.write().unwrap() = Some(ctx.cancellation.clone());
        let result = self.execute_tracked(ctx, Some(&self.current)).await;
        *self.active_cancellation.write().unwrap() = None;
        result
    }

    pub async fn execute_tracked(&self, ctx: &ExecutionContext, current: Option<&CurrentNodeHandle>) -> Result<NodeResult, NerveError> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(NerveError::GraphInvalid(errors));
        }
        let order = self.execution_order().map_err(|e| NerveError::GraphInvalid(vec![e]))?;
        let session = ctx.session.as_deref();

        ctx.trace.set_running();
        tracing::info!(graph_id = %self.id(), "graph_start");

        let mut results: HashMap<String, Value> = HashMap::new();
        let mut step_results: serde_json::Map<String, Value> = serde_json::Map::new();
        let mut first_error: Option<(String, ErrorType)> = None;
        let mut overall_success = true;
        let mut final_output = Value::Null;

        for step_id in &order {
            ctx.check_cancelled().map_err(NerveError::from)?;
            ctx.check_budget().map_err(NerveError::from)?;
            ctx.budget.add_step();

            let step = self.get_step(step_id).expect("validated step exists");
            let node = match resolve_node(&step.node, session) {
                Ok(n) => n,
                Err(e) => {
                    ctx.trace.complete(Some(e.to_string()));
                    tracing::error!(graph_id = %self.id(), step_id, "graph_failed: {e}");
                    return Err(e);
                }
            };

            let step_input = compute_step_input(step, &results, &ctx.input);
            let mut step_ctx = ctx.with_input(step_input.clone()).with_upstream(
                results.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            );
            if let Some(parser) = &step.parser {
                step_ctx = step_ctx.with_parser(parser.clone());
            }
            if let Some(current) = current {
                current.set(Some(node.clone()));
            }

            let start = now_ms();
            let policy = step.error_policy.clone().unwrap_or_default();
            let outcome = run_step_with_policy(node.as_ref(), &step_ctx, &policy, session).await;
            if let Some(current) = current {
                current.set(None);
            }
            let end = now_ms();

            let step_result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    ctx.trace.complete(Some(e.to_string()));
                    tracing::error!(graph_id = %self.id(), step_id, "graph_failed: {e}");
                    return Err(e);
                }
            };

            ctx.trace.add_step(StepTrace {
                step_id: step_id.clone(),
                node_id: node.id().to_string(),
                node_type: node.node_type().to_string(),
                input: step_input,
                output: Some(step_result.output.clone()),
                error: step_result.error.clone(),
                start_time_ms: start,
                end_time_ms: end,
                duration_ms: (end - start) as f64,
            });

            if !step_result.success {
                overall_success = false;
                if first_error.is_none() {
                    first_error = Some((
                        step_result.error.clone().unwrap_or_default(),
                        step_result.error_type.unwrap_or(ErrorType::ExecutionError),
                    ));
                }
            }

            results.insert(step_id.clone(), step_result.output.clone());
            final_output = step_result.output.clone();
            step_results.insert(step_id.clone(), serde_json::to_value(&step_result).unwrap_or(Value::Null));
        }

        ctx.trace.complete(first_error.as_ref().map(|(m, _)| m.clone()));
        tracing::info!(graph_id = %self.id(), success = overall_success, "graph_complete");

        let final_step_id = order.last().cloned().unwrap_or_default();
        let mut result = if overall_success {
            NodeResult::ok(self.node_type_tag(), self.id(), ctx.input.clone(), final_output)
        } else {
            let (message, error_type) = first_error.unwrap_or((
                "graph execution failed".to_string(),
                ErrorType::ExecutionError,
            ));
            NodeResult::err(self.node_type_tag(), self.id(), ctx.input.clone(), message, error_type)
        };
        result = result.with_attributes(json!({
            "steps": Value::Object(step_results),
            "execution_order": order,
            "final_step_id": final_step_id,
        }));
        Ok(result)
    }

    /// Streamed execution (spec.md §4.4 "Streaming"): yields one
    /// `step_start`/`step_complete` (or `step_error`) pair per step.
    pub fn execute_stream(self: Arc<Self>, ctx: ExecutionContext) -> ReceiverStream<StepEvent> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let order = match self.execution_order() {
                Ok(o) => o,
                Err(_) => return,
            };
            let session = ctx.session.clone();
            let mut results: HashMap<String, Value> = HashMap::new();

            for step_id in &order {
                if ctx.check_cancelled().is_err() {
                    break;
                }
                let Some(step) = self.get_step(step_id) else { continue };
                let node = match resolve_node(&step.node, session.as_deref()) {
                    Ok(n) => n,
                    Err(e) => {
                        let _ = tx
                            .send(StepEvent::StepError {
                                step_id: step_id.clone(),
                                node_id: "unknown".to_string(),
                                data: e.to_string(),
                                timestamp_ms: now_ms(),
                            })
                            .await;
                        break;
                    }
                };
                let _ = tx
                    .send(StepEvent::StepStart {
                        step_id: step_id.clone(),
                        node_id: node.id().to_string(),
                        timestamp_ms: now_ms(),
                    })
                    .await;

                let step_input = compute_step_input(step, &results, &ctx.input);
                let step_ctx = ctx.with_input(step_input).with_upstream(
                    results.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                );
                let policy = step.error_policy.clone().unwrap_or_default();
                match run_step_with_policy(node.as_ref(), &step_ctx, &policy, session.as_deref()).await {
                    Ok(result) => {
                        results.insert(step_id.clone(), result.output.clone());
                        let data = serde_json::to_value(&result).unwrap_or(Value::Null);
                        let _ = tx
                            .send(StepEvent::StepComplete {
                                step_id: step_id.clone(),
                                node_id: node.id().to_string(),
                                data,
                                timestamp_ms: now_ms(),
                            })
                            .await;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(StepEvent::StepError {
                                step_id: step_id.clone(),
                                node_id: node.id().to_string(),
                                data: e.to_string(),
                                timestamp_ms: now_ms(),
                            })
                            .await;
                        break;
                    }
                }
            }
        });
        ReceiverStream::new(rx)
    }

    /// Walks the step tree, including nested graphs, returning every
    /// persistent node so a session can start/stop them in order
    /// (spec.md §4.4 "Nested graphs").
    pub fn collect_persistent_nodes(&self, session: Option<&Session>) -> Vec<NodeRef> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for step_id in self.step_ids() {
            let step = self.get_step(step_id).unwrap();
            if let Ok(node) = resolve_node(&step.node, session) {
                collect_from_node(&node, session, &mut out, &mut seen);
            }
            if let Some(target) = step.error_policy.as_ref().and_then(|p| p.fallback_node.as_ref()) {
                if let Ok(n) = resolve_node(target, session) {
                    collect_from_node(&n, session, &mut out, &mut seen);
                }
            }
        }
        out
    }

    fn node_type_tag(&self) -> &'static str {
        "graph"
    }
}

fn collect_from_node(node: &NodeRef, session: Option<&Session>, out: &mut Vec<NodeRef>, seen: &mut HashSet<String>) {
    if !seen.insert(node.id().to_string()) {
        return;
    }
    if node.persistent() {
        out.push(node.clone());
    }
    if let Some(g) = node.as_graph() {
        for step_id in g.step_ids() {
            let step = g.get_step(step_id).unwrap();
            if let Ok(n) = resolve_node(&step.node, session) {
                collect_from_node(&n, session, out, seen);
            }
        }
    }
}

/// Computes a step's input (spec.md §4.4 step 2.c): `input_fn` is called with
/// upstream results merged with `{"input": ctx.input}`; otherwise the static
/// `input` is used (or `Null` if neither is set).
fn compute_step_input(step: &Step, upstream: &HashMap<String, Value>, graph_input: &Value) -> Value {
    if let Some(f) = &step.input_fn {
        let mut merged = upstream.clone();
        merged.insert("input".to_string(), graph_input.clone());
        return f(&merged);
    }
    step.input.clone().unwrap_or(Value::Null)
}

/// Runs one step under its error policy (spec.md §4.4 "Error policy execution").
async fn run_step_with_policy(
    node: &dyn Node,
    step_ctx: &ExecutionContext,
    policy: &ErrorPolicy,
    session: Option<&Session>,
) -> Result<NodeResult, NerveError> {
    let max_attempts = policy.retry_count + 1;
    let mut last_failure: Option<NodeResult> = None;

    for attempt in 0..max_attempts {
        let outcome = if let Some(timeout_ms) = policy.timeout_ms {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), node.execute(step_ctx)).await {
                Ok(r) => r,
                Err(_) => Ok(NodeResult::err(
                    node.node_type(),
                    node.id(),
                    step_ctx.input.clone(),
                    format!("step timed out after {timeout_ms}ms"),
                    ErrorType::Timeout,
                )),
            }
        } else {
            node.execute(step_ctx).await
        };

        let result: NodeResult = outcome.map_err(NerveError::from)?;
        if result.success {
            return Ok(result);
        }

        tracing::warn!(
            node_id = node.id(),
            attempt,
            max_attempts,
            error_type = ?result.error_type,
            error = ?result.error,
            "graph step retry"
        );

        let should_retry = policy.should_retry(attempt);
        last_failure = Some(result);
        if should_retry {
            tokio::time::sleep(policy.get_delay_for_attempt(attempt)).await;
            continue;
        }
        break;
    }

    let failed = last_failure.expect("at least one attempt ran");
    match policy.on_error {
        OnError::Fail => Err(NerveError::StepFailed {
            message: failed.error.clone().unwrap_or_default(),
            error_type: failed.error_type.unwrap_or(ErrorType::ExecutionError),
        }),
        OnError::Skip => {
            tracing::warn!(node_id = node.id(), "step_skipped");
            Ok(NodeResult::ok(node.node_type(), node.id(), step_ctx.input.clone(), policy.fallback_value.clone()))
        }
        OnError::Fallback => {
            let fallback_target = policy.fallback_node.as_ref().expect("fallback policy requires fallback_node");
            let fallback_node = resolve_node(fallback_target, session)?;
            tracing::info!(node_id = fallback_node.id(), "fallback_start");
            match fallback_node.execute(step_ctx).await {
                Ok(result) => {
                    tracing::info!(node_id = fallback_node.id(), "fallback_complete");
                    Ok(result)
                }
                Err(e) => {
                    tracing::error!(node_id = fallback_node.id(), "fallback_failed");
                    Err(NerveError::from(e))
                }
            }
        }
    }
}

#[async_trait]
impl Node for Graph {
    fn id(&self) -> &str {
        Graph::id(self)
    }

    fn node_type(&self) -> &str {
        "graph"
    }

    fn state(&self) -> NodeState {
        NodeState::Ready
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeResult, ExecError> {
        match self.execute(ctx).await {
            Ok(result) => Ok(result),
            Err(NerveError::Cancelled(c)) => Err(ExecError::Cancelled(c)),
            Err(NerveError::BudgetExceeded(b)) => Err(ExecError::BudgetExceeded(b)),
            Err(e) => Ok(NodeResult::err(
                "graph",
                Graph::id(self),
                ctx.input.clone(),
                e.to_string(),
                e.error_type(),
            )),
        }
    }

    /// Cancels the in-flight `execute()` call (if any) and best-effort
    /// interrupts whichever node is currently executing under it
    /// (spec.md §4.4/§5 "Interruption").
    async fn interrupt(&self) {
        let cancellation = self.active_cancellation.read().unwrap().clone();
        if let Some(cancellation) = cancellation {
            self.current.interrupt(&cancellation).await;
        }
    }

    fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id().to_string(),
            node_type: "graph".to_string(),
            state: NodeState::Ready,
            persistent: false,
            metadata: json!({"step_ids": self.step_ids(), "max_parallel": self.max_parallel}),
        }
    }

    fn as_graph(&self) -> Option<&Graph> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Step;
    use crate::node::function::FunctionNode;
    use crate::node::identity::IdentityNode;
    use serde_json::json;

    fn double(id: &str) -> NodeRef {
        Arc::new(FunctionNode::from_value_fn(id, |v| json!(v.as_i64().unwrap_or(0) * 2)))
    }

    #[tokio::test]
    async fn linear_chain_runs_in_order_and_lifts_final_output() {
        let mut g = Graph::new("g");
        g.add_step("double", Step::direct(double("double")).with_input(json!(5)));
        g.add_step(
            "add10",
            Step::direct(Arc::new(FunctionNode::from_value_fn("add10", |v| json!(v.as_i64().unwrap_or(0) + 10))))
                .with_input_fn(|m| m["double"].clone()),
        );
        g.add_step(
            "upper",
            Step::direct(Arc::new(FunctionNode::from_value_fn("upper", |v| json!(v.to_string().to_uppercase()))))
                .with_input_fn(|m| m["add10"].clone()),
        );
        g.chain(&["double", "add10", "upper"]);

        let ctx = ExecutionContext::new(None, Value::Null);
        let result = g.execute(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.attributes["execution_order"], json!(["double", "add10", "upper"]));
        assert_eq!(result.attributes["steps"]["upper"]["output"], json!("20"));
        assert_eq!(result.output, json!("20"));
    }

    #[tokio::test]
    async fn retry_then_fallback_recovers_the_step() {
        let mut g = Graph::new("g");
        let flaky = Arc::new(crate::node::function::FunctionNode::new("flaky", |_ctx| Err("always fails".to_string())));
        let fallback = Arc::new(IdentityNode::new("fallback"));
        let policy = ErrorPolicy::default()
            .with_retry(2)
            .on_fallback(NodeTarget::Direct(fallback));
        g.add_step("flaky", Step::direct(flaky).with_input(json!("OK")).with_error_policy(policy));

        let ctx = ExecutionContext::new(None, Value::Null);
        let result = g.execute(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, json!("OK"));
        assert_eq!(result.attributes["steps"]["flaky"]["output"], json!("OK"));
    }

    #[tokio::test]
    async fn fail_policy_aborts_whole_graph() {
        let mut g = Graph::new("g");
        let flaky = Arc::new(crate::node::function::FunctionNode::new("flaky", |_ctx| Err("boom".to_string())));
        g.add_step("flaky", Step::direct(flaky));
        let ctx = ExecutionContext::new(None, Value::Null);
        let err = g.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, NerveError::StepFailed { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_step() {
        let mut g = Graph::new("g");
        g.add_step("a", Step::direct(Arc::new(IdentityNode::new("a"))));
        g.add_step("b", Step::direct(Arc::new(IdentityNode::new("b"))).depends_on(&["a"]));
        let ctx = ExecutionContext::new(None, Value::Null);
        ctx.cancellation.cancel();
        let err = g.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, NerveError::Cancelled(_)));
    }
}
