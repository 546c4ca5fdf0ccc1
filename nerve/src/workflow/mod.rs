//! Workflow engine: imperative runs with suspend/resume on gates, nested
//! graph/workflow invocation, and cancellation (spec.md §4.5).

pub mod run;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::NerveError;
use crate::node::ExecError;
use crate::result::NodeResult;
use crate::session::Session;
use crate::validation::validate_id;
use crate::workflow::run::WorkflowRun;

pub type WorkflowFn = Arc<dyn Fn(WorkflowContext) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync>;

/// Immutable registration of `{id, session, fn}` (spec.md §3 "Workflow", §4.5 "Workflow").
pub struct Workflow {
    id: String,
    func: WorkflowFn,
}

impl Workflow {
    pub fn new(
        id: impl Into<String>,
        func: impl Fn(WorkflowContext) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync + 'static,
    ) -> Result<Self, NerveError> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self { id, func: Arc::new(func) })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// The live capability passed to a workflow's `fn` (spec.md §4.5 "WorkflowContext").
#[derive(Clone)]
pub struct WorkflowContext {
    pub session: Arc<Session>,
    pub run: Arc<WorkflowRun>,
    pub input: Value,
    pub params: Value,
}

impl WorkflowContext {
    /// Runs a registered node to completion, emitting `node_started`/`node_completed`/
    /// `node_error` on the run (spec.md §4.5 `run`).
    pub async fn run_node(&self, node_id: &str, input: Value) -> Result<NodeResult, String> {
        let node = self
            .session
            .get_node(node_id)
            .ok_or_else(|| format!("node '{node_id}' not found"))?;
        self.run.emit("node_started", serde_json::json!({"node_id": node_id}));
        let mut ctx = ExecutionContext::new(Some(self.session.clone()), input);
        ctx.cancellation = self.run.cancellation().clone();
        match node.execute(&ctx).await {
            Ok(result) => {
                if result.success {
                    self.run.emit("node_completed", serde_json::to_value(&result).unwrap_or(Value::Null));
                } else {
                    self.run.emit("node_error", serde_json::to_value(&result).unwrap_or(Value::Null));
                }
                Ok(result)
            }
            Err(ExecError::Cancelled(_)) => Err("cancelled".to_string()),
            Err(ExecError::BudgetExceeded(b)) => Err(b.to_string()),
        }
    }

    /// Runs a registered graph to completion, emitting `graph_started`/`graph_completed`/
    /// `graph_error` on the run (spec.md §4.5 `run_graph`).
    pub async fn run_graph(&self, graph_id: &str, input: Value) -> Result<NodeResult, String> {
        let graph = self
            .session
            .get_graph(graph_id)
            .ok_or_else(|| format!("graph '{graph_id}' not found"))?;
        self.run.emit("graph_started", serde_json::json!({"graph_id": graph_id}));
        let mut ctx = ExecutionContext::new(Some(self.session.clone()), input);
        ctx.cancellation = self.run.cancellation().clone();
        match graph.execute(&ctx).await {
            Ok(result) => {
                let data = serde_json::to_value(&result).unwrap_or(Value::Null);
                if result.success {
                    self.run.emit("graph_completed", data);
                } else {
                    self.run.emit("graph_error", data);
                }
                Ok(result)
            }
            Err(e) => {
                self.run.emit("graph_error", Value::String(e.to_string()));
                Err(e.to_string())
            }
        }
    }

    /// Resolves `workflow_id`, creates a **new** `WorkflowRun` sharing this
    /// run's cancellation, awaits completion, and propagates its error
    /// (spec.md §4.5 `run_workflow`).
    pub async fn run_workflow(&self, workflow_id: &str, input: Value, params: Value) -> Result<Value, String> {
        let workflow = self
            .session
            .get_workflow(workflow_id)
            .ok_or_else(|| format!("workflow '{workflow_id}' not found"))?;
        self.run.emit("nested_workflow_started", serde_json::json!({"workflow_id": workflow_id}));

        let child = Arc::new(WorkflowRun::with_cancellation(
            Uuid::new_v4().to_string(),
            workflow_id,
            input.clone(),
            params.clone(),
            self.run.cancellation().clone(),
        ));
        self.session.register_run(child.clone());
        let child_ctx = WorkflowContext {
            session: self.session.clone(),
            run: child.clone(),
            input,
            params,
        };

        child.mark_started();
        let outcome = (workflow.func)(child_ctx).await;
        match outcome {
            Ok(value) => {
                child.mark_completed(value.clone());
                self.run.emit("nested_workflow_completed", value.clone());
                Ok(value)
            }
            Err(e) => {
                child.mark_failed(e.clone());
                self.run.emit("nested_workflow_error", Value::String(e.clone()));
                Err(e)
            }
        }
    }

    /// Suspends execution until an external `answer_gate` call (spec.md §4.5 `gate`).
    pub async fn gate(&self, prompt: impl Into<String>, choices: Option<Vec<String>>) -> Result<Value, String> {
        self.run.gate(prompt.into(), choices).await
    }

    /// Appends a custom event to the run's log (spec.md §4.5 `emit`).
    pub fn emit(&self, event_type: &str, data: Value) {
        self.run.emit(event_type, data);
    }
}

/// Starts a workflow run: creates the `WorkflowRun`, registers it, and
/// schedules the underlying task (spec.md §4.5 "WorkflowRun" steps 1-3).
pub async fn start_run(session: Arc<Session>, workflow: Arc<Workflow>, input: Value, params: Value) -> Arc<WorkflowRun> {
    let run = Arc::new(WorkflowRun::new(Uuid::new_v4().to_string(), workflow.id(), input.clone(), params.clone()));
    session.register_run(run.clone());

    let ctx = WorkflowContext {
        session,
        run: run.clone(),
        input,
        params,
    };
    let run_for_task = run.clone();
    let func = workflow.func.clone();
    run.mark_started();
    let handle = tokio::spawn(async move {
        match (func)(ctx).await {
            Ok(value) => run_for_task.mark_completed(value),
            Err(e) => run_for_task.mark_failed(e),
        }
    });
    run.set_task(handle);
    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::identity::IdentityNode;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn run_completes_and_returns_result() {
        let session = Arc::new(Session::new("s", "srv"));
        let workflow = Arc::new(
            Workflow::new("double", |ctx: WorkflowContext| {
                Box::pin(async move {
                    let n = ctx.input.as_i64().unwrap_or(0);
                    Ok(json!(n * 2))
                })
            })
            .unwrap(),
        );
        let run = start_run(session, workflow, json!(21), Value::Null).await;
        for _ in 0..50 {
            if matches!(run.state(), run::RunState::Completed | run::RunState::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(run.state(), run::RunState::Completed);
    }

    #[tokio::test]
    async fn gate_suspends_then_resumes_on_answer() {
        let session = Arc::new(Session::new("s", "srv"));
        let workflow = Arc::new(
            Workflow::new("asks", |ctx: WorkflowContext| {
                Box::pin(async move {
                    ctx.emit("custom", json!({"note": "starting"}));
                    let answer = ctx.gate("continue?", Some(vec!["yes".into(), "no".into()])).await?;
                    Ok(answer)
                })
            })
            .unwrap(),
        );
        let run = start_run(session, workflow, Value::Null, Value::Null).await;
        for _ in 0..50 {
            if run.state() == run::RunState::Waiting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(run.state(), run::RunState::Waiting);
        assert!(run.answer_gate(json!("maybe")).is_err());
        run.answer_gate(json!("yes")).unwrap();

        for _ in 0..50 {
            if run.state() == run::RunState::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let info = run.to_info();
        assert_eq!(info["result"], json!("yes"));
        assert!(info["events"].as_array().unwrap().iter().any(|e| e["event_type"] == "gate_answered"));
    }

    #[tokio::test]
    async fn run_node_delegates_to_registered_node() {
        let session = Arc::new(Session::new("s", "srv"));
        session.register_node(Arc::new(IdentityNode::new("echo"))).unwrap();
        let workflow = Arc::new(
            Workflow::new("calls_node", |ctx: WorkflowContext| {
                Box::pin(async move {
                    let result = ctx.run_node("echo", json!("hi")).await?;
                    Ok(result.output)
                })
            })
            .unwrap(),
        );
        let run = start_run(session, workflow, Value::Null, Value::Null).await;
        for _ in 0..50 {
            if matches!(run.state(), run::RunState::Completed | run::RunState::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(run.to_info()["result"], json!("hi"));
    }
}
