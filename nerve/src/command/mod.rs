//! Daemon command plane: a small, versioned request/response protocol that
//! mediates all out-of-process control (spec.md §4.6). Transport-agnostic —
//! `nerve-serve` decodes bytes off a socket into a [`Command`] and encodes a
//! [`CommandResponse`] back; this module never touches a transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::context::ExecutionContext;
use crate::error::NerveError;
use crate::graph::Graph;
use crate::node::llm::stateful::StatefulLLMNode;
use crate::node::llm::stateless::{Provider, StatelessLLMNode};
use crate::node::terminal::claude::ClaudeTerminalNode;
use crate::node::terminal::pty::PTYBackedNode;
use crate::node::terminal::wezterm::WezTermBackedNode;
use crate::node::{ExecError, NodeRef};
use crate::result::NodeResult;
use crate::session::Session;
use crate::workflow::run::RunState;
use crate::workflow::{start_run, Workflow, WorkflowContext};

/// Baseline timeout for an execute-node command; long-running AI terminal
/// sessions get [`EXTENDED_EXECUTE_TIMEOUT`] instead (spec.md §4.6 "Timeouts").
pub const BASELINE_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);
pub const EXTENDED_EXECUTE_TIMEOUT: Duration = Duration::from_secs(60 * 30);

/// `{type, params}` (spec.md §4.6 "Command envelope").
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub params: Value,
}

/// `{success, data?, error?}` (spec.md §4.6 "Command envelope").
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()) }
    }
}

fn param_str(params: &Value, key: &str) -> Result<String, String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing required param '{key}'"))
}

fn param_str_opt(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Owns every session known to this daemon instance and resolves the
/// session selector on session-scoped commands (spec.md §3 "Session also
/// owns a logical 'default'").
pub struct SessionManager {
    server_name: String,
    sessions: std::sync::RwLock<HashMap<String, Arc<Session>>>,
    default_session: std::sync::RwLock<Option<String>>,
    shutting_down: std::sync::atomic::AtomicBool,
}

impl SessionManager {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            sessions: std::sync::RwLock::new(HashMap::new()),
            default_session: std::sync::RwLock::new(None),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Creates and registers a session, making it the default if none exists yet
    /// (spec.md §3 "the first session created for a daemon answers commands
    /// that omit a session selector").
    pub fn create_session(&self, name: impl Into<String>) -> Arc<Session> {
        let name = name.into();
        let session = Arc::new(Session::new(name.clone(), self.server_name.clone()));
        self.sessions.write().unwrap().insert(name.clone(), session.clone());
        let mut default = self.default_session.write().unwrap();
        if default.is_none() {
            *default = Some(name);
        }
        session
    }

    /// Resolves a session by explicit id, or falls back to the default session,
    /// creating one lazily if the daemon has never had one.
    pub fn resolve(&self, session_id: Option<&str>) -> Result<Arc<Session>, String> {
        if let Some(id) = session_id {
            return self
                .sessions
                .read()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| format!("session '{id}' not found"));
        }
        let default = self.default_session.read().unwrap().clone();
        match default {
            Some(id) => Ok(self.sessions.read().unwrap().get(&id).cloned().expect("default session always registered")),
            None => Ok(self.create_session("default")),
        }
    }

    pub fn list(&self) -> Vec<Value> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .map(|s| {
                let (nodes, graphs, workflows, runs) = s.counts();
                json!({
                    "name": s.name(),
                    "server_name": s.server_name(),
                    "nodes": nodes,
                    "graphs": graphs,
                    "workflows": workflows,
                    "runs": runs,
                })
            })
            .collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Graceful shutdown (spec.md §4.6 "Graceful shutdown"): sets the flag so
    /// new commands are rejected, then stops every session's nodes/runs in
    /// reverse registration order.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, std::sync::atomic::Ordering::SeqCst);
        let sessions: Vec<Arc<Session>> = self.sessions.read().unwrap().values().cloned().collect();
        for session in sessions {
            session.stop().await;
        }
    }
}

/// Builds a node from a `CREATE_NODE` command. `backend` values are the exact
/// strings named by spec.md §6 "Node backend tags".
fn build_node(backend: &str, node_id: &str, params: &Value) -> Result<NodeRef, String> {
    match backend {
        "identity" => Ok(Arc::new(crate::node::identity::IdentityNode::new(node_id))),
        "bash" => {
            let mut node = crate::node::bash::BashNode::new(node_id);
            if let Some(cwd) = param_str_opt(params, "cwd") {
                node = node.with_cwd(cwd);
            }
            if let Some(timeout_ms) = params.get("bash_timeout").and_then(Value::as_u64) {
                node = node.with_timeout(Duration::from_millis(timeout_ms));
            }
            Ok(Arc::new(node))
        }
        "pty" => {
            let command = param_str_opt(params, "command").unwrap_or_default();
            let mut backend = crate::node::terminal::pty::PtyBackend::new(command);
            if let Some(cwd) = param_str_opt(params, "cwd") {
                backend = backend.with_cwd(cwd);
            }
            Ok(Arc::new(PTYBackedNode::with_backend(node_id, backend)))
        }
        "wezterm" => {
            let node = if let Some(pane_id) = param_str_opt(params, "pane_id") {
                WezTermBackedNode::attach(node_id, pane_id)
            } else {
                let command = param_str_opt(params, "command").unwrap_or_default();
                WezTermBackedNode::spawn(node_id, command)
            };
            Ok(Arc::new(node))
        }
        "claude-wezterm" => {
            let command = param_str(params, "command")?;
            let session_id = param_str_opt(params, "claude_session_id");
            let node = ClaudeTerminalNode::new_with_session(node_id, command, session_id).map_err(|e| e.to_string())?;
            Ok(Arc::new(node))
        }
        "openrouter" | "glm" => {
            let model = param_str(params, "llm_model")?;
            let api_key = param_str(params, "api_key")?;
            let provider = if backend == "glm" { Provider::Glm } else { Provider::OpenRouter };
            let mut node = StatelessLLMNode::new(node_id, provider, model, api_key);
            if let Some(base_url) = param_str_opt(params, "llm_base_url") {
                node = node.with_base_url(base_url);
            }
            Ok(Arc::new(node))
        }
        "llm-chat" => {
            let model = param_str(params, "llm_model")?;
            let api_key = param_str(params, "api_key")?;
            let provider = match param_str(params, "llm_provider")?.as_str() {
                "glm" => Provider::Glm,
                "openrouter" => Provider::OpenRouter,
                other => return Err(format!("unknown llm_provider '{other}'")),
            };
            let stateless = StatelessLLMNode::new(node_id, provider, model, api_key);
            let mut node = StatefulLLMNode::new(node_id, stateless);
            if let Some(prompt) = param_str_opt(params, "llm_system") {
                node = node.with_system_prompt(prompt);
            }
            Ok(Arc::new(node))
        }
        "suggestion" | "mcp" => Err(format!(
            "backend '{backend}' is a recognized tag with no corresponding §4.2 node variant in this core"
        )),
        other => Err(format!("unknown node backend '{other}'")),
    }
}

/// Routes a decoded [`Command`] to the right session operation and returns a
/// [`CommandResponse`] (spec.md §4.6 table). Transport layers own encoding.
pub async fn dispatch(manager: &SessionManager, command: Command) -> CommandResponse {
    if manager.is_shutting_down() && command.command_type != "PING" {
        return CommandResponse::err("daemon is shutting down");
    }

    let session_id = param_str_opt(&command.params, "session_id");
    let result = handle(manager, &command.command_type, &command.params, session_id.as_deref()).await;
    match result {
        Ok(data) => CommandResponse::ok(data),
        Err(e) => CommandResponse::err(e),
    }
}

async fn handle(manager: &SessionManager, command_type: &str, params: &Value, session_id: Option<&str>) -> Result<Value, String> {
    match command_type {
        "PING" => {
            let session = manager.resolve(session_id)?;
            let (nodes, graphs, workflows, runs) = session.counts();
            Ok(json!({"nodes": nodes, "graphs": graphs, "workflows": workflows, "runs": runs}))
        }
        "STOP" => {
            manager.shutdown().await;
            Ok(json!({"stopped": true}))
        }
        "GET_SESSION" => {
            let session = manager.resolve(session_id)?;
            let (nodes, graphs, workflows, runs) = session.counts();
            Ok(json!({"name": session.name(), "server_name": session.server_name(), "nodes": nodes, "graphs": graphs, "workflows": workflows, "runs": runs}))
        }
        "LIST_SESSIONS" => Ok(json!({"sessions": manager.list()})),
        "CREATE_NODE" => {
            let session = manager.resolve(session_id)?;
            let node_id = param_str(params, "node_id")?;
            let backend = param_str(params, "backend")?;
            let node = build_node(&backend, &node_id, params)?;
            session.register_node(node).map_err(|e| e.to_string())?;
            Ok(json!({"node_id": node_id}))
        }
        "DELETE_NODE" => {
            let session = manager.resolve(session_id)?;
            let node_id = param_str(params, "node_id")?;
            let deleted = session.delete_node(&node_id).await;
            Ok(json!({"deleted": deleted}))
        }
        "FORK_NODE" => {
            let session = manager.resolve(session_id)?;
            let source_id = param_str(params, "node_id")?;
            let target_id = param_str(params, "target_id")?;
            let source = session
                .get_node(&source_id)
                .ok_or_else(|| format!("node '{source_id}' not found"))?;
            let forkable = source
                .as_forkable()
                .ok_or_else(|| format!("node '{source_id}' does not support forking"))?;
            let forked = forkable.fork_into(&target_id).map_err(|e| e.to_string())?;
            session.register_node(forked).map_err(|e| e.to_string())?;
            Ok(json!({"node_id": target_id}))
        }
        "LIST_NODES" => {
            let session = manager.resolve(session_id)?;
            let infos: Vec<Value> = session
                .list_nodes()
                .into_iter()
                .map(|info| json!({"id": info.id, "type": info.node_type, "state": info.state, "metadata": info.metadata}))
                .collect();
            Ok(json!({"nodes": infos}))
        }
        "EXECUTE_INPUT" => {
            let session = manager.resolve(session_id)?;
            let node_id = param_str(params, "node_id")?;
            let text = param_str_opt(params, "input").unwrap_or_default();
            let node = session.get_node(&node_id).ok_or_else(|| format!("node '{node_id}' not found"))?;
            let ctx = ExecutionContext::new(Some(session.clone()), Value::String(text));
            let result = match node.as_ready_aware() {
                Some(ready_aware) => ready_aware.execute_when_ready(&ctx).await,
                None => node.execute(&ctx).await,
            }
            .map_err(exec_err_to_string)?;
            if result.node_id != node_id {
                return Err(format!("response node_id '{}' does not match request '{node_id}'", result.node_id));
            }
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "RUN_COMMAND" | "WRITE_DATA" | "GET_BUFFER" | "SEND_INTERRUPT" => {
            let session = manager.resolve(session_id)?;
            let node_id = param_str(params, "node_id")?;
            let node = session
                .get_node(&node_id)
                .or_else(|| session.get_graph(&node_id).map(|g| g as NodeRef))
                .ok_or_else(|| format!("node '{node_id}' not found"))?;
            match command_type {
                "SEND_INTERRUPT" => {
                    node.interrupt().await;
                    Ok(json!({"interrupted": true}))
                }
                _ => {
                    let text = param_str_opt(params, "data").unwrap_or_default();
                    let ctx = ExecutionContext::new(Some(session.clone()), Value::String(text));
                    let result = node.execute(&ctx).await.map_err(exec_err_to_string)?;
                    Ok(serde_json::to_value(result).unwrap_or(Value::Null))
                }
            }
        }
        "LIST_GRAPHS" => {
            let session = manager.resolve(session_id)?;
            Ok(json!({"graphs": session.list_graph_ids()}))
        }
        "RUN_GRAPH" => {
            let session = manager.resolve(session_id)?;
            let graph_id = param_str(params, "graph_id")?;
            let graph = session.get_graph(&graph_id).ok_or_else(|| format!("graph '{graph_id}' not found"))?;
            let input = params.get("input").cloned().unwrap_or(Value::Null);
            let ctx = ExecutionContext::new(Some(session.clone()), input);
            let result = graph.execute(&ctx).await.map_err(|e: NerveError| e.to_string())?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "LIST_WORKFLOWS" => {
            let session = manager.resolve(session_id)?;
            Ok(json!({"workflows": session.list_workflow_ids()}))
        }
        "EXECUTE_WORKFLOW" => {
            let session = manager.resolve(session_id)?;
            let workflow_id = param_str(params, "workflow_id")?;
            let workflow = session
                .get_workflow(&workflow_id)
                .ok_or_else(|| format!("workflow '{workflow_id}' not found"))?;
            let input = params.get("input").cloned().unwrap_or(Value::Null);
            let run_params = params.get("params").cloned().unwrap_or(Value::Null);
            let wait = params.get("wait").and_then(Value::as_bool).unwrap_or(false);

            let run = start_run(session.clone(), workflow, input, run_params).await;
            if wait {
                loop {
                    match run.state() {
                        RunState::Completed | RunState::Failed | RunState::Cancelled => break,
                        _ => tokio::time::sleep(Duration::from_millis(20)).await,
                    }
                }
                Ok(run.to_info())
            } else {
                Ok(json!({"run_id": run.id(), "state": run.state()}))
            }
        }
        "GET_WORKFLOW_RUN" => {
            let session = manager.resolve(session_id)?;
            let run_id = param_str(params, "run_id")?;
            let run = session.get_run(&run_id).ok_or_else(|| format!("run '{run_id}' not found"))?;
            Ok(run.to_info())
        }
        "ANSWER_GATE" => {
            let session = manager.resolve(session_id)?;
            let run_id = param_str(params, "run_id")?;
            let run = session.get_run(&run_id).ok_or_else(|| format!("run '{run_id}' not found"))?;
            let value = params.get("value").cloned().unwrap_or(Value::Null);
            run.answer_gate(value)?;
            Ok(json!({"answered": true}))
        }
        "CANCEL_WORKFLOW" => {
            let session = manager.resolve(session_id)?;
            let run_id = param_str(params, "run_id")?;
            let run = session.get_run(&run_id).ok_or_else(|| format!("run '{run_id}' not found"))?;
            run.cancel().await;
            Ok(json!({"cancelled": true}))
        }
        "EXECUTE_REPL_COMMAND" => {
            let session = manager.resolve(session_id)?;
            let verb = param_str(params, "verb")?;
            execute_repl_command(&session, &verb, params)
        }
        other => Err(format!("unrecognized command type '{other}'")),
    }
}

fn exec_err_to_string(e: ExecError) -> String {
    e.to_string()
}

/// Predefined REPL verbs executed server-side (spec.md §4.6 `EXECUTE_REPL_COMMAND`).
fn execute_repl_command(session: &Session, verb: &str, params: &Value) -> Result<Value, String> {
    match verb {
        "read" => {
            let node_id = param_str(params, "node_id")?;
            session
                .get_node(&node_id)
                .map(|n| serde_json::to_value(n.to_info()).unwrap_or(Value::Null))
                .ok_or_else(|| format!("node '{node_id}' not found"))
        }
        "show" => {
            let (nodes, graphs, workflows, runs) = session.counts();
            Ok(json!({"nodes": nodes, "graphs": graphs, "workflows": workflows, "runs": runs}))
        }
        "validate" => {
            let graph_id = param_str(params, "graph_id")?;
            let graph = session.get_graph(&graph_id).ok_or_else(|| format!("graph '{graph_id}' not found"))?;
            let errors = graph.validate();
            Ok(json!({"valid": errors.is_empty(), "errors": errors}))
        }
        "dry" => {
            let graph_id = param_str(params, "graph_id")?;
            let graph = session.get_graph(&graph_id).ok_or_else(|| format!("graph '{graph_id}' not found"))?;
            let order = graph.execution_order()?;
            Ok(json!({"execution_order": order}))
        }
        other => Err(format!("unrecognized REPL verb '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ping_returns_counts_for_default_session() {
        let manager = SessionManager::new("test-daemon");
        let response = dispatch(&manager, Command { command_type: "PING".into(), params: Value::Null }).await;
        assert!(response.success);
        assert_eq!(response.data.unwrap()["nodes"], json!(0));
    }

    #[tokio::test]
    async fn create_then_execute_then_list_nodes() {
        let manager = SessionManager::new("test-daemon");
        let create = dispatch(
            &manager,
            Command {
                command_type: "CREATE_NODE".into(),
                params: json!({"node_id": "echo", "backend": "identity"}),
            },
        )
        .await;
        assert!(create.success);

        let exec = dispatch(
            &manager,
            Command {
                command_type: "EXECUTE_INPUT".into(),
                params: json!({"node_id": "echo", "input": "hi"}),
            },
        )
        .await;
        assert!(exec.success);
        assert_eq!(exec.data.unwrap()["output"], json!("hi"));

        let list = dispatch(&manager, Command { command_type: "LIST_NODES".into(), params: Value::Null }).await;
        assert_eq!(list.data.unwrap()["nodes"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_node_then_execute_fails() {
        let manager = SessionManager::new("test-daemon");
        dispatch(
            &manager,
            Command { command_type: "CREATE_NODE".into(), params: json!({"node_id": "echo", "backend": "identity"}) },
        )
        .await;
        let delete = dispatch(&manager, Command { command_type: "DELETE_NODE".into(), params: json!({"node_id": "echo"}) }).await;
        assert!(delete.success);
        let exec = dispatch(
            &manager,
            Command { command_type: "EXECUTE_INPUT".into(), params: json!({"node_id": "echo", "input": "hi"}) },
        )
        .await;
        assert!(!exec.success);
    }

    #[tokio::test]
    async fn stop_rejects_subsequent_commands_except_ping() {
        let manager = SessionManager::new("test-daemon");
        let stop = dispatch(&manager, Command { command_type: "STOP".into(), params: Value::Null }).await;
        assert!(stop.success);
        let create = dispatch(
            &manager,
            Command { command_type: "CREATE_NODE".into(), params: json!({"node_id": "echo", "backend": "identity"}) },
        )
        .await;
        assert!(!create.success);
        let ping = dispatch(&manager, Command { command_type: "PING".into(), params: Value::Null }).await;
        assert!(ping.success);
    }
}
