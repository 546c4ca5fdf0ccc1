//! Thin Nerve client: a [`RunBackend`] abstraction with a [`LocalBackend`]
//! (in-process session) and a [`RemoteBackend`] (talks to a running daemon
//! over its Unix socket) (SPEC_FULL.md §A.4).

pub mod backend;
pub mod repl;

pub use backend::{LocalBackend, RemoteBackend, RunBackend};

use nerve::command::{Command, CommandResponse};
use serde_json::Value;

/// Builds a `CREATE_NODE` command from the exact backend tags of spec.md §6.
pub fn create_node_command(node_id: &str, backend: &str, params: Value) -> Command {
    let mut full = params;
    if !full.is_object() {
        full = serde_json::json!({});
    }
    full["node_id"] = Value::String(node_id.to_string());
    full["backend"] = Value::String(backend.to_string());
    Command { command_type: "CREATE_NODE".to_string(), params: full }
}

/// Builds an `EXECUTE_INPUT` command.
pub fn execute_input_command(node_id: &str, input: impl Into<String>) -> Command {
    Command {
        command_type: "EXECUTE_INPUT".to_string(),
        params: serde_json::json!({"node_id": node_id, "input": input.into()}),
    }
}

/// `0` on success, `1` on any command failure (spec.md §6 "Exit codes").
pub fn exit_code(response: &CommandResponse) -> i32 {
    if response.success {
        0
    } else {
        1
    }
}
