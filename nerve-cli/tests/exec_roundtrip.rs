//! End-to-end check of the backend abstraction against an in-process
//! session: create a node over the command plane, then execute input
//! against it, the same path `nerve exec` drives.

use nerve_cli::{create_node_command, execute_input_command, exit_code, LocalBackend, RunBackend};

#[tokio::test]
async fn create_then_execute_identity_node_round_trips() {
    let backend = LocalBackend::new("exec-roundtrip-test");

    let create = backend
        .send(create_node_command("echo", "identity", serde_json::json!({})))
        .await;
    assert!(create.success, "{:?}", create.error);

    let response = backend.send(execute_input_command("echo", "hello")).await;
    assert!(response.success);
    assert_eq!(exit_code(&response), 0);
    assert_eq!(response.data.unwrap()["output"], "hello");
}

#[tokio::test]
async fn executing_an_unknown_node_fails_with_nonzero_exit() {
    let backend = LocalBackend::new("exec-roundtrip-test-missing");
    let response = backend.send(execute_input_command("does-not-exist", "hi")).await;
    assert!(!response.success);
    assert_eq!(exit_code(&response), 1);
}
