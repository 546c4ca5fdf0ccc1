//! LocalBackend: dispatch commands in-process against an embedded
//! [`SessionManager`], no transport involved. Used for embedding/tests.

use async_trait::async_trait;
use nerve::command::{Command, CommandResponse, SessionManager};

use super::RunBackend;

pub struct LocalBackend {
    manager: SessionManager,
}

impl LocalBackend {
    pub fn new(server_name: impl Into<String>) -> Self {
        let manager = SessionManager::new(server_name);
        manager.create_session("default");
        Self { manager }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }
}

#[async_trait]
impl RunBackend for LocalBackend {
    async fn send(&self, command: Command) -> CommandResponse {
        nerve::command::dispatch(&self.manager, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn ping_round_trips_through_local_backend() {
        let backend = LocalBackend::new("test");
        let response = backend.send(Command { command_type: "PING".into(), params: Value::Null }).await;
        assert!(response.success);
        assert_eq!(response.data.unwrap()["nodes"], json!(0));
    }
}
