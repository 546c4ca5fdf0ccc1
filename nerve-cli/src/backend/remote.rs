//! RemoteBackend: talks to a running daemon over its Unix socket, using the
//! same newline-delimited JSON envelope as `nerve-serve` (spec.md §6 "Wire
//! format (sockets)"). One connection per `send` call, matching the
//! command plane's "a client sends a command" framing.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use uuid::Uuid;

use nerve::command::{Command, CommandResponse};

use super::RunBackend;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RemoteBackend {
    socket_path: PathBuf,
}

impl RemoteBackend {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self { socket_path: socket_path.into() }
    }

    pub fn for_daemon(name: &str) -> Self {
        Self::new(nerve_serve::bookkeeping::socket_path(name))
    }
}

#[async_trait]
impl RunBackend for RemoteBackend {
    async fn send(&self, command: Command) -> CommandResponse {
        match self.send_inner(command).await {
            Ok(response) => response,
            Err(e) => CommandResponse::err(e),
        }
    }
}

impl RemoteBackend {
    async fn send_inner(&self, command: Command) -> Result<CommandResponse, String> {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| "connect timed out".to_string())?
            .map_err(|e| format!("connect to daemon failed: {e}"))?;

        let id = Uuid::new_v4().to_string();
        let mut line = serde_json::json!({"id": id, "type": command.command_type, "params": command.params}).to_string();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;

        let (read_half, _) = stream.split();
        let mut lines = BufReader::new(read_half).lines();
        let response_line = lines
            .next_line()
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "daemon closed the connection without a reply".to_string())?;

        let parsed: serde_json::Value = serde_json::from_str(&response_line).map_err(|e| e.to_string())?;
        Ok(CommandResponse {
            success: parsed["success"].as_bool().unwrap_or(false),
            data: parsed.get("data").cloned(),
            error: parsed.get("error").and_then(|v| v.as_str()).map(str::to_string),
        })
    }
}
