//! PTYBackedNode: owns a subprocess via pseudo-terminal; a background reader
//! continuously appends to a growing buffer (spec.md §4.2 "PTY backend
//! nuances"). Polling interval ~0.3s.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};

use crate::context::ExecutionContext;
use crate::node::terminal::{TerminalBackend, TerminalCore};
use crate::node::{ExecError, Node, NodeInfo, NodeState};
use crate::result::NodeResult;

const PTY_POLL_INTERVAL: Duration = Duration::from_millis(300);

pub struct PtyBackend {
    command: String,
    cwd: Option<std::path::PathBuf>,
    env: Vec<(String, String)>,
    buffer: Arc<Mutex<String>>,
    writer: Mutex<Option<Box<dyn std::io::Write + Send>>>,
    child: Mutex<Option<Box<dyn portable_pty::Child + Send + Sync>>>,
    master: Mutex<Option<Box<dyn portable_pty::MasterPty + Send>>>,
}

impl PtyBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: Vec::new(),
            buffer: Arc::new(Mutex::new(String::new())),
            writer: Mutex::new(None),
            child: Mutex::new(None),
            master: Mutex::new(None),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<std::path::PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl TerminalBackend for PtyBackend {
    async fn start(&self) -> Result<(), String> {
        let command = self.command.clone();
        let cwd = self.cwd.clone();
        let env = self.env.clone();
        let buffer = self.buffer.clone();

        let (master, child, writer) = tokio::task::spawn_blocking(move || -> Result<_, String> {
            let pty_system = native_pty_system();
            let pair = pty_system
                .openpty(PtySize { rows: 40, cols: 160, pixel_width: 0, pixel_height: 0 })
                .map_err(|e| e.to_string())?;

            let mut parts = shell_words::split(&command).map_err(|e| e.to_string())?;
            if parts.is_empty() {
                return Err("empty command".to_string());
            }
            let program = parts.remove(0);
            let mut cmd = CommandBuilder::new(program);
            cmd.args(parts);
            if let Some(cwd) = cwd {
                cmd.cwd(cwd);
            }
            for (k, v) in env {
                cmd.env(k, v);
            }

            let child = pair.slave.spawn_command(cmd).map_err(|e| e.to_string())?;
            let reader = pair.master.try_clone_reader().map_err(|e| e.to_string())?;
            let writer = pair.master.take_writer().map_err(|e| e.to_string())?;

            std::thread::spawn(move || {
                let mut reader = reader;
                let mut chunk = [0u8; 4096];
                loop {
                    match reader.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            let text = String::from_utf8_lossy(&chunk[..n]);
                            buffer.lock().unwrap().push_str(&text);
                        }
                        Err(_) => break,
                    }
                }
            });

            Ok((pair.master, child, writer))
        })
        .await
        .map_err(|e| e.to_string())??;

        *self.writer.lock().unwrap() = Some(writer);
        *self.child.lock().unwrap() = Some(child);
        *self.master.lock().unwrap() = Some(master);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.kill();
        }
        *self.writer.lock().unwrap() = None;
        *self.master.lock().unwrap() = None;
    }

    async fn write(&self, data: &str) -> Result<(), String> {
        let mut guard = self.writer.lock().unwrap();
        let writer = guard.as_mut().ok_or("pty not started")?;
        writer.write_all(data.as_bytes()).map_err(|e| e.to_string())?;
        writer.flush().map_err(|e| e.to_string())
    }

    async fn buffer(&self) -> String {
        self.buffer.lock().unwrap().clone()
    }
}

/// `PTYBackedNode` per spec.md §3/§4.2: terminal node owning a PTY-spawned
/// subprocess, polling for readiness every ~0.3s.
pub struct PTYBackedNode(TerminalCore<PtyBackend>);

impl PTYBackedNode {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self(TerminalCore::new(id, "pty", PtyBackend::new(command), PTY_POLL_INTERVAL))
    }

    pub fn with_backend(id: impl Into<String>, backend: PtyBackend) -> Self {
        Self(TerminalCore::new(id, "pty", backend, PTY_POLL_INTERVAL))
    }

    pub fn core(&self) -> &TerminalCore<PtyBackend> {
        &self.0
    }
}

#[async_trait]
impl Node for PTYBackedNode {
    fn id(&self) -> &str {
        self.0.id()
    }

    fn node_type(&self) -> &str {
        "pty"
    }

    fn persistent(&self) -> bool {
        true
    }

    fn state(&self) -> NodeState {
        self.0.state()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeResult, ExecError> {
        self.0.execute(ctx, None).await
    }

    async fn interrupt(&self) {
        self.0.interrupt().await;
    }

    async fn stop(&self) {
        self.0.stop().await;
    }

    fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id().to_string(),
            node_type: self.node_type().to_string(),
            state: self.state(),
            persistent: true,
            metadata: serde_json::json!({}),
        }
    }
}
