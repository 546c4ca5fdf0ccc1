//! WezTermBackedNode: attaches to or spawns an external `wezterm` pane
//! (spec.md §4.2 "WezTerm backend nuances"). The buffer is never cached —
//! every read shells out to `wezterm cli get-text` — and polling is 2s to
//! respect the external subprocess overhead.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::context::ExecutionContext;
use crate::node::terminal::{TerminalBackend, TerminalCore};
use crate::node::{ExecError, Node, NodeInfo, NodeState};
use crate::result::NodeResult;

const WEZTERM_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct WezTermBackend {
    pane_id: std::sync::RwLock<Option<String>>,
    command: Option<String>,
    cwd: Option<std::path::PathBuf>,
}

impl WezTermBackend {
    /// Spawns a new pane running `command`.
    pub fn spawn(command: impl Into<String>) -> Self {
        Self {
            pane_id: std::sync::RwLock::new(None),
            command: Some(command.into()),
            cwd: None,
        }
    }

    /// Attaches to an existing pane (spec.md §4.2 "`attach(pane_id)` is an
    /// alternate constructor").
    pub fn attach(pane_id: impl Into<String>) -> Self {
        Self {
            pane_id: std::sync::RwLock::new(Some(pane_id.into())),
            command: None,
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<std::path::PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn pane_id(&self) -> Option<String> {
        self.pane_id.read().unwrap().clone()
    }

    async fn run_wezterm(&self, args: &[&str]) -> Result<String, String> {
        let mut cmd = Command::new("wezterm");
        cmd.arg("cli").args(args);
        let output = cmd.output().await.map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl TerminalBackend for WezTermBackend {
    async fn start(&self) -> Result<(), String> {
        if self.pane_id().is_some() {
            return Ok(());
        }
        let command = self.command.clone().ok_or("no command or pane_id configured")?;
        let mut args = vec!["spawn".to_string()];
        if let Some(cwd) = &self.cwd {
            args.push("--cwd".to_string());
            args.push(cwd.display().to_string());
        }
        args.push("--".to_string());
        args.extend(shell_words::split(&command).map_err(|e| e.to_string())?);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run_wezterm(&arg_refs).await?;
        let pane_id = out.trim().to_string();
        *self.pane_id.write().unwrap() = Some(pane_id);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(pane_id) = self.pane_id() {
            let _ = self.run_wezterm(&["kill-pane", "--pane-id", &pane_id]).await;
        }
    }

    async fn write(&self, data: &str) -> Result<(), String> {
        let pane_id = self.pane_id().ok_or("pane not started")?;
        self.run_wezterm(&["send-text", "--pane-id", &pane_id, "--no-paste", data])
            .await
            .map(|_| ())
    }

    async fn buffer(&self) -> String {
        let Some(pane_id) = self.pane_id() else {
            return String::new();
        };
        self.run_wezterm(&["get-text", "--pane-id", &pane_id]).await.unwrap_or_default()
    }
}

/// `WezTermBackedNode` per spec.md §3/§4.2.
pub struct WezTermBackedNode(TerminalCore<WezTermBackend>);

impl WezTermBackedNode {
    pub fn spawn(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self(TerminalCore::new(id, "wezterm", WezTermBackend::spawn(command), WEZTERM_POLL_INTERVAL))
    }

    pub fn attach(id: impl Into<String>, pane_id: impl Into<String>) -> Self {
        Self(TerminalCore::new(id, "wezterm", WezTermBackend::attach(pane_id), WEZTERM_POLL_INTERVAL))
    }

    pub fn core(&self) -> &TerminalCore<WezTermBackend> {
        &self.0
    }
}

#[async_trait]
impl Node for WezTermBackedNode {
    fn id(&self) -> &str {
        self.0.id()
    }

    fn node_type(&self) -> &str {
        "wezterm"
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
