//! ClaudeTerminalNode: wraps a PTY-backed terminal, enforcing the "claude"
//! command guard, execution serialization, Claude session-id bookkeeping,
//! and fork (spec.md §4.2 "ClaudeTerminalNode (wrapper)").

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::NerveError;
use crate::node::terminal::pty::PtyBackend;
use crate::node::terminal::TerminalCore;
use crate::node::{ExecError, Node, NodeInfo, NodeState};
use crate::result::NodeResult;

const CLAUDE_POLL_INTERVAL: Duration = Duration::from_millis(300);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60 * 30);

/// Strips `--session-id X`, `--resume X`, and bare `--fork-session` from a
/// shell-lexed command line, preserving other tokens and shell operators like
/// `&&` (SPEC_FULL.md §C.1, spec.md §8 boundary behaviour).
pub fn extract_base_command(cmd: &str) -> String {
    let tokens = shell_words::split(cmd).unwrap_or_else(|_| vec![cmd.to_string()]);
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i].as_str() {
            "--session-id" | "--resume" => {
                i += if i + 1 < tokens.len() { 2 } else { 1 };
            }
            "--fork-session" => {
                i += 1;
            }
            _ => {
                out.push(tokens[i].clone());
                i += 1;
            }
        }
    }
    shell_words::join(out)
}

/// Returns the value following `--session-id` in a shell-lexed command, if any.
pub fn extract_session_id(cmd: &str) -> Option<String> {
    let tokens = shell_words::split(cmd).ok()?;
    tokens
        .iter()
        .position(|t| t == "--session-id")
        .and_then(|i| tokens.get(i + 1))
        .cloned()
}

fn with_session_id(base_command: &str, session_id: &str) -> String {
    format!("{base_command} --session-id {session_id}")
}

pub struct ClaudeTerminalNode {
    id: String,
    core: TerminalCore<PtyBackend>,
    command: RwLock<String>,
    claude_session_id: RwLock<String>,
    cwd: Option<PathBuf>,
    proxy_url: Option<String>,
    ready_timeout: Duration,
    response_timeout: Duration,
    forked_from: Option<String>,
    fork_timestamp_ms: Option<u128>,
}

impl ClaudeTerminalNode {
    /// Rejects construction if `command` does not contain "claude"
    /// (case-insensitive) — spec.md §4.2 "Command guard".
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Result<Self, NerveError> {
        Self::new_with_session(id, command, None)
    }

    pub fn new_with_session(
        id: impl Into<String>,
        command: impl Into<String>,
        explicit_session_id: Option<String>,
    ) -> Result<Self, NerveError> {
        let id = id.into();
        let command = command.into();
        if !command.to_lowercase().contains("claude") {
            return Err(NerveError::InvalidRequest(format!(
                "claude terminal command must contain 'claude': {command}"
            )));
        }

        // Session id: explicit override, else extracted from the command, else generated.
        let session_id = explicit_session_id
            .or_else(|| extract_session_id(&command))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let base = extract_base_command(&command);
        let normalized_command = with_session_id(&base, &session_id);

        let backend = PtyBackend::new(normalized_command.clone());
        let core = TerminalCore::new(id.clone(), "claude_pty", backend, CLAUDE_POLL_INTERVAL)
            .with_write_mode(crate::node::terminal::WriteMode::ClaudeInsert)
            .with_response_timeout(DEFAULT_RESPONSE_TIMEOUT);

        Ok(Self {
            id,
            core,
            command: RwLock::new(normalized_command),
            claude_session_id: RwLock::new(session_id),
            cwd: None,
            proxy_url: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            forked_from: None,
            fork_timestamp_ms: None,
        })
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self.core = self.core.with_response_timeout(timeout);
        self
    }

    pub fn command(&self) -> String {
        self.command.read().unwrap().clone()
    }

    pub fn claude_session_id(&self) -> String {
        self.claude_session_id.read().unwrap().clone()
    }

    /// Polls readiness before writing, then runs the normal execute
    /// (spec.md §4.2 `execute_when_ready`).
    pub async fn execute_when_ready(&self, ctx: &ExecutionContext, ready_timeout: Duration) -> Result<NodeResult, ExecError> {
        self.core.ensure_started().await.ok();
        self.core.wait_until_ready(ready_timeout).await;
        self.core.execute(ctx, None).await
    }

    /// Creates a sibling node whose command resumes this node's Claude
    /// session under a fresh session id (spec.md §4.2 "Fork").
    ///
    /// Validates the source has a session id before any other side effect
    /// (SPEC_FULL.md §C.3); in this implementation the session id is always
    /// populated at construction, so this guards against a cleared/empty value.
    pub fn fork(&self, target_id: impl Into<String>) -> Result<ClaudeTerminalNode, NerveError> {
        let source_session_id = self.claude_session_id();
        if source_session_id.trim().is_empty() {
            return Err(NerveError::InvalidRequest(
                "cannot fork a claude terminal with no session id".to_string(),
            ));
        }

        let target_id = target_id.into();
        let base = extract_base_command(&self.command());
        let new_session_id = Uuid::new_v4().to_string();
        let forked_command = format!("{base} --resume {source_session_id} --fork-session --session-id {new_session_id}");

        let mut forked = ClaudeTerminalNode::new_with_session(target_id, forked_command, Some(new_session_id))?;
        forked.cwd = self.cwd.clone();
        forked.proxy_url = self.proxy_url.clone();
        forked.ready_timeout = self.ready_timeout;
        forked = forked.with_response_timeout(self.response_timeout);
        if let Some(cwd) = &forked.cwd {
            forked.core = TerminalCore::new(
                forked.id.clone(),
                "claude_pty",
                PtyBackend::new(forked.command()).with_cwd(cwd.clone()),
                CLAUDE_POLL_INTERVAL,
            )
            .with_write_mode(crate::node::terminal::WriteMode::ClaudeInsert)
            .with_response_timeout(forked.response_timeout);
        }
        forked.forked_from = Some(self.id.clone());
        forked.fork_timestamp_ms = Some(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_millis(),
        );
        Ok(forked)
    }
}

#[async_trait]
impl Node for ClaudeTerminalNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &str {
        "claude_wezterm"
    }

    fn persistent(&self) -> bool {
        true
    }

    fn state(&self) -> NodeState {
        self.core.state()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeResult, ExecError> {
        self.core.execute(ctx, None).await
    }

    async fn interrupt(&self) {
        self.core.interrupt().await;
    }

    async fn stop(&self) {
        self.core.stop().await;
    }

    fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: self.node_type().to_string(),
            state: self.state(),
            persistent: true,
            metadata: json!({
                "command": self.command(),
                "claude_session_id": self.claude_session_id(),
                "forked_from": self.forked_from,
                "fork_timestamp_ms": self.fork_timestamp_ms,
            }),
        }
    }

    fn as_forkable(&self) -> Option<&dyn crate::node::Forkable> {
        Some(self)
    }

    fn as_ready_aware(&self) -> Option<&dyn crate::node::ReadyAware> {
        Some(self)
    }
}

impl crate::node::Forkable for ClaudeTerminalNode {
    fn fork_into(&self, target_id: &str) -> Result<crate::node::NodeRef, NerveError> {
        self.fork(target_id).map(|node| std::sync::Arc::new(node) as crate::node::NodeRef)
    }
}

#[async_trait]
impl crate::node::ReadyAware for ClaudeTerminalNode {
    async fn execute_when_ready(&self, ctx: &ExecutionContext) -> Result<NodeResult, ExecError> {
        self.execute_when_ready(ctx, self.ready_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_command_without_claude() {
        let err = ClaudeTerminalNode::new("c", "bash -lc echo hi");
        assert!(err.is_err());
    }

    #[test]
    fn construction_adds_exactly_one_session_id() {
        let node = ClaudeTerminalNode::new("c", "claude --dangerously-skip-permissions").unwrap();
        let cmd = node.command();
        let count = cmd.matches("--session-id").count();
        assert_eq!(count, 1);
    }

    #[test]
    fn extract_base_command_strips_session_flags_and_keeps_operators() {
        let cmd = "claude --session-id abc --resume xyz --fork-session && echo done";
        let base = extract_base_command(cmd);
        assert!(!base.contains("--session-id"));
        assert!(!base.contains("--resume"));
        assert!(!base.contains("--fork-session"));
        assert!(base.contains("&&"));
        assert!(base.contains("echo"));
    }

    #[test]
    fn fork_produces_resume_and_new_session_id() {
        let src = ClaudeTerminalNode::new("src", "claude --dangerously-skip-permissions").unwrap();
        let src_session = src.claude_session_id();
        let child = src.fork("child").unwrap();
        let child_cmd = child.command();
        assert!(child_cmd.contains(&format!("--resume {src_session}")));
        assert!(child_cmd.contains("--fork-session"));
        assert_ne!(child.claude_session_id(), src_session);
        assert_eq!(child_cmd.matches("--session-id").count(), 1);
    }

    #[test]
    fn explicit_session_id_is_extracted_when_present() {
        let node = ClaudeTerminalNode::new("c", "claude --session-id 11111111-1111-1111-1111-111111111111").unwrap();
        assert_eq!(node.claude_session_id(), "11111111-1111-1111-1111-111111111111");
    }
}
