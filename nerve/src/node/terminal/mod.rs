//! Terminal nodes — shared execution algorithm (spec.md §4.2 "Terminal
//! nodes — shared execution algorithm"). Concrete backend processes (PTY
//! subprocess spawning, WezTerm CLI integration) are the collaborator
//! described only by the `TerminalBackend` interface (spec.md §1); this
//! module owns the polling/write/parse algorithm shared by every variant.

pub mod claude;
pub mod pty;
pub mod wezterm;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::context::ExecutionContext;
use crate::error::ErrorType;
use crate::history::{HistoryLogger, HistoryOp};
use crate::node::{check_preconditions, ExecError, Node, NodeState};
use crate::result::NodeResult;
use crate::types::{ParserRef, PlainParser};

/// External collaborator contract assumed by the core (spec.md §1): `start`,
/// `stop`, `write`, `read_stream`/`buffer`, `read_tail`.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    async fn start(&self) -> Result<(), String>;
    async fn stop(&self);
    async fn write(&self, data: &str) -> Result<(), String>;
    /// Full buffer accumulated since `start` (PTY: cached and appended to by a
    /// background reader; WezTerm: freshly queried every call — spec.md §4.2).
    async fn buffer(&self) -> String;

    /// The slice of `buffer()` from char offset `since` onward.
    async fn read_tail(&self, since: usize) -> String {
        let buf = self.buffer().await;
        buf.chars().skip(since).collect()
    }
}

/// Shared ready-detection primitive (SPEC_FULL.md §C.7): poll at `interval`
/// until two consecutive positive samples, confirmed by a short extra sleep,
/// used both by the terminal ready loop and `ClaudeTerminalNode::execute_when_ready`.
pub async fn poll_until_ready<F, Fut>(interval: Duration, timeout: Duration, mut is_ready_now: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    let mut consecutive = 0;
    loop {
        if is_ready_now().await {
            consecutive += 1;
            if consecutive >= 2 {
                tokio::time::sleep(interval / 3).await;
                return true;
            }
        } else {
            consecutive = 0;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// How input is sequenced before the ready loop (spec.md §4.2: "per-parser
/// sequencing — e.g. the Claude parser requires INSERT-mode keystrokes
/// followed by Escape then Enter on PTY, and plain text plus carriage return
/// on external terminals").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    ClaudeInsert,
    PlainCr,
}

impl WriteMode {
    fn format(&self, input: &str) -> String {
        match self {
            WriteMode::ClaudeInsert => format!("{input}\x1b\r"),
            WriteMode::PlainCr => format!("{input}\r"),
        }
    }
}

/// Shared state and execution algorithm for every terminal node variant.
/// Generic over the backend so `PTYBackedNode`/`WezTermBackedNode` are thin
/// aliases that only differ in backend construction and polling constants.
pub struct TerminalCore<B: TerminalBackend> {
    id: String,
    node_type: &'static str,
    backend: B,
    parser: RwLock<ParserRef>,
    write_mode: WriteMode,
    poll_interval: Duration,
    response_timeout: Duration,
    state: RwLock<NodeState>,
    history: Option<Arc<HistoryLogger>>,
    buffer_start: AtomicUsize,
    execute_lock: tokio::sync::Mutex<()>,
}

impl<B: TerminalBackend> TerminalCore<B> {
    pub fn new(id: impl Into<String>, node_type: &'static str, backend: B, poll_interval: Duration) -> Self {
        Self {
            id: id.into(),
            node_type,
            backend,
            parser: RwLock::new(Arc::new(PlainParser)),
            write_mode: WriteMode::PlainCr,
            poll_interval,
            response_timeout: Duration::from_secs(120),
            state: RwLock::new(NodeState::Starting),
            history: None,
            buffer_start: AtomicUsize::new(0),
            execute_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_parser(self, parser: ParserRef) -> Self {
        *self.parser.write().unwrap() = parser;
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_history(mut self, history: Arc<HistoryLogger>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn set_parser(&self, parser: ParserRef) {
        *self.parser.write().unwrap() = parser;
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn ensure_started(&self) -> Result<(), String> {
        if *self.state.read().unwrap() == NodeState::Starting {
            self.backend.start().await?;
            *self.state.write().unwrap() = NodeState::Ready;
        }
        Ok(())
    }

    /// Polls `parser.is_ready(full buffer)` with two-consecutive-positive
    /// confirmation, up to `ready_timeout` (spec.md §4.2
    /// `execute_when_ready`, shared with the plain ready loop).
    pub async fn wait_until_ready(&self, ready_timeout: Duration) -> bool {
        let backend = &self.backend;
        let parser = self.parser.read().unwrap().clone();
        poll_until_ready(self.poll_interval, ready_timeout, || async {
            let buf = backend.buffer().await;
            parser.is_ready(&buf)
        })
        .await
    }

    pub async fn execute(&self, ctx: &ExecutionContext, input_override: Option<&str>) -> Result<NodeResult, ExecError> {
        check_preconditions(ctx)?;
        let _guard = self.execute_lock.lock().await;

        let input = input_override.map(|s| s.to_string()).unwrap_or_else(|| {
            ctx.input.as_str().map(|s| s.to_string()).unwrap_or_else(|| ctx.input.to_string())
        });
        let input_value = serde_json::Value::String(input.clone());

        if *self.state.read().unwrap() == NodeState::Stopped {
            return Ok(NodeResult::err(
                self.node_type,
                &self.id,
                input_value,
                "node is stopped",
                ErrorType::NodeStopped,
            ));
        }

        if let Err(e) = self.ensure_started().await {
            return Ok(NodeResult::err(self.node_type, &self.id, input_value, e, ErrorType::InternalError));
        }

        *self.state.write().unwrap() = NodeState::Busy;
        let ts_start = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_millis();

        let pre_buffer = self.backend.buffer().await;
        let start_offset = pre_buffer.chars().count();
        self.buffer_start.store(start_offset, Ordering::SeqCst);

        let parser = self.parser.read().unwrap().clone();
        let sequenced = self.write_mode.format(&input);
        if let Err(e) = self.backend.write(&sequenced).await {
            *self.state.write().unwrap() = NodeState::Ready;
            return Ok(NodeResult::err(self.node_type, &self.id, input_value, e, ErrorType::InternalError));
        }

        let timeout = ctx.timeout.unwrap_or(self.response_timeout);
        let ready = self.wait_until_ready(timeout).await;

        if !ready {
            *self.state.write().unwrap() = NodeState::Ready;
            let result = NodeResult::err(
                self.node_type,
                &self.id,
                input_value,
                format!("timed out after {}ms waiting for response", timeout.as_millis()),
                ErrorType::Timeout,
            );
            self.log_history(ts_start, &input, None, start_offset).await;
            return Ok(result);
        }

        let tail = self.backend.read_tail(start_offset).await;
        let parsed = parser.parse(&tail);
        *self.state.write().unwrap() = NodeState::Ready;

        let sections_json: Vec<serde_json::Value> = parsed
            .sections
            .iter()
            .map(|s| json!({"name": s.name, "content": s.content}))
            .collect();
        let output = serde_json::Value::String(parsed.output_text());
        let result = NodeResult::ok(self.node_type, &self.id, input_value, output)
            .with_attributes(json!({"sections": sections_json}));

        self.log_history(ts_start, &input, Some(&parsed), start_offset).await;
        Ok(result)
    }

    async fn log_history(
        &self,
        ts_start: u128,
        input: &str,
        response: Option<&crate::types::ParsedResponse>,
        preceding_buffer_seq: usize,
    ) {
        if let Some(history) = &self.history {
            let ts_end = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_millis();
            let response_json = response.map(|r| serde_json::to_value(r).unwrap_or_default());
            let lines = response.map(|r| r.raw.lines().count());
            let _ = history
                .append(HistoryOp::Send, ts_start, ts_end, Some(input.to_string()), response_json, lines, Some(preceding_buffer_seq))
                .await;
        }
    }

    pub async fn interrupt(&self) {
        self.backend.stop().await;
    }

    pub async fn stop(&self) {
        *self.state.write().unwrap() = NodeState::Stopped;
        self.backend.stop().await;
    }

    pub fn state(&self) -> NodeState {
        *self.state.read().unwrap()
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct MockBackend {
        buf: Arc<StdMutex<String>>,
    }

    #[async_trait]
    impl TerminalBackend for MockBackend {
        async fn start(&self) -> Result<(), String> {
            Ok(())
        }
        async fn stop(&self) {}
        async fn write(&self, data: &str) -> Result<(), String> {
            self.buf.lock().unwrap().push_str(data);
            self.buf.lock().unwrap().push_str(" [reply]");
            Ok(())
        }
        async fn buffer(&self) -> String {
            self.buf.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn executes_and_captures_tail_since_send() {
        let backend = MockBackend { buf: Arc::new(StdMutex::new("prompt> ".to_string())) };
        let core = TerminalCore::new("term", "plain", backend, Duration::from_millis(5));
        let ctx = ExecutionContext::new(None, serde_json::Value::String("hi".to_string()));
        let result = core.execute(&ctx, None).await.unwrap();
        assert!(result.success);
        assert!(result.output.as_str().unwrap().contains("hi"));
    }
}
