//! Execution context: the request-scoped dependency bundle threaded through every
//! `execute` call (spec.md §3 "ExecutionContext", §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{BudgetExceededError, CancelledError};
use crate::session::Session;
use crate::types::ParserRef;

/// One-shot cooperative cancellation token, shared between a context and every
/// context derived from it (spec.md §5 "Cancellation").
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled. Polling, not signal-driven, to
    /// match this crate's other wait loops (e.g. daemon shutdown).
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Budget caps plus running counters, shared between a context and its
/// derivations so a parent and its children observe the same totals.
#[derive(Clone)]
pub struct Budget {
    steps: Arc<AtomicU64>,
    tokens: Arc<AtomicU64>,
    started: std::time::Instant,
    max_steps: Option<u64>,
    max_tokens: Option<u64>,
    max_elapsed: Option<Duration>,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            steps: Arc::new(AtomicU64::new(0)),
            tokens: Arc::new(AtomicU64::new(0)),
            started: std::time::Instant::now(),
            max_steps: None,
            max_tokens: None,
            max_elapsed: None,
        }
    }
}

impl Budget {
    pub fn new(max_steps: Option<u64>, max_tokens: Option<u64>, max_elapsed: Option<Duration>) -> Self {
        Self {
            max_steps,
            max_tokens,
            max_elapsed,
            ..Default::default()
        }
    }

    pub fn add_step(&self) {
        self.steps.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_tokens(&self, n: u64) {
        self.tokens.fetch_add(n, Ordering::SeqCst);
    }

    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Raises `BudgetExceededError` if any configured cap would be (or already is) violated.
    pub fn check(&self) -> Result<(), BudgetExceededError> {
        if let Some(max) = self.max_steps {
            if self.steps() >= max {
                return Err(BudgetExceededError(format!("step budget exceeded: {}/{}", self.steps(), max)));
            }
        }
        if let Some(max) = self.max_tokens {
            if self.tokens() >= max {
                return Err(BudgetExceededError(format!("token budget exceeded: {}/{}", self.tokens(), max)));
            }
        }
        if let Some(max) = self.max_elapsed {
            if self.started.elapsed() >= max {
                return Err(BudgetExceededError(format!(
                    "time budget exceeded: {}ms/{}ms",
                    self.elapsed_ms(),
                    max.as_millis()
                )));
            }
        }
        Ok(())
    }
}

/// One recorded step of a graph run (spec.md §4.3).
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepTrace {
    pub step_id: String,
    pub node_id: String,
    pub node_type: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub start_time_ms: u128,
    pub end_time_ms: u128,
    pub duration_ms: f64,
}

/// Append-only trace accumulator shared across a run's derived contexts.
#[derive(Clone, Default)]
pub struct Trace(Arc<std::sync::Mutex<TraceInner>>);

#[derive(Default)]
struct TraceInner {
    status: String,
    steps: Vec<StepTrace>,
    error: Option<String>,
}

impl Trace {
    pub fn new() -> Self {
        Self(Arc::new(std::sync::Mutex::new(TraceInner {
            status: "pending".to_string(),
            steps: Vec::new(),
            error: None,
        })))
    }

    pub fn set_running(&self) {
        self.0.lock().unwrap().status = "running".to_string();
    }

    pub fn add_step(&self, step: StepTrace) {
        self.0.lock().unwrap().steps.push(step);
    }

    pub fn complete(&self, error: Option<String>) {
        let mut inner = self.0.lock().unwrap();
        inner.status = if error.is_some() { "failed".to_string() } else { "complete".to_string() };
        inner.error = error;
    }

    pub fn steps(&self) -> Vec<StepTrace> {
        self.0.lock().unwrap().steps.clone()
    }

    pub fn status(&self) -> String {
        self.0.lock().unwrap().status.clone()
    }
}

/// Structured per-run logging keys, used to correlate graph/workflow/node events.
#[derive(Clone, Default)]
pub struct RunLogger {
    pub run_id: Option<String>,
}

/// Request-scoped dependency bundle threaded through every `execute` call.
///
/// Immutable in the sense that mutating methods (`with_input`, `with_upstream`,
/// `with_parser`) return a new context; `cancellation`, `budget`, and `trace`
/// are shared references so parent and derived contexts observe the same signals.
#[derive(Clone)]
pub struct ExecutionContext {
    pub session: Option<Arc<Session>>,
    pub input: Value,
    pub parser: Option<ParserRef>,
    pub timeout: Option<Duration>,
    pub cancellation: CancellationToken,
    pub budget: Budget,
    pub trace: Trace,
    pub run_logger: RunLogger,
    pub run_id: Option<String>,
    pub exec_id: Option<String>,
    pub upstream: Arc<HashMap<String, Value>>,
}

impl ExecutionContext {
    pub fn new(session: Option<Arc<Session>>, input: Value) -> Self {
        Self {
            session,
            input,
            parser: None,
            timeout: None,
            cancellation: CancellationToken::new(),
            budget: Budget::default(),
            trace: Trace::new(),
            run_logger: RunLogger::default(),
            run_id: None,
            exec_id: None,
            upstream: Arc::new(HashMap::new()),
        }
    }

    pub fn check_cancelled(&self) -> Result<(), CancelledError> {
        self.cancellation.check()
    }

    pub fn check_budget(&self) -> Result<(), BudgetExceededError> {
        self.budget.check()
    }

    pub fn with_input(&self, input: Value) -> Self {
        let mut ctx = self.clone();
        ctx.input = input;
        ctx
    }

    pub fn with_upstream(&self, upstream: HashMap<String, Value>) -> Self {
        let mut ctx = self.clone();
        ctx.upstream = Arc::new(upstream);
        ctx
    }

    pub fn with_parser(&self, parser: ParserRef) -> Self {
        let mut ctx = self.clone();
        ctx.parser = Some(parser);
        ctx
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut ctx = self.clone();
        ctx.timeout = Some(timeout);
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_across_derivations() {
        let ctx = ExecutionContext::new(None, Value::Null);
        let derived = ctx.with_input(Value::String("x".into()));
        ctx.cancellation.cancel();
        assert!(derived.check_cancelled().is_err());
    }

    #[test]
    fn budget_caps_are_enforced() {
        let mut ctx = ExecutionContext::new(None, Value::Null);
        ctx.budget = Budget::new(Some(2), None, None);
        ctx.budget.add_step();
        assert!(ctx.check_budget().is_ok());
        ctx.budget.add_step();
        assert!(ctx.check_budget().is_err());
    }

    #[test]
    fn derived_context_shares_budget_counters() {
        let ctx = ExecutionContext::new(None, Value::Null);
        let derived = ctx.with_input(Value::Null);
        derived.budget.add_step();
        assert_eq!(ctx.budget.steps(), 1);
    }
}
