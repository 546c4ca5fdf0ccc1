//! WorkflowRun: the live, stateful instance of one workflow invocation
//! (spec.md §3 "WorkflowRun", §4.5 "WorkflowRun").

use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::context::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

/// A suspended `gate()` call awaiting an external answer (spec.md §3 "WorkflowRun").
pub struct PendingGate {
    pub prompt: String,
    pub choices: Option<Vec<String>>,
    answer_tx: Mutex<Option<oneshot::Sender<Value>>>,
}

impl PendingGate {
    fn new(prompt: String, choices: Option<Vec<String>>, answer_tx: oneshot::Sender<Value>) -> Self {
        Self {
            prompt,
            choices,
            answer_tx: Mutex::new(Some(answer_tx)),
        }
    }

    /// Validates `value` against the choice set (if any) and posts it,
    /// consuming the gate so a second answer is rejected (spec.md §4.5 `answer_gate`).
    fn answer(&self, value: Value) -> Result<(), String> {
        if let Some(choices) = &self.choices {
            let as_str = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            if !choices.contains(&as_str) {
                return Err(format!("'{as_str}' is not one of the allowed choices {choices:?}"));
            }
        }
        let tx = self
            .answer_tx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| "gate already answered".to_string())?;
        tx.send(value).map_err(|_| "gate receiver dropped".to_string())
    }
}

/// One event in a run's log, with a monotonic (per-run) timestamp (spec.md §4.5 "Events").
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunEvent {
    pub event_type: String,
    pub data: Value,
    pub timestamp_ms: u128,
}

fn now_ms() -> u128 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_millis()
}

struct RunInner {
    state: RunState,
    result: Option<Value>,
    error: Option<String>,
    scratch: serde_json::Map<String, Value>,
    events: Vec<RunEvent>,
    pending_gate: Option<Arc<PendingGate>>,
    start_time_ms: Option<u128>,
    end_time_ms: Option<u128>,
}

impl Default for RunInner {
    fn default() -> Self {
        Self {
            state: RunState::Pending,
            result: None,
            error: None,
            scratch: serde_json::Map::new(),
            events: Vec::new(),
            pending_gate: None,
            start_time_ms: None,
            end_time_ms: None,
        }
    }
}

/// A live invocation of a [`crate::workflow::Workflow`] (spec.md §3 "WorkflowRun").
pub struct WorkflowRun {
    id: String,
    workflow_id: String,
    input: Value,
    params: Value,
    cancellation: CancellationToken,
    inner: RwLock<RunInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkflowRun {
    pub fn new(id: impl Into<String>, workflow_id: impl Into<String>, input: Value, params: Value) -> Self {
        Self::with_cancellation(id, workflow_id, input, params, CancellationToken::new())
    }

    /// Builds a run sharing an existing cancellation token instead of minting
    /// its own — used for nested runs so a parent's cancellation reaches the
    /// child (spec.md §4.5 `run_workflow`: "a new WorkflowRun with the
    /// parent's cancellation").
    pub fn with_cancellation(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        input: Value,
        params: Value,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            input,
            params,
            cancellation,
            inner: RwLock::new(RunInner::default()),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn state(&self) -> RunState {
        self.inner.read().unwrap().state
    }

    pub(crate) fn set_task(&self, handle: JoinHandle<()>) {
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Transitions to `RUNNING` and emits `workflow_started` (spec.md §4.5 step 2).
    pub fn mark_started(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.state = RunState::Running;
        inner.start_time_ms = Some(now_ms());
        drop(inner);
        self.emit("workflow_started", Value::Null);
    }

    /// Transitions to `COMPLETED` with `result` and emits `workflow_completed`
    /// (spec.md §4.5 step 3).
    pub fn mark_completed(&self, result: Value) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.state = RunState::Completed;
            inner.result = Some(result.clone());
            inner.end_time_ms = Some(now_ms());
        }
        self.emit("workflow_completed", result);
    }

    /// Transitions to `FAILED` with `error` and emits `workflow_failed`
    /// (spec.md §4.5 step 3, §5 "Workflows propagate exceptions from `fn` as `FAILED` state").
    pub fn mark_failed(&self, error: String) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.state = RunState::Failed;
            inner.error = Some(error.clone());
            inner.end_time_ms = Some(now_ms());
        }
        self.emit("workflow_failed", Value::String(error));
    }

    /// Cancels the coroutine; if a gate is pending, closes its answer channel
    /// so the awaiting `fn` observes cancellation, then sets state to
    /// `CANCELLED` (spec.md §4.5 step 4, §5 "cancel()").
    pub async fn cancel(&self) {
        if matches!(self.state(), RunState::Completed | RunState::Failed | RunState::Cancelled) {
            return;
        }
        self.cancellation.cancel();
        let gate = self.inner.write().unwrap().pending_gate.take();
        drop(gate); // dropping the Arc drops the sender if this was the last ref, closing the channel

        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let mut inner = self.inner.write().unwrap();
        if !matches!(inner.state, RunState::Completed | RunState::Failed) {
            inner.state = RunState::Cancelled;
            inner.end_time_ms = Some(now_ms());
        }
    }

    /// Suspends the run on a gate, returning a future that resolves with the
    /// answer (spec.md §4.5 `gate`). Sets `WAITING`, records the pending gate,
    /// emits `gate_waiting`, and on answer emits `gate_answered`.
    pub async fn gate(&self, prompt: String, choices: Option<Vec<String>>) -> Result<Value, String> {
        let (tx, rx) = oneshot::channel();
        let gate = Arc::new(PendingGate::new(prompt.clone(), choices.clone(), tx));
        {
            let mut inner = self.inner.write().unwrap();
            inner.state = RunState::Waiting;
            inner.pending_gate = Some(gate);
        }
        self.emit(
            "gate_waiting",
            serde_json::json!({"prompt": prompt, "choices": choices}),
        );

        tokio::select! {
            result = rx => match result {
                Ok(value) => {
                    let mut inner = self.inner.write().unwrap();
                    inner.state = RunState::Running;
                    inner.pending_gate = None;
                    drop(inner);
                    self.emit("gate_answered", value.clone());
                    Ok(value)
                }
                Err(_) => Err("gate cancelled".to_string()),
            },
            _ = self.cancellation.cancelled() => {
                let mut inner = self.inner.write().unwrap();
                inner.pending_gate = None;
                if !matches!(inner.state, RunState::Completed | RunState::Failed) {
                    inner.state = RunState::Cancelled;
                    inner.end_time_ms = Some(now_ms());
                }
                drop(inner);
                Err("gate cancelled".to_string())
            }
        }
    }

    /// Validates and posts an answer to the current pending gate (spec.md §4.5
    /// `answer_gate`): rejects a value outside the choice set, and rejects a
    /// second answer to an already-answered gate. A rejected (invalid-choice)
    /// answer leaves the gate pending so a corrected answer can still land.
    pub fn answer_gate(&self, value: Value) -> Result<(), String> {
        let gate = self
            .inner
            .read()
            .unwrap()
            .pending_gate
            .clone()
            .ok_or_else(|| "no gate is pending".to_string())?;
        gate.answer(value)
    }

    pub fn pending_gate_info(&self) -> Option<Value> {
        self.inner.read().unwrap().pending_gate.as_ref().map(|g| {
            serde_json::json!({"prompt": g.prompt, "choices": g.choices})
        })
    }

    pub fn emit(&self, event_type: &str, data: Value) {
        let event = RunEvent {
            event_type: event_type.to_string(),
            data,
            timestamp_ms: now_ms(),
        };
        self.inner.write().unwrap().events.push(event);
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.inner.read().unwrap().events.clone()
    }

    /// `scratch` is shared mutable state visible to the workflow function for
    /// the run's lifetime (spec.md §3 "a shared mutable `state` scratch map").
    pub fn scratch_set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().unwrap().scratch.insert(key.into(), value);
    }

    pub fn scratch_get(&self, key: &str) -> Option<Value> {
        self.inner.read().unwrap().scratch.get(key).cloned()
    }

    /// JSON-serializable snapshot: state, duration, pending gate, events,
    /// error, and a result digest (spec.md §4.5 `to_info()`).
    pub fn to_info(&self) -> Value {
        let inner = self.inner.read().unwrap();
        let duration_ms = match (inner.start_time_ms, inner.end_time_ms) {
            (Some(start), Some(end)) => Some((end - start) as f64),
            (Some(start), None) => Some((now_ms() - start) as f64),
            _ => None,
        };
        serde_json::json!({
            "id": self.id,
            "workflow_id": self.workflow_id,
            "state": inner.state,
            "duration_ms": duration_ms,
            "pending_gate": inner.pending_gate.as_ref().map(|g| serde_json::json!({"prompt": g.prompt, "choices": g.choices})),
            "events": inner.events,
            "error": inner.error,
            "result": inner.result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn starts_pending_and_transitions_to_running() {
        let run = WorkflowRun::new("r1", "w1", Value::Null, Value::Null);
        assert_eq!(run.state(), RunState::Pending);
        run.mark_started();
        assert_eq!(run.state(), RunState::Running);
        assert_eq!(run.events().first().unwrap().event_type, "workflow_started");
    }

    #[tokio::test]
    async fn gate_answer_roundtrips_and_rejects_second_answer() {
        let run = Arc::new(WorkflowRun::new("r1", "w1", Value::Null, Value::Null));
        run.mark_started();
        let run2 = run.clone();
        let handle = tokio::spawn(async move { run2.gate("continue?".to_string(), Some(vec!["yes".into(), "no".into()])).await });
        tokio::task::yield_now().await;

        assert!(run.answer_gate(json!("maybe")).is_err());
        assert!(run.answer_gate(json!("yes")).is_ok());
        let answer = handle.await.unwrap().unwrap();
        assert_eq!(answer, json!("yes"));
        assert!(run.answer_gate(json!("yes")).is_err());
    }

    #[tokio::test]
    async fn cancel_while_gated_resolves_the_waiting_future() {
        let run = Arc::new(WorkflowRun::new("r1", "w1", Value::Null, Value::Null));
        run.mark_started();
        let run2 = run.clone();
        let handle = tokio::spawn(async move { run2.gate("continue?".to_string(), None).await });
        tokio::task::yield_now().await;

        run.cancel().await;
        assert!(handle.await.unwrap().is_err());
        assert_eq!(run.state(), RunState::Cancelled);
    }

    #[test]
    fn mark_failed_records_error_and_event() {
        let run = WorkflowRun::new("r1", "w1", Value::Null, Value::Null);
        run.mark_started();
        run.mark_failed("boom".to_string());
        assert_eq!(run.state(), RunState::Failed);
        assert!(run.events().iter().any(|e| e.event_type == "workflow_failed"));
    }
}
