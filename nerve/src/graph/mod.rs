//! Graph, Step, and error-policy types (spec.md §3 "Graph"/"Step"/"Error
//! policy", §4.4). Execution lives in [`engine`].

pub mod engine;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use std::sync::RwLock;

use serde_json::Value;

use crate::context::CancellationToken;
use crate::graph::engine::CurrentNodeHandle;
use crate::node::NodeRef;
use crate::types::ParserRef;
use crate::validation::validate_id;

/// A step references exactly one of {concrete node, node-id lookup}
/// (spec.md §3 "Graph" invariants).
#[derive(Clone)]
pub enum NodeTarget {
    Direct(NodeRef),
    Lookup(String),
}

/// Computes a step's input from the merged upstream-results map (spec.md §3 "Step").
pub type InputFn = Arc<dyn Fn(&HashMap<String, Value>) -> Value + Send + Sync>;

/// Disposition when a step exhausts its retries (spec.md §3 "Error policy").
#[derive(Debug, Clone, PartialEq)]
pub enum OnError {
    Fail,
    Skip,
    Fallback,
}

/// Per-step retry/timeout/failure-disposition policy (spec.md §3 "Error policy").
#[derive(Clone)]
pub struct ErrorPolicy {
    pub retry_count: u32,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
    pub timeout_ms: Option<u64>,
    pub on_error: OnError,
    pub fallback_value: Value,
    pub fallback_node: Option<NodeTarget>,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            retry_count: 0,
            backoff_base: Duration::from_millis(200),
            backoff_ceiling: Duration::from_secs(10),
            timeout_ms: None,
            on_error: OnError::Fail,
            fallback_value: Value::Null,
            fallback_node: None,
        }
    }
}

impl ErrorPolicy {
    pub fn with_retry(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn on_skip(mut self, fallback_value: Value) -> Self {
        self.on_error = OnError::Skip;
        self.fallback_value = fallback_value;
        self
    }

    pub fn on_fallback(mut self, node: NodeTarget) -> Self {
        self.on_error = OnError::Fallback;
        self.fallback_node = Some(node);
        self
    }

    /// Whether attempt `attempt` (0-indexed) should be followed by a retry.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.retry_count
    }

    /// Exponential-backoff delay for `attempt` (0-indexed), capped at `backoff_ceiling`.
    pub fn get_delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.backoff_base.as_millis().saturating_mul(1u128 << attempt.min(16));
        Duration::from_millis(scaled.min(self.backoff_ceiling.as_millis()) as u64)
    }
}

/// A graph vertex (spec.md §3 "Step"): a node reference, its input (static or
/// derived), its dependencies, and an optional error policy/parser override.
pub struct Step {
    pub node: NodeTarget,
    pub input: Option<Value>,
    pub input_fn: Option<InputFn>,
    pub depends_on: Vec<String>,
    pub error_policy: Option<ErrorPolicy>,
    pub parser: Option<ParserRef>,
}

impl Step {
    pub fn direct(node: NodeRef) -> Self {
        Self {
            node: NodeTarget::Direct(node),
            input: None,
            input_fn: None,
            depends_on: Vec::new(),
            error_policy: None,
            parser: None,
        }
    }

    pub fn lookup(node_id: impl Into<String>) -> Self {
        Self {
            node: NodeTarget::Lookup(node_id.into()),
            input: None,
            input_fn: None,
            depends_on: Vec::new(),
            error_policy: None,
            parser: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_input_fn(mut self, f: impl Fn(&HashMap<String, Value>) -> Value + Send + Sync + 'static) -> Self {
        self.input_fn = Some(Arc::new(f));
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    pub fn with_parser(mut self, parser: ParserRef) -> Self {
        self.parser = Some(parser);
        self
    }
}

/// A validated DAG of steps (spec.md §3 "Graph").
pub struct Graph {
    id: String,
    pub max_parallel: u32,
    step_ids: Vec<String>,
    steps: HashMap<String, Step>,
    /// Tracks the node currently executing and the cancellation token of the
    /// in-flight `execute()` call, so `Node::interrupt()` can reach it
    /// (spec.md §4.4/§5 "Interruption").
    current: CurrentNodeHandle,
    active_cancellation: RwLock<Option<CancellationToken>>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            max_parallel: 1,
            step_ids: Vec::new(),
            steps: HashMap::new(),
            current: CurrentNodeHandle::new(),
            active_cancellation: RwLock::new(None),
        }
    }

    pub fn with_max_parallel(mut self, n: u32) -> Self {
        self.max_parallel = n;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_step(&mut self, step_id: impl Into<String>, step: Step) -> &mut Self {
        let step_id = step_id.into();
        if !self.steps.contains_key(&step_id) {
            self.step_ids.push(step_id.clone());
        }
        self.steps.insert(step_id, step);
        self
    }

    pub fn step_ids(&self) -> &[String] {
        &self.step_ids
    }

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    /// Wires a linear chain `a -> b -> c -> ...` (spec.md §4.4 `chain`).
    pub fn chain(&mut self, ids: &[&str]) -> &mut Self {
        for pair in ids.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if let Some(step) = self.steps.get_mut(to) {
                if !step.depends_on.iter().any(|d| d == from) {
                    step.depends_on.push(from.to_string());
                }
            }
        }
        self
    }

    /// General chaining combinator covering `A>>B`, `A>>[B,C]`, `[A,B]>>C`,
    /// and `[A,B]>>[C,D]` (spec.md §4.4): every id in `to` depends on every id in `from`.
    pub fn link(&mut self, from: &[&str], to: &[&str]) -> &mut Self {
        for t in to {
            if let Some(step) = self.steps.get_mut(*t) {
                for f in from {
                    if !step.depends_on.iter().any(|d| d == f) {
                        step.depends_on.push(f.to_string());
                    }
                }
            }
        }
        self
    }

    /// Collects validation errors (spec.md §4.4 "Validation"): empty step id,
    /// self-dependency, `input`/`input_fn` both set, unknown dependency, cycles.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for id in &self.step_ids {
            if id.is_empty() {
                errors.push("empty step id".to_string());
            }
            if validate_id(id).is_err() {
                errors.push(format!("invalid step id: '{id}'"));
            }
        }

        for (id, step) in &self.steps {
            if step.depends_on.iter().any(|d| d == id) {
                errors.push(format!("step '{id}' depends on itself"));
            }
            if step.input.is_some() && step.input_fn.is_some() {
                errors.push(format!("step '{id}' sets both input and input_fn"));
            }
            for dep in &step.depends_on {
                if !self.steps.contains_key(dep) {
                    errors.push(format!("step '{id}' depends on unknown step '{dep}'"));
                }
            }
        }

        if errors.is_empty() {
            if let Err(e) = self.toposort() {
                errors.push(e);
            }
        }

        errors
    }

    /// Topological sequence consistent with `depends_on`, ties broken by
    /// insertion order (spec.md §4.4 `execution_order`, §5 "Ordering guarantees").
    pub fn execution_order(&self) -> Result<Vec<String>, String> {
        self.toposort()
    }

    fn toposort(&self) -> Result<Vec<String>, String> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for id in &self.step_ids {
            in_degree.entry(id).or_insert(0);
        }
        for id in &self.step_ids {
            let step = &self.steps[id];
            for dep in &step.depends_on {
                *in_degree.entry(id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut ready: Vec<&str> = self
            .step_ids
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree[id] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.step_ids.len());
        let mut visited: HashSet<&str> = HashSet::new();

        while let Some(pos) = ready.iter().position(|id| !visited.contains(id)) {
            let current = ready[pos];
            visited.insert(current);
            order.push(current.to_string());
            if let Some(deps) = dependents.get(current) {
                for &next in deps {
                    let entry = in_degree.get_mut(next).unwrap();
                    *entry -= 1;
                    if *entry == 0 && !ready.contains(&next) {
                        ready.push(next);
                    }
                }
            }
        }

        if order.len() != self.step_ids.len() {
            return Err("graph contains a cycle".to_string());
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::identity::IdentityNode;
    use std::sync::Arc;

    fn node(id: &str) -> NodeRef {
        Arc::new(IdentityNode::new(id))
    }

    #[test]
    fn execution_order_matches_chain() {
        let mut g = Graph::new("g");
        g.add_step("a", Step::direct(node("a")));
        g.add_step("b", Step::direct(node("b")));
        g.add_step("c", Step::direct(node("c")));
        g.chain(&["a", "b", "c"]);
        assert_eq!(g.validate(), Vec::<String>::new());
        assert_eq!(g.execution_order().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn detects_self_dependency() {
        let mut g = Graph::new("g");
        g.add_step("a", Step::direct(node("a")).depends_on(&["a"]));
        let errors = g.validate();
        assert!(errors.iter().any(|e| e.contains("depends on itself")));
    }

    #[test]
    fn detects_unknown_dependency() {
        let mut g = Graph::new("g");
        g.add_step("a", Step::direct(node("a")).depends_on(&["missing"]));
        let errors = g.validate();
        assert!(errors.iter().any(|e| e.contains("unknown step")));
    }

    #[test]
    fn detects_cycle() {
        let mut g = Graph::new("g");
        g.add_step("a", Step::direct(node("a")).depends_on(&["b"]));
        g.add_step("b", Step::direct(node("b")).depends_on(&["a"]));
        let errors = g.validate();
        assert!(errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn rejects_input_and_input_fn_both_set() {
        let mut g = Graph::new("g");
        g.add_step(
            "a",
            Step::direct(node("a")).with_input(Value::Null).with_input_fn(|_| Value::Null),
        );
        let errors = g.validate();
        assert!(errors.iter().any(|e| e.contains("both input and input_fn")));
    }

    #[test]
    fn link_wires_cartesian_dependencies() {
        let mut g = Graph::new("g");
        for id in ["a", "b", "c", "d"] {
            g.add_step(id, Step::direct(node(id)));
        }
        g.link(&["a", "b"], &["c", "d"]);
        assert_eq!(g.get_step("c").unwrap().depends_on.len(), 2);
        assert_eq!(g.get_step("d").unwrap().depends_on.len(), 2);
    }
}
