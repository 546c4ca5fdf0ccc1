//! Session & registry (spec.md §3 "Session", §4.1).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::error::NerveError;
use crate::graph::Graph;
use crate::node::{NodeInfo, NodeRef};
use crate::validation::validate_id;
use crate::workflow::run::WorkflowRun;
use crate::workflow::Workflow;

/// A process-local workspace owning nodes, graphs, workflows, and runs
/// (spec.md §3 "Session"). Node-id and graph-id share one namespace;
/// workflow and run ids live in their own (spec.md §4.1 invariants).
pub struct Session {
    name: String,
    server_name: String,
    pub history_enabled: bool,
    pub history_base_dir: Option<PathBuf>,
    nodes: RwLock<HashMap<String, NodeRef>>,
    graphs: RwLock<HashMap<String, Arc<Graph>>>,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    runs: RwLock<HashMap<String, Arc<WorkflowRun>>>,
    /// Registration order of nodes, so `stop()` tears down in reverse order
    /// (spec.md §4.1 "Shutdown order is reverse of start order").
    registration_order: RwLock<Vec<String>>,
}

impl Session {
    pub fn new(name: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_name: server_name.into(),
            history_enabled: false,
            history_base_dir: None,
            nodes: RwLock::new(HashMap::new()),
            graphs: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            registration_order: RwLock::new(Vec::new()),
        }
    }

    pub fn with_history(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.history_enabled = true;
        self.history_base_dir = Some(base_dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn id_taken_in_node_or_graph_namespace(&self, id: &str) -> bool {
        self.nodes.read().unwrap().contains_key(id) || self.graphs.read().unwrap().contains_key(id)
    }

    /// Fails with an id conflict if `node.id()` collides with an existing
    /// node *or* graph in this session (spec.md §4.1 shared namespace invariant).
    pub fn register_node(&self, node: NodeRef) -> Result<(), NerveError> {
        let id = node.id().to_string();
        validate_id(&id)?;
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(&id) || self.graphs.read().unwrap().contains_key(&id) {
            return Err(NerveError::IdConflict(id));
        }
        tracing::info!(session = %self.name, node_id = %id, node_type = node.node_type(), "node registered");
        nodes.insert(id.clone(), node);
        drop(nodes);
        self.registration_order.write().unwrap().push(id);
        Ok(())
    }

    pub fn register_graph(&self, graph: Arc<Graph>) -> Result<(), NerveError> {
        let id = graph.id().to_string();
        validate_id(&id)?;
        let mut graphs = self.graphs.write().unwrap();
        if graphs.contains_key(&id) || self.nodes.read().unwrap().contains_key(&id) {
            return Err(NerveError::IdConflict(id));
        }
        tracing::info!(session = %self.name, graph_id = %id, "graph registered");
        graphs.insert(id, graph);
        Ok(())
    }

    pub fn register_workflow(&self, workflow: Arc<Workflow>) -> Result<(), NerveError> {
        let id = workflow.id().to_string();
        validate_id(&id)?;
        let mut workflows = self.workflows.write().unwrap();
        if workflows.contains_key(&id) {
            return Err(NerveError::IdConflict(id));
        }
        tracing::info!(session = %self.name, workflow_id = %id, "workflow registered");
        workflows.insert(id, workflow);
        Ok(())
    }

    pub fn register_run(&self, run: Arc<WorkflowRun>) {
        self.runs.write().unwrap().insert(run.id().to_string(), run);
    }

    pub fn get_node(&self, id: &str) -> Option<NodeRef> {
        self.nodes.read().unwrap().get(id).cloned()
    }

    pub fn get_graph(&self, id: &str) -> Option<Arc<Graph>> {
        self.graphs.read().unwrap().get(id).cloned()
    }

    pub fn get_workflow(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows.read().unwrap().get(id).cloned()
    }

    pub fn get_run(&self, id: &str) -> Option<Arc<WorkflowRun>> {
        self.runs.read().unwrap().get(id).cloned()
    }

    /// Stops the node via its own `stop()`, removes it from the registry,
    /// and is idempotent (spec.md §4.1 `delete_node`).
    pub async fn delete_node(&self, id: &str) -> bool {
        let node = self.nodes.write().unwrap().remove(id);
        self.registration_order.write().unwrap().retain(|x| x != id);
        match node {
            Some(node) => {
                node.stop().await;
                tracing::info!(session = %self.name, node_id = %id, "node deleted");
                true
            }
            None => false,
        }
    }

    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        self.nodes.read().unwrap().values().map(|n| n.to_info()).collect()
    }

    pub fn list_graph_ids(&self) -> Vec<String> {
        self.graphs.read().unwrap().keys().cloned().collect()
    }

    pub fn list_workflow_ids(&self) -> Vec<String> {
        self.workflows.read().unwrap().keys().cloned().collect()
    }

    pub fn counts(&self) -> (usize, usize, usize, usize) {
        (
            self.nodes.read().unwrap().len(),
            self.graphs.read().unwrap().len(),
            self.workflows.read().unwrap().len(),
            self.runs.read().unwrap().len(),
        )
    }

    /// Stops all workflow runs (cancel), then all persistent nodes in
    /// reverse registration order (spec.md §4.1 `stop()`).
    pub async fn stop(&self) {
        let runs: Vec<Arc<WorkflowRun>> = self.runs.read().unwrap().values().cloned().collect();
        for run in runs {
            run.cancel().await;
        }

        let order: Vec<String> = self.registration_order.read().unwrap().iter().rev().cloned().collect();
        for id in order {
            let node = self.nodes.write().unwrap().remove(&id);
            if let Some(node) = node {
                tracing::info!(session = %self.name, node_id = %id, "stopping node");
                node.stop().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::identity::IdentityNode;
    use std::sync::Arc;

    #[test]
    fn register_then_get_returns_same_node() {
        let session = Session::new("s", "srv");
        let node: NodeRef = Arc::new(IdentityNode::new("echo"));
        session.register_node(node).unwrap();
        assert!(session.get_node("echo").is_some());
    }

    #[test]
    fn node_and_graph_share_id_namespace() {
        let session = Session::new("s", "srv");
        let node: NodeRef = Arc::new(IdentityNode::new("shared"));
        session.register_node(node).unwrap();
        let graph = Arc::new(Graph::new("shared"));
        let err = session.register_graph(graph).unwrap_err();
        assert!(matches!(err, NerveError::IdConflict(_)));
    }

    #[tokio::test]
    async fn delete_node_is_idempotent() {
        let session = Session::new("s", "srv");
        let node: NodeRef = Arc::new(IdentityNode::new("echo"));
        session.register_node(node).unwrap();
        assert!(session.delete_node("echo").await);
        assert!(!session.delete_node("echo").await);
        assert!(session.get_node("echo").is_none());
    }

    #[test]
    fn invalid_id_is_rejected() {
        let session = Session::new("s", "srv");
        let node: NodeRef = Arc::new(IdentityNode::new("Bad Id"));
        assert!(session.register_node(node).is_err());
    }
}
