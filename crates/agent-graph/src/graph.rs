//! The outer graph object.
//!
//! A `GraphAgent` owns the event stream, the node table, the injected
//! service registry and the global state map. Application code adds nodes,
//! binds them, and invokes an entry node to seed a run; everything after
//! that is driven by the event stream.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use crate::error::{GraphError, Result};
use crate::event::{EventStream, Run};
use crate::graph_node::{GraphNode, Invocation};
use crate::node::{AgentNode, NodeConfig, NodeInput};
use crate::services::{GlobalState, Services};

/// A graph of agent nodes sharing one event stream.
pub struct GraphAgent {
    inner: Arc<GraphInner>,
}

impl GraphAgent {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GraphInner {
                stream: EventStream::default(),
                nodes: RwLock::new(HashMap::new()),
                services: Services::new(),
                state: GlobalState::new(),
            }),
        }
    }

    /// The graph's event stream, for external observers.
    pub fn event_stream(&self) -> &EventStream {
        &self.inner.stream
    }

    /// Injected services resolvable from node contexts.
    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    /// The per-graph JSON state map.
    pub fn global_state(&self) -> &GlobalState {
        &self.inner.state
    }

    /// Add a node under a graph-unique id and run its `init` hook with the
    /// synthetic init run.
    pub async fn add_node(
        &self,
        id: impl Into<String>,
        node: Arc<dyn AgentNode>,
        config: Option<NodeConfig>,
    ) -> Result<GraphNode> {
        let id = id.into();
        let graph_node = GraphNode::create(
            id.clone(),
            node,
            config,
            self.inner.stream.clone(),
            GraphHandle {
                inner: Arc::downgrade(&self.inner),
            },
        );
        {
            let mut nodes = self.inner.nodes.write().expect("node table poisoned");
            if nodes.contains_key(&id) {
                return Err(GraphError::DuplicateNode(id));
            }
            nodes.insert(id.clone(), graph_node.clone());
        }
        if let Err(err) = graph_node.init().await {
            let mut nodes = self.inner.nodes.write().expect("node table poisoned");
            nodes.remove(&id);
            return Err(err);
        }
        Ok(graph_node)
    }

    /// Look up a node by its graph-local id.
    pub fn node(&self, id: &str) -> Option<GraphNode> {
        self.inner.node(id)
    }

    /// Seed a run through the given entry node.
    pub fn invoke(&self, node_id: &str, input: serde_json::Value) -> Result<Invocation> {
        let node = self
            .node(node_id)
            .ok_or_else(|| GraphError::NodeNotFound(node_id.to_string()))?;
        Ok(node.invoke(NodeInput::from_json(input)))
    }
}

impl Default for GraphAgent {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct GraphInner {
    stream: EventStream,
    nodes: RwLock<HashMap<String, GraphNode>>,
    services: Services,
    state: GlobalState,
}

impl GraphInner {
    pub(crate) fn services(&self) -> &Services {
        &self.services
    }

    pub(crate) fn global_state(&self) -> &GlobalState {
        &self.state
    }

    pub(crate) fn node(&self, id: &str) -> Option<GraphNode> {
        self.nodes.read().expect("node table poisoned").get(id).cloned()
    }
}

/// Non-owning handle into the graph, carried by node contexts.
///
/// Holding the node table behind a weak reference keeps the ownership
/// graph acyclic even though tool descriptors point back at their nodes.
#[derive(Clone)]
pub(crate) struct GraphHandle {
    inner: Weak<GraphInner>,
}

impl GraphHandle {
    pub(crate) fn upgrade(&self) -> Result<Arc<GraphInner>> {
        self.inner.upgrade().ok_or(GraphError::GraphDropped)
    }

    /// Re-invoke a node within an existing run (tool dispatch). No
    /// `RunInvoked` is emitted.
    pub(crate) async fn invoke_node(
        &self,
        node_id: &str,
        input: NodeInput,
        run: Run,
    ) -> Result<crate::event::OutputMap> {
        let graph = self.upgrade()?;
        let node = graph
            .node(node_id)
            .ok_or_else(|| GraphError::NodeNotFound(node_id.to_string()))?;
        node.invoke_with(input, Some(run)).output().await
    }
}
