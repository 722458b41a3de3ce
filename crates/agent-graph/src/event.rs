//! The event stream: a hot multicast bus for one graph instance.
//!
//! Every value that moves between nodes travels here as an [`AgentEvent`].
//! The bus is a single-writer-many-reader broadcast: `publish` fans the
//! event out to all current subscribers, late subscribers receive no
//! history, and within one subscriber events arrive in publication order.
//!
//! The reactive correlation machinery (grouping by run, capping, cutting
//! off at terminal events) lives in `graph_node`; this module only moves
//! events. Subscriptions expose a `futures` stream adapter so consumers
//! can still compose with standard combinators where they need to.

use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Synthetic run id passed to `AgentNode::init`.
pub const NODE_INIT_RUN: &str = "__NODE_INIT__";

/// One logical traversal of the graph, identified by a unique id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
}

impl Run {
    /// Create a run with a fresh unique id.
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Create a run with a caller-supplied id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// The synthetic run used for node initialization.
    pub fn init() -> Self {
        Self::with_id(NODE_INIT_RUN)
    }
}

impl Default for Run {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Descriptor of a node instance as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDesc {
    /// Graph-local node id
    pub id: String,
    /// Stable node type id (from the node's metadata)
    pub node_type: String,
    /// Node version
    pub version: String,
}

/// A partial output map published by a node.
pub type OutputMap = HashMap<String, serde_json::Value>;

/// A render update for one UI step.
///
/// `step` is the opaque render id assigned by the node author; the runtime
/// never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderPayload {
    pub step: String,
    pub data: serde_json::Value,
}

/// Events carried by the stream. Closed set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentEvent {
    /// Seeds a run; every bound node starts collecting for it.
    #[serde(rename_all = "camelCase")]
    RunInvoked { run: Run },

    /// A node published a partial output map.
    #[serde(rename_all = "camelCase")]
    Output {
        run: Run,
        node: NodeDesc,
        output: OutputMap,
    },

    /// A node published a UI render update.
    #[serde(rename_all = "camelCase")]
    Render {
        run: Run,
        node: NodeDesc,
        render: RenderPayload,
    },

    /// A node finished its generator for a run.
    #[serde(rename_all = "camelCase")]
    RunCompleted { run: Run, node: NodeDesc },

    /// A node will not run for this run.
    #[serde(rename_all = "camelCase")]
    RunSkipped { run: Run, node: NodeDesc },
}

impl AgentEvent {
    /// The run this event belongs to.
    pub fn run(&self) -> &Run {
        match self {
            AgentEvent::RunInvoked { run }
            | AgentEvent::Output { run, .. }
            | AgentEvent::Render { run, .. }
            | AgentEvent::RunCompleted { run, .. }
            | AgentEvent::RunSkipped { run, .. } => run,
        }
    }

    /// The emitting node, if any.
    pub fn node(&self) -> Option<&NodeDesc> {
        match self {
            AgentEvent::RunInvoked { .. } => None,
            AgentEvent::Output { node, .. }
            | AgentEvent::Render { node, .. }
            | AgentEvent::RunCompleted { node, .. }
            | AgentEvent::RunSkipped { node, .. } => Some(node),
        }
    }

    /// Whether this is a terminal (`RunCompleted | RunSkipped`) event for
    /// the given node id.
    pub fn is_terminal_for(&self, node_id: &str) -> bool {
        matches!(
            self,
            AgentEvent::RunCompleted { node, .. } | AgentEvent::RunSkipped { node, .. }
                if node.id == node_id
        )
    }
}

/// Hot multicast bus carrying [`AgentEvent`]s for one graph instance.
///
/// Cloning is cheap: all clones publish into the same channel.
#[derive(Clone)]
pub struct EventStream {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: AgentEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    /// Publish an `Output` event.
    pub fn send_output(&self, run: Run, node: NodeDesc, output: OutputMap) {
        self.publish(AgentEvent::Output { run, node, output });
    }

    /// Publish a `Render` event.
    pub fn send_render_update(&self, run: Run, node: NodeDesc, update: RenderPayload) {
        self.publish(AgentEvent::Render {
            run,
            node,
            render: update,
        });
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A live subscription to the bus.
pub struct EventSubscription {
    rx: broadcast::Receiver<AgentEvent>,
}

impl EventSubscription {
    /// Receive the next event, or `None` once the bus is closed.
    ///
    /// A lagged receiver logs a warning and keeps going from the oldest
    /// retained event.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("event subscriber lagged, {missed} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt the subscription into a `futures` stream for combinator use.
    pub fn into_stream(self) -> impl Stream<Item = AgentEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}
