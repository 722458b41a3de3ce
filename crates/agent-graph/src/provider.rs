//! Value providers: the typed handles a graph node exposes for its output
//! fields, its tool schema, and its render stream.
//!
//! A provider is both an observable surface over the event stream and a
//! metadata tag. During `bind` the tag (kind + source nodes + source field)
//! is what classifies the edge; the observable surface is what external
//! consumers (tests, UIs) use to watch values flow.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::{GraphError, Result};
use crate::event::{AgentEvent, EventStream, NodeDesc, Run};
use crate::schema::ToolSchema;

/// What a provider sources its values from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    /// A single output field of the source node
    Output { field: String },
    /// The source node's tool descriptor (run-independent)
    Schema,
    /// The source nodes' per-run render streams
    Render,
}

/// A tagged observable over one node's output field, schema, or renders.
///
/// Providers are cheap to clone and live as long as the enclosing agent.
#[derive(Clone)]
pub struct ValueProvider {
    kind: ProviderKind,
    nodes: Vec<NodeDesc>,
    schema: Option<ToolSchema>,
    stream: EventStream,
}

impl ValueProvider {
    pub(crate) fn output(node: NodeDesc, field: impl Into<String>, stream: EventStream) -> Self {
        Self {
            kind: ProviderKind::Output {
                field: field.into(),
            },
            nodes: vec![node],
            schema: None,
            stream,
        }
    }

    pub(crate) fn schema(node: NodeDesc, schema: ToolSchema, stream: EventStream) -> Self {
        Self {
            kind: ProviderKind::Schema,
            nodes: vec![node],
            schema: Some(schema),
            stream,
        }
    }

    pub(crate) fn render(nodes: Vec<NodeDesc>, stream: EventStream) -> Self {
        Self {
            kind: ProviderKind::Render,
            nodes,
            schema: None,
            stream,
        }
    }

    pub fn kind(&self) -> &ProviderKind {
        &self.kind
    }

    /// The source node descriptors. Output and schema providers have
    /// exactly one; a merged render provider may have several.
    pub fn source_nodes(&self) -> &[NodeDesc] {
        &self.nodes
    }

    /// The source output field, for output providers.
    pub fn source_field(&self) -> Option<&str> {
        match &self.kind {
            ProviderKind::Output { field } => Some(field),
            _ => None,
        }
    }

    /// The cached tool descriptor, for schema providers.
    pub fn tool_schema(&self) -> Option<&ToolSchema> {
        self.schema.as_ref()
    }

    /// Observe every published value of this output field, in publication
    /// order, across runs. Hot: only values published after the call are
    /// seen.
    pub fn subscribe(&self) -> FieldSubscription {
        FieldSubscription {
            node_id: self.nodes[0].id.clone(),
            field: self.source_field().unwrap_or_default().to_string(),
            sub: self.stream.subscribe(),
        }
    }

    /// Resolve with the first value of this output field published for
    /// `run_id`, or `None` if the node reaches a terminal event for that
    /// run without carrying the field.
    ///
    /// The subscription is opened synchronously at the call, so events
    /// published after `select` returns its future are never missed; like
    /// the bus itself it observes no history.
    pub fn select(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Option<serde_json::Value>> + Send + 'static {
        let node_id = self.nodes[0].id.clone();
        let field = self.source_field().map(str::to_string);
        let run_id = run_id.to_string();
        let mut sub = self.stream.subscribe();
        async move {
            let field = field?;
            while let Some(event) = sub.recv().await {
                if event.run().id != run_id {
                    continue;
                }
                match &event {
                    AgentEvent::Output { node, output, .. } if node.id == node_id => {
                        if let Some(value) = output.get(&field) {
                            return Some(value.clone());
                        }
                    }
                    _ if event.is_terminal_for(&node_id) => return None,
                    _ => {}
                }
            }
            None
        }
    }

    /// Open a live feed of this provider's render updates for `run_id`.
    ///
    /// The feed closes once every source node has emitted a terminal event
    /// for the run. Hot semantics: call before the run's events flow.
    pub fn watch(&self, run_id: &str) -> RenderFeed {
        let (sender, feed) = RenderFeed::channel(self.nodes.clone());
        let mut pending: std::collections::HashSet<String> =
            self.nodes.iter().map(|n| n.id.clone()).collect();
        let mut sub = self.stream.subscribe();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                if event.run().id != run_id {
                    continue;
                }
                match event {
                    AgentEvent::Render { node, render, .. } if pending.contains(&node.id) => {
                        sender.send(RenderUpdate {
                            node,
                            step: render.step,
                            data: render.data,
                        });
                    }
                    AgentEvent::RunCompleted { node, .. } | AgentEvent::RunSkipped { node, .. } => {
                        pending.remove(&node.id);
                        if pending.is_empty() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        });
        feed
    }
}

impl std::fmt::Debug for ValueProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueProvider")
            .field("kind", &self.kind)
            .field("nodes", &self.nodes)
            .finish()
    }
}

/// Merge multiple render providers into one.
///
/// The merged provider's per-run feed interleaves every member node's
/// updates and closes once all members are terminal. Used when a sink must
/// show UI fragments from several tool nodes at once.
pub fn merge_render_streams(providers: &[ValueProvider]) -> Result<ValueProvider> {
    let mut nodes = Vec::new();
    let mut stream = None;
    for provider in providers {
        if !matches!(provider.kind(), ProviderKind::Render) {
            return Err(GraphError::SchemaViolation {
                node: provider.nodes[0].id.clone(),
                message: "merge_render_streams accepts only render providers".to_string(),
            });
        }
        for node in provider.source_nodes() {
            if !nodes.contains(node) {
                nodes.push(node.clone());
            }
        }
        stream.get_or_insert_with(|| provider.stream.clone());
    }
    let stream = stream.ok_or_else(|| GraphError::SchemaViolation {
        node: String::new(),
        message: "merge_render_streams requires at least one provider".to_string(),
    })?;
    Ok(ValueProvider::render(nodes, stream))
}

/// A value observed on an output field
#[derive(Debug, Clone)]
pub struct FieldValue {
    pub run: Run,
    pub field: String,
    pub value: serde_json::Value,
}

/// Subscription over one node's output field
pub struct FieldSubscription {
    node_id: String,
    field: String,
    sub: crate::event::EventSubscription,
}

impl FieldSubscription {
    /// Next matching value, or `None` once the bus closes.
    pub async fn next(&mut self) -> Option<FieldValue> {
        while let Some(event) = self.sub.recv().await {
            if let AgentEvent::Output { run, node, output } = event {
                if node.id == self.node_id {
                    if let Some(value) = output.get(&self.field) {
                        return Some(FieldValue {
                            run,
                            field: self.field.clone(),
                            value: value.clone(),
                        });
                    }
                }
            }
        }
        None
    }
}

/// One render fragment flowing through a feed
#[derive(Debug, Clone)]
pub struct RenderUpdate {
    pub node: NodeDesc,
    pub step: String,
    pub data: serde_json::Value,
}

/// Receiver half of a per-run render feed.
pub type RenderFeedReceiver = mpsc::UnboundedReceiver<RenderUpdate>;

/// A live, per-run stream of render updates from one or more source nodes.
///
/// The feed is handed to consumers as an input value; the first consumer to
/// call [`RenderFeed::take`] owns the receiver. The sender side is driven
/// by the bound node's dispatcher and dropped when every source node has
/// emitted a terminal event, which closes the receiver.
#[derive(Debug, Clone)]
pub struct RenderFeed {
    sources: Vec<NodeDesc>,
    rx: Arc<Mutex<Option<RenderFeedReceiver>>>,
}

impl RenderFeed {
    pub(crate) fn channel(sources: Vec<NodeDesc>) -> (RenderFeedSender, RenderFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RenderFeedSender { tx },
            RenderFeed {
                sources,
                rx: Arc::new(Mutex::new(Some(rx))),
            },
        )
    }

    /// The nodes feeding this stream.
    pub fn sources(&self) -> &[NodeDesc] {
        &self.sources
    }

    /// Take the receiver. Returns `None` if it was already taken.
    pub fn take(&self) -> Option<RenderFeedReceiver> {
        self.rx.lock().expect("render feed lock poisoned").take()
    }
}

/// Sender half of a render feed, held by the dispatcher.
#[derive(Debug)]
pub(crate) struct RenderFeedSender {
    tx: mpsc::UnboundedSender<RenderUpdate>,
}

impl RenderFeedSender {
    pub(crate) fn send(&self, update: RenderUpdate) {
        // Receiver may have been dropped by an uninterested consumer
        let _ = self.tx.send(update);
    }
}
