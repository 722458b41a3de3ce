//! The agent node contract.
//!
//! A node is the polymorphic unit of the graph: a stable metadata
//! descriptor plus three lifecycle hooks. `init` runs once when the node is
//! added (with the synthetic `__NODE_INIT__` run), `on_input_event` fires
//! for each accumulated input delivery before execution, and `execute`
//! returns a finite stream of partial output maps — the runtime publishes
//! each yield as an `Output` event and emits `RunCompleted` when the
//! stream ends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::context::NodeContext;
use crate::error::Result;
use crate::event::{OutputMap, Run};
use crate::provider::RenderFeed;
use crate::schema::{NodeMetadata, ToolSchema};

/// Per-node configuration handed through `add_node`
pub type NodeConfig = serde_json::Value;

/// The finite sequence of partial outputs produced by one activation
pub type OutputStream = BoxStream<'static, Result<OutputMap>>;

/// A value delivered to a node input
#[derive(Debug, Clone)]
pub enum InputValue {
    /// A plain JSON value from an upstream output field
    Json(serde_json::Value),
    /// An upstream node's tool descriptor
    Schema(ToolSchema),
    /// A live per-run render feed from upstream nodes
    Render(RenderFeed),
}

impl InputValue {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            InputValue::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_schema(&self) -> Option<&ToolSchema> {
        match self {
            InputValue::Schema(schema) => Some(schema),
            _ => None,
        }
    }

    pub fn as_render(&self) -> Option<&RenderFeed> {
        match self {
            InputValue::Render(feed) => Some(feed),
            _ => None,
        }
    }
}

/// A bound input field's accumulated value: scalar or array, matching how
/// the field was bound.
#[derive(Debug, Clone)]
pub enum InputSlot {
    One(InputValue),
    Many(Vec<InputValue>),
}

impl InputSlot {
    /// Iterate the slot's values, scalar or not.
    pub fn values(&self) -> impl Iterator<Item = &InputValue> {
        match self {
            InputSlot::One(value) => std::slice::from_ref(value).iter(),
            InputSlot::Many(values) => values.iter(),
        }
    }
}

/// The accumulated input for one (run, node) activation.
///
/// This is also the record the input reducer folds into: `count` is the
/// number of accepted entries, which the runtime compares against the
/// number of bound providers to decide between executing and skipping.
#[derive(Debug, Clone, Default)]
pub struct NodeInput {
    run: Option<Run>,
    values: HashMap<String, InputSlot>,
    count: usize,
}

impl NodeInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an input from a JSON object, one scalar field per key.
    /// Non-object values produce an empty input.
    pub fn from_json(value: serde_json::Value) -> Self {
        let mut input = Self::new();
        if let serde_json::Value::Object(map) = value {
            for (field, value) in map {
                input.values.insert(field, InputSlot::One(InputValue::Json(value)));
                input.count += 1;
            }
        }
        input
    }

    pub fn run(&self) -> Option<&Run> {
        self.run.as_ref()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&InputSlot> {
        self.values.get(field)
    }

    /// Iterate over (field, slot) pairs.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &InputSlot)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The field's JSON value, for scalar JSON bindings.
    pub fn json(&self, field: &str) -> Option<&serde_json::Value> {
        match self.values.get(field)? {
            InputSlot::One(value) => value.as_json(),
            InputSlot::Many(_) => None,
        }
    }

    /// All JSON values accumulated for an array-bound field.
    pub fn json_array(&self, field: &str) -> Vec<&serde_json::Value> {
        self.values
            .get(field)
            .map(|slot| slot.values().filter_map(InputValue::as_json).collect())
            .unwrap_or_default()
    }

    /// All tool schemas accumulated for a field.
    pub fn schemas(&self, field: &str) -> Vec<&ToolSchema> {
        self.values
            .get(field)
            .map(|slot| slot.values().filter_map(InputValue::as_schema).collect())
            .unwrap_or_default()
    }

    /// All render feeds accumulated for a field.
    pub fn render_feeds(&self, field: &str) -> Vec<RenderFeed> {
        self.values
            .get(field)
            .map(|slot| {
                slot.values()
                    .filter_map(InputValue::as_render)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Inject an uncounted field, used for literal bindings. Literals do
    /// not participate in input completeness.
    pub fn set_literal(&mut self, field: impl Into<String>, value: serde_json::Value) {
        self.values
            .insert(field.into(), InputSlot::One(InputValue::Json(value)));
    }

    pub(crate) fn set_run(&mut self, run: Run) {
        self.run = Some(run);
    }

    pub(crate) fn values_mut(&mut self) -> &mut HashMap<String, InputSlot> {
        &mut self.values
    }

    pub(crate) fn bump_count(&mut self) {
        self.count += 1;
    }

    /// Extract a single-field partial input for `on_input_event` delivery.
    pub(crate) fn partial_for(&self, field: &str) -> Option<NodeInput> {
        let slot = self.values.get(field)?.clone();
        let count = match &slot {
            InputSlot::One(_) => 1,
            InputSlot::Many(values) => values.len(),
        };
        let mut values = HashMap::new();
        values.insert(field.to_string(), slot);
        Some(NodeInput {
            run: self.run.clone(),
            values,
            count,
        })
    }
}

/// The polymorphic agent node contract.
///
/// Implementations are shared (`Arc`) between the graph and any tool
/// consumers, so node state must be interior and `Send + Sync`.
#[async_trait]
pub trait AgentNode: Send + Sync {
    /// Stable descriptor for this node type
    fn metadata(&self) -> NodeMetadata;

    /// One-time initialization, called when the node is added to a graph
    /// with the synthetic `__NODE_INIT__` run id. Must not depend on run
    /// inputs; may prime lazy resources.
    async fn init(&self, _ctx: NodeContext) -> Result<()> {
        Ok(())
    }

    /// Pre-execute hook, called once per accumulated-field delivery for a
    /// run. Sinks override this to act on partial input without waiting
    /// for the full set. Must not consume render feeds.
    async fn on_input_event(&self, _ctx: NodeContext, _partial: NodeInput) -> Result<()> {
        Ok(())
    }

    /// Produce this activation's outputs as a finite stream of partial
    /// maps. Each yield must only use declared output fields; completion
    /// of the stream signals `RunCompleted`.
    fn execute(self: Arc<Self>, ctx: NodeContext, input: NodeInput) -> OutputStream;
}

/// Convenience factory: build an [`AgentNode`] from metadata plus a
/// closure producing the output stream.
pub fn create_agent_node<F>(metadata: NodeMetadata, run: F) -> Arc<dyn AgentNode>
where
    F: Fn(NodeContext, NodeInput) -> OutputStream + Send + Sync + 'static,
{
    Arc::new(FnAgentNode {
        metadata,
        run: Box::new(run),
    })
}

struct FnAgentNode {
    metadata: NodeMetadata,
    run: Box<dyn Fn(NodeContext, NodeInput) -> OutputStream + Send + Sync>,
}

#[async_trait]
impl AgentNode for FnAgentNode {
    fn metadata(&self) -> NodeMetadata {
        self.metadata.clone()
    }

    fn execute(self: Arc<Self>, ctx: NodeContext, input: NodeInput) -> OutputStream {
        (self.run)(ctx, input)
    }
}
