//! Per-activation context handed to node code.
//!
//! The context carries the run and node identity, the node's config, and
//! the imperative surfaces: `send_output` (equivalent to yielding from
//! `execute`), `render` for UI updates, the typed service locator, the
//! global state map, and same-run tool dispatch.

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::event::{EventStream, NodeDesc, OutputMap, RenderPayload, Run};
use crate::graph::GraphHandle;
use crate::node::{NodeConfig, NodeInput};
use crate::schema::{IoSchema, ToolSchema};

/// Handle passed to `init`, `on_input_event` and `execute`.
///
/// Cloning is cheap; all clones of one activation share the same output
/// collector, so imperative sends and stream yields merge into the same
/// accumulated output.
#[derive(Clone)]
pub struct NodeContext {
    run: Run,
    node: NodeDesc,
    config: Arc<NodeConfig>,
    declared_output: Arc<IoSchema>,
    stream: EventStream,
    graph: GraphHandle,
    collector: Arc<Mutex<OutputMap>>,
}

impl NodeContext {
    pub(crate) fn new(
        run: Run,
        node: NodeDesc,
        config: Arc<NodeConfig>,
        declared_output: Arc<IoSchema>,
        stream: EventStream,
        graph: GraphHandle,
    ) -> Self {
        Self {
            run,
            node,
            config,
            declared_output,
            stream,
            graph,
            collector: Arc::new(Mutex::new(OutputMap::new())),
        }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn node(&self) -> &NodeDesc {
        &self.node
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Publish a partial output map.
    ///
    /// Fields not declared in the node's output schema are dropped (they
    /// could never match a downstream binding anyway). Empty maps publish
    /// nothing.
    pub fn send_output(&self, output: OutputMap) {
        let mut filtered = OutputMap::new();
        for (field, value) in output {
            if self.declared_output.contains(&field) {
                filtered.insert(field, value);
            } else {
                log::warn!(
                    "node '{}' dropped undeclared output field '{}'",
                    self.node.id,
                    field
                );
            }
        }
        if filtered.is_empty() {
            return;
        }
        {
            let mut collected = self.collector.lock().expect("output collector poisoned");
            collected.extend(filtered.clone());
        }
        self.stream
            .send_output(self.run.clone(), self.node.clone(), filtered);
    }

    /// Publish a render update for `step` and get an updater for
    /// subsequent updates to the same step.
    pub fn render(&self, step: impl Into<String>, data: serde_json::Value) -> RenderHandle {
        let step = step.into();
        self.stream.send_render_update(
            self.run.clone(),
            self.node.clone(),
            RenderPayload {
                step: step.clone(),
                data,
            },
        );
        RenderHandle {
            run: self.run.clone(),
            node: self.node.clone(),
            step,
            stream: self.stream.clone(),
        }
    }

    /// Resolve an injected service by key.
    pub async fn resolve<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        let graph = self.graph.upgrade().ok()?;
        graph.services().get::<T>(key).await
    }

    /// Record a value in the per-graph global state map.
    pub async fn set_global_state(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let graph = self.graph.upgrade()?;
        graph.global_state().set(key, value).await;
        Ok(())
    }

    /// Read a value from the per-graph global state map.
    pub async fn global_state(&self, key: &str) -> Option<serde_json::Value> {
        let graph = self.graph.upgrade().ok()?;
        graph.global_state().get(key).await
    }

    /// Invoke the node behind a tool descriptor within the current run and
    /// wait for its merged output. No `RunInvoked` is emitted; the tool
    /// joins this activation's run.
    pub async fn invoke_tool(
        &self,
        tool: &ToolSchema,
        args: serde_json::Value,
    ) -> Result<OutputMap> {
        self.graph
            .invoke_node(&tool.node, NodeInput::from_json(args), self.run.clone())
            .await
    }

    /// Snapshot of everything sent so far in this activation.
    pub(crate) fn collected_output(&self) -> OutputMap {
        self.collector
            .lock()
            .expect("output collector poisoned")
            .clone()
    }
}

/// Updater returned by [`NodeContext::render`], bound to one step.
pub struct RenderHandle {
    run: Run,
    node: NodeDesc,
    step: String,
    stream: EventStream,
}

impl RenderHandle {
    /// Publish new data for the same step.
    pub fn update(&self, data: serde_json::Value) {
        self.stream.send_render_update(
            self.run.clone(),
            self.node.clone(),
            RenderPayload {
                step: self.step.clone(),
                data,
            },
        );
    }

    pub fn step(&self) -> &str {
        &self.step
    }
}
