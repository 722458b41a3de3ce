//! Graph nodes: per-node binding, run correlation, firing and publishing.
//!
//! Each node added to the graph gets one `GraphNode`. Binding classifies
//! its input sources and installs a dispatcher task over the event stream.
//! The dispatcher keeps a per-run state table and translates events into
//! state transitions:
//!
//! - `RunInvoked` creates the run state, injects literals, delivers the
//!   cached tool descriptors of schema-bound upstreams and opens one live
//!   render feed per render source;
//! - `Output` events from output-source nodes fan out into one accumulator
//!   entry per matching (source field → target field) mapping, capped per
//!   field;
//! - each input field group is delivered to `on_input_event` as soon as it
//!   is complete, without waiting for the whole input;
//! - once every unique output producer has emitted a terminal event the
//!   node fires: a complete accumulator invokes `execute`, an incomplete
//!   one publishes `RunSkipped`;
//! - when the node's own terminal event comes back around, any schema-bound
//!   upstream that never ran for this run is issued a synthetic
//!   `RunSkipped`, so downstream render and output bindings on those nodes
//!   terminate cleanly.
//!
//! Because the bus delivers events to each subscriber in publication
//! order, a tool invoked during this node's activation is guaranteed to
//! have its terminal event processed here before our own, which keeps the
//! synthetic-skip pass from racing genuinely-invoked tools.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::oneshot;

use crate::binding::{Bindings, BoundEdges};
use crate::context::NodeContext;
use crate::error::{GraphError, Result};
use crate::event::{AgentEvent, EventStream, NodeDesc, OutputMap, RenderPayload, Run};
use crate::graph::GraphHandle;
use crate::node::{AgentNode, InputValue, NodeConfig, NodeInput};
use crate::provider::{RenderFeed, RenderFeedSender, RenderUpdate, ValueProvider};
use crate::reducer::MappedInput;
use crate::schema::{IoSchema, NodeMetadata, ToolSchema};

/// A node instance in the graph.
///
/// Cheap to clone; all clones refer to the same instance.
#[derive(Clone)]
pub struct GraphNode {
    inner: Arc<NodeInner>,
}

impl GraphNode {
    pub(crate) fn create(
        id: impl Into<String>,
        node: Arc<dyn AgentNode>,
        config: Option<NodeConfig>,
        stream: EventStream,
        graph: GraphHandle,
    ) -> Self {
        let id = id.into();
        let metadata = node.metadata();
        let desc = NodeDesc {
            id: id.clone(),
            node_type: metadata.id.clone(),
            version: metadata.version.clone(),
        };
        let tool = ToolSchema::for_node(&id, &metadata);
        Self {
            inner: Arc::new(NodeInner {
                id,
                desc,
                declared_output: Arc::new(metadata.output.clone()),
                metadata,
                node,
                config: Arc::new(config.unwrap_or(serde_json::Value::Null)),
                tool,
                stream,
                graph,
                edges: Mutex::new(None),
                runs: Mutex::new(HashMap::new()),
                providers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Graph-local node id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn metadata(&self) -> &NodeMetadata {
        &self.inner.metadata
    }

    pub fn desc(&self) -> &NodeDesc {
        &self.inner.desc
    }

    /// Provider for one of this node's output fields.
    ///
    /// Lazily materialized per accessed field and cached. Fields outside
    /// the declared output schema produce a provider that never fires
    /// (undeclared fields are dropped at publish time).
    pub fn output(&self, field: &str) -> ValueProvider {
        let mut providers = self.inner.providers.lock().expect("provider cache poisoned");
        providers
            .entry(field.to_string())
            .or_insert_with(|| {
                ValueProvider::output(self.inner.desc.clone(), field, self.inner.stream.clone())
            })
            .clone()
    }

    /// Provider carrying this node's run-independent tool descriptor.
    pub fn schema(&self) -> ValueProvider {
        ValueProvider::schema(
            self.inner.desc.clone(),
            self.inner.tool.clone(),
            self.inner.stream.clone(),
        )
    }

    /// Provider over this node's per-run render streams.
    pub fn render(&self) -> ValueProvider {
        ValueProvider::render(vec![self.inner.desc.clone()], self.inner.stream.clone())
    }

    /// Wire this node's input fields to upstream providers and literals,
    /// and start correlating runs. May be called at most once.
    pub fn bind(&self, bindings: Bindings) -> Result<()> {
        let edges = BoundEdges::from_bindings(&self.inner.id, &self.inner.metadata.input, bindings)?;
        let edges = {
            let mut slot = self.inner.edges.lock().expect("edge table poisoned");
            if slot.is_some() {
                return Err(GraphError::AlreadyBound(self.inner.id.clone()));
            }
            let edges = Arc::new(edges);
            *slot = Some(Arc::clone(&edges));
            edges
        };

        // Subscribe before returning so no event published after bind()
        // can be missed by the dispatcher.
        let mut sub = self.inner.stream.subscribe();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                dispatch_event(&inner, &edges, event).await;
            }
        });
        Ok(())
    }

    /// Invoke this node directly, seeding a fresh run.
    pub fn invoke(&self, input: NodeInput) -> Invocation {
        self.invoke_with(input, None)
    }

    /// Invoke this node directly. When `run` is supplied the caller is
    /// joining an existing run and no `RunInvoked` is emitted.
    pub fn invoke_with(&self, input: NodeInput, run: Option<Run>) -> Invocation {
        let run = match run {
            Some(run) => run,
            None => {
                let run = Run::new();
                self.inner
                    .stream
                    .publish(AgentEvent::RunInvoked { run: run.clone() });
                run
            }
        };
        let ctx = self.inner.activate(run.clone());
        let (tx, rx) = oneshot::channel();
        tokio::spawn(run_activation(Arc::clone(&self.inner), ctx, input, Some(tx)));
        Invocation { run, output: rx }
    }

    pub(crate) async fn init(&self) -> Result<()> {
        let ctx = self.inner.activate(Run::init());
        self.inner.node.init(ctx).await
    }
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.inner.id)
            .field("node_type", &self.inner.desc.node_type)
            .finish()
    }
}

/// A started invocation: the run it belongs to plus the promise of the
/// node's merged output.
pub struct Invocation {
    pub run: Run,
    output: oneshot::Receiver<Result<OutputMap>>,
}

impl Invocation {
    /// Wait for the activation to finish and return its merged output.
    pub async fn output(self) -> Result<OutputMap> {
        self.output
            .await
            .map_err(|_| GraphError::ActivationDropped)?
    }
}

struct NodeInner {
    id: String,
    desc: NodeDesc,
    metadata: NodeMetadata,
    declared_output: Arc<IoSchema>,
    node: Arc<dyn AgentNode>,
    config: Arc<NodeConfig>,
    tool: ToolSchema,
    stream: EventStream,
    graph: GraphHandle,
    edges: Mutex<Option<Arc<BoundEdges>>>,
    runs: Mutex<HashMap<String, RunState>>,
    providers: Mutex<HashMap<String, ValueProvider>>,
}

impl NodeInner {
    fn activate(&self, run: Run) -> NodeContext {
        NodeContext::new(
            run,
            self.desc.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.declared_output),
            self.stream.clone(),
            self.graph.clone(),
        )
    }
}

/// Per-run correlation state
struct RunState {
    ctx: NodeContext,
    input: NodeInput,
    /// Output-source nodes that have not yet emitted a terminal event
    pending_producers: HashSet<String>,
    outputs_closed: bool,
    fired: bool,
    /// Our own terminal event has come back around on the bus
    terminal_seen: bool,
    skips_propagated: bool,
    /// Schema-source nodes with no terminal event yet for this run
    schema_pending: HashMap<String, NodeDesc>,
    feeds: Vec<ActiveFeed>,
    /// Accepted entries per target field, checked against the field cap
    progress: HashMap<String, usize>,
    /// Fields already handed to `on_input_event`
    delivered: HashSet<String>,
}

/// Sender side of one render source's per-run feed
struct ActiveFeed {
    pending: HashSet<String>,
    sender: RenderFeedSender,
}

/// Work computed under the run-table lock, performed after releasing it
enum Action {
    Deliver(NodeContext, NodeInput),
    Fire(NodeContext, NodeInput),
    Skip(Run),
    SyntheticSkip(Run, NodeDesc),
}

async fn dispatch_event(inner: &Arc<NodeInner>, edges: &Arc<BoundEdges>, event: AgentEvent) {
    let mut actions = Vec::new();
    match event {
        AgentEvent::RunInvoked { run } => on_run_invoked(inner, edges, run, &mut actions),
        AgentEvent::Output { run, node, output } => {
            on_output(inner, edges, run, node, output, &mut actions)
        }
        AgentEvent::Render { run, node, render } => on_render(inner, run, node, render),
        AgentEvent::RunCompleted { run, node } | AgentEvent::RunSkipped { run, node } => {
            on_terminal(inner, edges, run, node, &mut actions)
        }
    }

    for action in actions {
        match action {
            Action::Deliver(ctx, partial) => {
                if let Err(err) = inner.node.on_input_event(ctx, partial).await {
                    log::error!("node '{}' on_input_event failed: {err}", inner.id);
                }
            }
            Action::Fire(ctx, input) => {
                tokio::spawn(run_activation(Arc::clone(inner), ctx, input, None));
            }
            Action::Skip(run) => {
                inner.stream.publish(AgentEvent::RunSkipped {
                    run,
                    node: inner.desc.clone(),
                });
            }
            Action::SyntheticSkip(run, node) => {
                log::debug!(
                    "node '{}' skipping un-invoked schema source '{}' for run {}",
                    inner.id,
                    node.id,
                    run
                );
                inner.stream.publish(AgentEvent::RunSkipped { run, node });
            }
        }
    }
}

fn on_run_invoked(
    inner: &Arc<NodeInner>,
    edges: &Arc<BoundEdges>,
    run: Run,
    actions: &mut Vec<Action>,
) {
    let mut runs = inner.runs.lock().expect("run table poisoned");
    if runs.contains_key(&run.id) {
        return;
    }

    let mut state = RunState {
        ctx: inner.activate(run.clone()),
        input: NodeInput::new(),
        pending_producers: edges.output_producers.clone(),
        outputs_closed: false,
        fired: false,
        terminal_seen: false,
        skips_propagated: false,
        schema_pending: HashMap::new(),
        feeds: Vec::new(),
        progress: HashMap::new(),
        delivered: HashSet::new(),
    };

    for (field, value) in &edges.literals {
        state.input.set_literal(field.clone(), value.clone());
        state.delivered.insert(field.clone());
        if let Some(partial) = state.input.partial_for(field) {
            actions.push(Action::Deliver(state.ctx.clone(), partial));
        }
    }

    // Schema sources are run-independent: their cached descriptors are
    // available the moment the run starts.
    for source in &edges.schema_sources {
        let entry = MappedInput::new(
            run.clone(),
            &source.target_field,
            source.is_array,
            Some(InputValue::Schema(source.schema.clone())),
        );
        if accept_entry(inner, &mut state, entry) == Accepted {
            state
                .schema_pending
                .insert(source.node.id.clone(), source.node.clone());
        }
    }

    for source in &edges.render_sources {
        let (sender, feed) = RenderFeed::channel(source.nodes.clone());
        let entry = MappedInput::new(
            run.clone(),
            &source.target_field,
            source.is_array,
            Some(InputValue::Render(feed)),
        );
        if accept_entry(inner, &mut state, entry) == Accepted {
            state.feeds.push(ActiveFeed {
                pending: source.nodes.iter().map(|n| n.id.clone()).collect(),
                sender,
            });
        }
    }

    collect_ready(edges, &mut state, actions);

    if state.pending_producers.is_empty() {
        state.outputs_closed = true;
        decide_fire(inner, edges, &run, &mut state, actions);
    }

    runs.insert(run.id.clone(), state);
}

fn on_output(
    inner: &Arc<NodeInner>,
    edges: &Arc<BoundEdges>,
    run: Run,
    node: NodeDesc,
    output: OutputMap,
    actions: &mut Vec<Action>,
) {
    let mut runs = inner.runs.lock().expect("run table poisoned");
    let Some(state) = runs.get_mut(&run.id) else {
        return;
    };
    if state.fired || state.outputs_closed || !edges.output_producers.contains(&node.id) {
        return;
    }

    for mapping in edges
        .output_mappings
        .iter()
        .filter(|m| m.source_node == node.id)
    {
        // Absent source field models an undefined upstream value
        let Some(value) = output.get(&mapping.source_field) else {
            continue;
        };
        let cap = edges
            .field_capacity
            .get(&mapping.target_field)
            .copied()
            .unwrap_or(0);
        if state.progress.get(&mapping.target_field).copied().unwrap_or(0) >= cap {
            continue;
        }
        let entry = MappedInput::new(
            run.clone(),
            &mapping.target_field,
            mapping.is_array,
            Some(InputValue::Json(value.clone())),
        );
        if accept_entry(inner, state, entry) == Poisoned {
            actions.push(Action::Skip(run.clone()));
            return;
        }
    }

    collect_ready(edges, state, actions);
}

fn on_render(inner: &Arc<NodeInner>, run: Run, node: NodeDesc, render: RenderPayload) {
    let mut runs = inner.runs.lock().expect("run table poisoned");
    let Some(state) = runs.get_mut(&run.id) else {
        return;
    };
    for feed in &state.feeds {
        if feed.pending.contains(&node.id) {
            feed.sender.send(RenderUpdate {
                node: node.clone(),
                step: render.step.clone(),
                data: render.data.clone(),
            });
        }
    }
}

fn on_terminal(
    inner: &Arc<NodeInner>,
    edges: &Arc<BoundEdges>,
    run: Run,
    node: NodeDesc,
    actions: &mut Vec<Action>,
) {
    let mut runs = inner.runs.lock().expect("run table poisoned");
    let Some(state) = runs.get_mut(&run.id) else {
        return;
    };

    // Dropping a drained feed drops its sender, which closes the consumer's
    // receiver.
    state.feeds.retain_mut(|feed| {
        feed.pending.remove(&node.id);
        !feed.pending.is_empty()
    });

    state.schema_pending.remove(&node.id);

    if node.id == inner.id {
        state.terminal_seen = true;
        state.fired = true;
        if !state.skips_propagated {
            state.skips_propagated = true;
            for (_, desc) in state.schema_pending.drain() {
                actions.push(Action::SyntheticSkip(run.clone(), desc));
            }
        }
    }

    if state.pending_producers.remove(&node.id) && state.pending_producers.is_empty() {
        state.outputs_closed = true;
        // Array groups cut short by a skipped producer still deliver what
        // they have.
        flush_partial_groups(state, actions);
        decide_fire(inner, edges, &run, state, actions);
    }

    if state.terminal_seen && state.feeds.is_empty() {
        runs.remove(&run.id);
    }
}

#[derive(PartialEq)]
enum Accept {
    Accepted,
    Dropped,
    Poisoned,
}
use Accept::{Accepted, Poisoned};

/// Fold one entry into the accumulator; a protocol violation poisons the
/// run state so the node ends up skipped.
fn accept_entry(inner: &Arc<NodeInner>, state: &mut RunState, entry: MappedInput) -> Accept {
    let field = entry.target_field.clone();
    match state.input.accept(entry) {
        Ok(true) => {
            *state.progress.entry(field).or_insert(0) += 1;
            Accepted
        }
        Ok(false) => Accept::Dropped,
        Err(err) => {
            log::error!("node '{}' input protocol violation: {err}", inner.id);
            state.fired = true;
            Poisoned
        }
    }
}

/// Deliver every field group that just reached its cap.
fn collect_ready(edges: &Arc<BoundEdges>, state: &mut RunState, actions: &mut Vec<Action>) {
    for (field, cap) in &edges.field_capacity {
        if state.delivered.contains(field) {
            continue;
        }
        let progress = state.progress.get(field).copied().unwrap_or(0);
        if progress > 0 && progress >= *cap {
            if let Some(partial) = state.input.partial_for(field) {
                state.delivered.insert(field.clone());
                actions.push(Action::Deliver(state.ctx.clone(), partial));
            }
        }
    }
}

/// Deliver partially filled groups once no more output values can arrive.
fn flush_partial_groups(state: &mut RunState, actions: &mut Vec<Action>) {
    let ready: Vec<String> = state
        .progress
        .iter()
        .filter(|(field, progress)| **progress > 0 && !state.delivered.contains(*field))
        .map(|(field, _)| field.clone())
        .collect();
    for field in ready {
        if let Some(partial) = state.input.partial_for(&field) {
            state.delivered.insert(field);
            actions.push(Action::Deliver(state.ctx.clone(), partial));
        }
    }
}

/// Both preconditions observed: every output producer is terminal and the
/// accumulator can no longer grow. Execute on a complete input, skip
/// otherwise.
fn decide_fire(
    inner: &Arc<NodeInner>,
    edges: &Arc<BoundEdges>,
    run: &Run,
    state: &mut RunState,
    actions: &mut Vec<Action>,
) {
    if state.fired || state.terminal_seen {
        return;
    }
    state.fired = true;
    if state.input.count() == edges.expected_count {
        let mut input = state.input.clone();
        if input.run().is_none() {
            input.set_run(run.clone());
        }
        actions.push(Action::Fire(state.ctx.clone(), input));
    } else {
        log::debug!(
            "node '{}' skipping run {}: {}/{} inputs arrived",
            inner.id,
            run,
            state.input.count(),
            edges.expected_count
        );
        actions.push(Action::Skip(run.clone()));
    }
}

/// Drive one activation: iterate the node's generator, publish each yield,
/// publish the terminal event, resolve the invocation promise.
async fn run_activation(
    inner: Arc<NodeInner>,
    ctx: NodeContext,
    input: NodeInput,
    reply: Option<oneshot::Sender<Result<OutputMap>>>,
) {
    let run = ctx.run().clone();
    let mut stream = Arc::clone(&inner.node).execute(ctx.clone(), input);
    let mut failure = None;

    while let Some(item) = stream.next().await {
        match item {
            Ok(partial) => ctx.send_output(partial),
            Err(err) => {
                if inner.declared_output.contains("error") {
                    let mut output = OutputMap::new();
                    output.insert("error".to_string(), serde_json::json!(err.to_string()));
                    ctx.send_output(output);
                } else {
                    failure = Some(err);
                }
                break;
            }
        }
    }
    drop(stream);

    inner.stream.publish(AgentEvent::RunCompleted {
        run: run.clone(),
        node: inner.desc.clone(),
    });

    match (reply, failure) {
        (Some(tx), None) => {
            let _ = tx.send(Ok(ctx.collected_output()));
        }
        (Some(tx), Some(err)) => {
            let _ = tx.send(Err(err));
        }
        (None, Some(err)) => {
            log::error!("node '{}' failed for run {run}: {err}", inner.id);
        }
        (None, None) => {}
    }
}
