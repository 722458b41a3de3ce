//! Agent Graph - per-run dataflow runtime for LLM agent nodes
//!
//! This crate wires independently authored agent nodes into a directed
//! graph and drives logical runs through it. Nodes declare input/output
//! schemas and produce partial outputs plus UI render updates; the runtime
//! routes values between them over a hot event stream, decides when a node
//! has enough input to fire, and propagates skip signals so every node
//! reaches exactly one terminal event per run.
//!
//! # Architecture
//!
//! - `EventStream`: the multicast bus carrying all `AgentEvent`s
//! - `AgentNode`: the node contract (metadata, init, input hook, execute)
//! - `GraphNode`: per-node binding, run correlation, firing and publishing
//! - `GraphAgent`: the outer object owning the stream and the node table
//!
//! # Example
//!
//! ```ignore
//! use agent_graph::{Bindings, GraphAgent};
//!
//! let agent = GraphAgent::new();
//! let chat = agent.add_node("chat", chat_node, None).await?;
//! let user = agent.add_node("user", user_node, None).await?;
//! user.bind(Bindings::new().with("markdown", chat.output("message")))?;
//! let run = agent.invoke("chat", serde_json::json!({"prompt": "hi"}))?;
//! let output = run.output().await?;
//! ```

pub mod binding;
pub mod context;
pub mod error;
pub mod event;
pub mod graph;
pub mod graph_node;
pub mod node;
pub mod provider;
pub mod reducer;
pub mod schema;
pub mod services;

// Re-export key types
pub use binding::{BindingSource, Bindings};
pub use context::{NodeContext, RenderHandle};
pub use error::{GraphError, ProtocolViolation, Result};
pub use event::{
    AgentEvent, EventStream, EventSubscription, NodeDesc, OutputMap, RenderPayload, Run,
    NODE_INIT_RUN,
};
pub use graph::GraphAgent;
pub use graph_node::{GraphNode, Invocation};
pub use node::{create_agent_node, AgentNode, InputSlot, InputValue, NodeConfig, NodeInput, OutputStream};
pub use provider::{
    merge_render_streams, FieldSubscription, FieldValue, ProviderKind, RenderFeed,
    RenderFeedReceiver, RenderUpdate, ValueProvider,
};
pub use reducer::MappedInput;
pub use schema::{DataType, FieldSpec, IoSchema, NodeMetadata, ToolSchema};
pub use services::{GlobalState, Services};
