//! Built-in nodes for the agent-graph runtime.
//!
//! This crate carries the node library that ships with the runtime:
//!
//! - `ChatCompletionNode`: streams a chat model's completion and
//!   dispatches requested tool calls back into the graph
//! - `UserNode`: the UI-boundary sink that republishes partial input and
//!   forwards render fragments
//! - the `ChatExecutor` contract and well-known keys through which the
//!   external LLM transport plugs in

pub mod chat;
pub mod executor;
pub mod user;

pub use chat::ChatCompletionNode;
pub use executor::{
    keys, ChatDelta, ChatExecutor, ChatRequest, DeltaStream, ModelMetadata, RequestSpec,
};
pub use user::UserNode;
