//! The user-facing sink node.
//!
//! `User` terminates a graph at the UI boundary. It republishes every
//! input field the moment it arrives, so consumers of its outputs receive
//! whatever subset of the inputs was actually produced upstream, and it
//! forwards bound render fragments onto its own render channel until the
//! upstream feeds close.

use std::sync::Arc;

use async_trait::async_trait;

use agent_graph::{
    AgentNode, DataType, FieldSpec, InputSlot, IoSchema, NodeContext, NodeInput, NodeMetadata,
    OutputMap, OutputStream, Result,
};

/// Sink node presenting markdown and UI fragments to the user.
#[derive(Debug, Clone, Default)]
pub struct UserNode;

impl UserNode {
    /// Field id for the rendered markdown input/output
    pub const FIELD_MARKDOWN: &'static str = "markdown";
    /// Field id for the streaming markdown input/output
    pub const FIELD_MARKDOWN_STREAM: &'static str = "markdown_stream";
    /// Field id for bound render streams
    pub const FIELD_UI: &'static str = "ui";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AgentNode for UserNode {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            id: "user".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            name: "User".to_string(),
            description: Some("Presents agent output to the user".to_string()),
            input: IoSchema::new(vec![
                FieldSpec::optional(Self::FIELD_MARKDOWN, "Markdown", DataType::String),
                FieldSpec::optional(
                    Self::FIELD_MARKDOWN_STREAM,
                    "Markdown Stream",
                    DataType::Stream,
                ),
                FieldSpec::optional(Self::FIELD_UI, "UI", DataType::Ui).list(),
            ]),
            output: IoSchema::new(vec![
                FieldSpec::optional(Self::FIELD_MARKDOWN, "Markdown", DataType::String),
                FieldSpec::optional(
                    Self::FIELD_MARKDOWN_STREAM,
                    "Markdown Stream",
                    DataType::Stream,
                ),
            ]),
        }
    }

    /// Republish each delivered input field as an output, without waiting
    /// for the rest of the input.
    async fn on_input_event(&self, ctx: NodeContext, partial: NodeInput) -> Result<()> {
        let mut output = OutputMap::new();
        for (field, slot) in partial.fields() {
            match slot {
                InputSlot::One(value) => {
                    if let Some(json) = value.as_json() {
                        output.insert(field.to_string(), json.clone());
                    }
                }
                InputSlot::Many(_) => {
                    let values: Vec<serde_json::Value> = slot
                        .values()
                        .filter_map(|v| v.as_json().cloned())
                        .collect();
                    if !values.is_empty() {
                        output.insert(field.to_string(), serde_json::Value::Array(values));
                    }
                }
            }
        }
        if !output.is_empty() {
            ctx.send_output(output);
        }
        Ok(())
    }

    fn execute(self: Arc<Self>, ctx: NodeContext, input: NodeInput) -> OutputStream {
        let feeds = input.render_feeds(Self::FIELD_UI);
        Box::pin(futures::stream::once(async move {
            for feed in feeds {
                let Some(mut updates) = feed.take() else { continue };
                while let Some(update) = updates.recv().await {
                    ctx.render(update.step, update.data);
                }
            }
            Ok(OutputMap::new())
        }))
    }
}
