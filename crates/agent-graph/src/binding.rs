//! Binding declarations: how a node's input fields are fed.
//!
//! Each target field is fed by a single provider, an array of providers,
//! or a literal value. At bind time the providers are classified by their
//! tag into output, schema and render sources; that classification is what
//! drives the per-run correlation machinery in `graph_node`.

use std::collections::{HashMap, HashSet};

use crate::error::{GraphError, Result};
use crate::event::NodeDesc;
use crate::provider::{ProviderKind, ValueProvider};
use crate::schema::{IoSchema, ToolSchema};

/// One target field's source
#[derive(Debug, Clone)]
pub enum BindingSource {
    /// A single upstream provider (scalar binding)
    Provider(ValueProvider),
    /// Several upstream providers (array binding)
    Providers(Vec<ValueProvider>),
    /// A fixed value, injected at run start and not counted toward
    /// completeness
    Value(serde_json::Value),
}

impl From<ValueProvider> for BindingSource {
    fn from(provider: ValueProvider) -> Self {
        BindingSource::Provider(provider)
    }
}

impl From<Vec<ValueProvider>> for BindingSource {
    fn from(providers: Vec<ValueProvider>) -> Self {
        BindingSource::Providers(providers)
    }
}

impl From<serde_json::Value> for BindingSource {
    fn from(value: serde_json::Value) -> Self {
        BindingSource::Value(value)
    }
}

/// The edge map handed to `GraphNode::bind`
#[derive(Debug, Default)]
pub struct Bindings {
    entries: Vec<(String, BindingSource)>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding for `field`.
    pub fn with(mut self, field: impl Into<String>, source: impl Into<BindingSource>) -> Self {
        self.entries.push((field.into(), source.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> Vec<(String, BindingSource)> {
        self.entries
    }
}

/// A (source node, source field) → target field output mapping
#[derive(Debug, Clone)]
pub(crate) struct OutputMapping {
    pub source_node: String,
    pub source_field: String,
    pub target_field: String,
    pub is_array: bool,
}

/// A schema-bound upstream node
#[derive(Debug, Clone)]
pub(crate) struct SchemaSource {
    pub node: NodeDesc,
    pub schema: ToolSchema,
    pub target_field: String,
    pub is_array: bool,
}

/// A render-bound set of upstream nodes (one provider, possibly merged)
#[derive(Debug, Clone)]
pub(crate) struct RenderSource {
    pub nodes: Vec<NodeDesc>,
    pub target_field: String,
    pub is_array: bool,
}

/// The classified, immutable result of `bind`
#[derive(Debug, Default)]
pub(crate) struct BoundEdges {
    pub output_mappings: Vec<OutputMapping>,
    /// Unique source node ids across all output mappings
    pub output_producers: HashSet<String>,
    pub schema_sources: Vec<SchemaSource>,
    pub render_sources: Vec<RenderSource>,
    pub literals: HashMap<String, serde_json::Value>,
    /// Counted providers per target field (the group cap)
    pub field_capacity: HashMap<String, usize>,
    /// Total counted providers; the input is complete when the
    /// accumulator's count reaches this
    pub expected_count: usize,
}

impl BoundEdges {
    /// Classify a binding map against the node's declared input schema.
    pub fn from_bindings(node_id: &str, input_schema: &IoSchema, bindings: Bindings) -> Result<Self> {
        let mut edges = BoundEdges::default();
        let mut seen_fields = HashSet::new();

        for (target_field, source) in bindings.into_entries() {
            if !input_schema.contains(&target_field) {
                return Err(GraphError::SchemaViolation {
                    node: node_id.to_string(),
                    message: format!("binding targets undeclared input field '{target_field}'"),
                });
            }
            if !seen_fields.insert(target_field.clone()) {
                return Err(GraphError::SchemaViolation {
                    node: node_id.to_string(),
                    message: format!("field '{target_field}' bound twice"),
                });
            }

            match source {
                BindingSource::Value(value) => {
                    edges.literals.insert(target_field, value);
                }
                BindingSource::Provider(provider) => {
                    edges.classify(provider, &target_field, false);
                }
                BindingSource::Providers(providers) => {
                    for provider in providers {
                        edges.classify(provider, &target_field, true);
                    }
                }
            }
        }

        Ok(edges)
    }

    fn classify(&mut self, provider: ValueProvider, target_field: &str, is_array: bool) {
        match provider.kind().clone() {
            ProviderKind::Output { field } => {
                let source = &provider.source_nodes()[0];
                self.output_producers.insert(source.id.clone());
                self.output_mappings.push(OutputMapping {
                    source_node: source.id.clone(),
                    source_field: field,
                    target_field: target_field.to_string(),
                    is_array,
                });
            }
            ProviderKind::Schema => {
                let source = provider.source_nodes()[0].clone();
                let schema = provider
                    .tool_schema()
                    .expect("schema provider carries its descriptor")
                    .clone();
                self.schema_sources.push(SchemaSource {
                    node: source,
                    schema,
                    target_field: target_field.to_string(),
                    is_array,
                });
            }
            ProviderKind::Render => {
                self.render_sources.push(RenderSource {
                    nodes: provider.source_nodes().to_vec(),
                    target_field: target_field.to_string(),
                    is_array,
                });
            }
        }
        *self
            .field_capacity
            .entry(target_field.to_string())
            .or_insert(0) += 1;
        self.expected_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventStream;
    use crate::schema::{DataType, FieldSpec, NodeMetadata};

    fn desc(id: &str) -> NodeDesc {
        NodeDesc {
            id: id.to_string(),
            node_type: "test".to_string(),
            version: "1.0.0".to_string(),
        }
    }

    fn input_schema() -> IoSchema {
        IoSchema::new(vec![
            FieldSpec::optional("v", "Value", DataType::Any),
            FieldSpec::optional("items", "Items", DataType::Any).list(),
            FieldSpec::optional("tools", "Tools", DataType::Any).list(),
            FieldSpec::optional("mode", "Mode", DataType::String),
        ])
    }

    fn tool(node_id: &str) -> ToolSchema {
        ToolSchema::for_node(
            node_id,
            &NodeMetadata {
                id: "tool".to_string(),
                version: "1.0.0".to_string(),
                name: "Tool".to_string(),
                description: None,
                input: IoSchema::empty(),
                output: IoSchema::empty(),
            },
        )
    }

    #[test]
    fn test_classification_and_counts() {
        let stream = EventStream::default();
        let bindings = Bindings::new()
            .with("v", ValueProvider::output(desc("a"), "x", stream.clone()))
            .with(
                "items",
                vec![
                    ValueProvider::output(desc("a"), "y", stream.clone()),
                    ValueProvider::output(desc("b"), "y", stream.clone()),
                ],
            )
            .with(
                "tools",
                vec![ValueProvider::schema(desc("w"), tool("w"), stream.clone())],
            )
            .with("mode", serde_json::json!("fast"));

        let edges = BoundEdges::from_bindings("c", &input_schema(), bindings).unwrap();

        assert_eq!(edges.output_mappings.len(), 3);
        assert_eq!(edges.output_producers.len(), 2);
        assert_eq!(edges.schema_sources.len(), 1);
        assert!(edges.schema_sources[0].is_array);
        assert_eq!(edges.literals.get("mode"), Some(&serde_json::json!("fast")));
        assert_eq!(edges.field_capacity["items"], 2);
        // literals are uncounted
        assert_eq!(edges.expected_count, 4);
    }

    #[test]
    fn test_undeclared_target_field_rejected() {
        let stream = EventStream::default();
        let bindings =
            Bindings::new().with("nope", ValueProvider::output(desc("a"), "x", stream));
        let err = BoundEdges::from_bindings("c", &input_schema(), bindings).unwrap_err();
        assert!(matches!(err, GraphError::SchemaViolation { .. }));
    }

    #[test]
    fn test_double_bound_field_rejected() {
        let stream = EventStream::default();
        let bindings = Bindings::new()
            .with("v", ValueProvider::output(desc("a"), "x", stream.clone()))
            .with("v", ValueProvider::output(desc("b"), "x", stream));
        assert!(BoundEdges::from_bindings("c", &input_schema(), bindings).is_err());
    }
}
