//! Field schemas and node metadata.
//!
//! A node declares its input and output surface as a list of [`FieldSpec`]s
//! with UI labels. The same declarations are the single source of truth for
//! binding validation and for the tool parameter descriptors offered to
//! LLM nodes.

use serde::{Deserialize, Serialize};

/// The data type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Accepts any type
    Any,
    /// Text string
    String,
    /// Numeric value
    Number,
    /// Boolean value
    Boolean,
    /// JSON object
    Object,
    /// Streaming data (delivered as successive partial outputs)
    Stream,
    /// UI fragment reference (render channel)
    Ui,
}

impl DataType {
    /// JSON-Schema type name used in tool parameter descriptors.
    fn json_type(&self) -> &'static str {
        match self {
            DataType::String | DataType::Stream => "string",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Object | DataType::Ui | DataType::Any => "object",
        }
    }
}

/// Declaration of a single input or output field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    /// Field identifier (used as the event output key)
    pub id: String,
    /// Human-readable label for UI naming
    pub label: String,
    /// Data type of the field
    pub data_type: DataType,
    /// Whether this field is required (for inputs)
    pub required: bool,
    /// Whether this field accepts multiple bound sources
    pub multiple: bool,
}

impl FieldSpec {
    /// Create a required field
    pub fn required(id: impl Into<String>, label: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            data_type,
            required: true,
            multiple: false,
        }
    }

    /// Create an optional field
    pub fn optional(id: impl Into<String>, label: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            data_type,
            required: false,
            multiple: false,
        }
    }

    /// Allow multiple bound sources for this field
    pub fn list(mut self) -> Self {
        self.multiple = true;
        self
    }
}

/// An input or output surface: an ordered collection of field specs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoSchema {
    pub fields: Vec<FieldSpec>,
}

impl IoSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a field by id
    pub fn field(&self, id: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.field(id).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.id.as_str())
    }

    /// Generate a JSON-Schema object describing these fields, used as the
    /// `parameters` of a tool descriptor.
    pub fn parameters(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut prop = serde_json::Map::new();
            if field.multiple {
                prop.insert("type".to_string(), serde_json::json!("array"));
                prop.insert(
                    "items".to_string(),
                    serde_json::json!({ "type": field.data_type.json_type() }),
                );
            } else {
                prop.insert(
                    "type".to_string(),
                    serde_json::json!(field.data_type.json_type()),
                );
            }
            prop.insert("description".to_string(), serde_json::json!(field.label));
            properties.insert(field.id.clone(), serde_json::Value::Object(prop));
            if field.required {
                required.push(serde_json::json!(field.id));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

impl From<Vec<FieldSpec>> for IoSchema {
    fn from(fields: Vec<FieldSpec>) -> Self {
        Self::new(fields)
    }
}

/// Stable descriptor of a node type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    /// Stable type identifier (e.g. "chat-completion")
    pub id: String,
    /// Node version
    pub version: String,
    /// Human-readable name
    pub name: String,
    /// Description of what the node does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input field declarations
    pub input: IoSchema,
    /// Output field declarations
    pub output: IoSchema,
}

/// The tool descriptor a node exposes to LLM consumers.
///
/// `node` is the graph-local id of the backing node, an index into the
/// agent's node table rather than an owning reference, so tool dispatch can
/// re-invoke the node within the same run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
    pub node: String,
}

impl ToolSchema {
    /// Build the descriptor for a node added to the graph under `node_id`.
    pub fn for_node(node_id: &str, metadata: &NodeMetadata) -> Self {
        Self {
            id: metadata.id.clone(),
            name: metadata.name.clone(),
            description: metadata.description.clone(),
            parameters: metadata.input.parameters(),
            node: node_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_builders() {
        let field = FieldSpec::required("prompt", "Prompt", DataType::String);
        assert!(field.required);
        assert!(!field.multiple);

        let field = FieldSpec::optional("tools", "Tools", DataType::Any).list();
        assert!(!field.required);
        assert!(field.multiple);
    }

    #[test]
    fn test_parameters_generation() {
        let schema = IoSchema::new(vec![
            FieldSpec::required("query", "Search query", DataType::String),
            FieldSpec::optional("limit", "Max results", DataType::Number),
        ]);
        let params = schema.parameters();

        assert_eq!(params["type"], "object");
        assert_eq!(params["properties"]["query"]["type"], "string");
        assert_eq!(params["properties"]["query"]["description"], "Search query");
        assert_eq!(params["required"], serde_json::json!(["query"]));
    }

    #[test]
    fn test_tool_schema_points_at_graph_node() {
        let metadata = NodeMetadata {
            id: "weather".to_string(),
            version: "1.0.0".to_string(),
            name: "Weather".to_string(),
            description: Some("Look up the weather".to_string()),
            input: IoSchema::new(vec![FieldSpec::required("city", "City", DataType::String)]),
            output: IoSchema::new(vec![FieldSpec::optional(
                "report",
                "Report",
                DataType::String,
            )]),
        };

        let tool = ToolSchema::for_node("weather-1", &metadata);
        assert_eq!(tool.node, "weather-1");
        assert_eq!(tool.id, "weather");
        assert_eq!(tool.parameters["properties"]["city"]["type"], "string");
    }
}
