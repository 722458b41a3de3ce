//! The LLM executor contract.
//!
//! The concrete transport (HTTP client, streaming JSON decoder) lives
//! outside this workspace; nodes interact with it only through the
//! [`ChatExecutor`] trait and the model metadata registered under the
//! well-known service keys. Executors record request/response state in the
//! graph's global state map so hosts can inspect it.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use agent_graph::{GraphError, Result};

/// Well-known service and global-state keys for the LLM pipeline.
pub mod keys {
    /// Service key for the registered [`super::ModelMetadata`].
    pub const MODEL_METADATA: &str = "core.llm.model.metadata";
    /// Service key for the registered `Arc<dyn ChatExecutor>`.
    pub const CHAT_EXECUTOR: &str = "core.llm.executor";
    /// Global-state key recording the composed request body.
    pub const REQUEST_BODY: &str = "core.llm.request.body";
    /// Global-state key recording the upstream response status.
    pub const RESPONSE_STATUS: &str = "core.llm.response.status";
    /// Global-state key recording the accumulated streamed response.
    pub const RESPONSE_STREAM: &str = "core.llm.response.stream";
}

/// How a model expects its requests to be built.
///
/// On the wire this is either the literal string `"custom"` (the node must
/// build its own request through a custom executor) or an
/// `{url, headers, body?}` object.
#[derive(Debug, Clone)]
pub enum RequestSpec {
    Custom,
    Http {
        url: String,
        headers: HashMap<String, String>,
        body: Option<serde_json::Value>,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RequestSpecWire {
    Literal(String),
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
}

impl Serialize for RequestSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let wire = match self {
            RequestSpec::Custom => RequestSpecWire::Literal("custom".to_string()),
            RequestSpec::Http { url, headers, body } => RequestSpecWire::Http {
                url: url.clone(),
                headers: headers.clone(),
                body: body.clone(),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RequestSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RequestSpecWire::deserialize(deserializer)? {
            RequestSpecWire::Literal(literal) if literal == "custom" => Ok(RequestSpec::Custom),
            RequestSpecWire::Literal(other) => Err(serde::de::Error::custom(format!(
                "unknown request literal '{other}', expected \"custom\""
            ))),
            RequestSpecWire::Http { url, headers, body } => {
                Ok(RequestSpec::Http { url, headers, body })
            }
        }
    }
}

/// Model descriptor resolved from [`keys::MODEL_METADATA`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub request: RequestSpec,
}

/// A composed chat request handed to the executor.
///
/// For `RequestSpec::Custom` models `url` is `None` and the executor owns
/// the transport entirely.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

/// One streamed increment from the model.
#[derive(Debug, Clone)]
pub enum ChatDelta {
    /// A text content delta
    Content { text: String },
    /// The model requested a tool invocation
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// The upstream stream closed with the given status
    Done { status: u16 },
}

/// The executor's delta stream.
pub type DeltaStream = BoxStream<'static, Result<ChatDelta>>;

/// Contract for the external LLM transport.
#[async_trait]
pub trait ChatExecutor: Send + Sync {
    /// Send a composed request and stream back deltas until the upstream
    /// closes.
    async fn execute(&self, request: ChatRequest) -> Result<DeltaStream>;
}

/// Wrap an upstream transport failure in the runtime's error type.
pub fn transport_error(node: &str, message: impl std::fmt::Display) -> GraphError {
    GraphError::failed(node, format!("chat transport error: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_request_roundtrip() {
        let metadata = ModelMetadata {
            request: RequestSpec::Custom,
        };
        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(json, r#"{"request":"custom"}"#);

        let parsed: ModelMetadata = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed.request, RequestSpec::Custom));
    }

    #[test]
    fn test_http_request_roundtrip() {
        let json = r#"{"request":{"url":"https://api.example.com/v1/chat","headers":{"authorization":"Bearer t"}}}"#;
        let parsed: ModelMetadata = serde_json::from_str(json).unwrap();
        match parsed.request {
            RequestSpec::Http { url, headers, body } => {
                assert_eq!(url, "https://api.example.com/v1/chat");
                assert_eq!(headers["authorization"], "Bearer t");
                assert!(body.is_none());
            }
            other => panic!("expected http request spec, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_literal_rejected() {
        let result: std::result::Result<ModelMetadata, _> =
            serde_json::from_str(r#"{"request":"magic"}"#);
        assert!(result.is_err());
    }
}
