//! Error types for the graph runtime

use thiserror::Error;

/// Result type alias using GraphError
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors that can occur while building or driving a graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// A binding or input does not match a node's declared schema
    #[error("schema violation on node '{node}': {message}")]
    SchemaViolation { node: String, message: String },

    /// The event protocol was violated; fatal to the current run
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    /// A node's generator (or the transport behind it) failed
    #[error("node '{node}' execution failed: {message}")]
    ExecutionFailed { node: String, message: String },

    /// Lookup of a graph-local node id failed
    #[error("node '{0}' not found in graph")]
    NodeNotFound(String),

    /// A node id was registered twice
    #[error("node id '{0}' already registered")]
    DuplicateNode(String),

    /// `bind` was called twice on the same graph node
    #[error("node '{0}' is already bound")]
    AlreadyBound(String),

    /// The owning GraphAgent was dropped while a handle was still in use
    #[error("graph agent dropped")]
    GraphDropped,

    /// An activation ended without resolving its invocation
    #[error("activation dropped before completion")]
    ActivationDropped,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    /// Create an execution failed error for a node
    pub fn failed(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// Violations of the event-routing protocol.
///
/// These are kept as a dedicated type so callers can tell a broken wiring
/// from an ordinary node failure. Skips and missing optional fields are
/// control signals, not protocol violations.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    /// A scalar input field received a second value for the same run
    #[error("duplicate value for scalar input field '{field}'")]
    DuplicateScalar { field: String },

    /// Events with different run ids were folded into one accumulator
    #[error("run id mismatch in input accumulator: expected '{expected}', got '{actual}'")]
    RunMismatch { expected: String, actual: String },

    /// A model declared a custom request but no custom executor is registered
    #[error("model requires a custom request but no custom executor is registered")]
    CustomRequestWithoutExecutor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_is_distinguishable() {
        let err: GraphError = ProtocolViolation::DuplicateScalar {
            field: "v".to_string(),
        }
        .into();

        assert!(matches!(
            err,
            GraphError::Protocol(ProtocolViolation::DuplicateScalar { .. })
        ));
    }

    #[test]
    fn test_display_messages() {
        let err = GraphError::failed("chat-1", "boom");
        assert_eq!(err.to_string(), "node 'chat-1' execution failed: boom");

        let err: GraphError = ProtocolViolation::RunMismatch {
            expected: "a".to_string(),
            actual: "b".to_string(),
        }
        .into();
        assert!(err.to_string().contains("run id mismatch"));
    }
}
