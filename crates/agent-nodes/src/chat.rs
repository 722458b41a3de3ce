//! Chat completion node with tool calling.
//!
//! Composes the request body from its inputs, streams content deltas out
//! on the `stream` field, dispatches requested tool calls back into the
//! graph within the same run, and finishes with the accumulated `message`.
//! Transport failures surface on the declared `error` output field.

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;

use agent_graph::{
    AgentNode, DataType, FieldSpec, GraphError, IoSchema, NodeContext, NodeInput, NodeMetadata,
    OutputMap, OutputStream, ProtocolViolation, ToolSchema,
};

use crate::executor::{keys, ChatDelta, ChatExecutor, ChatRequest, ModelMetadata, RequestSpec};

/// A tool invocation requested by the model during one completion.
#[derive(Debug, Clone)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: serde_json::Value,
}

/// LLM chat node: messages in, streamed completion and tool results out.
#[derive(Debug, Clone, Default)]
pub struct ChatCompletionNode {
    /// Sampling temperature used when the input doesn't carry one
    temperature: Option<f64>,
}

impl ChatCompletionNode {
    /// Field id for the message list input
    pub const FIELD_MESSAGES: &'static str = "messages";
    /// Field id for the tool schema bindings
    pub const FIELD_TOOLS: &'static str = "tools";
    /// Field id for the temperature input
    pub const FIELD_TEMPERATURE: &'static str = "temperature";
    /// Field id for the streamed deltas output
    pub const FIELD_STREAM: &'static str = "stream";
    /// Field id for the final message output
    pub const FIELD_MESSAGE: &'static str = "message";
    /// Field id for the tool results output
    pub const FIELD_TOOL_RESULTS: &'static str = "tool_results";
    /// Field id for the error output
    pub const FIELD_ERROR: &'static str = "error";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(temperature: f64) -> Self {
        Self {
            temperature: Some(temperature),
        }
    }

    /// Compose the request body: the model's base body extended with
    /// messages, offered tools, streaming flag and temperature.
    fn compose_body(
        &self,
        base: Option<serde_json::Value>,
        input: &NodeInput,
        tools: &[ToolSchema],
    ) -> serde_json::Value {
        let mut body = match base {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        body.insert(
            "messages".to_string(),
            input
                .json(Self::FIELD_MESSAGES)
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        );
        if !tools.is_empty() {
            let described: Vec<serde_json::Value> = tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect();
            body.insert("tools".to_string(), serde_json::json!(described));
        }
        body.insert("stream".to_string(), serde_json::json!(true));
        let temperature = input
            .json(Self::FIELD_TEMPERATURE)
            .and_then(serde_json::Value::as_f64)
            .or(self.temperature);
        if let Some(temperature) = temperature {
            body.insert("temperature".to_string(), serde_json::json!(temperature));
        }
        serde_json::Value::Object(body)
    }
}

#[async_trait]
impl AgentNode for ChatCompletionNode {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            id: "chat-completion".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            name: "Chat Completion".to_string(),
            description: Some("Runs messages through a chat model with tool calling".to_string()),
            input: IoSchema::new(vec![
                FieldSpec::required(Self::FIELD_MESSAGES, "Messages", DataType::Object),
                FieldSpec::optional(Self::FIELD_TOOLS, "Tools", DataType::Any).list(),
                FieldSpec::optional(Self::FIELD_TEMPERATURE, "Temperature", DataType::Number),
            ]),
            output: IoSchema::new(vec![
                FieldSpec::optional(Self::FIELD_STREAM, "Stream", DataType::Stream),
                FieldSpec::optional(Self::FIELD_MESSAGE, "Message", DataType::String),
                FieldSpec::optional(Self::FIELD_TOOL_RESULTS, "Tool Results", DataType::Object),
                FieldSpec::optional(Self::FIELD_ERROR, "Error", DataType::String),
            ]),
        }
    }

    fn execute(self: Arc<Self>, ctx: NodeContext, input: NodeInput) -> OutputStream {
        Box::pin(stream! {
            let node_id = ctx.node().id.clone();
            let Some(metadata) = ctx.resolve::<ModelMetadata>(keys::MODEL_METADATA).await else {
                yield Err(GraphError::failed(node_id.clone(), "no model metadata registered"));
                return;
            };
            let executor = ctx
                .resolve::<Arc<dyn ChatExecutor>>(keys::CHAT_EXECUTOR)
                .await;

            let tools: Vec<ToolSchema> = input
                .schemas(Self::FIELD_TOOLS)
                .into_iter()
                .cloned()
                .collect();

            let request = match metadata.request {
                RequestSpec::Custom => {
                    if executor.is_none() {
                        yield Err(GraphError::from(ProtocolViolation::CustomRequestWithoutExecutor));
                        return;
                    }
                    ChatRequest {
                        url: None,
                        headers: HashMap::new(),
                        body: self.compose_body(None, &input, &tools),
                    }
                }
                RequestSpec::Http { url, headers, body } => ChatRequest {
                    url: Some(url),
                    headers,
                    body: self.compose_body(body, &input, &tools),
                },
            };
            let Some(executor) = executor else {
                yield Err(GraphError::failed(node_id.clone(), "no chat executor registered"));
                return;
            };

            if let Err(err) = ctx
                .set_global_state(keys::REQUEST_BODY, request.body.clone())
                .await
            {
                yield Err(err);
                return;
            }

            let mut deltas = match executor.execute(request).await {
                Ok(deltas) => deltas,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let mut collected = String::new();
            let mut calls: Vec<PendingToolCall> = Vec::new();
            while let Some(delta) = deltas.next().await {
                match delta {
                    Ok(ChatDelta::Content { text }) => {
                        collected.push_str(&text);
                        yield Ok(OutputMap::from([(
                            Self::FIELD_STREAM.to_string(),
                            serde_json::json!(text),
                        )]));
                    }
                    Ok(ChatDelta::ToolCall { id, name, arguments }) => {
                        calls.push(PendingToolCall { id, name, arguments });
                    }
                    Ok(ChatDelta::Done { status }) => {
                        let _ = ctx
                            .set_global_state(keys::RESPONSE_STATUS, serde_json::json!(status))
                            .await;
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }

            let _ = ctx
                .set_global_state(keys::RESPONSE_STREAM, serde_json::json!(collected))
                .await;

            // Dispatch requested tools within the same run; un-called tools
            // are skip-propagated by the runtime once this node completes.
            let mut results = Vec::new();
            for call in calls {
                let Some(schema) = tools
                    .iter()
                    .find(|tool| tool.name == call.name || tool.id == call.name)
                else {
                    log::warn!("node '{node_id}' ignoring unknown tool '{}'", call.name);
                    continue;
                };
                match ctx.invoke_tool(schema, call.arguments.clone()).await {
                    Ok(output) => results.push(serde_json::json!({
                        "id": call.id,
                        "name": call.name,
                        "output": output,
                    })),
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
            if !results.is_empty() {
                yield Ok(OutputMap::from([(
                    Self::FIELD_TOOL_RESULTS.to_string(),
                    serde_json::json!(results),
                )]));
            }

            yield Ok(OutputMap::from([(
                Self::FIELD_MESSAGE.to_string(),
                serde_json::json!(collected),
            )]));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_graph::{AgentEvent, GraphAgent, InputValue, MappedInput, Run};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Scripted executor for tests: replays a fixed delta sequence.
    struct MockChatExecutor {
        deltas: Vec<ChatDelta>,
    }

    #[async_trait]
    impl ChatExecutor for MockChatExecutor {
        async fn execute(&self, _request: ChatRequest) -> agent_graph::Result<crate::executor::DeltaStream> {
            let deltas = self.deltas.clone();
            Ok(Box::pin(futures::stream::iter(
                deltas.into_iter().map(Ok).collect::<Vec<_>>(),
            )))
        }
    }

    async fn register_model(agent: &GraphAgent, deltas: Vec<ChatDelta>) {
        agent
            .services()
            .set(
                keys::MODEL_METADATA,
                ModelMetadata {
                    request: RequestSpec::Http {
                        url: "http://localhost:8080/v1/chat/completions".to_string(),
                        headers: HashMap::new(),
                        body: Some(serde_json::json!({"model": "test-model"})),
                    },
                },
            )
            .await;
        agent
            .services()
            .set(
                keys::CHAT_EXECUTOR,
                Arc::new(MockChatExecutor { deltas }) as Arc<dyn ChatExecutor>,
            )
            .await;
    }

    #[tokio::test]
    async fn test_streams_deltas_then_message() {
        let agent = GraphAgent::new();
        register_model(
            &agent,
            vec![
                ChatDelta::Content { text: "Hel".to_string() },
                ChatDelta::Content { text: "lo".to_string() },
                ChatDelta::Done { status: 200 },
            ],
        )
        .await;
        let chat = agent
            .add_node("chat", Arc::new(ChatCompletionNode::new()), None)
            .await
            .unwrap();

        let mut stream_sub = chat.output(ChatCompletionNode::FIELD_STREAM).subscribe();
        let output = timeout(
            Duration::from_secs(5),
            chat.invoke(NodeInput::from_json(
                serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}),
            ))
            .output(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(output["message"], serde_json::json!("Hello"));
        assert_eq!(stream_sub.next().await.unwrap().value, serde_json::json!("Hel"));
        assert_eq!(stream_sub.next().await.unwrap().value, serde_json::json!("lo"));

        // Executor state recorded under the well-known keys
        let body = agent.global_state().get(keys::REQUEST_BODY).await.unwrap();
        assert_eq!(body["model"], serde_json::json!("test-model"));
        assert_eq!(body["stream"], serde_json::json!(true));
        assert_eq!(
            agent.global_state().get(keys::RESPONSE_STATUS).await,
            Some(serde_json::json!(200))
        );
    }

    #[tokio::test]
    async fn test_dispatches_requested_tool() {
        let agent = GraphAgent::new();
        register_model(
            &agent,
            vec![
                ChatDelta::ToolCall {
                    id: "call-1".to_string(),
                    name: "Adder".to_string(),
                    arguments: serde_json::json!({"n": 1}),
                },
                ChatDelta::Done { status: 200 },
            ],
        )
        .await;

        let adder = agent
            .add_node(
                "adder",
                agent_graph::create_agent_node(
                    NodeMetadata {
                        id: "adder".to_string(),
                        version: "1.0.0".to_string(),
                        name: "Adder".to_string(),
                        description: None,
                        input: IoSchema::new(vec![FieldSpec::required(
                            "n",
                            "N",
                            DataType::Number,
                        )]),
                        output: IoSchema::new(vec![FieldSpec::optional(
                            "sum",
                            "Sum",
                            DataType::Number,
                        )]),
                    },
                    |_ctx, input| {
                        let n = input.json("n").and_then(|v| v.as_i64()).unwrap_or(0);
                        Box::pin(futures::stream::iter(vec![Ok(OutputMap::from([(
                            "sum".to_string(),
                            serde_json::json!(n + 1),
                        )]))]))
                    },
                ),
                None,
            )
            .await
            .unwrap();
        let chat = agent
            .add_node("chat", Arc::new(ChatCompletionNode::new()), None)
            .await
            .unwrap();

        let run = Run::new();
        let mut input = NodeInput::from_json(serde_json::json!({"messages": []}));
        input
            .accept(MappedInput::new(
                run.clone(),
                ChatCompletionNode::FIELD_TOOLS,
                true,
                Some(InputValue::Schema(
                    adder.schema().tool_schema().unwrap().clone(),
                )),
            ))
            .unwrap();

        let output = timeout(
            Duration::from_secs(5),
            chat.invoke_with(input, Some(run)).output(),
        )
        .await
        .unwrap()
        .unwrap();

        let results = output["tool_results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["output"]["sum"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_custom_model_without_executor_surfaces_error() {
        let agent = GraphAgent::new();
        agent
            .services()
            .set(
                keys::MODEL_METADATA,
                ModelMetadata {
                    request: RequestSpec::Custom,
                },
            )
            .await;
        let chat = agent
            .add_node("chat", Arc::new(ChatCompletionNode::new()), None)
            .await
            .unwrap();

        let mut sub = agent.event_stream().subscribe();
        // The node declares an error field, so the failure lands there and
        // the activation still completes
        let output = timeout(
            Duration::from_secs(5),
            chat.invoke(NodeInput::from_json(serde_json::json!({"messages": []})))
                .output(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(output["error"]
            .as_str()
            .unwrap()
            .contains("custom request"));

        let completed = timeout(Duration::from_secs(5), async {
            loop {
                match sub.recv().await {
                    Some(AgentEvent::RunCompleted { node, .. }) if node.id == "chat" => {
                        return true;
                    }
                    Some(AgentEvent::RunSkipped { node, .. }) if node.id == "chat" => {
                        return false;
                    }
                    Some(_) => {}
                    None => return false,
                }
            }
        })
        .await
        .unwrap();
        assert!(completed);
    }
}
