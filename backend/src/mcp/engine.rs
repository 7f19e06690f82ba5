//! MCP protocol engine.
//!
//! Validates and dispatches JSON-RPC method calls for one session. The set of
//! methods is closed: anything not registered fails with `MethodNotFound`.

use aido_types::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ToolListResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::outbox::Outbox;
use super::tools::{describe_issues, ToolCatalogue, ToolContext, ToolError};

/// Handler for one JSON-RPC method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, ctx: &ToolContext, params: Option<Value>) -> Result<Value, JsonRpcError>;
}

/// Per-session method dispatcher.
pub struct ProtocolEngine {
    session_id: String,
    outbox: Arc<Outbox>,
    handlers: HashMap<&'static str, Arc<dyn MethodHandler>>,
}

impl ProtocolEngine {
    /// Engine without any methods registered.
    pub fn new(session_id: impl Into<String>, outbox: Arc<Outbox>) -> Self {
        Self {
            session_id: session_id.into(),
            outbox,
            handlers: HashMap::new(),
        }
    }

    /// Engine serving `tools/list`, `tools/call` and `ping` over `catalogue`.
    pub fn with_tools(
        session_id: impl Into<String>,
        outbox: Arc<Outbox>,
        catalogue: Arc<ToolCatalogue>,
    ) -> Self {
        let mut engine = Self::new(session_id, outbox);
        engine.register("tools/list", ListToolsHandler {
            catalogue: catalogue.clone(),
        });
        engine.register("tools/call", CallToolHandler { catalogue });
        engine.register("ping", PingHandler);
        engine
    }

    pub fn register(&mut self, method: &'static str, handler: impl MethodHandler + 'static) {
        self.handlers.insert(method, Arc::new(handler));
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&'static str> {
        let mut methods: Vec<_> = self.handlers.keys().copied().collect();
        methods.sort_unstable();
        methods
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Handle a request. The response always echoes the request id.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!("[{}] MCP: Handling method: {}", self.session_id, request.method);

        let Some(handler) = self.handlers.get(request.method.as_str()).cloned() else {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::method_not_found(format!("Method not found: {}", request.method)),
            );
        };

        let ctx = ToolContext::new(self.session_id.clone(), self.outbox.clone());
        match handler.handle(&ctx, request.params).await {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(error) => JsonRpcResponse::error(request.id, error),
        }
    }

    /// Notifications get no response; they are only logged.
    pub fn handle_notification(&self, notification: &JsonRpcNotification) {
        match notification.method.as_str() {
            "notifications/initialized" | "initialized" => {
                info!("[{}] MCP client initialized", self.session_id)
            }
            "notifications/cancelled" => debug!(
                "[{}] MCP client cancelled a request: {:?}",
                self.session_id, notification.params
            ),
            other => debug!("[{}] Ignoring notification {}", self.session_id, other),
        }
    }
}

struct PingHandler;

#[async_trait]
impl MethodHandler for PingHandler {
    async fn handle(&self, _ctx: &ToolContext, _params: Option<Value>) -> Result<Value, JsonRpcError> {
        Ok(json!({}))
    }
}

struct ListToolsHandler {
    catalogue: Arc<ToolCatalogue>,
}

#[async_trait]
impl MethodHandler for ListToolsHandler {
    async fn handle(&self, _ctx: &ToolContext, _params: Option<Value>) -> Result<Value, JsonRpcError> {
        let result = ToolListResult {
            tools: self.catalogue.definitions(),
        };
        serde_json::to_value(result).map_err(|e| {
            error!("Failed to serialize tool list: {}", e);
            JsonRpcError::internal_error("Internal error")
        })
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(default, rename = "_meta")]
    _meta: Option<Value>,
}

struct CallToolHandler {
    catalogue: Arc<ToolCatalogue>,
}

#[async_trait]
impl MethodHandler for CallToolHandler {
    async fn handle(&self, ctx: &ToolContext, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: ToolCallParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params for tools/call: {}", e)))?;

        let Some(tool) = self.catalogue.get(&params.name) else {
            return Err(JsonRpcError::method_not_found(format!(
                "Tool '{}' not found.",
                params.name
            )));
        };

        let arguments = match params.arguments {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(JsonRpcError::invalid_params(format!(
                    "Invalid arguments for tool '{}': arguments - Expected object",
                    params.name
                )))
            }
        };

        info!("[{}] MCP: Calling tool '{}'", ctx.session_id, params.name);
        match tool.call(ctx, arguments).await {
            Ok(result) => Ok(result),
            Err(ToolError::InvalidArguments(issues)) => Err(JsonRpcError::invalid_params(format!(
                "Invalid arguments for tool '{}': {}",
                params.name,
                describe_issues(&issues)
            ))),
            Err(ToolError::Internal(e)) => {
                error!(
                    "[{}] Tool '{}' failed: {:#}",
                    ctx.session_id, params.name, e
                );
                Err(JsonRpcError::internal_error(
                    "Internal error during tool execution",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::store::TodoStore;
    use aido_types::error_codes;

    fn engine() -> ProtocolEngine {
        let catalogue = Arc::new(ToolCatalogue::with_todo_tools(TodoStore::new()));
        ProtocolEngine::with_tools("s1", Arc::new(Outbox::new("s1", 16)), catalogue)
    }

    fn call(id: i64, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(id, method, Some(params))
    }

    struct FailingTool;

    #[async_trait]
    impl crate::mcp::tools::Tool for FailingTool {
        fn definition(&self) -> aido_types::ToolDefinition {
            aido_types::ToolDefinition {
                name: "explode".into(),
                description: None,
                input_schema: json!({"type": "object"}),
                output_schema: None,
            }
        }

        async fn call(&self, _ctx: &ToolContext, _arguments: Map<String, Value>) -> Result<Value, ToolError> {
            Err(anyhow::anyhow!("disk on fire").into())
        }
    }

    #[test]
    fn test_registered_methods() {
        assert_eq!(engine().methods(), vec!["ping", "tools/call", "tools/list"]);
    }

    #[tokio::test]
    async fn test_tools_list_returns_catalogue() {
        let response = engine().handle_request(call(1, "tools/list", json!({}))).await;
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["list-todos", "add-todo"]);
        assert!(tools[1]["inputSchema"]["properties"]["text"].is_object());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let response = engine().handle_request(call(2, "resources/list", json!({}))).await;
        assert_eq!(response.id, json!(2));
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let response = engine()
            .handle_request(call(3, "tools/call", json!({"name": "delete-todo"})))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, error_codes::METHOD_NOT_FOUND);
        assert_eq!(error.message, "Tool 'delete-todo' not found.");
    }

    #[tokio::test]
    async fn test_invalid_arguments_name_the_field() {
        let response = engine()
            .handle_request(call(4, "tools/call", json!({"name": "add-todo", "arguments": {}})))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, error_codes::INVALID_PARAMS);
        assert_eq!(error.message, "Invalid arguments for tool 'add-todo': text - Required");
    }

    #[tokio::test]
    async fn test_missing_tool_name_is_invalid_params() {
        let response = engine().handle_request(call(5, "tools/call", json!({}))).await;
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_tool_failure_is_hidden() {
        let mut catalogue = ToolCatalogue::new();
        catalogue.register(FailingTool);
        let engine = ProtocolEngine::with_tools("s1", Arc::new(Outbox::new("s1", 4)), Arc::new(catalogue));

        let response = engine
            .handle_request(call(6, "tools/call", json!({"name": "explode"})))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, error_codes::INTERNAL_ERROR);
        assert!(!error.message.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_add_then_list_on_same_engine() {
        let engine = engine();
        let added = engine
            .handle_request(call(7, "tools/call", json!({"name": "add-todo", "arguments": {"text": "buy milk"}})))
            .await
            .result
            .unwrap();
        assert_eq!(added["text"], "buy milk");

        let listed = engine
            .handle_request(call(8, "tools/call", json!({"name": "list-todos"})))
            .await
            .result
            .unwrap();
        assert_eq!(listed["items"][0]["id"], added["id"]);
    }

    #[tokio::test]
    async fn test_ping() {
        let response = engine().handle_request(call(9, "ping", Value::Null)).await;
        assert_eq!(response.result, Some(json!({})));
    }
}
