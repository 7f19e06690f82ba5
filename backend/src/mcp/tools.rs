//! MCP tools exposed through `tools/list` and `tools/call`.
//!
//! The catalogue is the single source of both the advertised definitions and
//! the dispatch table, so a listed tool is always callable and vice versa.

use aido_types::{JsonRpcNotification, Todo, ToolDefinition};
use async_trait::async_trait;
use garde::Validate;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::outbox::Outbox;
use super::store::TodoStore;

/// One failed argument rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentIssue {
    pub path: String,
    pub message: String,
}

/// Errors a tool call can end with.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {}", describe_issues(.0))]
    InvalidArguments(Vec<ArgumentIssue>),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<garde::Report> for ToolError {
    fn from(report: garde::Report) -> Self {
        ToolError::InvalidArguments(
            report
                .iter()
                .map(|(path, error)| ArgumentIssue {
                    path: path.to_string(),
                    message: error.to_string(),
                })
                .collect(),
        )
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        ToolError::InvalidArguments(vec![ArgumentIssue {
            path: "arguments".to_string(),
            message: err.to_string(),
        }])
    }
}

/// `path - message, path - message`
pub fn describe_issues(issues: &[ArgumentIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("{} - {}", i.path, i.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Per-call context handed to tools.
pub struct ToolContext {
    pub session_id: String,
    outbox: Arc<Outbox>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, outbox: Arc<Outbox>) -> Self {
        Self {
            session_id: session_id.into(),
            outbox,
        }
    }

    /// Emit an MCP `notifications/message` log entry on the session stream.
    pub fn log(&self, level: &str, logger: &str, data: Value) {
        let notification = JsonRpcNotification::new(
            "notifications/message",
            Some(json!({ "level": level, "logger": logger, "data": data })),
        );
        if let Err(e) = self.outbox.send(&notification) {
            warn!(
                "[{}] Failed to queue log notification: {}",
                self.session_id, e
            );
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, ctx: &ToolContext, arguments: Map<String, Value>)
        -> Result<Value, ToolError>;
}

/// Ordered set of tools, looked up by name.
#[derive(Clone, Default)]
pub struct ToolCatalogue {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalogue with `list-todos` and `add-todo` backed by `store`.
    pub fn with_todo_tools(store: TodoStore) -> Self {
        let mut catalogue = Self::new();
        catalogue.register(ListTodos::new(store.clone()));
        catalogue.register(AddTodo::new(store));
        catalogue
    }

    /// Add a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.definition().name;
        self.tools.retain(|t| t.definition().name != name);
        debug!("Registered tool '{}'", name);
        self.tools.push(Arc::new(tool));
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .iter()
            .find(|t| t.definition().name == name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.definition().name).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ============================================================================
// list-todos
// ============================================================================

pub struct ListTodos {
    store: TodoStore,
}

impl ListTodos {
    pub const NAME: &'static str = "list-todos";

    pub fn new(store: TodoStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ListTodos {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: Some("Lists all todo items.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
            output_schema: Some(json!({
                "type": "object",
                "properties": {
                    "items": {
                        "type": "array",
                        "items": { "type": "object" }
                    }
                }
            })),
        }
    }

    async fn call(&self, _ctx: &ToolContext, _arguments: Map<String, Value>) -> Result<Value, ToolError> {
        let items = self.store.list().await;
        Ok(json!({ "items": items }))
    }
}

// ============================================================================
// add-todo
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
struct AddTodoArgs {
    #[serde(default)]
    #[garde(custom(non_empty_string))]
    text: Option<Value>,
}

fn non_empty_string(value: &Option<Value>, _context: &()) -> garde::Result {
    match value {
        None | Some(Value::Null) => Err(garde::Error::new("Required")),
        Some(Value::String(s)) if s.is_empty() => {
            Err(garde::Error::new("String must contain at least 1 character(s)"))
        }
        Some(Value::String(_)) => Ok(()),
        Some(other) => Err(garde::Error::new(format!(
            "Expected string, received {}",
            json_type_name(other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub struct AddTodo {
    store: TodoStore,
}

impl AddTodo {
    pub const NAME: &'static str = "add-todo";

    pub fn new(store: TodoStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for AddTodo {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: Some("Adds a new todo item. Requires a \"text\" parameter.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "text": {
                        "type": "string",
                        "description": "The text content of the todo."
                    }
                },
                "required": ["text"]
            }),
            output_schema: Some(json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "text": { "type": "string" },
                    "completed": { "type": "boolean" }
                }
            })),
        }
    }

    async fn call(&self, ctx: &ToolContext, arguments: Map<String, Value>) -> Result<Value, ToolError> {
        let args: AddTodoArgs = serde_json::from_value(Value::Object(arguments))?;
        args.validate()?;

        let Some(Value::String(text)) = args.text else {
            return Err(anyhow::anyhow!("validated text argument missing").into());
        };

        let todo = self.store.insert(Todo::new(text)).await;
        ctx.log("info", Self::NAME, json!({ "created": todo.id }));
        serde_json::to_value(&todo).map_err(|e| ToolError::Internal(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (ToolContext, Arc<Outbox>) {
        let outbox = Arc::new(Outbox::new("test-session", 16));
        (ToolContext::new("test-session", outbox.clone()), outbox)
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("arguments must be an object"),
        }
    }

    #[test]
    fn test_catalogue_lists_todo_tools() {
        let catalogue = ToolCatalogue::with_todo_tools(TodoStore::new());
        assert_eq!(catalogue.names(), vec!["list-todos", "add-todo"]);
        assert!(catalogue.get("add-todo").is_some());
        assert!(catalogue.get("delete-todo").is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let store = TodoStore::new();
        let mut catalogue = ToolCatalogue::with_todo_tools(store.clone());
        catalogue.register(ListTodos::new(store));
        assert_eq!(catalogue.len(), 2);
    }

    #[test]
    fn test_add_todo_schema_requires_text() {
        let definition = AddTodo::new(TodoStore::new()).definition();
        assert_eq!(definition.input_schema["required"], json!(["text"]));
        assert_eq!(definition.input_schema["properties"]["text"]["type"], "string");
    }

    #[tokio::test]
    async fn test_add_then_list() {
        let store = TodoStore::new();
        let (ctx, outbox) = context();

        let created = AddTodo::new(store.clone())
            .call(&ctx, args(json!({"text": "buy milk"})))
            .await
            .unwrap();
        assert_eq!(created["text"], "buy milk");
        assert_eq!(created["completed"], false);
        // add-todo announces itself on the session stream
        assert_eq!(outbox.buffered_events(), 1);

        let listed = ListTodos::new(store)
            .call(&ctx, Map::new())
            .await
            .unwrap();
        assert_eq!(listed["items"].as_array().unwrap().len(), 1);
        assert_eq!(listed["items"][0]["id"], created["id"]);
    }

    #[tokio::test]
    async fn test_add_todo_missing_text() {
        let (ctx, _) = context();
        let err = AddTodo::new(TodoStore::new())
            .call(&ctx, Map::new())
            .await
            .unwrap_err();
        match err {
            ToolError::InvalidArguments(issues) => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].path, "text");
                assert_eq!(issues[0].message, "Required");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_add_todo_rejects_empty_and_non_string() {
        let (ctx, _) = context();
        let tool = AddTodo::new(TodoStore::new());

        let empty = tool.call(&ctx, args(json!({"text": ""}))).await.unwrap_err();
        assert!(empty.to_string().contains("text - String must contain"));

        let number = tool.call(&ctx, args(json!({"text": 42}))).await.unwrap_err();
        assert!(number.to_string().contains("Expected string, received number"));
    }

    #[test]
    fn test_describe_issues_joins() {
        let issues = vec![
            ArgumentIssue {
                path: "a".into(),
                message: "Required".into(),
            },
            ArgumentIssue {
                path: "b".into(),
                message: "Expected string, received number".into(),
            },
        ];
        assert_eq!(
            describe_issues(&issues),
            "a - Required, b - Expected string, received number"
        );
    }
}
