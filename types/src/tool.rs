//! Tool descriptions advertised through `tools/list`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A callable operation with its JSON Schema contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema (`type: object`) for the tool's arguments.
    pub input_schema: Value,
    /// JSON Schema (`type: object`) for the tool's result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// Result payload of `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolListResult {
    pub tools: Vec<ToolDefinition>,
}
