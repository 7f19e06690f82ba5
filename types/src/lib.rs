//! Shared types for the Aido MCP endpoint.
//!
//! This crate contains the JSON-RPC envelopes, tool descriptions and
//! domain records exchanged over the Streamable HTTP transport.

/// Default port for the Aido MCP server.
pub const DEFAULT_PORT: u16 = 3000;

/// Header carrying the session identifier on every MCP request.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Header carrying the last SSE event id seen by a reconnecting client.
pub const MCP_LAST_EVENT_ID_HEADER: &str = "mcp-last-event-id";

/// Content type used for JSON-RPC responses on the POST path.
pub const JSONRPC_CONTENT_TYPE: &str = "application/jsonrpc+json; charset=utf-8";

/// MCP protocol version answered when the client asks for an unknown one.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// MCP protocol versions this server can speak.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05", "2024-10-07"];

pub mod api;
pub mod jsonrpc;
pub mod todo;
pub mod tool;

pub use api::{ErrorResponse, MessageResponse};
pub use jsonrpc::{
    error_codes, is_initialize_request, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JSONRPC_VERSION,
};
pub use todo::{Todo, TodoId};
pub use tool::{ToolDefinition, ToolListResult};
