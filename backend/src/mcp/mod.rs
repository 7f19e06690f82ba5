//! MCP (Model Context Protocol) Streamable HTTP support.
//!
//! This module implements the MCP Streamable HTTP transport, giving AI
//! assistants access to the Aido todo tools through a single HTTP endpoint
//! with an SSE stream for server-initiated messages.
//!
//! ## Endpoints
//!
//! - `POST /api/mcp/sse` - Send JSON-RPC requests
//! - `GET /api/mcp/sse` - Open SSE stream for server messages
//! - `DELETE /api/mcp/sse` - Terminate session
//!
//! ## Session Management
//!
//! Sessions are identified by the `mcp-session-id` header, assigned during
//! initialization and required for subsequent requests.

pub mod engine;
pub mod outbox;
pub mod session;
pub mod shim;
pub mod store;
pub mod tools;
pub mod transport;

pub use engine::ProtocolEngine;
pub use session::{McpSession, SessionRegistry};
pub use store::TodoStore;
pub use tools::ToolCatalogue;
pub use transport::{StreamableHttpTransport, TransportOptions, TransportState};
