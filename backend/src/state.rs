//! Application state management.

use std::sync::Arc;
use tracing::info;

use crate::config::{Config, McpConfig};
use crate::mcp::outbox::Outbox;
use crate::mcp::{
    McpSession, ProtocolEngine, SessionRegistry, StreamableHttpTransport, TodoStore,
    ToolCatalogue, TransportOptions,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// MCP endpoint settings
    mcp: McpConfig,
    /// Origins allowed in addition to localhost
    allowed_origins: Vec<String>,
    /// Live MCP sessions
    sessions: SessionRegistry,
    /// Todo store shared by every session
    todos: TodoStore,
    /// Tools offered to every session
    tools: Arc<ToolCatalogue>,
    transport_options: TransportOptions,
}

impl AppState {
    /// Create application state from the loaded configuration.
    pub fn new(config: &Config) -> Self {
        let todos = TodoStore::new();
        let tools = ToolCatalogue::with_todo_tools(todos.clone());
        Self::with_tools(config, todos, tools)
    }

    /// Create application state serving `tools` to every session.
    pub fn with_tools(config: &Config, todos: TodoStore, tools: ToolCatalogue) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                mcp: config.mcp.clone(),
                allowed_origins: config.cors_allowed_origins.clone(),
                sessions: SessionRegistry::new(),
                todos,
                tools: Arc::new(tools),
                transport_options: TransportOptions::from_config(&config.mcp),
            }),
        }
    }

    /// Get the MCP endpoint settings.
    pub fn mcp_config(&self) -> &McpConfig {
        &self.inner.mcp
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.inner.allowed_origins
    }

    /// Get the session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// Get the todo store.
    pub fn todos(&self) -> &TodoStore {
        &self.inner.todos
    }

    /// Build a fresh engine and transport pair for `session_id`.
    pub fn new_session(&self, session_id: &str) -> Arc<McpSession> {
        let outbox = Arc::new(Outbox::new(session_id, self.inner.mcp.event_buffer_size));
        let engine = Arc::new(ProtocolEngine::with_tools(
            session_id,
            outbox,
            self.inner.tools.clone(),
        ));
        let transport = Arc::new(StreamableHttpTransport::new(
            engine,
            self.inner.transport_options.clone(),
        ));
        Arc::new(McpSession::new(transport))
    }

    /// Get the session for `session_id`, creating it if this process has none.
    pub async fn get_or_create_session(&self, session_id: &str) -> (Arc<McpSession>, bool) {
        self.inner
            .sessions
            .get_or_create(session_id, |id| self.new_session(id))
            .await
    }

    /// Close sessions idle for longer than the configured timeout.
    pub async fn reap_idle_sessions(&self) -> usize {
        let Some(max_idle) = self.inner.mcp.session_idle_timeout() else {
            return 0;
        };
        let removed = self.inner.sessions.cleanup_stale(max_idle).await;
        if removed > 0 {
            info!("Reaped {} idle MCP session(s)", removed);
        }
        removed
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}
