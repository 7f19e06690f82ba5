//! MCP session management.
//!
//! Maps `mcp-session-id` values to the protocol engine and transport bound to
//! that session. Session ids are UUIDs minted on initialize, or whatever id a
//! client presents for a session this process does not know.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::engine::ProtocolEngine;
use super::transport::StreamableHttpTransport;

/// An MCP session: one engine and one transport under a session id.
pub struct McpSession {
    /// Unique session identifier.
    pub id: String,
    /// When the session was created.
    pub created_at: Instant,
    pub engine: Arc<ProtocolEngine>,
    pub transport: Arc<StreamableHttpTransport>,
    last_seen: Mutex<Instant>,
}

impl McpSession {
    pub fn new(transport: Arc<StreamableHttpTransport>) -> Self {
        let now = Instant::now();
        Self {
            id: transport.session_id().to_string(),
            created_at: now,
            engine: transport.engine().clone(),
            transport,
            last_seen: Mutex::new(now),
        }
    }

    /// Record activity on the session.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last request on this session.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Get the session age in seconds.
    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

/// Registry of live MCP sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<McpSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Option<Arc<McpSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Insert or replace a session.
    pub async fn set(&self, session: Arc<McpSession>) {
        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.insert(session.id.clone(), session) {
            debug!("Replaced MCP session: {}", previous.id);
        }
    }

    /// Look up a session, creating it with `create` if absent.
    ///
    /// Lookup and insert happen under one write lock, so concurrent callers
    /// for the same id all get the same session. The flag is `true` when the
    /// session was created by this call.
    pub async fn get_or_create<F>(&self, id: &str, create: F) -> (Arc<McpSession>, bool)
    where
        F: FnOnce(&str) -> Arc<McpSession>,
    {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(id) {
            return (existing.clone(), false);
        }
        let session = create(id);
        sessions.insert(id.to_string(), session.clone());
        info!("Created MCP session: {}", id);
        (session, true)
    }

    /// Remove a session. Returns whether anything was removed.
    pub async fn delete(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(id).is_some() {
            info!("Terminated MCP session: {}", id);
            true
        } else {
            false
        }
    }

    /// Get the number of active sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close every session and empty the registry.
    pub async fn close_all(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        for session in sessions.values() {
            session.transport.close();
        }
        let count = sessions.len();
        sessions.clear();
        count
    }

    /// Close and remove sessions idle for longer than `max_idle`.
    pub async fn cleanup_stale(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, session| {
            let idle = session.idle_for();
            let keep = idle < max_idle;
            if !keep {
                info!(
                    "Cleaning up stale MCP session: {} (idle: {}s, age: {}s)",
                    id,
                    idle.as_secs(),
                    session.age_secs()
                );
                session.transport.close();
            }
            keep
        });
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::outbox::Outbox;
    use crate::mcp::store::TodoStore;
    use crate::mcp::tools::ToolCatalogue;
    use crate::mcp::transport::{TransportOptions, TransportState};

    fn session(id: &str) -> Arc<McpSession> {
        let outbox = Arc::new(Outbox::new(id, 8));
        let catalogue = Arc::new(ToolCatalogue::with_todo_tools(TodoStore::new()));
        let engine = Arc::new(ProtocolEngine::with_tools(id, outbox, catalogue));
        let transport = Arc::new(StreamableHttpTransport::new(engine, TransportOptions::default()));
        Arc::new(McpSession::new(transport))
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let registry = SessionRegistry::new();
        registry.set(session("a")).await;

        assert!(registry.get("a").await.is_some());
        assert!(registry.get("b").await.is_none());
        assert!(registry.delete("a").await);
        assert!(!registry.delete("a").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_existing() {
        let registry = SessionRegistry::new();
        let (first, created) = registry.get_or_create("a", session).await;
        assert!(created);

        let (second, created) = registry.get_or_create("a", session).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first.engine, &second.engine));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_registers_once() {
        let registry = SessionRegistry::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create("shared", session).await
            }));
        }

        let mut created = 0;
        let mut first: Option<Arc<McpSession>> = None;
        for handle in handles {
            let (s, was_created) = handle.await.unwrap();
            created += usize::from(was_created);
            match &first {
                Some(f) => assert!(Arc::ptr_eq(f, &s)),
                None => first = Some(s),
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_cleanup_stale_closes_transports() {
        let registry = SessionRegistry::new();
        let (stale, _) = registry.get_or_create("stale", session).await;
        let (fresh, _) = registry.get_or_create("fresh", session).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        fresh.touch();

        let removed = registry.cleanup_stale(Duration::from_millis(20)).await;
        assert_eq!(removed, 1);
        assert!(registry.get("stale").await.is_none());
        assert!(registry.get("fresh").await.is_some());
        assert_eq!(stale.transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SessionRegistry::new();
        let (a, _) = registry.get_or_create("a", session).await;
        registry.get_or_create("b", session).await;

        assert_eq!(registry.close_all().await, 2);
        assert!(registry.is_empty().await);
        assert_eq!(a.transport.state(), TransportState::Closed);
    }
}
