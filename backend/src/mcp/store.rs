//! In-memory todo store shared by all MCP sessions.

use aido_types::{Todo, TodoId};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-wide todo list. Cloning shares the underlying storage.
#[derive(Clone, Default)]
pub struct TodoStore {
    items: Arc<RwLock<Vec<Todo>>>,
}

impl TodoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a todo and return it.
    pub async fn insert(&self, todo: Todo) -> Todo {
        self.items.write().await.push(todo.clone());
        todo
    }

    /// Snapshot of all todos in insertion order.
    pub async fn list(&self) -> Vec<Todo> {
        self.items.read().await.clone()
    }

    pub async fn get(&self, id: &TodoId) -> Option<Todo> {
        self.items.read().await.iter().find(|t| &t.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}
