//! Todo records served by the MCP tools.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a todo.
pub type TodoId = Uuid;

/// A todo item held by the endpoint's in-memory store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Todo {
    pub id: TodoId,
    pub text: String,
    pub completed: bool,
}

impl Todo {
    /// Create an open todo with a freshly generated id.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            completed: false,
        }
    }
}
