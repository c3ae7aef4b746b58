use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub title: String,
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Versioned todo list for one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TodoSnapshot {
    pub todos: Vec<TodoItem>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl TodoSnapshot {
    pub fn empty() -> Self {
        Self {
            todos: Vec::new(),
            version: 1,
            updated_at: Utc::now(),
        }
    }

    pub fn open_items(&self) -> impl Iterator<Item = &TodoItem> {
        self.todos.iter().filter(|t| t.status != TodoStatus::Completed)
    }
}

impl Default for TodoSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}
