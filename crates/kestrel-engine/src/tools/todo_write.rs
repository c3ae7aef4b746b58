use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use kestrel_core::errors::ToolError;
use kestrel_core::tools::{ExecutionMode, Tool, ToolContext, ToolMetadata};

use crate::todo::{TodoInput, TodoManager};

#[derive(Deserialize)]
struct TodoWriteArgs {
    todos: Vec<TodoInput>,
}

/// Replaces the session's todo list.
pub struct TodoWriteTool {
    manager: Arc<TodoManager>,
}

impl TodoWriteTool {
    pub fn new(manager: Arc<TodoManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Replace the todo list for this session. Send the full list every time; \
         at most one item may be in_progress."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["todos"],
            "properties": {
                "todos": {
                    "type": "array",
                    "description": "The full todo list",
                    "items": {
                        "type": "object",
                        "required": ["id", "title", "status"],
                        "properties": {
                            "id": { "type": "string" },
                            "title": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            },
                            "assignee": { "type": "string" },
                            "notes": { "type": "string" }
                        }
                    }
                }
            }
        })
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::mutating("write")
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let TodoWriteArgs { todos } =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let snapshot = self
            .manager
            .set_todos(todos)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(json!({
            "ok": true,
            "count": snapshot.todos.len(),
            "version": snapshot.version,
        }))
    }
}

/// Reads the session's todo list.
pub struct TodoReadTool {
    manager: Arc<TodoManager>,
}

impl TodoReadTool {
    pub fn new(manager: Arc<TodoManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for TodoReadTool {
    fn name(&self) -> &str {
        "todo_read"
    }

    fn description(&self) -> &str {
        "Read the current todo list for this session"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::read_only()
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        if !self.manager.enabled() {
            return Ok(json!({
                "todos": [],
                "note": "Todo service not enabled for this session",
            }));
        }
        let todos =
            serde_json::to_value(self.manager.list()).map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(json!({ "todos": todos }))
    }
}
