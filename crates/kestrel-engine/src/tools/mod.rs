pub mod bash;
pub mod todo_write;

use std::sync::Arc;

use crate::registry::{ToolRegistry, ToolSource};
use crate::todo::TodoManager;

/// Register the shell family and the todo tools bound to `todos`.
pub fn register_builtin_tools(registry: &mut ToolRegistry, todos: Arc<TodoManager>) {
    // Shell
    registry.register(Arc::new(bash::BashRunTool), ToolSource::BuiltIn);
    registry.register(Arc::new(bash::BashLogsTool), ToolSource::BuiltIn);
    registry.register(Arc::new(bash::BashKillTool), ToolSource::BuiltIn);

    // Task management
    registry.register(
        Arc::new(todo_write::TodoWriteTool::new(Arc::clone(&todos))),
        ToolSource::BuiltIn,
    );
    registry.register(Arc::new(todo_write::TodoReadTool::new(todos)), ToolSource::BuiltIn);
}
