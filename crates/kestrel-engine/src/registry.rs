use std::collections::HashMap;
use std::sync::Arc;

use kestrel_core::tools::{Tool, ToolDefinition};

/// Where a registered tool came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolSource {
    /// Shipped with the engine (shell, todo). Rebound to each session's own
    /// todo manager, so never copied between sessions.
    BuiltIn,
    /// Supplied by the caller through the session config or `register_tools`.
    Session,
}

struct ToolEntry {
    tool: Arc<dyn Tool>,
    source: ToolSource,
}

/// Tools available to one session, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>, source: ToolSource) {
        let name = tool.name().to_string();
        let _ = self.tools.insert(name, ToolEntry { tool, source });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    /// Tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions sent to the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|e| e.tool.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Copy of the caller-supplied tools, for a fork or a delegated task.
    pub fn session_tools(&self) -> Self {
        let tools = self
            .tools
            .iter()
            .filter(|(_, e)| e.source == ToolSource::Session)
            .map(|(name, e)| {
                let entry = ToolEntry {
                    tool: Arc::clone(&e.tool),
                    source: e.source,
                };
                (name.clone(), entry)
            })
            .collect();
        Self { tools }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingTool, EchoTool};

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool), ToolSource::Session);
        reg.register(Arc::new(CountingTool::new("bash_run")), ToolSource::BuiltIn);
        reg.register(Arc::new(CountingTool::new("todo_write")), ToolSource::BuiltIn);
        reg
    }

    #[test]
    fn register_and_lookup() {
        let reg = registry();
        assert_eq!(reg.get("echo").unwrap().name(), "echo");
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn names_and_definitions_are_sorted() {
        let reg = registry();
        assert_eq!(reg.names(), vec!["bash_run", "echo", "todo_write"]);
        let defs: Vec<String> = reg.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(defs, vec!["bash_run", "echo", "todo_write"]);
    }

    #[test]
    fn session_tools_leave_builtins_behind() {
        let mut reg = registry();
        reg.register(Arc::new(CountingTool::new("lint")), ToolSource::Session);
        assert_eq!(reg.session_tools().names(), vec!["echo", "lint"]);
    }

    #[test]
    fn re_register_takes_the_new_source() {
        let mut reg = registry();
        reg.register(Arc::new(CountingTool::new("echo")), ToolSource::BuiltIn);
        assert_eq!(reg.names().len(), 3);
        assert!(reg.session_tools().names().is_empty());
    }
}
