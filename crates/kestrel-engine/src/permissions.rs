//! Tool permission policy.
//!
//! Evaluation order, first match wins: deny list, allow list, approval list,
//! mode handler, default allow.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use kestrel_core::tools::ToolMetadata;
use kestrel_settings::PermissionSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    Ask,
}

/// What a mode handler sees.
#[derive(Clone, Debug)]
pub struct PermissionRequest<'a> {
    pub tool: &'a str,
    pub metadata: &'a ToolMetadata,
}

pub type ModeHandler = Arc<dyn Fn(&PermissionRequest<'_>) -> Verdict + Send + Sync>;

const MUTATING_ACCESS: [&str; 4] = ["write", "execute", "manage", "mutate"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionConfig {
    pub mode: String,
    pub allow_tools: Vec<String>,
    pub deny_tools: Vec<String>,
    pub require_approval_tools: Vec<String>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self::from(&PermissionSettings::default())
    }
}

impl From<&PermissionSettings> for PermissionConfig {
    fn from(s: &PermissionSettings) -> Self {
        Self {
            mode: s.mode.clone(),
            allow_tools: s.allow_tools.clone(),
            deny_tools: s.deny_tools.clone(),
            require_approval_tools: s.require_approval_tools.clone(),
        }
    }
}

impl PermissionConfig {
    pub fn with_mode(mut self, mode: &str) -> Self {
        self.mode = mode.to_string();
        self
    }

    pub fn with_allow_tools(mut self, tools: &[&str]) -> Self {
        self.allow_tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_deny_tools(mut self, tools: &[&str]) -> Self {
        self.deny_tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_require_approval_tools(mut self, tools: &[&str]) -> Self {
        self.require_approval_tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// A mode as recorded alongside a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedMode {
    pub name: String,
    pub built_in: bool,
}

/// Named permission modes. `auto`, `approval` and `readonly` are built in.
pub struct ModeRegistry {
    handlers: RwLock<HashMap<String, ModeHandler>>,
    custom: RwLock<HashSet<String>>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        let mut handlers: HashMap<String, ModeHandler> = HashMap::new();
        let _ = handlers.insert("auto".into(), Arc::new(|_: &PermissionRequest<'_>| Verdict::Allow));
        let _ = handlers.insert("approval".into(), Arc::new(|_: &PermissionRequest<'_>| Verdict::Ask));
        let _ = handlers.insert("readonly".into(), Arc::new(readonly));
        Self {
            handlers: RwLock::new(handlers),
            custom: RwLock::new(HashSet::new()),
        }
    }

    /// Register or replace a custom mode.
    pub fn register(&self, name: &str, handler: ModeHandler) {
        let _ = self.handlers.write().insert(name.to_string(), handler);
        let _ = self.custom.write().insert(name.to_string());
    }

    pub fn get(&self, name: &str) -> Option<ModeHandler> {
        self.handlers.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn serialize(&self) -> Vec<SerializedMode> {
        let custom = self.custom.read();
        self.list()
            .into_iter()
            .map(|name| SerializedMode {
                built_in: !custom.contains(&name),
                name,
            })
            .collect()
    }

    /// Custom modes in `modes` that are not registered here.
    pub fn validate_restore(&self, modes: &[SerializedMode]) -> Vec<String> {
        let handlers = self.handlers.read();
        modes
            .iter()
            .filter(|m| !m.built_in && !handlers.contains_key(&m.name))
            .map(|m| m.name.clone())
            .collect()
    }

    /// Run the policy for one call.
    pub fn evaluate(&self, config: &PermissionConfig, tool: &str, metadata: &ToolMetadata) -> Verdict {
        if config.deny_tools.iter().any(|t| t == tool) {
            return Verdict::Deny;
        }
        if !config.allow_tools.is_empty() && !config.allow_tools.iter().any(|t| t == tool) {
            return Verdict::Deny;
        }
        if config.require_approval_tools.iter().any(|t| t == tool) {
            return Verdict::Ask;
        }
        let handler = self.get(&config.mode).or_else(|| self.get("auto"));
        match handler {
            Some(h) => h(&PermissionRequest { tool, metadata }),
            None => Verdict::Allow,
        }
    }
}

impl Default for ModeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn readonly(req: &PermissionRequest<'_>) -> Verdict {
    match req.metadata.mutates {
        Some(true) => return Verdict::Deny,
        Some(false) => return Verdict::Allow,
        None => {}
    }
    match req.metadata.access.as_deref() {
        Some(access) if MUTATING_ACCESS.contains(&access) => Verdict::Deny,
        _ => Verdict::Ask,
    }
}
