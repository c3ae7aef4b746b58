use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::ToolError;
use crate::hooks::Hooks;
use crate::ids::SessionId;
use crate::sandbox::Sandbox;

/// Tools declare whether they can run in parallel with others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Safe to run in parallel through the limiter.
    Concurrent,
    /// Runs alone, after the concurrent batch.
    Sequential,
}

/// Hints consumed by permission modes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub mutates: Option<bool>,
    pub access: Option<String>,
}

impl ToolMetadata {
    pub fn read_only() -> Self {
        Self {
            mutates: Some(false),
            access: Some("read".into()),
        }
    }

    pub fn mutating(access: &str) -> Self {
        Self {
            mutates: Some(true),
            access: Some(access.into()),
        }
    }
}

/// Tool definition sent to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// What a tool may ask of the session that runs it.
#[async_trait]
pub trait SessionCapabilities: Send + Sync {
    /// Emit a `custom` monitor event.
    fn emit(&self, name: &str, data: Value);

    /// Run `prompt` in a child session to completion and return its final text.
    async fn delegate_task(&self, prompt: String, system: Option<String>) -> Result<String, ToolError>;
}

/// Capabilities for tools running outside any session.
pub struct DetachedCapabilities;

#[async_trait]
impl SessionCapabilities for DetachedCapabilities {
    fn emit(&self, _name: &str, _data: Value) {}

    async fn delegate_task(&self, _prompt: String, _system: Option<String>) -> Result<String, ToolError> {
        Err(ToolError::ExecutionFailed("no session to delegate to".into()))
    }
}

/// Context available to tools during execution.
pub struct ToolContext {
    pub session_id: SessionId,
    pub call_id: String,
    pub sandbox: Arc<dyn Sandbox>,
    pub abort_signal: CancellationToken,
    capabilities: Arc<dyn SessionCapabilities>,
}

impl ToolContext {
    pub fn new(
        session_id: SessionId,
        call_id: impl Into<String>,
        sandbox: Arc<dyn Sandbox>,
        abort_signal: CancellationToken,
        capabilities: Arc<dyn SessionCapabilities>,
    ) -> Self {
        Self {
            session_id,
            call_id: call_id.into(),
            sandbox,
            abort_signal,
            capabilities,
        }
    }

    pub fn emit(&self, name: &str, data: Value) {
        self.capabilities.emit(name, data);
    }

    pub async fn delegate_task(&self, prompt: String, system: Option<String>) -> Result<String, ToolError> {
        self.capabilities.delegate_task(prompt, system).await
    }
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::default()
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    /// Hooks contributed by this tool, registered alongside it.
    fn hooks(&self) -> Option<Arc<dyn Hooks>> {
        None
    }

    /// Extra detail shown with a permission request.
    fn permission_details(&self, _args: &Value) -> Option<Value> {
        None
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_mode_serde() {
        let json = serde_json::to_string(&ExecutionMode::Concurrent).unwrap();
        assert_eq!(json, r#""concurrent""#);
        let json = serde_json::to_string(&ExecutionMode::Sequential).unwrap();
        assert_eq!(json, r#""sequential""#);
    }

    #[test]
    fn metadata_helpers() {
        assert_eq!(ToolMetadata::read_only().mutates, Some(false));
        assert_eq!(ToolMetadata::mutating("write").access.as_deref(), Some("write"));
        assert_eq!(ToolMetadata::default().mutates, None);
    }

    #[tokio::test]
    async fn detached_capabilities_refuse_delegation() {
        let caps = DetachedCapabilities;
        caps.emit("ignored", Value::Null);
        assert!(caps.delegate_task("x".into(), None).await.is_err());
    }
}
