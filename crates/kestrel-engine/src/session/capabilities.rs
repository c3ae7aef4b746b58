use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use kestrel_core::errors::ToolError;
use kestrel_core::events::AgentEvent;
use kestrel_core::tools::SessionCapabilities;

use super::{Seed, Session, SessionInner};

/// What a running tool may do with its session. Holds only a weak
/// reference, so a tool that outlives its session sees it as gone.
pub(crate) struct SessionHandle {
    session: Weak<SessionInner>,
}

impl SessionHandle {
    pub(crate) fn new(session: Weak<SessionInner>) -> Self {
        Self { session }
    }

    fn upgrade(&self) -> Result<Arc<SessionInner>, ToolError> {
        self.session
            .upgrade()
            .ok_or_else(|| ToolError::ExecutionFailed("session is no longer available".into()))
    }
}

#[async_trait]
impl SessionCapabilities for SessionHandle {
    fn emit(&self, name: &str, data: Value) {
        if let Some(session) = self.session.upgrade() {
            session.emit(AgentEvent::Custom {
                name: name.to_string(),
                data,
            });
        }
    }

    #[instrument(skip(self, prompt, system))]
    async fn delegate_task(&self, prompt: String, system: Option<String>) -> Result<String, ToolError> {
        let parent = self.upgrade()?;
        let child_id = parent.id.task_child();

        let mut config = parent.config.clone();
        if system.is_some() {
            config.system_prompt = system;
        }
        let mut seed = Seed::fresh(&child_id, &config);
        seed.meta.lineage = parent.meta.lock().lineage.clone();
        seed.meta.lineage.push(parent.id.clone());
        seed.registry = Some(parent.session_tools());
        let deps = parent.deps.clone();
        drop(parent);

        let failed = |e: crate::error::EngineError| ToolError::ExecutionFailed(e.to_string());
        let inner = SessionInner::build(child_id.clone(), config, deps, seed).map_err(failed)?;
        inner.open().await.map_err(failed)?;
        let child = Session { inner };
        debug!(child = %child_id, "delegated task started");

        let result = child.reply(&prompt).await;
        child.dispose().await;
        result.map_err(failed)
    }
}
