use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;
use crate::messages::ToolCall;
use crate::provider::{ModelRequest, ModelResponse};

/// Context passed to every hook invocation.
#[derive(Clone, Debug)]
pub struct HookContext {
    pub session_id: SessionId,
    pub step: u64,
}

/// Outcome of a `pre_tool_use` hook. Anything but `Allow` stops the chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HookDecision {
    Allow,
    Deny {
        reason: Option<String>,
        tool_result: Option<Value>,
    },
    Ask {
        meta: Value,
    },
    Result {
        value: Value,
    },
}

/// What a tool call produced, as seen by `post_tool_use`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub ok: bool,
    pub content: Value,
    pub duration_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomePatch {
    pub ok: Option<bool>,
    pub content: Option<Value>,
    pub duration_ms: Option<u64>,
}

impl ToolOutcome {
    /// Shallow merge: set fields replace, absent fields keep their value.
    pub fn apply(&mut self, patch: OutcomePatch) {
        if let Some(ok) = patch.ok {
            self.ok = ok;
        }
        if let Some(content) = patch.content {
            self.content = content;
        }
        if patch.duration_ms.is_some() {
            self.duration_ms = patch.duration_ms;
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PostHookAction {
    Update(OutcomePatch),
    Replace(ToolOutcome),
}

/// A set of lifecycle hooks. Every method is optional.
#[async_trait]
pub trait Hooks: Send + Sync {
    fn name(&self) -> &str {
        "hooks"
    }

    async fn pre_tool_use(&self, _call: &mut ToolCall, _ctx: &HookContext) -> HookDecision {
        HookDecision::Allow
    }

    async fn post_tool_use(
        &self,
        _call: &ToolCall,
        _outcome: &ToolOutcome,
        _ctx: &HookContext,
    ) -> Option<PostHookAction> {
        None
    }

    async fn pre_model(&self, _request: &mut ModelRequest, _ctx: &HookContext) {}

    async fn post_model(&self, _response: &ModelResponse, _ctx: &HookContext) {}
}
