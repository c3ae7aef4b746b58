//! Event vocabulary for the session bus.
//!
//! Every event kind belongs to exactly one channel. Envelopes carry the
//! bus-assigned cursor, which starts at 1 and never repeats within a session.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorKind;
use crate::ids::EventId;
use crate::todos::{TodoItem, TodoSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Progress,
    Control,
    Monitor,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Progress, Channel::Control, Channel::Monitor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Control => "control",
            Self::Monitor => "monitor",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(Self::Progress),
            "control" => Ok(Self::Control),
            "monitor" => Ok(Self::Monitor),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Ready,
    Busy,
    Paused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidedBy {
    Api,
    Respond,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeFrom {
    Crash,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Completed,
    Interrupted,
    Failed,
    Denied,
}

/// A tool call closed with a synthetic result during crash recovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SealedCall {
    pub tool_use_id: String,
    pub name: String,
    pub args: Value,
    pub note: String,
}

type RespondFn = dyn Fn(Decision, Option<String>) -> BoxFuture<'static, Result<(), String>> + Send + Sync;

/// In-process callback attached to `permission_ask`. Never serialized.
#[derive(Clone)]
pub struct PermissionResponder(Arc<RespondFn>);

impl PermissionResponder {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Decision, Option<String>) -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub async fn respond(&self, decision: Decision, note: Option<String>) -> Result<(), String> {
        (self.0)(decision, note).await
    }
}

impl fmt::Debug for PermissionResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PermissionResponder")
    }
}

/// Token accounting reported per model call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageData {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    // --- progress ---
    TextChunk {
        delta: String,
    },
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        name: String,
        ok: bool,
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Usage {
        data: UsageData,
    },
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
    Done {
        step: u64,
        reason: DoneReason,
    },

    // --- control ---
    PermissionAsk {
        id: String,
        tool: String,
        args: Value,
        meta: Value,
        #[serde(skip)]
        respond: Option<PermissionResponder>,
    },
    PermissionDecision {
        id: String,
        decision: Decision,
        by: DecidedBy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    State {
        state: SessionState,
    },
    Resume {
        from: ResumeFrom,
        sealed: Vec<SealedCall>,
    },

    // --- monitor ---
    MessagesUpdate {
        message_count: usize,
        last_sfp_index: Option<usize>,
        added: usize,
    },
    Commit {
        sfp_index: Option<usize>,
    },
    Forked {
        child_session_id: String,
        from: Option<String>,
    },
    TodoChanged {
        previous: TodoSnapshot,
        current: TodoSnapshot,
    },
    TodoReminder {
        todos: Vec<TodoItem>,
        reason: String,
    },
    FileChanged {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mtime_ms: Option<u64>,
    },
    SchedulerTriggered {
        task_id: String,
        spec: String,
        kind: String,
    },
    ToolManualUpdated {
        tools: Vec<String>,
    },
    Custom {
        name: String,
        data: Value,
    },
}

impl AgentEvent {
    pub fn channel(&self) -> Channel {
        match self {
            Self::TextChunk { .. }
            | Self::Text { .. }
            | Self::ToolUse { .. }
            | Self::ToolResult { .. }
            | Self::Usage { .. }
            | Self::Error { .. }
            | Self::Done { .. } => Channel::Progress,
            Self::PermissionAsk { .. }
            | Self::PermissionDecision { .. }
            | Self::State { .. }
            | Self::Resume { .. } => Channel::Control,
            Self::MessagesUpdate { .. }
            | Self::Commit { .. }
            | Self::Forked { .. }
            | Self::TodoChanged { .. }
            | Self::TodoReminder { .. }
            | Self::FileChanged { .. }
            | Self::SchedulerTriggered { .. }
            | Self::ToolManualUpdated { .. }
            | Self::Custom { .. } => Channel::Monitor,
        }
    }

    /// The serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextChunk { .. } => "text_chunk",
            Self::Text { .. } => "text",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Usage { .. } => "usage",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
            Self::PermissionAsk { .. } => "permission_ask",
            Self::PermissionDecision { .. } => "permission_decision",
            Self::State { .. } => "state",
            Self::Resume { .. } => "resume",
            Self::MessagesUpdate { .. } => "messages_update",
            Self::Commit { .. } => "commit",
            Self::Forked { .. } => "forked",
            Self::TodoChanged { .. } => "todo_changed",
            Self::TodoReminder { .. } => "todo_reminder",
            Self::FileChanged { .. } => "file_changed",
            Self::SchedulerTriggered { .. } => "scheduler_triggered",
            Self::ToolManualUpdated { .. } => "tool_manual_updated",
            Self::Custom { .. } => "custom",
        }
    }
}

/// Durable cursor position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

/// An event stamped by the bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub cursor: u64,
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub channel: Channel,
    pub event: AgentEvent,
}

impl Envelope {
    pub fn new(cursor: u64, event: AgentEvent) -> Self {
        Self {
            cursor,
            event_id: EventId::new(),
            timestamp: Utc::now(),
            channel: event.channel(),
            event,
        }
    }

    pub fn bookmark(&self) -> Bookmark {
        Bookmark {
            seq: self.cursor,
            timestamp: self.timestamp,
        }
    }
}
