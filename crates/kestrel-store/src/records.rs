use std::path::PathBuf;

use chrono::{DateTime, Utc};
use kestrel_core::events::{Channel, SealedCall};
use kestrel_core::ids::SessionId;
use kestrel_core::messages::{Message, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Pending,
    ApprovalRequired,
    Executing,
    Completed,
    Failed,
    Denied,
    Sealed,
}

impl ToolCallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Denied | Self::Sealed)
    }
}

/// Lifecycle of one tool call, kept under `runtime/tool-calls`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub state: ToolCallState,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ToolCallRecord {
    pub fn pending(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
            state: ToolCallState::Pending,
            is_error: false,
            result: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn finish(&mut self, state: ToolCallState, result: Value, is_error: bool) {
        let now = Utc::now();
        self.state = state;
        self.result = Some(result);
        self.is_error = is_error;
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub lineage: Vec<SessionId>,
    #[serde(default)]
    pub step_count: u64,
}

impl SessionMeta {
    pub fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            template_id: None,
            created_at: now,
            updated_at: now,
            lineage: Vec::new(),
            step_count: 0,
        }
    }
}

/// Immutable copy of a session's history at a safe fork point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub messages: Vec<Message>,
    pub last_sfp_index: Option<usize>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryWindow {
    pub id: String,
    pub messages: Vec<Message>,
    pub last_sfp_index: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub reason: String,
}

impl HistoryWindow {
    pub fn new(messages: Vec<Message>, last_sfp_index: Option<usize>, reason: impl Into<String>) -> Self {
        Self {
            id: format!("win_{}", Uuid::now_v7()),
            messages,
            last_sfp_index,
            created_at: Utc::now(),
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressionRecord {
    pub id: String,
    pub window_id: String,
    pub summary: String,
    pub original_count: usize,
    pub created_at: DateTime<Utc>,
}

impl CompressionRecord {
    pub fn new(window: &HistoryWindow, summary: impl Into<String>) -> Self {
        Self {
            id: format!("cmp_{}", Uuid::now_v7()),
            window_id: window.id.clone(),
            summary: summary.into(),
            original_count: window.messages.len(),
            created_at: Utc::now(),
        }
    }
}

/// Written once per crash recovery that sealed at least one call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub id: String,
    pub sealed: Vec<SealedCall>,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
}

impl RecoveryRecord {
    pub fn new(sealed: Vec<SealedCall>, message_count: usize) -> Self {
        Self {
            id: format!("rec_{}", Uuid::now_v7()),
            sealed,
            message_count,
            created_at: Utc::now(),
        }
    }
}

/// Filter for `read_events`. `since` is exclusive, `until` inclusive.
#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    pub channel: Option<Channel>,
    pub since: Option<u64>,
    pub until: Option<u64>,
}

impl EventQuery {
    pub fn since(cursor: u64) -> Self {
        Self {
            since: Some(cursor),
            ..Default::default()
        }
    }

    pub fn matches(&self, channel: Channel, cursor: u64) -> bool {
        self.channel.map_or(true, |c| c == channel)
            && self.since.map_or(true, |s| cursor > s)
            && self.until.map_or(true, |u| cursor <= u)
    }
}

/// Summary of a WAL recovery sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub records_replayed: usize,
    pub events_replayed: usize,
    pub corrupted: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_query_bounds() {
        let q = EventQuery { channel: Some(Channel::Progress), since: Some(3), until: Some(5) };
        assert!(!q.matches(Channel::Progress, 3));
        assert!(q.matches(Channel::Progress, 4));
        assert!(q.matches(Channel::Progress, 5));
        assert!(!q.matches(Channel::Progress, 6));
        assert!(!q.matches(Channel::Monitor, 4));
    }

    #[test]
    fn tool_call_record_finish() {
        let call = ToolCall { id: "t1".into(), name: "bash".into(), input: json!({}) };
        let mut rec = ToolCallRecord::pending(&call);
        rec.started_at = Some(Utc::now());
        rec.finish(ToolCallState::Completed, json!("ok"), false);
        assert!(rec.state.is_terminal());
        assert!(rec.duration_ms.is_some());
        assert!(!ToolCallState::Executing.is_terminal());
    }

    #[test]
    fn compression_points_at_window() {
        let window = HistoryWindow::new(vec![Message::user_text("a")], Some(0), "manual");
        let cmp = CompressionRecord::new(&window, "summary");
        assert_eq!(cmp.window_id, window.id);
        assert_eq!(cmp.original_count, 1);
    }
}
