use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Where the step loop currently is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakpointState {
    #[default]
    Ready,
    PreModel,
    StreamingModel,
    ToolPending,
    AwaitingApproval,
    PreTool,
    ToolExecuting,
    PostTool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakpointEntry {
    pub state: BreakpointState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

pub type BreakpointListener = Arc<dyn Fn(BreakpointState, BreakpointState, &BreakpointEntry) + Send + Sync>;

#[derive(Default)]
struct Inner {
    current: BreakpointState,
    history: Vec<BreakpointEntry>,
}

#[derive(Default)]
pub struct BreakpointManager {
    inner: Mutex<Inner>,
    on_change: Option<BreakpointListener>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(on_change: BreakpointListener) -> Self {
        Self {
            inner: Mutex::default(),
            on_change: Some(on_change),
        }
    }

    pub fn current(&self) -> BreakpointState {
        self.inner.lock().current
    }

    pub fn history(&self) -> Vec<BreakpointEntry> {
        self.inner.lock().history.clone()
    }

    /// Move to `state`. Setting the current state again is ignored.
    pub fn set(&self, state: BreakpointState, note: Option<&str>) {
        let (previous, entry) = {
            let mut inner = self.inner.lock();
            if inner.current == state {
                return;
            }
            let entry = BreakpointEntry {
                state,
                timestamp: Utc::now(),
                note: note.map(str::to_string),
            };
            let previous = std::mem::replace(&mut inner.current, state);
            inner.history.push(entry.clone());
            (previous, entry)
        };
        if let Some(listener) = &self.on_change {
            listener(previous, state, &entry);
        }
    }

    /// Jump to `state` and forget the history without notifying.
    pub fn reset(&self, state: BreakpointState) {
        let mut inner = self.inner.lock();
        inner.current = state;
        inner.history.clear();
    }
}
