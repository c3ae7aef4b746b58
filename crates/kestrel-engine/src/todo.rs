//! Per-session todo list: a validated, versioned snapshot persisted through the
//! store, plus the manager that publishes changes and reminds the model.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use kestrel_core::events::AgentEvent;
use kestrel_core::ids::SessionId;
use kestrel_core::todos::{TodoItem, TodoSnapshot, TodoStatus};
use kestrel_store::Store;

use crate::bus::EventBus;
use crate::error::{EngineError, Result};

const MAX_IN_PROGRESS: usize = 1;
const REMINDER_LIST_LIMIT: usize = 10;

/// A todo as supplied by callers; timestamps are managed by the service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TodoInput {
    pub id: String,
    pub title: String,
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl TodoInput {
    pub fn new(id: &str, title: &str, status: TodoStatus) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            status,
            assignee: None,
            notes: None,
        }
    }
}

/// Partial update for one todo. Absent fields keep their value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TodoPatch {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<TodoStatus>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub struct TodoService {
    store: Arc<dyn Store>,
    session_id: SessionId,
    snapshot: Mutex<TodoSnapshot>,
    // Serializes read-modify-persist cycles.
    writes: tokio::sync::Mutex<()>,
}

impl TodoService {
    pub fn new(store: Arc<dyn Store>, session_id: SessionId) -> Self {
        Self {
            store,
            session_id,
            snapshot: Mutex::new(TodoSnapshot::empty()),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<()> {
        if let Some(existing) = self.store.load_todos(&self.session_id).await? {
            *self.snapshot.lock() = existing;
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<TodoItem> {
        self.snapshot.lock().todos.clone()
    }

    pub fn snapshot(&self) -> TodoSnapshot {
        self.snapshot.lock().clone()
    }

    /// Replace the whole list. Returns the previous snapshot.
    pub async fn set_todos(&self, inputs: Vec<TodoInput>) -> Result<TodoSnapshot> {
        let _gate = self.writes.lock().await;
        let previous = self.snapshot();
        let now = Utc::now();
        let created: HashMap<&str, _> = previous
            .todos
            .iter()
            .map(|t| (t.id.as_str(), t.created_at))
            .collect();
        let todos: Vec<TodoItem> = inputs
            .into_iter()
            .map(|input| TodoItem {
                created_at: created.get(input.id.as_str()).copied().unwrap_or(now),
                updated_at: now,
                id: input.id,
                title: input.title,
                status: input.status,
                assignee: input.assignee,
                notes: input.notes,
            })
            .collect();
        self.commit(&previous, todos).await?;
        Ok(previous)
    }

    pub async fn update(&self, patch: TodoPatch) -> Result<TodoSnapshot> {
        let _gate = self.writes.lock().await;
        let previous = self.snapshot();
        if !previous.todos.iter().any(|t| t.id == patch.id) {
            return Err(EngineError::Todo(format!("Todo not found: {}", patch.id)));
        }
        let now = Utc::now();
        let todos = previous
            .todos
            .iter()
            .cloned()
            .map(|mut t| {
                if t.id == patch.id {
                    if let Some(title) = &patch.title {
                        t.title = title.clone();
                    }
                    if let Some(status) = patch.status {
                        t.status = status;
                    }
                    if patch.assignee.is_some() {
                        t.assignee = patch.assignee.clone();
                    }
                    if patch.notes.is_some() {
                        t.notes = patch.notes.clone();
                    }
                    t.updated_at = now;
                }
                t
            })
            .collect();
        self.commit(&previous, todos).await?;
        Ok(previous)
    }

    /// Remove a todo. Deleting an unknown id still bumps the version.
    pub async fn delete(&self, id: &str) -> Result<TodoSnapshot> {
        let _gate = self.writes.lock().await;
        let previous = self.snapshot();
        let todos = previous.todos.iter().filter(|t| t.id != id).cloned().collect();
        self.commit(&previous, todos).await?;
        Ok(previous)
    }

    async fn commit(&self, previous: &TodoSnapshot, todos: Vec<TodoItem>) -> Result<()> {
        validate(&todos)?;
        let next = TodoSnapshot {
            todos,
            version: previous.version + 1,
            updated_at: Utc::now(),
        };
        self.store.save_todos(&self.session_id, &next).await?;
        debug!(session_id = %self.session_id, version = next.version, count = next.todos.len(), "todos saved");
        *self.snapshot.lock() = next;
        Ok(())
    }
}

fn validate(todos: &[TodoItem]) -> Result<()> {
    let mut ids = HashSet::new();
    let mut in_progress = 0;
    for todo in todos {
        if todo.id.is_empty() {
            return Err(EngineError::Todo("Todo id is required".into()));
        }
        if !ids.insert(todo.id.as_str()) {
            return Err(EngineError::Todo(format!("Duplicate todo id: {}", todo.id)));
        }
        if todo.status == TodoStatus::InProgress {
            in_progress += 1;
        }
        if todo.title.trim().is_empty() {
            return Err(EngineError::Todo(format!("Todo {} must have a title", todo.id)));
        }
    }
    if in_progress > MAX_IN_PROGRESS {
        return Err(EngineError::Todo("Only one todo can be in progress".into()));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TodoConfig {
    pub enabled: bool,
    pub reminder_on_start: bool,
    /// Remind every N steps; 0 turns interval reminders off.
    pub remind_interval_steps: u64,
}

impl Default for TodoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reminder_on_start: false,
            remind_interval_steps: 0,
        }
    }
}

pub type RemindFn = Arc<dyn Fn(String) + Send + Sync>;

/// Wraps a [`TodoService`] with change events and model reminders.
pub struct TodoManager {
    service: TodoService,
    config: TodoConfig,
    bus: Arc<EventBus>,
    remind: RemindFn,
    steps_since_reminder: AtomicU64,
}

impl TodoManager {
    pub fn new(service: TodoService, config: TodoConfig, bus: Arc<EventBus>, remind: RemindFn) -> Self {
        Self {
            service,
            config,
            bus,
            remind,
            steps_since_reminder: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn load(&self) -> Result<()> {
        self.service.load().await
    }

    pub fn list(&self) -> Vec<TodoItem> {
        self.service.list()
    }

    pub fn snapshot(&self) -> TodoSnapshot {
        self.service.snapshot()
    }

    #[instrument(skip(self, todos), fields(count = todos.len()))]
    pub async fn set_todos(&self, todos: Vec<TodoInput>) -> Result<TodoSnapshot> {
        self.ensure_enabled()?;
        let previous = self.service.set_todos(todos).await?;
        Ok(self.publish_change(previous))
    }

    pub async fn update(&self, patch: TodoPatch) -> Result<TodoSnapshot> {
        self.ensure_enabled()?;
        let previous = self.service.update(patch).await?;
        Ok(self.publish_change(previous))
    }

    pub async fn remove(&self, id: &str) -> Result<TodoSnapshot> {
        self.ensure_enabled()?;
        let previous = self.service.delete(id).await?;
        Ok(self.publish_change(previous))
    }

    /// Remind about open items (or the empty list) when a session starts.
    pub fn handle_startup(&self) {
        if !self.enabled() || !self.config.reminder_on_start {
            return;
        }
        let open: Vec<TodoItem> = self.service.snapshot().open_items().cloned().collect();
        if open.is_empty() {
            self.send_empty_reminder();
        } else {
            self.send_reminder(open, "startup");
        }
    }

    /// Count a step; remind once the configured interval has passed.
    pub fn on_step(&self) {
        let interval = self.config.remind_interval_steps;
        if !self.enabled() || interval == 0 {
            return;
        }
        let steps = self.steps_since_reminder.fetch_add(1, Ordering::SeqCst) + 1;
        if steps < interval {
            return;
        }
        let open: Vec<TodoItem> = self.service.snapshot().open_items().cloned().collect();
        if !open.is_empty() {
            self.send_reminder(open, "interval");
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if !self.enabled() {
            return Err(EngineError::Todo("Todo service not enabled for this session".into()));
        }
        Ok(())
    }

    fn publish_change(&self, previous: TodoSnapshot) -> TodoSnapshot {
        self.steps_since_reminder.store(0, Ordering::SeqCst);
        let current = self.service.snapshot();
        let _ = self.bus.emit(AgentEvent::TodoChanged {
            previous,
            current: current.clone(),
        });
        if current.todos.is_empty() {
            self.send_empty_reminder();
        }
        current
    }

    fn send_reminder(&self, todos: Vec<TodoItem>, reason: &str) {
        self.steps_since_reminder.store(0, Ordering::SeqCst);
        let text = format_reminder(&todos);
        let _ = self.bus.emit(AgentEvent::TodoReminder {
            todos,
            reason: reason.to_string(),
        });
        (self.remind)(text);
    }

    fn send_empty_reminder(&self) {
        (self.remind)(
            "The todo list is empty. If you need to track tasks, create a list with todo_write."
                .to_string(),
        );
    }
}

fn status_label(status: TodoStatus) -> &'static str {
    match status {
        TodoStatus::Pending => "pending",
        TodoStatus::InProgress => "in_progress",
        TodoStatus::Completed => "completed",
    }
}

fn format_reminder(todos: &[TodoItem]) -> String {
    let list = todos
        .iter()
        .take(REMINDER_LIST_LIMIT)
        .enumerate()
        .map(|(i, t)| format!("{}. [{}] {}", i + 1, status_label(t.status), t.title))
        .collect::<Vec<_>>()
        .join("\n");
    let more = if todos.len() > REMINDER_LIST_LIMIT {
        format!("\n... and {} more", todos.len() - REMINDER_LIST_LIMIT)
    } else {
        String::new()
    };
    format!(
        "The todo list still has open items:\n{list}{more}\nKeep progress current with todo_write. Do not mention this reminder to the user."
    )
}
