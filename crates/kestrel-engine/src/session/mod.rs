//! Long-lived agent sessions.
//!
//! A [`Session`] owns one conversation: its history, tool registry, hook
//! pipeline, event bus and the single driver task that runs the step loop.
//! Every mutation of the history goes through a generation check so an
//! interrupted turn can never commit late output.

mod capabilities;
mod recovery;
mod turn;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use kestrel_core::events::{AgentEvent, Channel, Decision, DecidedBy, DoneReason, Envelope, SessionState};
use kestrel_core::hooks::{HookContext, Hooks};
use kestrel_core::ids::SessionId;
use kestrel_core::messages::{count_user_turns, find_last_sfp, Message};
use kestrel_core::provider::{CompleteOptions, ModelProvider, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use kestrel_core::sandbox::{FileChange, Sandbox};
use kestrel_core::tools::Tool;
use kestrel_settings::SessionSettings;
use kestrel_store::{SessionMeta, SnapshotRecord, Store, ToolCallRecord};

use crate::breakpoints::{BreakpointManager, BreakpointState};
use crate::bus::{EventBus, EventStream, SubscribeOptions, DEFAULT_EVENT_CAPACITY};
use crate::error::{EngineError, Result};
use crate::hooks::{HookOrigin, HookPipeline, RegisteredHook};
use crate::limiter::{ToolRunner, DEFAULT_MAX_CONCURRENCY};
use crate::message_queue::{MessageQueue, PendingKind, SendOptions};
use crate::permissions::{ModeRegistry, PermissionConfig};
use crate::registry::{ToolRegistry, ToolSource};
use crate::scheduler::Scheduler;
use crate::todo::{RemindFn, TodoConfig, TodoManager, TodoService};
use crate::tools::register_builtin_tools;

pub use recovery::{ResumeOptions, ResumeStrategy};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared services a session runs against.
#[derive(Clone)]
pub struct SessionDeps {
    pub provider: Arc<dyn ModelProvider>,
    pub store: Arc<dyn Store>,
    pub sandbox: Arc<dyn Sandbox>,
    pub modes: Arc<ModeRegistry>,
}

impl SessionDeps {
    pub fn new(provider: Arc<dyn ModelProvider>, store: Arc<dyn Store>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            provider,
            store,
            sandbox,
            modes: Arc::new(ModeRegistry::new()),
        }
    }

    pub fn with_modes(mut self, modes: Arc<ModeRegistry>) -> Self {
        self.modes = modes;
        self
    }
}

/// Per-session configuration.
#[derive(Clone)]
pub struct SessionConfig {
    pub template_id: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub max_concurrency: usize,
    pub tool_timeout: Duration,
    pub event_capacity: usize,
    pub permissions: PermissionConfig,
    pub todos: TodoConfig,
    pub tools: Vec<Arc<dyn Tool>>,
    pub hooks: Vec<Arc<dyn Hooks>>,
    /// Install the shell and todo tools.
    pub builtin_tools: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            template_id: None,
            system_prompt: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            permissions: PermissionConfig::default(),
            todos: TodoConfig::default(),
            tools: Vec::new(),
            hooks: Vec::new(),
            builtin_tools: true,
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            system_prompt: settings.system_prompt.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            max_concurrency: settings.max_concurrency,
            tool_timeout: Duration::from_millis(settings.tool_timeout_ms),
            event_capacity: settings.event_capacity,
            permissions: PermissionConfig::from(&settings.permissions),
            ..Default::default()
        }
    }

    pub fn with_template_id(mut self, template_id: &str) -> Self {
        self.template_id = Some(template_id.to_string());
        self
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = Some(prompt.to_string());
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionConfig) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_todos(mut self, todos: TodoConfig) -> Self {
        self.todos = todos;
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn without_builtin_tools(mut self) -> Self {
        self.builtin_tools = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: SessionId,
    pub message_count: usize,
    pub last_sfp_index: Option<usize>,
    pub cursor: u64,
    pub step_count: u64,
    pub pending_permissions: Vec<String>,
    /// A turn is in flight (the driver task owns the session).
    pub running: bool,
    pub breakpoint: BreakpointState,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub template_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub lineage: Vec<SessionId>,
    pub message_count: usize,
    pub last_sfp_index: Option<usize>,
}

/// Options for [`Session::ask_llm`].
#[derive(Clone, Debug, Default)]
pub struct AskOptions {
    pub system: Option<String>,
    /// Offer the session's tool schemas to the model.
    pub with_tools: bool,
}

struct Runtime {
    state: SessionState,
    running: bool,
    /// Bumped by interrupt; a turn only commits while its generation is current.
    generation: u64,
    turn: CancellationToken,
    step_count: u64,
    last_sfp_index: Option<usize>,
}

impl Runtime {
    /// Mark a turn as in flight and hand out its generation and cancel token.
    fn claim(&mut self) -> (u64, CancellationToken) {
        self.running = true;
        self.turn = CancellationToken::new();
        (self.generation, self.turn.clone())
    }
}

struct PendingPermission {
    tool: String,
    tx: oneshot::Sender<(Decision, Option<String>)>,
}

/// Initial contents for a session being built.
struct Seed {
    meta: SessionMeta,
    messages: Vec<Message>,
    records: Vec<ToolCallRecord>,
    registry: Option<ToolRegistry>,
    hooks: Option<HookPipeline>,
}

impl Seed {
    fn fresh(id: &SessionId, config: &SessionConfig) -> Self {
        let mut meta = SessionMeta::new(id.clone());
        meta.template_id = config.template_id.clone();
        Self {
            meta,
            messages: Vec::new(),
            records: Vec::new(),
            registry: None,
            hooks: None,
        }
    }
}

pub(crate) struct SessionInner {
    id: SessionId,
    config: SessionConfig,
    deps: SessionDeps,
    bus: Arc<EventBus>,
    registry: RwLock<ToolRegistry>,
    hooks: HookPipeline,
    runner: Arc<ToolRunner>,
    queue: MessageQueue,
    breakpoints: BreakpointManager,
    todos: Arc<TodoManager>,
    scheduler: OnceLock<Arc<Scheduler>>,
    runtime: Mutex<Runtime>,
    messages: Mutex<Vec<Message>>,
    records: Mutex<Vec<ToolCallRecord>>,
    meta: Mutex<SessionMeta>,
    permissions: DashMap<String, PendingPermission>,
    persist_lock: tokio::sync::Mutex<()>,
    watches: Mutex<Vec<String>>,
    self_ref: Weak<SessionInner>,
}

impl SessionInner {
    /// Must be called inside a tokio runtime (the bus spawns its persistence worker).
    fn build(id: SessionId, config: SessionConfig, deps: SessionDeps, seed: Seed) -> Result<Arc<Self>> {
        let runner = Arc::new(ToolRunner::new(config.max_concurrency)?);
        let Seed {
            meta,
            messages,
            records,
            registry,
            hooks,
        } = seed;
        let step_count = meta.step_count.max(count_user_turns(&messages));
        let last_sfp_index = find_last_sfp(&messages);

        Ok(Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let bus = Arc::new(EventBus::with_store(
                id.clone(),
                Arc::clone(&deps.store),
                config.event_capacity,
            ));

            let remind_ref = weak.clone();
            let remind: RemindFn = Arc::new(move |text| {
                if let Some(inner) = remind_ref.upgrade() {
                    let _ = inner.queue.push(&text, &SendOptions::reminder());
                }
            });
            let todos = Arc::new(TodoManager::new(
                TodoService::new(Arc::clone(&deps.store), id.clone()),
                config.todos.clone(),
                Arc::clone(&bus),
                remind,
            ));

            let seeded = registry.is_some();
            let mut registry = registry.unwrap_or_default();
            if !seeded {
                for tool in &config.tools {
                    registry.register(Arc::clone(tool), ToolSource::Session);
                }
            }
            if config.builtin_tools {
                register_builtin_tools(&mut registry, Arc::clone(&todos));
            }

            let hooks = hooks.unwrap_or_else(|| {
                let pipeline = HookPipeline::new();
                for set in &config.hooks {
                    pipeline.register(Arc::clone(set), HookOrigin::Session);
                }
                for name in registry.names() {
                    if let Some(set) = registry.get(&name).and_then(|t| t.hooks()) {
                        pipeline.register(set, HookOrigin::Tool);
                    }
                }
                pipeline
            });

            let session_id = id.clone();
            let breakpoints = BreakpointManager::with_listener(Arc::new(move |prev, next, entry| {
                debug!(
                    session_id = %session_id,
                    from = ?prev,
                    to = ?next,
                    note = entry.note.as_deref().unwrap_or(""),
                    "breakpoint"
                );
            }));

            Self {
                id,
                config,
                deps,
                bus,
                registry: RwLock::new(registry),
                hooks,
                runner,
                queue: MessageQueue::new(),
                breakpoints,
                todos,
                scheduler: OnceLock::new(),
                runtime: Mutex::new(Runtime {
                    state: SessionState::Ready,
                    running: false,
                    generation: 0,
                    turn: CancellationToken::new(),
                    step_count,
                    last_sfp_index,
                }),
                messages: Mutex::new(messages),
                records: Mutex::new(records),
                meta: Mutex::new(meta),
                permissions: DashMap::new(),
                persist_lock: tokio::sync::Mutex::new(()),
                watches: Mutex::new(Vec::new()),
                self_ref: weak.clone(),
            }
        }))
    }

    /// Continue cursor numbering after whatever the store already holds and load todos.
    async fn open(&self) -> Result<()> {
        let cursor = self.deps.store.last_cursor(&self.id).await?;
        self.bus.seed_cursor(cursor);
        self.todos.load().await
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.bus.emit(event);
    }

    /// Emit a `state` event when the state actually changes.
    fn set_state(&self, state: SessionState) {
        let mut rt = self.runtime.lock();
        if rt.state != state {
            rt.state = state;
            self.emit(AgentEvent::State { state });
        }
    }

    fn hook_context(&self) -> HookContext {
        HookContext {
            session_id: self.id.clone(),
            step: self.runtime.lock().step_count,
        }
    }

    fn complete_options(&self, system: Option<String>, with_tools: bool) -> CompleteOptions {
        CompleteOptions {
            tools: if with_tools {
                self.registry.read().definitions()
            } else {
                Vec::new()
            },
            system: system.or_else(|| self.config.system_prompt.clone()),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    /// Apply `f` to the runtime and history unless `generation` was interrupted.
    fn commit_if_current<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut Runtime, &mut Vec<Message>) -> T,
    ) -> Option<T> {
        let mut rt = self.runtime.lock();
        if rt.generation != generation {
            return None;
        }
        let mut messages = self.messages.lock();
        Some(f(&mut rt, &mut messages))
    }

    /// Step-counter side effects. Called after the counter moved, with no locks held.
    fn after_step(&self, step_count: u64) {
        self.todos.on_step();
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.notify_step(step_count);
        }
    }

    fn meta_snapshot(&self) -> SessionMeta {
        let step_count = self.runtime.lock().step_count;
        let mut meta = self.meta.lock();
        meta.step_count = step_count;
        meta.updated_at = Utc::now();
        meta.clone()
    }

    /// Write the latest history, tool-call records and meta.
    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let messages = self.messages.lock().clone();
        self.deps.store.save_messages(&self.id, &messages).await?;
        let records = self.records.lock().clone();
        self.deps.store.save_tool_calls(&self.id, &records).await?;
        let meta = self.meta_snapshot();
        self.deps.store.save_meta(&self.id, &meta).await?;
        Ok(())
    }

    async fn persist_records(&self) {
        let _guard = self.persist_lock.lock().await;
        let records = self.records.lock().clone();
        if let Err(e) = self.deps.store.save_tool_calls(&self.id, &records).await {
            warn!(session_id = %self.id, error = %e, "failed to persist tool-call records");
        }
    }

    /// Move queued messages into the history. Counts one step per message.
    async fn flush_queue(&self) -> Result<usize> {
        let flushed = self.queue.flush(&self.messages, |_| self.persist()).await?;
        if flushed == 0 {
            return Ok(0);
        }
        let (step_count, message_count, sfp) = {
            let mut rt = self.runtime.lock();
            let messages = self.messages.lock();
            rt.step_count += flushed as u64;
            rt.last_sfp_index = find_last_sfp(&messages);
            (rt.step_count, messages.len(), rt.last_sfp_index)
        };
        for _ in 0..flushed {
            self.after_step(step_count);
        }
        self.emit(AgentEvent::MessagesUpdate {
            message_count,
            last_sfp_index: sfp,
            added: flushed,
        });
        Ok(flushed)
    }

    /// Drop a claim taken by `send` whose flush failed.
    fn release(&self, generation: u64) {
        let mut rt = self.runtime.lock();
        if rt.generation == generation {
            rt.running = false;
        }
    }

    /// Resolve a pending permission. Unknown or already-resolved ids fail.
    fn resolve_permission(
        &self,
        call_id: &str,
        decision: Decision,
        note: Option<String>,
        by: DecidedBy,
    ) -> Result<()> {
        let (_, pending) = self
            .permissions
            .remove(call_id)
            .ok_or_else(|| EngineError::PermissionNotFound(call_id.to_string()))?;
        debug!(session_id = %self.id, call_id, tool = %pending.tool, ?decision, "permission decided");
        self.emit(AgentEvent::PermissionDecision {
            id: call_id.to_string(),
            decision,
            by,
            note: note.clone(),
        });
        let _ = pending.tx.send((decision, note));
        Ok(())
    }

    fn status(&self) -> SessionStatus {
        let (state, running, step_count, last_sfp_index) = {
            let rt = self.runtime.lock();
            (rt.state, rt.running, rt.step_count, rt.last_sfp_index)
        };
        let mut pending_permissions: Vec<String> =
            self.permissions.iter().map(|e| e.key().clone()).collect();
        pending_permissions.sort();
        SessionStatus {
            state,
            session_id: self.id.clone(),
            message_count: self.messages.lock().len(),
            last_sfp_index,
            cursor: self.bus.cursor(),
            step_count,
            pending_permissions,
            running,
            breakpoint: self.breakpoints.current(),
        }
    }

    fn session_tools(&self) -> ToolRegistry {
        self.registry.read().session_tools()
    }
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.inner.id).finish()
    }
}

impl Session {
    /// New session with a fresh id.
    pub async fn create(config: SessionConfig, deps: SessionDeps) -> Result<Self> {
        Self::create_with_id(SessionId::new(), config, deps).await
    }

    #[instrument(skip(config, deps), fields(session_id = %id))]
    pub async fn create_with_id(id: SessionId, config: SessionConfig, deps: SessionDeps) -> Result<Self> {
        // Stored state is only replaced through `resume` or erased by `delete`.
        if deps.store.exists(&id).await? {
            return Err(EngineError::SessionExists(id.to_string()));
        }
        let seed = Seed::fresh(&id, &config);
        let inner = SessionInner::build(id, config, deps, seed)?;
        inner.open().await?;
        inner.persist().await?;
        inner.todos.handle_startup();
        debug!("session created");
        Ok(Self { inner })
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Queue a user message and start a turn if none is in flight.
    pub async fn send(&self, text: &str) -> Result<String> {
        self.send_with(text, SendOptions::default()).await
    }

    #[instrument(skip(self, text, opts), fields(session_id = %self.inner.id, kind = ?opts.kind))]
    pub async fn send_with(&self, text: &str, opts: SendOptions) -> Result<String> {
        let inner = &self.inner;
        let (id, claim) = {
            let mut rt = inner.runtime.lock();
            let id = inner.queue.push(text, &opts);
            let claim = (opts.kind == PendingKind::User && !rt.running).then(|| rt.claim());
            (id, claim)
        };
        let Some((generation, turn)) = claim else {
            return Ok(id);
        };
        if let Err(e) = inner.flush_queue().await {
            inner.release(generation);
            return Err(e);
        }
        inner.spawn_driver(generation, turn, turn::Start::Model);
        Ok(id)
    }

    /// Resolve a paused tool call.
    pub fn decide(&self, call_id: &str, decision: Decision, note: Option<String>) -> Result<()> {
        self.inner
            .resolve_permission(call_id, decision, note, DecidedBy::Api)
    }

    /// Copy the current history under `label` (default `sfp:<lastSfpIndex>`).
    pub async fn snapshot(&self, label: Option<&str>) -> Result<String> {
        let (messages, last_sfp_index) = {
            let rt = self.inner.runtime.lock();
            (self.inner.messages.lock().clone(), rt.last_sfp_index)
        };
        let id = match label {
            Some(label) => label.to_string(),
            None => format!("sfp:{}", last_sfp_index.unwrap_or(0)),
        };
        let record = SnapshotRecord {
            id: id.clone(),
            messages,
            last_sfp_index,
            created_at: Utc::now(),
        };
        self.inner.deps.store.save_snapshot(&self.inner.id, &record).await?;
        Ok(id)
    }

    /// Branch into a child session from the current state or a saved snapshot.
    /// The parent is never mutated.
    #[instrument(skip(self), fields(session_id = %self.inner.id))]
    pub async fn fork(&self, selector: Option<&str>) -> Result<Session> {
        let inner = &self.inner;
        let messages = match selector {
            None => inner.messages.lock().clone(),
            Some(snapshot_id) => {
                inner
                    .deps
                    .store
                    .load_snapshot(&inner.id, snapshot_id)
                    .await?
                    .ok_or_else(|| EngineError::SnapshotNotFound(snapshot_id.to_string()))?
                    .messages
            }
        };

        let child_id = inner.id.fork_child();
        let mut meta = SessionMeta::new(child_id.clone());
        {
            let parent = inner.meta.lock();
            meta.template_id = parent.template_id.clone();
            meta.lineage = parent.lineage.clone();
        }
        meta.lineage.push(inner.id.clone());
        meta.step_count = count_user_turns(&messages);

        let seed = Seed {
            meta,
            messages,
            records: Vec::new(),
            registry: Some(inner.session_tools()),
            hooks: Some(inner.hooks.fork_copy()),
        };
        let child = SessionInner::build(child_id.clone(), inner.config.clone(), inner.deps.clone(), seed)?;
        child.open().await?;
        child.persist().await?;

        inner.emit(AgentEvent::Forked {
            child_session_id: child_id.to_string(),
            from: selector.map(str::to_string),
        });
        debug!(child = %child_id, "session forked");
        Ok(Session { inner: child })
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status()
    }

    pub fn info(&self) -> SessionInfo {
        let last_sfp_index = self.inner.runtime.lock().last_sfp_index;
        let message_count = self.inner.messages.lock().len();
        let meta = self.inner.meta.lock();
        SessionInfo {
            session_id: self.inner.id.clone(),
            template_id: meta.template_id.clone(),
            created_at: meta.created_at,
            lineage: meta.lineage.clone(),
            message_count,
            last_sfp_index,
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.messages.lock().clone()
    }

    /// In-memory timeline events after `since`, at most `limit` of them.
    pub fn history(&self, since: Option<u64>, limit: Option<usize>) -> Vec<Envelope> {
        let mut events = self.inner.bus.timeline(since);
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        events
    }

    pub fn subscribe(&self, channels: &[Channel], opts: SubscribeOptions) -> EventStream {
        self.inner.bus.subscribe(channels, opts)
    }

    /// Send `text` and stream every event until the session is READY again.
    pub async fn chat(&self, text: &str) -> Result<EventStream> {
        let since = self.inner.bus.cursor();
        let events = self.inner.bus.subscribe(&[], SubscribeOptions::since(since));
        let _ = self.send(text).await?;
        Ok(stream::unfold((events, false), |(mut events, finished)| async move {
            if finished {
                return None;
            }
            let envelope = events.next().await?;
            let ready = matches!(
                envelope.event,
                AgentEvent::State {
                    state: SessionState::Ready
                }
            );
            Some((envelope, (events, ready)))
        })
        .boxed())
    }

    /// Send `text` and return the last text the model produced for it.
    pub async fn reply(&self, text: &str) -> Result<String> {
        let mut events = self.chat(text).await?;
        let mut reply = String::new();
        let mut failure = None;
        while let Some(envelope) = events.next().await {
            match envelope.event {
                AgentEvent::Text { text } => reply = text,
                AgentEvent::Error { message, .. } => failure = Some(message),
                AgentEvent::Done {
                    reason: DoneReason::Completed,
                    ..
                } => failure = None,
                _ => {}
            }
        }
        match failure {
            Some(message) => Err(EngineError::Internal(message)),
            None => Ok(reply),
        }
    }

    /// One-off completion outside the session history.
    pub async fn ask_llm(&self, text: &str, opts: AskOptions) -> Result<String> {
        let options = self.inner.complete_options(opts.system, opts.with_tools);
        let response = self
            .inner
            .deps
            .provider
            .complete(&[Message::user_text(text)], &options)
            .await?;
        Ok(Message::assistant(response.content).text())
    }

    pub fn use_hooks(&self, hooks: Arc<dyn Hooks>) {
        self.inner.hooks.register(hooks, HookOrigin::Session);
    }

    pub fn hooks(&self) -> Vec<RegisteredHook> {
        self.inner.hooks.registered()
    }

    /// Add session tools and announce the new tool list.
    pub fn register_tools(&self, tools: Vec<Arc<dyn Tool>>) {
        let names = {
            let mut registry = self.inner.registry.write();
            for tool in tools {
                if let Some(set) = tool.hooks() {
                    self.inner.hooks.register(set, HookOrigin::Tool);
                }
                registry.register(tool, ToolSource::Session);
            }
            registry.names()
        };
        self.inner.emit(AgentEvent::ToolManualUpdated { tools: names });
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.inner.registry.read().names()
    }

    pub fn todos(&self) -> Arc<TodoManager> {
        Arc::clone(&self.inner.todos)
    }

    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.inner.breakpoints
    }

    /// Scheduler driven by this session's step counter. Triggers are
    /// reported as `scheduler_triggered` events.
    pub fn schedule(&self) -> Arc<Scheduler> {
        let inner = &self.inner;
        Arc::clone(inner.scheduler.get_or_init(|| {
            let bus = Arc::clone(&inner.bus);
            Arc::new(Scheduler::with_trigger(Arc::new(move |info| {
                let _ = bus.emit(AgentEvent::SchedulerTriggered {
                    task_id: info.task_id,
                    spec: info.spec,
                    kind: info.kind.as_str().to_string(),
                });
            })))
        }))
    }

    /// Report changes under `paths` as `file_changed` events.
    pub fn watch_files(&self, paths: &[String]) -> Result<String> {
        let bus = Arc::clone(&self.inner.bus);
        let watch_id = self.inner.deps.sandbox.watch_files(
            paths,
            Arc::new(move |change: FileChange| {
                let _ = bus.emit(AgentEvent::FileChanged {
                    path: change.path.to_string_lossy().into_owned(),
                    mtime_ms: change.mtime_ms,
                });
            }),
        )?;
        self.inner.watches.lock().push(watch_id.clone());
        Ok(watch_id)
    }

    pub fn unwatch_files(&self, watch_id: &str) {
        self.inner.watches.lock().retain(|w| w != watch_id);
        self.inner.deps.sandbox.unwatch_files(watch_id);
    }

    pub async fn flush_failed_events(&self) -> Result<()> {
        Ok(self.inner.bus.flush_failed_events().await?)
    }

    pub fn failed_event_count(&self) -> usize {
        self.inner.bus.failed_event_count()
    }

    /// Stop the session: cancel the turn, drop timers and watches, and wait
    /// for queued events to reach the store.
    #[instrument(skip(self), fields(session_id = %self.inner.id))]
    pub async fn dispose(&self) {
        let inner = &self.inner;
        {
            let mut rt = inner.runtime.lock();
            rt.generation += 1;
            rt.turn.cancel();
            rt.running = false;
        }
        inner.permissions.clear();
        inner.runner.clear();
        let watches = std::mem::take(&mut *inner.watches.lock());
        for watch_id in watches {
            inner.deps.sandbox.unwatch_files(&watch_id);
        }
        if let Some(scheduler) = inner.scheduler.get() {
            scheduler.clear();
        }
        inner.bus.drain().await;
        if let Err(e) = inner.deps.store.flush_events(&inner.id).await {
            warn!(error = %e, "failed to flush events on dispose");
        }
        debug!("session disposed");
    }
}
