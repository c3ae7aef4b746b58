//! Shared fixtures for engine tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use kestrel_core::errors::ToolError;
use kestrel_core::events::{AgentEvent, Envelope, SessionState};
use kestrel_core::ids::SessionId;
use kestrel_core::messages::Message;
use kestrel_core::todos::TodoSnapshot;
use kestrel_core::tools::{ExecutionMode, Tool, ToolContext, ToolMetadata};
use kestrel_llm::mock::{MockProvider, MockResponse};
use kestrel_store::{
    CompressionRecord, EventQuery, FileStore, FileStoreOptions, HistoryWindow, RecoveryRecord,
    Result, SessionMeta, SnapshotRecord, Store, StoreError, ToolCallRecord,
};

use crate::bus::EventStream;
use crate::sandbox::{LocalSandbox, LocalSandboxOptions};
use crate::session::{Session, SessionDeps};

/// A `FileStore` whose event appends, event reads and message saves can be
/// made to fail.
pub(crate) struct FlakyStore {
    inner: FileStore,
    pub fail_events: AtomicBool,
    pub fail_messages: AtomicBool,
    pub fail_reads: AtomicBool,
}

impl FlakyStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: FileStore::new(root, FileStoreOptions::default().with_recover_on_open(false)),
            fail_events: AtomicBool::new(false),
            fail_messages: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Io("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn save_messages(&self, session: &SessionId, messages: &[Message]) -> Result<()> {
        Self::check(&self.fail_messages)?;
        self.inner.save_messages(session, messages).await
    }
    async fn load_messages(&self, session: &SessionId) -> Result<Vec<Message>> {
        self.inner.load_messages(session).await
    }
    async fn save_tool_calls(&self, session: &SessionId, records: &[ToolCallRecord]) -> Result<()> {
        self.inner.save_tool_calls(session, records).await
    }
    async fn load_tool_calls(&self, session: &SessionId) -> Result<Vec<ToolCallRecord>> {
        self.inner.load_tool_calls(session).await
    }
    async fn save_todos(&self, session: &SessionId, todos: &TodoSnapshot) -> Result<()> {
        self.inner.save_todos(session, todos).await
    }
    async fn load_todos(&self, session: &SessionId) -> Result<Option<TodoSnapshot>> {
        self.inner.load_todos(session).await
    }
    async fn append_event(&self, session: &SessionId, envelope: &Envelope) -> Result<()> {
        Self::check(&self.fail_events)?;
        self.inner.append_event(session, envelope).await
    }
    async fn read_events(&self, session: &SessionId, query: &EventQuery) -> Result<Vec<Envelope>> {
        Self::check(&self.fail_reads)?;
        self.inner.read_events(session, query).await
    }
    async fn flush_events(&self, session: &SessionId) -> Result<()> {
        self.inner.flush_events(session).await
    }
    async fn last_cursor(&self, session: &SessionId) -> Result<u64> {
        self.inner.last_cursor(session).await
    }
    async fn save_history_window(&self, session: &SessionId, window: &HistoryWindow) -> Result<()> {
        self.inner.save_history_window(session, window).await
    }
    async fn list_history_windows(&self, session: &SessionId) -> Result<Vec<HistoryWindow>> {
        self.inner.list_history_windows(session).await
    }
    async fn save_compression(&self, session: &SessionId, record: &CompressionRecord) -> Result<()> {
        self.inner.save_compression(session, record).await
    }
    async fn list_compressions(&self, session: &SessionId) -> Result<Vec<CompressionRecord>> {
        self.inner.list_compressions(session).await
    }
    async fn save_recovery(&self, session: &SessionId, record: &RecoveryRecord) -> Result<()> {
        self.inner.save_recovery(session, record).await
    }
    async fn list_recoveries(&self, session: &SessionId) -> Result<Vec<RecoveryRecord>> {
        self.inner.list_recoveries(session).await
    }
    async fn save_snapshot(&self, session: &SessionId, snapshot: &SnapshotRecord) -> Result<()> {
        self.inner.save_snapshot(session, snapshot).await
    }
    async fn load_snapshot(&self, session: &SessionId, id: &str) -> Result<Option<SnapshotRecord>> {
        self.inner.load_snapshot(session, id).await
    }
    async fn list_snapshots(&self, session: &SessionId) -> Result<Vec<SnapshotRecord>> {
        self.inner.list_snapshots(session).await
    }
    async fn save_meta(&self, session: &SessionId, meta: &SessionMeta) -> Result<()> {
        self.inner.save_meta(session, meta).await
    }
    async fn load_meta(&self, session: &SessionId) -> Result<Option<SessionMeta>> {
        self.inner.load_meta(session).await
    }
    async fn exists(&self, session: &SessionId) -> Result<bool> {
        self.inner.exists(session).await
    }
    async fn delete(&self, session: &SessionId) -> Result<()> {
        self.inner.delete(session).await
    }
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<SessionId>> {
        self.inner.list(prefix).await
    }
}

/// Temp dir, flaky store, scripted provider and a local sandbox rooted in the temp dir.
pub(crate) struct Fixture {
    pub dir: tempfile::TempDir,
    pub store: Arc<FlakyStore>,
    pub provider: Arc<MockProvider>,
    pub sandbox: Arc<LocalSandbox>,
}

impl Fixture {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(&dir.path().join("store")));
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let sandbox = Arc::new(LocalSandbox::new(LocalSandboxOptions::new(work)));
        Self {
            dir,
            store,
            provider: Arc::new(MockProvider::new(responses)),
            sandbox,
        }
    }

    pub fn deps(&self) -> SessionDeps {
        SessionDeps::new(self.provider.clone(), self.store.clone(), self.sandbox.clone())
    }
}

/// Poll until the session is READY with no turn in flight.
pub(crate) async fn wait_idle(session: &Session) {
    wait_for(session, |s| s.state == SessionState::Ready && !s.running).await;
}

pub(crate) async fn wait_paused(session: &Session) {
    wait_for(session, |s| s.state == SessionState::Paused).await;
}

async fn wait_for(session: &Session, pred: impl Fn(&crate::session::SessionStatus) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if pred(&session.status()) {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out: {:?}", session.status());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Collect envelopes up to and including the first one matching `stop`.
pub(crate) async fn collect_until(
    mut stream: EventStream,
    stop: impl Fn(&AgentEvent) -> bool,
) -> Vec<Envelope> {
    let mut out = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(envelope) = stream.next().await {
            let done = stop(&envelope.event);
            out.push(envelope);
            if done {
                break;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "stream stalled after {} events", out.len());
    out
}

pub(crate) fn kinds(events: &[Envelope]) -> Vec<&'static str> {
    events.iter().map(|e| e.event.kind()).collect()
}

/// Echoes its input back.
pub(crate) struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the input"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::read_only()
    }
    async fn execute(&self, args: Value, _ctx: &ToolContext) -> std::result::Result<Value, ToolError> {
        Ok(json!({"echo": args}))
    }
}

/// Sleeps for `args.ms` and counts how many runs overlap.
pub(crate) struct SlowTool {
    pub mode: ExecutionMode,
    pub active: Arc<std::sync::atomic::AtomicUsize>,
    pub peak: Arc<std::sync::atomic::AtomicUsize>,
}

impl SlowTool {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            active: Arc::default(),
            peak: Arc::default(),
        }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "Sleep for a while"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {"ms": {"type": "integer"}}})
    }
    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }
    async fn execute(&self, args: Value, _ctx: &ToolContext) -> std::result::Result<Value, ToolError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let ms = args["ms"].as_u64().unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({"slept": ms}))
    }
}

pub(crate) struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "explode"
    }
    fn description(&self) -> &str {
        "Always panics"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }
    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> std::result::Result<Value, ToolError> {
        panic!("boom");
    }
}

/// Counts executions. Declared as mutating so `readonly` denies it.
pub(crate) struct CountingTool {
    pub name: String,
    pub calls: Arc<std::sync::atomic::AtomicUsize>,
}

impl CountingTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Arc::default(),
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "Count executions"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::mutating("write")
    }
    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> std::result::Result<Value, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({"count": n}))
    }
}
