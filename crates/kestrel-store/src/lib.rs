//! Durable session storage.
//!
//! [`FileStore`] keeps each session in its own directory of JSON records and
//! per-channel JSONL event logs, all written through a WAL.

pub mod error;
mod event_log;
mod file;
pub mod layout;
pub mod records;
mod wal;

pub use error::{Result, StoreError};
pub use file::{FileStore, FileStoreOptions};
pub use layout::HistoryKind;
pub use records::{
    CompressionRecord, EventQuery, HistoryWindow, RecoveryRecord, RecoveryReport, SessionMeta,
    SnapshotRecord, ToolCallRecord, ToolCallState,
};

use async_trait::async_trait;
use kestrel_core::events::Envelope;
use kestrel_core::ids::SessionId;
use kestrel_core::messages::Message;
use kestrel_core::todos::TodoSnapshot;

/// Persistence seam used by the engine.
#[async_trait]
pub trait Store: Send + Sync {
    // --- runtime ---
    async fn save_messages(&self, session: &SessionId, messages: &[Message]) -> Result<()>;
    async fn load_messages(&self, session: &SessionId) -> Result<Vec<Message>>;
    async fn save_tool_calls(&self, session: &SessionId, records: &[ToolCallRecord]) -> Result<()>;
    async fn load_tool_calls(&self, session: &SessionId) -> Result<Vec<ToolCallRecord>>;
    async fn save_todos(&self, session: &SessionId, todos: &TodoSnapshot) -> Result<()>;
    async fn load_todos(&self, session: &SessionId) -> Result<Option<TodoSnapshot>>;

    // --- events ---
    async fn append_event(&self, session: &SessionId, envelope: &Envelope) -> Result<()>;
    /// Events matching `query`, ordered by cursor. Buffered events are flushed first.
    async fn read_events(&self, session: &SessionId, query: &EventQuery) -> Result<Vec<Envelope>>;
    async fn flush_events(&self, session: &SessionId) -> Result<()>;
    /// Highest durable cursor, 0 when the session has no events.
    async fn last_cursor(&self, session: &SessionId) -> Result<u64>;

    // --- history ---
    async fn save_history_window(&self, session: &SessionId, window: &HistoryWindow) -> Result<()>;
    async fn list_history_windows(&self, session: &SessionId) -> Result<Vec<HistoryWindow>>;
    async fn save_compression(&self, session: &SessionId, record: &CompressionRecord) -> Result<()>;
    async fn list_compressions(&self, session: &SessionId) -> Result<Vec<CompressionRecord>>;
    async fn save_recovery(&self, session: &SessionId, record: &RecoveryRecord) -> Result<()>;
    async fn list_recoveries(&self, session: &SessionId) -> Result<Vec<RecoveryRecord>>;

    // --- snapshots ---
    async fn save_snapshot(&self, session: &SessionId, snapshot: &SnapshotRecord) -> Result<()>;
    async fn load_snapshot(&self, session: &SessionId, id: &str) -> Result<Option<SnapshotRecord>>;
    async fn list_snapshots(&self, session: &SessionId) -> Result<Vec<SnapshotRecord>>;

    // --- meta ---
    async fn save_meta(&self, session: &SessionId, meta: &SessionMeta) -> Result<()>;
    async fn load_meta(&self, session: &SessionId) -> Result<Option<SessionMeta>>;

    // --- lifecycle ---
    async fn exists(&self, session: &SessionId) -> Result<bool>;
    async fn delete(&self, session: &SessionId) -> Result<()>;
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<SessionId>>;
}
