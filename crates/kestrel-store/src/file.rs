use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_core::events::{Channel, Envelope};
use kestrel_core::ids::SessionId;
use kestrel_core::messages::Message;
use kestrel_core::todos::TodoSnapshot;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::event_log::{EventHeal, EventLogs};
use crate::layout::{decode_id, HistoryKind, SessionPaths, SESSIONS_DIR};
use crate::records::{
    CompressionRecord, EventQuery, HistoryWindow, RecoveryRecord, RecoveryReport, SessionMeta,
    SnapshotRecord, ToolCallRecord,
};
use crate::wal::{self, Healed, KeyedLocks};
use crate::Store;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_MAX_BUFFERED: usize = 256;

#[derive(Clone, Debug)]
pub struct FileStoreOptions {
    pub flush_interval: Duration,
    pub max_buffered_events: usize,
    /// Run the WAL recovery sweep in the background when opening.
    pub recover_on_open: bool,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_buffered_events: DEFAULT_MAX_BUFFERED,
            recover_on_open: true,
        }
    }
}

impl FileStoreOptions {
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_buffered_events(mut self, max: usize) -> Self {
        self.max_buffered_events = max;
        self
    }

    pub fn with_recover_on_open(mut self, recover: bool) -> Self {
        self.recover_on_open = recover;
        self
    }
}

struct Inner {
    root: PathBuf,
    records: KeyedLocks,
    events: Arc<EventLogs>,
}

/// JSON file store. Cheap to clone; clones share buffers and locks.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, options: FileStoreOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                records: KeyedLocks::default(),
                events: Arc::new(EventLogs::new(
                    options.flush_interval,
                    options.max_buffered_events,
                )),
            }),
        }
    }

    /// Create the root directory and, if enabled, start the recovery sweep.
    /// Must be called inside a Tokio runtime when recovery is enabled.
    pub fn open(root: impl Into<PathBuf>, options: FileStoreOptions) -> Result<Self> {
        let recover = options.recover_on_open;
        let store = Self::new(root, options);
        std::fs::create_dir_all(store.root().join(SESSIONS_DIR))?;
        if recover {
            let sweeper = store.clone();
            tokio::spawn(async move {
                match sweeper.recover_all().await {
                    Ok(report) => debug!(?report, "startup WAL sweep finished"),
                    Err(e) => warn!(error = %e, "startup WAL sweep failed"),
                }
            });
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn paths(&self, session: &SessionId) -> Result<SessionPaths> {
        SessionPaths::new(&self.inner.root, session.as_str())
    }

    async fn write<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        let _guard = self.inner.records.lock(path).await;
        wal::write_record(path, value).await
    }

    async fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let _guard = self.inner.records.lock(path).await;
        wal::read_record(path).await
    }

    /// Every record in `dir`, including ones only present as a WAL.
    async fn read_all<T: DeserializeOwned>(&self, dir: &Path) -> Result<Vec<T>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(base) = name.strip_suffix(".wal") {
                if base.ends_with(".json") {
                    paths.insert(dir.join(base));
                }
            } else if name.ends_with(".json") {
                paths.insert(dir.join(name));
            }
        }
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(record) = self.read(&path).await? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Replay every leftover WAL under the store root.
    #[instrument(skip(self), fields(root = %self.inner.root.display()))]
    pub async fn recover_all(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut stack = vec![self.inner.root.join(SESSIONS_DIR)];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(base) = name.strip_suffix(".wal") else {
                    continue;
                };
                let target = dir.join(base);
                if base.ends_with(".log") {
                    match self.inner.events.heal(&target).await? {
                        EventHeal::Replayed(n) => report.events_replayed += n,
                        EventHeal::Corrupted(p) => report.corrupted.push(p),
                        EventHeal::Skipped => {}
                    }
                } else {
                    let _guard = self.inner.records.lock(&target).await;
                    match wal::heal_record(&target).await? {
                        Healed::Replayed => report.records_replayed += 1,
                        Healed::Corrupted(p) => report.corrupted.push(p),
                        Healed::Clean => {}
                    }
                }
            }
        }
        if report != RecoveryReport::default() {
            info!(
                records = report.records_replayed,
                events = report.events_replayed,
                corrupted = report.corrupted.len(),
                "WAL recovery sweep replayed leftovers"
            );
        }
        Ok(report)
    }

    /// Flush every buffered event log.
    pub async fn flush_all(&self) -> Result<()> {
        self.inner.events.flush_all().await
    }
}

#[async_trait]
impl Store for FileStore {
    async fn save_messages(&self, session: &SessionId, messages: &[Message]) -> Result<()> {
        self.write(&self.paths(session)?.messages(), &messages).await
    }

    async fn load_messages(&self, session: &SessionId) -> Result<Vec<Message>> {
        Ok(self
            .read(&self.paths(session)?.messages())
            .await?
            .unwrap_or_default())
    }

    async fn save_tool_calls(&self, session: &SessionId, records: &[ToolCallRecord]) -> Result<()> {
        self.write(&self.paths(session)?.tool_calls(), &records).await
    }

    async fn load_tool_calls(&self, session: &SessionId) -> Result<Vec<ToolCallRecord>> {
        Ok(self
            .read(&self.paths(session)?.tool_calls())
            .await?
            .unwrap_or_default())
    }

    async fn save_todos(&self, session: &SessionId, todos: &TodoSnapshot) -> Result<()> {
        self.write(&self.paths(session)?.todos(), todos).await
    }

    async fn load_todos(&self, session: &SessionId) -> Result<Option<TodoSnapshot>> {
        self.read(&self.paths(session)?.todos()).await
    }

    async fn append_event(&self, session: &SessionId, envelope: &Envelope) -> Result<()> {
        let log = self.paths(session)?.event_log(envelope.channel);
        self.inner.events.append(&log, envelope.clone()).await
    }

    async fn read_events(&self, session: &SessionId, query: &EventQuery) -> Result<Vec<Envelope>> {
        let paths = self.paths(session)?;
        let channels: Vec<Channel> = match query.channel {
            Some(c) => vec![c],
            None => Channel::ALL.to_vec(),
        };
        let mut out = Vec::new();
        for channel in channels {
            let events = self.inner.events.read(&paths.event_log(channel)).await?;
            out.extend(events.into_iter().filter(|e| query.matches(e.channel, e.cursor)));
        }
        out.sort_by_key(|e| e.cursor);
        out.dedup_by_key(|e| e.cursor);
        Ok(out)
    }

    async fn flush_events(&self, session: &SessionId) -> Result<()> {
        let paths = self.paths(session)?;
        self.inner.events.flush_under(&paths.events_dir()).await
    }

    async fn last_cursor(&self, session: &SessionId) -> Result<u64> {
        let paths = self.paths(session)?;
        let mut last = 0;
        for channel in Channel::ALL {
            let events = self.inner.events.read(&paths.event_log(channel)).await?;
            if let Some(max) = events.iter().map(|e| e.cursor).max() {
                last = last.max(max);
            }
        }
        Ok(last)
    }

    async fn save_history_window(&self, session: &SessionId, window: &HistoryWindow) -> Result<()> {
        let path = self.paths(session)?.history_record(HistoryKind::Windows, &window.id)?;
        self.write(&path, window).await
    }

    async fn list_history_windows(&self, session: &SessionId) -> Result<Vec<HistoryWindow>> {
        let dir = self.paths(session)?.history_dir(HistoryKind::Windows);
        let mut windows: Vec<HistoryWindow> = self.read_all(&dir).await?;
        windows.sort_by_key(|w| w.created_at);
        Ok(windows)
    }

    async fn save_compression(&self, session: &SessionId, record: &CompressionRecord) -> Result<()> {
        let path = self.paths(session)?.history_record(HistoryKind::Compressions, &record.id)?;
        self.write(&path, record).await
    }

    async fn list_compressions(&self, session: &SessionId) -> Result<Vec<CompressionRecord>> {
        let dir = self.paths(session)?.history_dir(HistoryKind::Compressions);
        let mut records: Vec<CompressionRecord> = self.read_all(&dir).await?;
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn save_recovery(&self, session: &SessionId, record: &RecoveryRecord) -> Result<()> {
        let path = self.paths(session)?.history_record(HistoryKind::Recovered, &record.id)?;
        self.write(&path, record).await
    }

    async fn list_recoveries(&self, session: &SessionId) -> Result<Vec<RecoveryRecord>> {
        let dir = self.paths(session)?.history_dir(HistoryKind::Recovered);
        let mut records: Vec<RecoveryRecord> = self.read_all(&dir).await?;
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn save_snapshot(&self, session: &SessionId, snapshot: &SnapshotRecord) -> Result<()> {
        let path = self.paths(session)?.snapshot(&snapshot.id)?;
        self.write(&path, snapshot).await
    }

    async fn load_snapshot(&self, session: &SessionId, id: &str) -> Result<Option<SnapshotRecord>> {
        let path = self.paths(session)?.snapshot(id)?;
        self.read(&path).await
    }

    async fn list_snapshots(&self, session: &SessionId) -> Result<Vec<SnapshotRecord>> {
        let dir = self.paths(session)?.snapshots_dir();
        let mut snapshots: Vec<SnapshotRecord> = self.read_all(&dir).await?;
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    async fn save_meta(&self, session: &SessionId, meta: &SessionMeta) -> Result<()> {
        self.write(&self.paths(session)?.meta(), meta).await
    }

    async fn load_meta(&self, session: &SessionId) -> Result<Option<SessionMeta>> {
        self.read(&self.paths(session)?.meta()).await
    }

    async fn exists(&self, session: &SessionId) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.paths(session)?.dir()).await?)
    }

    async fn delete(&self, session: &SessionId) -> Result<()> {
        let paths = self.paths(session)?;
        self.inner.events.forget_under(paths.dir());
        match tokio::fs::remove_dir_all(paths.dir()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<SessionId>> {
        let dir = self.inner.root.join(SESSIONS_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = decode_id(&entry.file_name().to_string_lossy());
            if prefix.map_or(true, |p| id.starts_with(p)) {
                ids.push(SessionId::from_raw(id));
            }
        }
        ids.sort();
        Ok(ids)
    }
}
