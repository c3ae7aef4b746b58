//! Per-channel JSONL event logs with a write-ahead buffer.
//!
//! Appends land in an in-memory buffer per log file. The whole buffer is
//! mirrored to `<log>.wal` on every append, so a crash between flushes loses
//! nothing. Buffers are flushed on a timer, when they fill up, and before any
//! read. A WAL left behind by an earlier process is replayed the first time
//! this process touches its log, before anything is read or buffered.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kestrel_core::events::Envelope;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::wal::{quarantine, replace_file, wal_path, KeyedLocks, WalEntry};

#[derive(Default)]
struct Buffer {
    pending: Vec<Envelope>,
    timer_armed: bool,
}

pub(crate) struct EventLogs {
    buffers: parking_lot::Mutex<HashMap<PathBuf, Buffer>>,
    /// Logs whose leftover WAL has been dealt with by this process.
    adopted: parking_lot::Mutex<HashSet<PathBuf>>,
    locks: KeyedLocks,
    flush_interval: Duration,
    max_buffered: usize,
}

/// Result of replaying one event WAL during the startup sweep.
pub(crate) enum EventHeal {
    Skipped,
    Replayed(usize),
    Corrupted(PathBuf),
}

impl EventLogs {
    pub fn new(flush_interval: Duration, max_buffered: usize) -> Self {
        Self {
            buffers: parking_lot::Mutex::new(HashMap::new()),
            adopted: parking_lot::Mutex::new(HashSet::new()),
            locks: KeyedLocks::default(),
            flush_interval,
            max_buffered: max_buffered.max(1),
        }
    }

    pub async fn append(self: &Arc<Self>, log: &Path, envelope: Envelope) -> Result<()> {
        let _guard = self.locks.lock(log).await;
        self.adopt_locked(log).await?;

        let (snapshot, arm) = {
            let mut buffers = self.buffers.lock();
            let buf = buffers.entry(log.to_path_buf()).or_default();
            buf.pending.push(envelope);
            let arm = !buf.timer_armed;
            buf.timer_armed = true;
            (buf.pending.clone(), arm)
        };

        let entry = WalEntry {
            timestamp: Utc::now(),
            data: &snapshot,
        };
        let written = match serde_json::to_vec(&entry) {
            Ok(bytes) => replace_file(&wal_path(log), &bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            // Not durable: take it back so a retry cannot duplicate it.
            if let Some(buf) = self.buffers.lock().get_mut(log) {
                buf.pending.pop();
            }
            return Err(e);
        }

        if snapshot.len() >= self.max_buffered {
            return self.flush_locked(log).await;
        }
        if arm {
            let this = Arc::clone(self);
            let log = log.to_path_buf();
            let interval = self.flush_interval;
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                if let Err(e) = this.flush(&log).await {
                    warn!(log = %log.display(), error = %e, "timed event flush failed");
                }
            });
        }
        Ok(())
    }

    pub async fn flush(&self, log: &Path) -> Result<()> {
        let _guard = self.locks.lock(log).await;
        self.flush_locked(log).await
    }

    async fn flush_locked(&self, log: &Path) -> Result<()> {
        let pending = {
            let mut buffers = self.buffers.lock();
            match buffers.get_mut(log) {
                Some(buf) => {
                    buf.timer_armed = false;
                    std::mem::take(&mut buf.pending)
                }
                None => return Ok(()),
            }
        };
        if pending.is_empty() {
            return Ok(());
        }

        if let Err(e) = append_lines(log, &pending).await {
            let mut buffers = self.buffers.lock();
            let buf = buffers.entry(log.to_path_buf()).or_default();
            let newer = std::mem::take(&mut buf.pending);
            buf.pending = pending;
            buf.pending.extend(newer);
            return Err(e);
        }
        remove_if_exists(&wal_path(log)).await?;
        debug!(log = %log.display(), count = pending.len(), "flushed events");
        Ok(())
    }

    /// Flush every buffered log under `dir`.
    pub async fn flush_under(&self, dir: &Path) -> Result<()> {
        let logs: Vec<PathBuf> = self
            .buffers
            .lock()
            .keys()
            .filter(|k| k.starts_with(dir))
            .cloned()
            .collect();
        for log in logs {
            self.flush(&log).await?;
        }
        Ok(())
    }

    pub async fn flush_all(&self) -> Result<()> {
        let logs: Vec<PathBuf> = self.buffers.lock().keys().cloned().collect();
        for log in logs {
            self.flush(&log).await?;
        }
        Ok(())
    }

    /// Drop buffers for logs under `dir` without writing them.
    pub fn forget_under(&self, dir: &Path) {
        self.buffers.lock().retain(|k, _| !k.starts_with(dir));
        self.adopted.lock().retain(|k| !k.starts_with(dir));
    }

    /// Read a flushed log. Unparseable lines (a torn tail) are skipped.
    pub async fn read(&self, log: &Path) -> Result<Vec<Envelope>> {
        let _guard = self.locks.lock(log).await;
        self.adopt_locked(log).await?;
        self.flush_locked(log).await?;
        read_log(log).await
    }

    /// Replay `<log>.wal` left by a previous process. Logs this process has
    /// already touched are skipped; their WAL belongs to a live buffer.
    pub async fn heal(&self, log: &Path) -> Result<EventHeal> {
        let _guard = self.locks.lock(log).await;
        if self.adopted.lock().contains(log) {
            return Ok(EventHeal::Skipped);
        }
        let healed = self.heal_locked(log).await?;
        let _ = self.adopted.lock().insert(log.to_path_buf());
        Ok(healed)
    }

    /// First touch of `log` in this process: fold in any leftover WAL so
    /// cursors continue past it and its events survive.
    async fn adopt_locked(&self, log: &Path) -> Result<()> {
        if self.adopted.lock().contains(log) {
            return Ok(());
        }
        if let EventHeal::Corrupted(moved) = self.heal_locked(log).await? {
            warn!(log = %log.display(), moved_to = %moved.display(), "quarantined unreadable event WAL");
        }
        let _ = self.adopted.lock().insert(log.to_path_buf());
        Ok(())
    }

    async fn heal_locked(&self, log: &Path) -> Result<EventHeal> {
        let wal = wal_path(log);
        let bytes = match tokio::fs::read(&wal).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(EventHeal::Skipped),
            Err(e) => return Err(e.into()),
        };
        let entry: WalEntry<Vec<Envelope>> = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => return Ok(EventHeal::Corrupted(quarantine(&wal, &e.to_string()).await?)),
        };

        let last = read_log(log).await?.last().map_or(0, |e| e.cursor);
        let missing: Vec<Envelope> = entry.data.into_iter().filter(|e| e.cursor > last).collect();
        if !missing.is_empty() {
            append_lines(log, &missing).await?;
        }
        tokio::fs::remove_file(&wal).await?;
        info!(log = %log.display(), replayed = missing.len(), "replayed event WAL");
        Ok(EventHeal::Replayed(missing.len()))
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn append_lines(log: &Path, envelopes: &[Envelope]) -> Result<()> {
    if let Some(parent) = log.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(log)
        .await?;

    let mut out = Vec::new();
    // A torn last line from a crash must not swallow the next record.
    let len = file.metadata().await?.len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1)).await?;
        file.read_exact(&mut last).await?;
        if last[0] != b'\n' {
            out.push(b'\n');
        }
    }
    for envelope in envelopes {
        serde_json::to_writer(&mut out, envelope)?;
        out.push(b'\n');
    }
    file.write_all(&out).await?;
    file.flush().await?;
    Ok(())
}

async fn read_log(log: &Path) -> Result<Vec<Envelope>> {
    let content = match tokio::fs::read_to_string(log).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut events = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<Envelope>(line) {
            Ok(env) => events.push(env),
            Err(e) => warn!(log = %log.display(), error = %e, "skipping unreadable event line"),
        }
    }
    Ok(events)
}
