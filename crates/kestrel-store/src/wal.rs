//! Write-ahead protected record files.
//!
//! A write goes `<file>.wal` -> `<file>.tmp` -> rename over `<file>` -> delete
//! the WAL. A WAL left behind by a crash is replayed by the next read of the
//! same file or by the startup sweep. A WAL that cannot be parsed is moved to
//! `<file>.wal.corrupted` and the previous file content is kept.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::layout::{with_suffix, CORRUPTED_SUFFIX, WAL_SUFFIX};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WalEntry<T> {
    pub timestamp: DateTime<Utc>,
    pub data: T,
}

/// Per-path async locks. Waiters are served in FIFO order and a failed
/// write releases the lock like a successful one.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    inner: parking_lot::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &Path) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock();
            Arc::clone(map.entry(key.to_path_buf()).or_default())
        };
        mutex.lock_owned().await
    }
}

pub(crate) fn wal_path(path: &Path) -> PathBuf {
    with_suffix(path, WAL_SUFFIX)
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Write `bytes` to `path` through a temp file and an atomic rename.
pub(crate) async fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path).await?;
    let tmp = with_suffix(path, "tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// WAL-protected write of one JSON record. Caller holds the path lock.
pub(crate) async fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_value(value)?;
    let entry = WalEntry {
        timestamp: Utc::now(),
        data,
    };
    let wal = wal_path(path);
    replace_file(&wal, &serde_json::to_vec(&entry)?).await?;
    replace_file(path, &serde_json::to_vec_pretty(&entry.data)?).await?;
    tokio::fs::remove_file(&wal).await?;
    Ok(())
}

/// Outcome of replaying one leftover WAL.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Healed {
    Clean,
    Replayed,
    Corrupted(PathBuf),
}

/// Move an unreadable WAL aside so it is never replayed.
pub(crate) async fn quarantine(wal: &Path, reason: &str) -> Result<PathBuf> {
    let target = with_suffix(wal, CORRUPTED_SUFFIX);
    warn!(path = %wal.display(), reason, "corrupted WAL moved aside");
    tokio::fs::rename(wal, &target).await?;
    Ok(target)
}

/// Replay a leftover record WAL for `path`, if any. Caller holds the path lock.
pub(crate) async fn heal_record(path: &Path) -> Result<Healed> {
    let wal = wal_path(path);
    let bytes = match tokio::fs::read(&wal).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Healed::Clean),
        Err(e) => return Err(e.into()),
    };
    let entry: WalEntry<serde_json::Value> = match serde_json::from_slice(&bytes) {
        Ok(entry) => entry,
        Err(e) => return Ok(Healed::Corrupted(quarantine(&wal, &e.to_string()).await?)),
    };
    replace_file(path, &serde_json::to_vec_pretty(&entry.data)?).await?;
    tokio::fs::remove_file(&wal).await?;
    info!(path = %path.display(), written_at = %entry.timestamp, "replayed record WAL");
    Ok(Healed::Replayed)
}

/// Self-healing read of one JSON record. Caller holds the path lock.
pub(crate) async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    heal_record(path).await?;
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Corrupted(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b.json");
        write_record(&path, &json!({"n": 1})).await.unwrap();
        assert!(!wal_path(&path).exists());
        let v: Option<serde_json::Value> = read_record(&path).await.unwrap();
        assert_eq!(v, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn leftover_wal_wins_over_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.json");
        write_record(&path, &json!([1])).await.unwrap();

        // Crash after the WAL write, before the rename.
        let entry = WalEntry { timestamp: Utc::now(), data: json!([1, 2]) };
        tokio::fs::write(wal_path(&path), serde_json::to_vec(&entry).unwrap())
            .await
            .unwrap();

        let v: Option<serde_json::Value> = read_record(&path).await.unwrap();
        assert_eq!(v, Some(json!([1, 2])));
        assert!(!wal_path(&path).exists());
    }

    #[tokio::test]
    async fn torn_wal_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.json");
        write_record(&path, &json!("old")).await.unwrap();
        tokio::fs::write(wal_path(&path), b"{\"timestamp\":").await.unwrap();

        let v: Option<serde_json::Value> = read_record(&path).await.unwrap();
        assert_eq!(v, Some(json!("old")));
        assert!(with_suffix(&wal_path(&path), CORRUPTED_SUFFIX).exists());
    }

    #[tokio::test]
    async fn missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let v: Option<serde_json::Value> = read_record(&dir.path().join("x.json")).await.unwrap();
        assert!(v.is_none());
    }

    #[tokio::test]
    async fn keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::default());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let guard = locks.lock(Path::new("k")).await;

        let l = Arc::clone(&locks);
        let o = Arc::clone(&order);
        let waiter = tokio::spawn(async move {
            let _g = l.lock(Path::new("k")).await;
            o.lock().push(2);
        });
        tokio::task::yield_now().await;
        order.lock().push(1);
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
    }
}
