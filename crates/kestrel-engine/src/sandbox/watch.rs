use std::collections::HashMap;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, warn};

use kestrel_core::errors::SandboxError;
use kestrel_core::sandbox::{FileChange, WatchCallback};

/// Live file watchers keyed by watch id. Dropping a watcher stops it.
pub struct WatchTable {
    watchers: Mutex<HashMap<String, RecommendedWatcher>>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self {
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn watch(&self, paths: &[PathBuf], on_change: WatchCallback) -> Result<String, SandboxError> {
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        return;
                    }
                    for path in event.paths {
                        let mtime_ms = mtime_ms(&path);
                        on_change(FileChange { path, mtime_ms });
                    }
                }
                Err(e) => warn!(error = %e, "file watch error"),
            },
            Config::default(),
        )
        .map_err(|e| SandboxError::Watch(e.to_string()))?;

        for path in paths {
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(|e| SandboxError::Watch(format!("{}: {e}", path.display())))?;
        }

        let id = format!("watch-{}", uuid::Uuid::now_v7());
        debug!(watch_id = %id, paths = paths.len(), "file watch started");
        let _ = self.watchers.lock().insert(id.clone(), watcher);
        Ok(id)
    }

    pub fn unwatch(&self, id: &str) -> bool {
        self.watchers.lock().remove(id).is_some()
    }

    pub fn clear(&self) {
        self.watchers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.watchers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WatchTable {
    fn default() -> Self {
        Self::new()
    }
}

fn mtime_ms(path: &std::path::Path) -> Option<u64> {
    std::fs::metadata(path)
        .ok()?
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}
