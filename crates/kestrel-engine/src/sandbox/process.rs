use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use kestrel_core::errors::SandboxError;
use kestrel_core::sandbox::ProcessInfo;

/// Exit code recorded for a process stopped by `kill`.
const KILLED_EXIT_CODE: i32 = 137;

struct ProcessEntry {
    command: String,
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
    exit: watch::Receiver<Option<i32>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

/// Background processes started by one sandbox.
pub struct ProcessTable {
    processes: DashMap<String, Arc<ProcessEntry>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            processes: DashMap::new(),
        }
    }

    /// Start `cmd` under `sh -c` in `dir`. Output is captured until exit.
    pub fn spawn(&self, cmd: &str, dir: &Path) -> Result<String, SandboxError> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let id = format!("shell-{}", uuid::Uuid::now_v7());
        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));
        let readers = [
            child.stdout.take().map(|r| tokio::spawn(capture(r, Arc::clone(&stdout)))),
            child.stderr.take().map(|r| tokio::spawn(capture(r, Arc::clone(&stderr)))),
        ];

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let process_id = id.clone();
        tokio::spawn(async move {
            let (code, killed) = tokio::select! {
                status = child.wait() => (status.ok().and_then(|s| s.code()).unwrap_or(-1), false),
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(process = %process_id, error = %e, "kill failed");
                    }
                    (KILLED_EXIT_CODE, true)
                }
            };
            // Grandchildren of a killed shell may hold the pipes open.
            for reader in readers.into_iter().flatten() {
                if killed {
                    reader.abort();
                } else {
                    let _ = reader.await;
                }
            }
            debug!(process = %process_id, code, "background process exited");
            let _ = exit_tx.send(Some(code));
        });

        let _ = self.processes.insert(
            id.clone(),
            Arc::new(ProcessEntry {
                command: cmd.to_string(),
                stdout,
                stderr,
                exit: exit_rx,
                kill: Mutex::new(Some(kill_tx)),
            }),
        );
        Ok(id)
    }

    pub fn info(&self, id: &str) -> Option<ProcessInfo> {
        let entry = self.processes.get(id)?;
        let code = *entry.exit.borrow();
        let stdout = entry.stdout.lock().clone();
        let stderr = entry.stderr.lock().clone();
        let info = ProcessInfo {
            id: id.to_string(),
            command: entry.command.clone(),
            running: code.is_none(),
            code,
            stdout,
            stderr,
        };
        Some(info)
    }

    /// Stop a process and wait for it to exit. Killing an exited process is a no-op.
    pub async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        let entry = self
            .processes
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SandboxError::ProcessNotFound(id.to_string()))?;
        if let Some(kill) = entry.kill.lock().take() {
            let _ = kill.send(());
        }
        let mut exit = entry.exit.clone();
        let _ = exit.wait_for(|code| code.is_some()).await;
        Ok(())
    }

    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.kill(&id).await;
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

async fn capture(mut reader: impl AsyncRead + Unpin, sink: Arc<Mutex<String>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.lock().push_str(&String::from_utf8_lossy(&buf[..n])),
        }
    }
}
