use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SandboxError;

#[derive(Clone, Debug, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// Snapshot of a background process owned by a sandbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: String,
    pub command: String,
    pub running: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub mtime_ms: Option<u64>,
}

pub type WatchCallback = Arc<dyn Fn(FileChange) + Send + Sync>;

/// Execution environment for tools: shell, filesystem and background processes.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn kind(&self) -> &str;
    fn work_dir(&self) -> &Path;

    /// Resolve a path relative to the work dir.
    fn resolve(&self, path: &str) -> PathBuf;
    fn is_inside(&self, path: &Path) -> bool;

    async fn exec(&self, cmd: &str, opts: ExecOptions) -> Result<ExecResult, SandboxError>;
    async fn read(&self, path: &str) -> Result<String, SandboxError>;
    async fn write(&self, path: &str, content: &str) -> Result<(), SandboxError>;
    async fn stat(&self, path: &str) -> Result<FileStat, SandboxError>;
    async fn glob(&self, pattern: &str) -> Result<Vec<String>, SandboxError>;

    fn watch_files(&self, _paths: &[String], _on_change: WatchCallback) -> Result<String, SandboxError> {
        Err(SandboxError::Unsupported("watch_files"))
    }

    fn unwatch_files(&self, _watch_id: &str) {}

    /// Start a background process and return its id.
    async fn spawn(&self, _cmd: &str) -> Result<String, SandboxError> {
        Err(SandboxError::Unsupported("spawn"))
    }

    fn process(&self, _id: &str) -> Option<ProcessInfo> {
        None
    }

    async fn kill(&self, _id: &str) -> Result<(), SandboxError> {
        Err(SandboxError::Unsupported("kill"))
    }

    async fn dispose(&self) {}
}
