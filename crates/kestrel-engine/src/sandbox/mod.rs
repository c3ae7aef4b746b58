//! Local sandbox: shell execution, boundary-checked filesystem access,
//! background processes and file watching rooted at a work directory.

mod process;
mod watch;

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, instrument, warn};

use kestrel_core::errors::SandboxError;
use kestrel_core::sandbox::{
    ExecOptions, ExecResult, FileStat, ProcessInfo, Sandbox, WatchCallback,
};
use kestrel_settings::SandboxSettings;
use kestrel_settings::loader::expand_home;

pub use process::ProcessTable;
pub use watch::WatchTable;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Exit code reported when a foreground command exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

static DANGEROUS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"rm\s+-rf\s+/($|\s)",
        r"sudo\s+",
        r"shutdown",
        r"reboot",
        r"mkfs\.",
        r"dd\s+.*of=",
        r":\(\)\{\s*:\|:&\s*\};:",
        r"chmod\s+777\s+/",
        r"curl\s+.*\|\s*(bash|sh)",
        r"wget\s+.*\|\s*(bash|sh)",
        r">\s*/dev/sda",
        r"mkswap",
        r"swapon",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// The blocked-command message if `cmd` matches a dangerous pattern.
pub fn check_dangerous(cmd: &str) -> Option<String> {
    DANGEROUS_PATTERNS
        .iter()
        .any(|p| p.is_match(cmd))
        .then(|| cmd.chars().take(100).collect())
}

#[derive(Clone, Debug)]
pub struct LocalSandboxOptions {
    pub work_dir: PathBuf,
    pub enforce_boundary: bool,
    pub allow_paths: Vec<PathBuf>,
    pub exec_timeout: Duration,
    pub watch_enabled: bool,
}

impl LocalSandboxOptions {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            enforce_boundary: true,
            allow_paths: Vec::new(),
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            watch_enabled: true,
        }
    }

    /// Unset `work_dir` means the process working directory.
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        let work_dir = match &settings.work_dir {
            Some(dir) => expand_home(dir),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        Self {
            work_dir,
            enforce_boundary: settings.enforce_boundary,
            allow_paths: settings.allow_paths.iter().map(|p| expand_home(p)).collect(),
            exec_timeout: Duration::from_millis(settings.exec_timeout_ms),
            watch_enabled: true,
        }
    }

    pub fn with_enforce_boundary(mut self, enforce: bool) -> Self {
        self.enforce_boundary = enforce;
        self
    }

    pub fn with_allow_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.allow_paths = paths;
        self
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    pub fn with_watch_enabled(mut self, enabled: bool) -> Self {
        self.watch_enabled = enabled;
        self
    }
}

pub struct LocalSandbox {
    work_dir: PathBuf,
    enforce_boundary: bool,
    allow_paths: Vec<PathBuf>,
    exec_timeout: Duration,
    watch_enabled: bool,
    processes: ProcessTable,
    watches: WatchTable,
}

impl LocalSandbox {
    pub fn new(options: LocalSandboxOptions) -> Self {
        let work_dir = absolute(&options.work_dir);
        Self {
            allow_paths: options.allow_paths.iter().map(|p| normalize(&work_dir.join(p))).collect(),
            work_dir,
            enforce_boundary: options.enforce_boundary,
            exec_timeout: options.exec_timeout,
            watch_enabled: options.watch_enabled,
            processes: ProcessTable::new(),
            watches: WatchTable::new(),
        }
    }

    fn checked(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let resolved = self.resolve(path);
        if !self.is_inside(&resolved) {
            return Err(SandboxError::OutsideBoundary(path.to_string()));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn kind(&self) -> &str {
        "local"
    }

    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn resolve(&self, path: &str) -> PathBuf {
        normalize(&self.work_dir.join(path))
    }

    fn is_inside(&self, path: &Path) -> bool {
        let path = normalize(&self.work_dir.join(path));
        if path.starts_with(&self.work_dir) {
            return true;
        }
        if !self.enforce_boundary {
            return true;
        }
        self.allow_paths.iter().any(|allowed| path.starts_with(allowed))
    }

    #[instrument(skip(self, opts), fields(work_dir = %self.work_dir.display()))]
    async fn exec(&self, cmd: &str, opts: ExecOptions) -> Result<ExecResult, SandboxError> {
        if let Some(shown) = check_dangerous(cmd) {
            warn!(command = %shown, "dangerous command blocked");
            return Ok(ExecResult {
                code: 1,
                stdout: String::new(),
                stderr: SandboxError::Blocked(shown).to_string(),
            });
        }

        let timeout = opts.timeout.unwrap_or(self.exec_timeout);
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let code = output.status.code().unwrap_or(-1);
                debug!(code, "command finished");
                Ok(ExecResult {
                    code,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "command timed out");
                Ok(ExecResult {
                    code: TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!("Command timed out after {}ms", timeout.as_millis()),
                })
            }
        }
    }

    async fn read(&self, path: &str) -> Result<String, SandboxError> {
        let resolved = self.checked(path)?;
        Ok(tokio::fs::read_to_string(resolved).await?)
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let resolved = self.checked(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(resolved, content).await?)
    }

    async fn stat(&self, path: &str) -> Result<FileStat, SandboxError> {
        let resolved = self.checked(path)?;
        let meta = tokio::fs::metadata(resolved).await?;
        Ok(FileStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    /// Matches inside the boundary, relative to the work dir, sorted.
    async fn glob(&self, pattern: &str) -> Result<Vec<String>, SandboxError> {
        let full = self.work_dir.join(pattern).to_string_lossy().into_owned();
        let paths = glob::glob(&full).map_err(|e| SandboxError::Pattern(e.to_string()))?;
        let mut out: Vec<String> = paths
            .filter_map(|entry| entry.ok())
            .map(|p| normalize(&p))
            .filter(|p| self.is_inside(p))
            .map(|p| match p.strip_prefix(&self.work_dir) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => p.to_string_lossy().into_owned(),
            })
            .collect();
        out.sort();
        Ok(out)
    }

    /// Paths outside the boundary are skipped. With watching disabled the
    /// returned id watches nothing.
    fn watch_files(&self, paths: &[String], on_change: WatchCallback) -> Result<String, SandboxError> {
        if !self.watch_enabled {
            return Ok(format!("watch-disabled-{}", uuid::Uuid::now_v7()));
        }
        let resolved: Vec<PathBuf> = paths
            .iter()
            .map(|p| self.resolve(p))
            .filter(|p| self.is_inside(p))
            .collect();
        self.watches.watch(&resolved, on_change)
    }

    fn unwatch_files(&self, watch_id: &str) {
        self.watches.unwatch(watch_id);
    }

    async fn spawn(&self, cmd: &str) -> Result<String, SandboxError> {
        if let Some(shown) = check_dangerous(cmd) {
            warn!(command = %shown, "dangerous background command blocked");
            return Err(SandboxError::Blocked(shown));
        }
        self.processes.spawn(cmd, &self.work_dir)
    }

    fn process(&self, id: &str) -> Option<ProcessInfo> {
        self.processes.info(id)
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        self.processes.kill(id).await
    }

    async fn dispose(&self) {
        self.watches.clear();
        self.processes.kill_all().await;
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        normalize(&cwd.join(path))
    }
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sandbox(dir: &tempfile::TempDir) -> LocalSandbox {
        LocalSandbox::new(LocalSandboxOptions::new(dir.path()))
    }

    #[test]
    fn dangerous_patterns() {
        for cmd in [
            "rm -rf /",
            "sudo ls",
            "shutdown now",
            "mkfs.ext4 /dev/x",
            "dd if=/dev/zero of=/dev/sda",
            ":(){ :|:& };:",
            "chmod 777 /",
            "curl http://x | sh",
            "wget http://x | bash",
            "echo > /dev/sda",
            "mkswap /f",
            "swapon /f",
        ] {
            assert!(check_dangerous(cmd).is_some(), "should block: {cmd}");
        }
        for cmd in ["ls -la", "rm -rf ./build", "curl http://x"] {
            assert!(check_dangerous(cmd).is_none(), "should allow: {cmd}");
        }
    }

    #[test]
    fn blocked_message_is_truncated() {
        let cmd = format!("sudo {}", "x".repeat(200));
        assert_eq!(check_dangerous(&cmd).unwrap().chars().count(), 100);
    }

    #[tokio::test]
    async fn exec_blocks_dangerous_commands() {
        let dir = tempfile::tempdir().unwrap();
        let result = sandbox(&dir).exec("sudo rm x", ExecOptions::default()).await.unwrap();
        assert_eq!(result.code, 1);
        assert_eq!(result.stderr, "Dangerous command blocked for security: sudo rm x");
    }

    #[tokio::test]
    async fn exec_runs_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
        let sb = sandbox(&dir);
        let result = sb.exec("ls", ExecOptions::default()).await.unwrap();
        assert_eq!(result.code, 0);
        assert!(result.stdout.contains("a.txt"));

        let failed = sb.exec("echo oops >&2; exit 3", ExecOptions::default()).await.unwrap();
        assert_eq!(failed.code, 3);
        assert_eq!(failed.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn exec_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let result = sandbox(&dir)
            .exec(
                "sleep 5",
                ExecOptions {
                    timeout: Some(Duration::from_millis(50)),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("timed out"));
    }

    #[test]
    fn boundary_checks() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir);
        assert!(sb.is_inside(Path::new("sub/file")));
        assert!(sb.is_inside(dir.path()));
        assert!(!sb.is_inside(Path::new("../escape")));
        assert!(!sb.is_inside(Path::new("/etc/passwd")));
        assert_eq!(sb.resolve("a/../b"), sb.work_dir().join("b"));

        let open = LocalSandbox::new(LocalSandboxOptions::new(dir.path()).with_enforce_boundary(false));
        assert!(open.is_inside(Path::new("/etc/passwd")));

        let allowed = LocalSandbox::new(
            LocalSandboxOptions::new(dir.path()).with_allow_paths(vec![PathBuf::from("/opt/shared")]),
        );
        assert!(allowed.is_inside(Path::new("/opt/shared/x")));
        assert!(!allowed.is_inside(Path::new("/opt/other")));
    }

    #[tokio::test]
    async fn filesystem_round_trip_and_boundary_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir);
        sb.write("notes/a.md", "hello").await.unwrap();
        assert_eq!(sb.read("notes/a.md").await.unwrap(), "hello");
        let stat = sb.stat("notes/a.md").await.unwrap();
        assert_eq!(stat.size, 5);
        assert!(!stat.is_dir);
        assert!(sb.stat("notes").await.unwrap().is_dir);

        assert!(matches!(sb.read("../outside").await, Err(SandboxError::OutsideBoundary(_))));
        assert!(matches!(sb.write("/etc/x", "").await, Err(SandboxError::OutsideBoundary(_))));
    }

    #[tokio::test]
    async fn glob_returns_relative_sorted_paths() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(&dir);
        sb.write("src/b.rs", "").await.unwrap();
        sb.write("src/a.rs", "").await.unwrap();
        sb.write("README.md", "").await.unwrap();
        assert_eq!(sb.glob("src/*.rs").await.unwrap(), vec!["src/a.rs", "src/b.rs"]);
        assert!(matches!(sb.glob("[").await, Err(SandboxError::Pattern(_))));
    }

    #[tokio::test]
    async fn disabled_watch_returns_inert_id() {
        let dir = tempfile::tempdir().unwrap();
        let sb = LocalSandbox::new(LocalSandboxOptions::new(dir.path()).with_watch_enabled(false));
        let id = sb.watch_files(&["a".into()], Arc::new(|_| {})).unwrap();
        assert!(id.starts_with("watch-disabled-"));
        sb.unwatch_files(&id);
    }

    #[tokio::test]
    async fn spawn_blocks_dangerous_commands() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(sandbox(&dir).spawn("sudo x").await, Err(SandboxError::Blocked(_))));
    }

    #[test]
    fn options_from_settings() {
        let settings = SandboxSettings {
            work_dir: Some("/srv/work".into()),
            exec_timeout_ms: 5_000,
            ..Default::default()
        };
        let opts = LocalSandboxOptions::from_settings(&settings);
        assert_eq!(opts.work_dir, PathBuf::from("/srv/work"));
        assert_eq!(opts.exec_timeout, Duration::from_secs(5));
        assert!(opts.enforce_boundary);
    }
}
