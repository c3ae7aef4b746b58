use std::path::{Path, PathBuf};

use kestrel_core::events::Channel;

use crate::error::{Result, StoreError};

pub(crate) const SESSIONS_DIR: &str = "sessions";
pub(crate) const WAL_SUFFIX: &str = "wal";
pub(crate) const CORRUPTED_SUFFIX: &str = "corrupted";

/// Subdirectories under `history/`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryKind {
    Windows,
    Compressions,
    Recovered,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Compressions => "compressions",
            Self::Recovered => "recovered",
        }
    }
}

/// Validate an id before it is used as a path component.
/// Rejects empty ids, `.`/`..` segments and control characters.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(StoreError::InvalidId("id cannot be empty".to_string()));
    }
    if id.split(['/', '\\']).any(|seg| seg == ".." || seg == ".") {
        return Err(StoreError::InvalidId(format!(
            "id contains a relative path segment: {id:?}"
        )));
    }
    if id.chars().any(|c| c.is_control()) {
        return Err(StoreError::InvalidId(format!(
            "id contains control characters: {id:?}"
        )));
    }
    Ok(())
}

/// Encode an id as a single file name. Only `%`, `/` and `\` are escaped so
/// the names stay readable and sort like the ids.
pub fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            c => out.push(c),
        }
    }
    out
}

pub fn decode_id(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let (decoded, skip) = match tail.get(..3) {
            Some("%25") => ('%', 3),
            Some("%2F") => ('/', 3),
            Some("%5C") => ('\\', 3),
            _ => ('%', 1),
        };
        out.push(decoded);
        rest = &tail[skip..];
    }
    out.push_str(rest);
    out
}

/// Paths of every record belonging to one session.
#[derive(Clone, Debug)]
pub struct SessionPaths {
    dir: PathBuf,
}

impl SessionPaths {
    pub fn new(root: &Path, session_id: &str) -> Result<Self> {
        validate_id(session_id)?;
        Ok(Self {
            dir: root.join(SESSIONS_DIR).join(encode_id(session_id)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn messages(&self) -> PathBuf {
        self.dir.join("runtime").join("messages.json")
    }

    pub fn tool_calls(&self) -> PathBuf {
        self.dir.join("runtime").join("tool-calls.json")
    }

    pub fn todos(&self) -> PathBuf {
        self.dir.join("runtime").join("todos.json")
    }

    pub fn events_dir(&self) -> PathBuf {
        self.dir.join("events")
    }

    pub fn event_log(&self, channel: Channel) -> PathBuf {
        self.events_dir().join(format!("{}.log", channel.as_str()))
    }

    pub fn history_dir(&self, kind: HistoryKind) -> PathBuf {
        self.dir.join("history").join(kind.as_str())
    }

    pub fn history_record(&self, kind: HistoryKind, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.history_dir(kind).join(format!("{}.json", encode_id(id))))
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.dir.join("snapshots")
    }

    pub fn snapshot(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.snapshots_dir().join(format!("{}.json", encode_id(id))))
    }

    pub fn meta(&self) -> PathBuf {
        self.dir.join("meta.json")
    }
}

/// `<file>.<suffix>` next to `path`.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
