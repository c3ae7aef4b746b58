//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every struct is `#[serde(default)]`
//! so a settings file only needs the keys it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KestrelSettings {
    pub store: StoreSettings,
    pub pool: PoolSettings,
    pub session: SessionSettings,
    pub sandbox: SandboxSettings,
    pub logging: LoggingSettings,
}

impl KestrelSettings {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_sessions == 0 {
            return Err(SettingsError::InvalidValue("pool.maxSessions must be positive".into()));
        }
        if self.session.max_concurrency == 0 {
            return Err(SettingsError::InvalidValue(
                "session.maxConcurrency must be positive".into(),
            ));
        }
        if self.session.event_capacity < 2 {
            return Err(SettingsError::InvalidValue(
                "session.eventCapacity must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Root directory; `~` expands to `$HOME`.
    pub root: String,
    pub flush_interval_ms: u64,
    pub max_buffered_events: usize,
    pub recover_on_open: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            root: "~/.kestrel/store".to_string(),
            flush_interval_ms: 50,
            max_buffered_events: 256,
            recover_on_open: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    pub max_sessions: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { max_sessions: 50 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub max_tokens: u32,
    pub temperature: f64,
    pub max_concurrency: usize,
    pub tool_timeout_ms: u64,
    pub event_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub permissions: PermissionSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
            max_concurrency: 3,
            tool_timeout_ms: 120_000,
            event_capacity: 10_000,
            system_prompt: None,
            permissions: PermissionSettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionSettings {
    pub mode: String,
    pub allow_tools: Vec<String>,
    pub deny_tools: Vec<String>,
    pub require_approval_tools: Vec<String>,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            mode: "auto".to_string(),
            allow_tools: Vec::new(),
            deny_tools: Vec::new(),
            require_approval_tools: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxSettings {
    /// Defaults to the process working directory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    pub enforce_boundary: bool,
    pub allow_paths: Vec<String>,
    pub exec_timeout_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            work_dir: None,
            enforce_boundary: true,
            allow_paths: Vec::new(),
            exec_timeout_ms: 120_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = KestrelSettings::default();
        assert_eq!(s.pool.max_sessions, 50);
        assert_eq!(s.session.max_concurrency, 3);
        assert_eq!(s.session.event_capacity, 10_000);
        assert_eq!(s.session.permissions.mode, "auto");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: KestrelSettings =
            serde_json::from_str(r#"{"session": {"maxConcurrency": 8}}"#).unwrap();
        assert_eq!(s.session.max_concurrency, 8);
        assert_eq!(s.session.max_tokens, 4096);
        assert_eq!(s.pool.max_sessions, 50);
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut s = KestrelSettings::default();
        s.session.max_concurrency = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }
}
