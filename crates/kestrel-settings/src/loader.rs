//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::KestrelSettings;

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// Resolve the path to the settings file (`~/.kestrel/settings.json`).
pub fn settings_path() -> PathBuf {
    home_dir().join(".kestrel").join("settings.json")
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None if path == "~" => home_dir(),
        None => PathBuf::from(path),
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<KestrelSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or invalid values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<KestrelSettings> {
    let defaults = serde_json::to_value(KestrelSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: KestrelSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `KESTREL_*` overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut KestrelSettings) {
    if let Some(v) = read_env_string("KESTREL_STORE_ROOT") {
        settings.store.root = v;
    }
    if let Some(v) = read_env_u64("KESTREL_FLUSH_INTERVAL_MS", 1, 60_000) {
        settings.store.flush_interval_ms = v;
    }
    if let Some(v) = read_env_bool("KESTREL_RECOVER_ON_OPEN") {
        settings.store.recover_on_open = v;
    }
    if let Some(v) = read_env_usize("KESTREL_MAX_SESSIONS", 1, 10_000) {
        settings.pool.max_sessions = v;
    }
    if let Some(v) = read_env_usize("KESTREL_MAX_CONCURRENCY", 1, 256) {
        settings.session.max_concurrency = v;
    }
    if let Some(v) = read_env_u64("KESTREL_TOOL_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.session.tool_timeout_ms = v;
    }
    if let Some(v) = read_env_string("KESTREL_PERMISSION_MODE") {
        settings.session.permissions.mode = v;
    }
    if let Some(v) = read_env_string("KESTREL_WORK_DIR") {
        settings.sandbox.work_dir = Some(v);
    }
    if let Some(v) = read_env_bool("KESTREL_ENFORCE_BOUNDARY") {
        settings.sandbox.enforce_boundary = v;
    }
    if let Some(v) = read_env_string("KESTREL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("KESTREL_LOG_JSON") {
        settings.logging.json = v;
    }
}

// --- Pure parsing functions ---

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// --- Env var readers ---

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, min, max, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, min, max, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_rules() {
        let target = json!({"a": {"b": 1, "c": [1, 2]}, "d": "keep"});
        let source = json!({"a": {"c": [3], "e": true}, "d": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged, json!({"a": {"b": 1, "c": [3], "e": true}, "d": "keep"}));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s.pool.max_sessions, KestrelSettings::default().pool.max_sessions);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"session": {"permissions": {"mode": "readonly", "denyTools": ["bash_run"]}}}"#,
        )
        .unwrap();
        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.session.permissions.mode, "readonly");
        assert_eq!(s.session.permissions.deny_tools, vec!["bash_run"]);
        assert_eq!(s.session.max_tokens, 4096);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_settings_from_path(&path).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"pool": {"maxSessions": 0}}"#).unwrap();
        assert!(load_settings_from_path(&path).is_err());
    }

    #[test]
    fn parsers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_u64_range("50", 1, 100), Some(50));
        assert_eq!(parse_u64_range("500", 1, 100), None);
        assert_eq!(parse_usize_range("x", 1, 10), None);
    }

    #[test]
    fn expand_home_handles_tilde() {
        assert!(expand_home("~/x").ends_with("x"));
        assert_eq!(expand_home("/abs"), PathBuf::from("/abs"));
    }
}
