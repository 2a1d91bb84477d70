//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ConduitSettings::default()`]
//! 2. If `~/.conduit/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `CONDUIT_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{AgentRole, ConduitSettings};

/// Resolve the path to the settings file (`~/.conduit/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".conduit").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ConduitSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ConduitSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<ConduitSettings> {
    let defaults = serde_json::to_value(ConduitSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides. Invalid values are logged and
/// ignored.
pub fn apply_env_overrides(settings: &mut ConduitSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Override logic with an injectable variable source.
pub fn apply_overrides(settings: &mut ConduitSettings, var: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| var(name).filter(|v| !v.is_empty());

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = string("CONDUIT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = parsed(&var, "CONDUIT_PORT", |s| parse_u16_range(s, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = parsed(&var, "CONDUIT_HEARTBEAT_MS", |s| parse_u64_range(s, 50, 600_000)) {
        settings.server.heartbeat_interval_ms = v;
    }

    // ── Agent ───────────────────────────────────────────────────────
    if let Some(v) = string("CONDUIT_AGENT_NAME") {
        settings.agent.name = v;
    }
    if let Some(v) = parsed(&var, "CONDUIT_ROLE", |s| s.parse::<AgentRole>().ok()) {
        settings.agent.role = v;
    }

    // ── Delegation ──────────────────────────────────────────────────
    if let Some(v) = string("CONDUIT_WORKER_BASE") {
        settings.delegation.worker_base = v;
    }
    if let Some(v) = parsed(&var, "CONDUIT_DELEGATION_TIMEOUT_SECS", |s| {
        parse_u64_range(s, 1, 86_400)
    }) {
        settings.delegation.timeout_secs = Some(v);
    }
    for worker in &mut settings.workers {
        if let Some(url) = string(&worker_url_var(&worker.name)) {
            worker.url = Some(url);
        }
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("CONDUIT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = string("CONDUIT_LOG_FORMAT") {
        settings.logging.format = v;
    }
}

/// `nl2sql_agent` → `CONDUIT_WORKER_NL2SQL_AGENT_URL`.
pub fn worker_url_var(worker: &str) -> String {
    let name: String = worker
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("CONDUIT_WORKER_{name}_URL")
}

fn parsed<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = var(name)?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
