//! Shape checks for configuration documents.
//!
//! Serde would silently ignore unknown keys and report type errors without
//! saying which file they came from; these checks run per layer first.

use crate::ConfigError;
use crate::duration::parse_duration;
use serde_json::{Map, Value};

/// How much a document must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Strictness {
    /// One layer; later layers may still fix a value.
    Layer,
    /// The merged document the service will run with.
    Effective,
}

/// Reject unknown keys and wrongly typed values in `value`.
pub(super) fn check(value: &Value, mode: Strictness, layer: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, "")?;
    let allowed = ["$schema", "lifecycle", "gc", "driver", "store", "approval"];
    ensure_allowed_keys(map, &allowed, layer, "")?;

    if let Some(value) = map.get("$schema") {
        expect_string(value, layer, "$schema")?;
    }
    if let Some(value) = map.get("lifecycle") {
        validate_lifecycle(value, layer, "lifecycle")?;
    }
    if let Some(value) = map.get("gc") {
        validate_gc(value, mode, layer, "gc")?;
    }
    if let Some(value) = map.get("driver") {
        validate_driver(value, layer, "driver")?;
    }
    if let Some(value) = map.get("store") {
        validate_store(value, layer, "store")?;
    }
    if let Some(value) = map.get("approval") {
        validate_approval(value, layer, "approval")?;
    }

    Ok(())
}

fn validate_lifecycle(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    let keys = [
        "retry_attempts_on_stale_version",
        "retry_attempts_on_transient_driver_error",
        "transient_backoff_ms",
    ];
    ensure_allowed_keys(map, &keys, layer, path)?;
    for key in keys {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    Ok(())
}

fn validate_gc(value: &Value, mode: Strictness, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    let durations = [
        "interval",
        "default_max_age",
        "default_idle_timeout",
        "default_terminal_delay",
    ];
    let integers = ["default_gc_limit", "max_total_size_bytes"];
    let mut allowed = vec!["enabled"];
    allowed.extend(durations);
    allowed.extend(integers);
    ensure_allowed_keys(map, &allowed, layer, path)?;

    if let Some(value) = map.get("enabled") {
        expect_bool(value, layer, &join_path(path, "enabled"))?;
    }
    for key in durations {
        if let Some(value) = map.get(key) {
            expect_duration(value, layer, &join_path(path, key))?;
        }
    }
    for key in integers {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    // Layers may zero a limit that a later layer restores; only the merged
    // result has to be usable.
    if mode == Strictness::Effective
        && let Some(limit) = map.get("default_gc_limit")
        && limit.as_u64() == Some(0)
    {
        return Err(invalid_field(
            layer,
            &join_path(path, "default_gc_limit"),
            "must be greater than zero",
        ));
    }
    Ok(())
}

fn validate_driver(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["default", "hint_allowlist", "state_dir"], layer, path)?;
    if let Some(value) = map.get("default") {
        expect_optional_string(value, layer, &join_path(path, "default"))?;
    }
    if let Some(value) = map.get("hint_allowlist") {
        validate_string_array(value, layer, &join_path(path, "hint_allowlist"))?;
    }
    if let Some(value) = map.get("state_dir") {
        expect_optional_string(value, layer, &join_path(path, "state_dir"))?;
    }
    Ok(())
}

fn validate_store(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["path"], layer, path)?;
    if let Some(value) = map.get("path") {
        expect_optional_string(value, layer, &join_path(path, "path"))?;
    }
    Ok(())
}

fn validate_approval(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["git_commit"], layer, path)?;
    if let Some(value) = map.get("git_commit") {
        expect_bool(value, layer, &join_path(path, "git_commit"))?;
    }
    Ok(())
}

/// Expect a JSON object or return a typed error.
fn expect_object<'a>(
    value: &'a Value,
    layer: &str,
    path: &str,
) -> Result<&'a Map<String, Value>, ConfigError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(invalid_field(layer, path, "expected object")),
    }
}

/// Expect a JSON string or return a typed error.
fn expect_string(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.as_str().is_some() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected string"))
    }
}

fn expect_optional_string(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_null() {
        return Ok(());
    }
    expect_string(value, layer, path)
}

/// Expect a JSON boolean or return a typed error.
fn expect_bool(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if matches!(value, Value::Bool(_)) {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected bool"))
    }
}

/// Expect a non-negative JSON integer or return a typed error.
fn expect_u64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_u64() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected non-negative integer"))
    }
}

/// Durations are whole seconds or strings such as `"4h"`.
fn expect_duration(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    match value {
        Value::Number(_) => expect_u64(value, layer, path),
        Value::String(text) => parse_duration(text)
            .map(|_| ())
            .map_err(|message| invalid_field(layer, path, &message)),
        _ => Err(invalid_field(layer, path, "expected duration")),
    }
}

/// Validate that a value is an array of strings.
fn validate_string_array(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let arr = match value {
        Value::Array(arr) => arr,
        _ => return Err(invalid_field(layer, path, "expected array")),
    };
    for (idx, entry) in arr.iter().enumerate() {
        if entry.as_str().is_none() {
            return Err(invalid_field(
                layer,
                &format!("{path}[{idx}]"),
                "expected string",
            ));
        }
    }
    Ok(())
}

/// Ensure an object contains only allowed keys.
fn ensure_allowed_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(invalid_field(layer, &join_path(path, key), "unknown key"));
        }
    }
    Ok(())
}

/// Join nested paths for better error messages.
fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn invalid_field(layer: &str, path: &str, message: &str) -> ConfigError {
    ConfigError::Field {
        origin: layer.to_string(),
        key: if path.is_empty() { "(root)" } else { path }.to_string(),
        reason: message.to_string(),
    }
}
