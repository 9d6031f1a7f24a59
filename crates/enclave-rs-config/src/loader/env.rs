//! `ENCLAVE_<SECTION>_<KEY>` environment overrides.

use super::ENV_PREFIX;
use log::debug;
use serde_json::{Map, Value};

/// Config sections reachable from the environment.
const SECTIONS: &[&str] = &["lifecycle", "gc", "driver", "store", "approval"];
/// Keys whose environment value is a comma-separated list.
const LIST_KEYS: &[&str] = &["hint_allowlist"];

/// Build an overlay value from environment variables, or `None` when no
/// variable targets a known section.
pub(super) fn overrides_from_vars(vars: &[(String, String)]) -> Option<Value> {
    let mut root = Map::new();
    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let rest = rest.to_ascii_lowercase();
        let Some((section, field)) = SECTIONS.iter().find_map(|section| {
            rest.strip_prefix(section)
                .and_then(|tail| tail.strip_prefix('_'))
                .filter(|field| !field.is_empty())
                .map(|field| (*section, field.to_string()))
        }) else {
            debug!("ignoring environment variable without known section (key={key})");
            continue;
        };
        let value = parse_env_value(&field, raw);
        let entry = root
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = entry {
            map.insert(field, value);
        }
    }
    if root.is_empty() {
        None
    } else {
        Some(Value::Object(root))
    }
}

fn parse_env_value(field: &str, raw: &str) -> Value {
    if LIST_KEYS.contains(&field) {
        return Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_string()))
                .collect(),
        );
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Bool(_) | Value::Number(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}
