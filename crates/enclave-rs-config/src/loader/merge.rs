//! Overlaying one JSON document onto another.

use serde_json::{Map, Value};

/// Overlay `layer` onto `base`: objects merge key by key, anything else
/// replaces what `base` held.
pub(super) fn overlay(base: &mut Value, layer: &Value) {
    overlay_unlocked(base, layer, None);
}

/// [`overlay`], except that keys `locked` sets to a non-object value keep
/// their current value in `base`.
pub(super) fn overlay_unlocked(base: &mut Value, layer: &Value, locked: Option<&Value>) {
    let locked = match locked {
        None => None,
        Some(Value::Object(keys)) => Some(keys),
        Some(_) => return,
    };
    let (Value::Object(target), Value::Object(incoming)) = (&mut *base, layer) else {
        if locked.is_none() {
            *base = layer.clone();
        }
        return;
    };
    for (key, value) in incoming {
        let lock = locked.and_then(|keys| keys.get(key));
        match lock {
            // Pinned scalar or array.
            Some(lock) if !lock.is_object() => continue,
            // A partially locked object cannot be replaced wholesale.
            Some(_) if !value.is_object() => continue,
            _ => {}
        }
        if value.is_object() && (lock.is_some() || target.get(key).is_some_and(Value::is_object)) {
            let slot = target
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            overlay_unlocked(slot, value, lock);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}
