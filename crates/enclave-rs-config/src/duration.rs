//! Duration values expressed as whole seconds.
//!
//! Config files may spell durations as an integer number of seconds or as a
//! humantime string such as `"90s"`, `"4h"` or `"1d 12h"`.

use serde::{Deserialize, Deserializer, Serializer};

/// Parse a config duration into whole seconds. Bare digits are seconds.
pub fn parse_duration(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(secs);
    }
    humantime::parse_duration(trimmed)
        .map(|duration| duration.as_secs())
        .map_err(|err| format!("invalid duration '{raw}': {err}"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

/// Serde adapter: serialize as seconds, deserialize from seconds or text.
pub fn serialize<S: Serializer>(secs: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(*secs)
}

/// See [`serialize`].
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(secs),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
