//! Reasons a configuration could not be produced.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A layer file exists but could not be read.
    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A file named explicitly (runtime layer, `--config`) is absent.
    #[error("config file {} does not exist", path.display())]
    Missing { path: PathBuf },
    #[error("{origin} is not valid JSON5: {source}")]
    Syntax {
        origin: String,
        #[source]
        source: json5::Error,
    },
    /// A key is unknown or holds a value of the wrong shape.
    #[error("{origin}: {key}: {reason}")]
    Field {
        origin: String,
        key: String,
        reason: String,
    },
    /// The merged document passed the schema but not the typed model.
    #[error("effective config does not decode: {0}")]
    Decode(#[from] serde_json::Error),
}
