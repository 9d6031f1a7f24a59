//! Configuration models and layered config loading.
//!
//! This crate owns the Enclave config schema, validation, and layer-merging
//! logic used by the service and the CLI.

pub mod duration;
mod error;
mod loader;
mod model;

pub use error::ConfigError;
pub use loader::{ConfigSources, Layer, LayerKind, LoadedConfig};
pub use model::*;
