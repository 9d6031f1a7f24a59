//! Public SDK surface for Enclave.
//!
//! This crate re-exports the building blocks, wires them together from an
//! [`EnclaveConfig`](config::EnclaveConfig), and provides a small logging
//! helper so binaries start up the same way.

mod enclave;

pub use enclave::Enclave;

/// Re-export for convenience.
pub use enclave_rs_config as config;
pub use enclave_rs_core as core;
/// Re-export for convenience.
pub use enclave_rs_driver as driver;
/// Re-export for convenience.
pub use enclave_rs_protocol as protocol;
pub use enclave_rs_store as store;

/// Initialize `env_logger` with millisecond timestamps, honouring `RUST_LOG`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::builder()
        .format_timestamp_millis()
        .parse_default_env()
        .try_init();
}
