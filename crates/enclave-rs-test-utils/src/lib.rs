//! Test helpers shared across Enclave crates.
//!
//! Fixture helpers panic on IO failure; they are only linked into tests.

pub mod driver;
pub mod fixtures;

pub use driver::{DriverOp, Fault, FaultyDriver};
pub use fixtures::{ProjectTree, read_file, write_file};
