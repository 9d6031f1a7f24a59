//! Sandbox orchestration for Enclave.
//!
//! This crate owns the lifecycle state machine, the approval engine and
//! policy validator, garbage collection, and audit emission. Storage and
//! drivers are injected as trait objects.

pub mod approval;
pub mod audit;
pub mod context;
pub mod error;
pub mod gc;
pub mod lifecycle;
pub mod policy;

pub use audit::Actor;
pub use context::RequestContext;
pub use error::EnclaveError;
/// Garbage collection and its periodic ticker.
pub use gc::{GC_LOOP_ACTOR, GcLoop, GcService};
/// Lifecycle entry point.
pub use lifecycle::{RecoveryReport, SandboxLocks, SandboxService};
/// Pure approval policy evaluation.
pub use policy::{PolicyDecision, evaluate};
