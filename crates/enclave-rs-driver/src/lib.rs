//! Copy-on-write sandbox drivers.
//!
//! A driver gives each sandbox a private writable view (the merged layer) of
//! a host subtree, reports how that view diverges from the host, and runs
//! confined processes inside it.

pub mod driver;
pub mod error;
pub mod exec;
pub mod registry;
pub mod types;

/// Driver error type and failure classes.
pub use error::{DriverError, FailureClass};
/// Driver trait and the portable copy driver.
pub use driver::{
    Driver,
    copy::{COPY_DRIVER, CopyDriver},
};
/// Process view used by confined commands.
pub use exec::ExecView;
/// Registry of available drivers.
pub use registry::DriverRegistry;
/// Confinement configuration and results.
pub use types::{Confinement, ExecConfig, ExecLimits, ExecResult, NetworkMode};

#[cfg(target_os = "linux")]
/// Kernel overlayfs driver for Linux.
pub use driver::overlay::{OVERLAY_DRIVER, OverlayDriver};
