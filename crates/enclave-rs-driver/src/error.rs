//! Driver error types and failure classification.

use std::io;
use uuid::Uuid;

/// How the lifecycle layer should react to a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The backing mechanism is missing on this host; fail the request.
    Unavailable,
    /// Retry with backoff.
    Transient,
    /// Mark the sandbox `error`.
    Fatal,
}

/// Errors returned by sandbox drivers.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Backing mechanism missing or unusable on this host.
    #[error("driver unavailable: {0}")]
    Unavailable(String),
    /// The OS refused the mount.
    #[error("mount failed: {0}")]
    MountFailed(String),
    /// Temporary condition; the operation may succeed on retry.
    #[error("transient driver failure: {0}")]
    Transient(String),
    /// Unrecoverable failure for this sandbox.
    #[error("driver failure: {0}")]
    Fatal(String),
    /// The operation needs a mounted sandbox.
    #[error("sandbox {0} is not mounted")]
    NotMounted(Uuid),
    /// Backing storage no longer matches what the driver expects.
    #[error("sandbox storage corrupt: {0}")]
    Corrupt(String),
    /// A command could not be run inside the sandbox.
    #[error("exec failed: {0}")]
    ExecFailed(String),
    /// Driver name not registered.
    #[error("unknown driver: {0}")]
    UnknownDriver(String),
    /// Driver hint outside the configured allowlist.
    #[error("driver hint not allowed: {0}")]
    HintNotAllowed(String),
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Storage metadata could not be encoded or decoded.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl DriverError {
    /// Classify the failure for retry and status handling.
    pub fn class(&self) -> FailureClass {
        match self {
            DriverError::Unavailable(_) => FailureClass::Unavailable,
            DriverError::Transient(_) => FailureClass::Transient,
            DriverError::Io(err) if is_transient_io(err) => FailureClass::Transient,
            _ => FailureClass::Fatal,
        }
    }

    /// Wrap an OS error from a mount-related syscall.
    pub(crate) fn from_mount_errno(context: &str, err: io::Error) -> Self {
        if is_transient_io(&err) {
            return DriverError::Transient(format!("{context}: {err}"));
        }
        #[cfg(unix)]
        if matches!(err.raw_os_error(), Some(libc::ENODEV) | Some(libc::EPERM)) {
            return DriverError::Unavailable(format!("{context}: {err}"));
        }
        DriverError::MountFailed(format!("{context}: {err}"))
    }
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ResourceBusy
    )
}
