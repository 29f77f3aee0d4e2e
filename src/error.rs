//! Crate-wide error type.
//!
//! Kernel and syscall failures stay plain [`std::io::Error`], exactly as they
//! arrive from the backend. Everything that doesn't fit that mould (API
//! misuse, capacity limits, plugin loading, cancellation of requests that
//! were never submitted) is collected here.

use std::fmt;
use std::io;

/// Errors returned directly by crate APIs, as opposed to delivered through a
/// completion callback as `io::Error`.
#[derive(thiserror::Error, Debug)]
pub enum CrateError {
    /// A request was submitted on a slot that is already owned by an
    /// in-flight operation.
    #[error("request slot is already owned by an active operation")]
    AlreadyOwned,

    /// The call is not valid for the current state of the object (for
    /// example cancelling a request that was never submitted).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A fixed-size resource (buffer pool slots, thread pool queue, watch
    /// list) has no room left.
    #[error("capacity exceeded: {0}")]
    Capacity(&'static str),

    /// The request was cancelled before it could complete.
    #[error("request was cancelled")]
    Cancelled,

    /// The underlying OS call failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CrateError {
    /// Returns the `io::ErrorKind` closest to this error, for callers that
    /// only care about broad classification.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            CrateError::AlreadyOwned | CrateError::InvalidState(_) => io::ErrorKind::InvalidInput,
            CrateError::Capacity(_) => io::ErrorKind::OutOfMemory,
            CrateError::Cancelled => io::ErrorKind::Interrupted,
            CrateError::Io(err) => err.kind(),
        }
    }
}

impl From<CrateError> for io::Error {
    fn from(err: CrateError) -> io::Error {
        match err {
            CrateError::Io(err) => err,
            other => io::Error::new(other.kind(), other),
        }
    }
}

/// Result alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, CrateError>;

/// Error captured while compiling or linking a plugin.
///
/// Never propagated as a `Result::Err`: kept as a log so the registry can
/// keep running with the plugin simply absent (matches the "never interrupts
/// its caller" cancellation/error policy for this subsystem).
#[derive(Debug, Clone, Default)]
pub struct PluginError(pub String);

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PluginError {}
