//! The per-OS `KernelBackend` abstraction.
//!
//! Grounded on the teacher's `sys::unix`/`sys::windows` split and its
//! `Selector` pattern (one OS-specific struct wrapping a raw handle, plus a
//! `register`/`reregister`/`deregister` trio): `Backend` is the same shape
//! generalized from "readiness for a socket" to "lifecycle of any request",
//! since this crate also has to drive timers, process exit and plugin/file
//! watch notifications through the same kernel object.

use std::time::Duration;

use crate::error::CrateError;
use crate::request::{CompletionData, Request};
use crate::token::Token;

/// One backend-reported completion: a token plus whatever data the backend
/// produced for it.
pub struct BackendEvent {
    pub token: Token,
    pub data: CompletionData,
}

/// Implemented once per kernel facility (epoll, kqueue, IOCP, and io_uring
/// layered over the epoll implementation). The `EventLoop` only ever talks
/// to this trait, never to a concrete backend type.
pub trait Backend: Send {
    /// Prepares `request` for submission (opens kernel-side resources such
    /// as an AFD handle or an `OVERLAPPED` slot) without yet handing it to
    /// the kernel. Corresponds to the `Setup` state.
    fn setup(&mut self, request: &mut Request) -> Result<(), CrateError>;

    /// Hands `request` to the kernel. Corresponds to the `Setup ->
    /// Submitting -> Active` transition; on completion-based backends
    /// (IOCP, io_uring) this is the point the operation is actually issued,
    /// on readiness backends (epoll, kqueue) this registers interest.
    fn activate(&mut self, request: &mut Request) -> Result<(), CrateError>;

    /// Requests cancellation of an active request. The backend must still
    /// deliver a completion (`CompletionData::Cancelled` or the operation's
    /// normal result, per the io_uring cancellation ambiguity noted in the
    /// design notes) rather than silently dropping it.
    fn cancel(&mut self, request: &mut Request) -> Result<(), CrateError>;

    /// Releases any kernel-side resources `setup` acquired. Called once a
    /// request has returned to `Free`.
    fn teardown(&mut self, request: &mut Request);

    /// Blocks for up to `timeout` (or indefinitely if `None`) and returns
    /// the completions that occurred.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<BackendEvent>, CrateError>;

    /// Whether this backend needs `activate` to be called again after every
    /// readiness notification (true for readiness-based backends like epoll
    /// and kqueue, false for strictly completion-based backends like IOCP
    /// and io_uring, which only ever submit once per operation).
    fn needs_submission_when_reactivating(&self) -> bool;

    /// Returns a handle that, when signalled from another thread, wakes a
    /// thread blocked in `poll`.
    fn waker_token(&self) -> Token;

    /// Signals the waker registered under `waker_token`.
    fn wake(&self) -> Result<(), CrateError>;

    /// Turns a readiness notification (`CompletionData::Ready`) into the
    /// request's real completion by running the syscall its `RequestKind`
    /// implies. Shared by every readiness-based backend (epoll, kqueue);
    /// IOCP completes requests itself and never produces `Ready`, so it
    /// never needs to override this.
    fn complete_async(&mut self, request: &mut Request) -> CompletionData {
        crate::io_ops::complete_readiness(request)
    }
}

#[cfg(all(unix, any(target_os = "linux", target_os = "android")))]
mod epoll;
#[cfg(all(
    unix,
    any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    )
))]
mod kqueue;
#[cfg(windows)]
mod iocp;

#[cfg(all(unix, any(target_os = "linux", target_os = "android")))]
pub use epoll::EpollBackend as SysBackend;
#[cfg(all(
    unix,
    any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    )
))]
pub use kqueue::KqueueBackend as SysBackend;
#[cfg(windows)]
pub use iocp::IocpBackend as SysBackend;

/// Constructs the default backend for the current target, honoring the
/// `io_uring`-over-epoll runtime toggle on Linux.
#[cfg(all(unix, any(target_os = "linux", target_os = "android")))]
pub fn new_default() -> Result<SysBackend, CrateError> {
    epoll::EpollBackend::new()
}

#[cfg(all(
    unix,
    any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
    )
))]
pub fn new_default() -> Result<SysBackend, CrateError> {
    kqueue::KqueueBackend::new()
}

#[cfg(windows)]
pub fn new_default() -> Result<SysBackend, CrateError> {
    iocp::IocpBackend::new()
}
