//! The request lifecycle state machine.
//!
//! Grounded on `original_source/Libraries/Async/Async.h`: every asynchronous
//! operation is a node that moves through the same five states regardless of
//! its kind (`Free -> Setup -> Submitting -> Active -> {Free, Cancelling}`).
//! The original models this with a base class and an `AlignedStorage` byte
//! buffer holding per-OS state; here a request is a plain slab entry and the
//! OS-specific payload is an `enum` variant pruned by `cfg` for the target
//! backend, which keeps a stable layout without unsafe storage tricks.

use std::time::{Duration, Instant};

use crate::buffers::BufferView;
use crate::error::CrateError;
use crate::token::Token;

/// Where a request sits in its lifecycle.
///
/// `Free` slots are available for reuse. A request only ever moves forward
/// along this chain in one tick of the event loop; `Cancelling` always
/// resolves back to `Free` once the backend acknowledges the cancellation
/// (or immediately, if the request had not yet been submitted to the
/// kernel — see the "cancel before submit" testable property).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Slot is unused.
    Free,
    /// Request has been configured but not yet handed to the backend.
    Setup,
    /// Request has been handed to `Backend::activate` and is waiting for the
    /// kernel to accept it.
    Submitting,
    /// Backend confirmed the request is live; a completion is expected.
    Active,
    /// A cancellation was requested while `Active`; waiting for the
    /// backend's acknowledgement before returning to `Free`.
    Cancelling,
}

/// The operation a [`Request`] carries.
///
/// One variant per request family named in the data model: timers,
/// cross-thread wake-ups, thread pool work, process exit, socket I/O and
/// file I/O. Every kernel backend in this crate is readiness-based even on
/// the platform that's natively completion-based (see `backend::iocp`'s
/// module doc): the backend only ever tells a request's fd is ready, and
/// [`Backend::complete_async`](crate::backend::Backend::complete_async)
/// turns that readiness into the rich [`CompletionData`] below by running
/// the actual `read`/`write`/`accept`/`close` syscall against the buffer (or
/// fd) the variant carries.
///
/// `SocketClose`/`FileClose`/`FileSystemOp` never reach a kernel backend at
/// all — closing a descriptor and most file-system operations don't have
/// kernel-reported readiness to wait for, so `EventLoop` completes them
/// synchronously (close) or on the thread pool (file-system op) rather than
/// submitting them to `Backend::activate`.
#[derive(Debug)]
pub enum RequestKind {
    /// Fires once, after `deadline` has passed.
    Timeout { deadline: Instant },
    /// Fires when another thread calls `EventLoop::wake_up`.
    WakeUp,
    /// Runs `Cargo`-free background work on the thread pool, then delivers
    /// its result back on the loop thread.
    Work,
    /// Resolves when the watched process terminates.
    ProcessExit { pid: u32 },
    /// Readiness for a not-yet-connected listening socket; completion calls
    /// `accept(2)` and reports the newly constructed socket descriptor.
    SocketAccept { fd: i32 },
    /// Writable-readiness for a socket mid-`connect(2)`.
    SocketConnect { fd: i32 },
    /// Writable-readiness for a socket with `buffer`'s bytes queued to send.
    SocketSend { fd: i32, buffer: BufferView },
    /// Readable-readiness for a socket; completion reads into `buffer`.
    SocketReceive { fd: i32, buffer: BufferView },
    /// Closes a socket fd. Completes synchronously, never submitted to a
    /// backend.
    SocketClose { fd: i32 },
    /// Readable-readiness for a regular or pipe fd to read into `buffer`.
    /// Regular files never reach `Backend::activate` (see
    /// `EventLoop::add_file_read`'s doc); they're routed through the thread
    /// pool instead, since epoll/kqueue refuse to register plain fds.
    FileRead { fd: i32, buffer: BufferView },
    /// Writable-readiness for a file to write `buffer`'s bytes to. Same
    /// regular-file routing caveat as `FileRead`.
    FileWrite { fd: i32, buffer: BufferView },
    /// Closes a file fd. Completes synchronously, never submitted to a
    /// backend.
    FileClose { fd: i32 },
    /// Readiness-only poll of a file descriptor (used by the watcher on
    /// Linux to multiplex an inotify fd through the same request machinery
    /// as every other I/O source).
    FilePoll { fd: i32 },
    /// An arbitrary blocking file-system call (`rename`, `mkdir`, `unlink`,
    /// ...), run on the thread pool and delivered back as
    /// `CompletionData::FileSystemOp`.
    FileSystemOp,
}

/// Payload delivered to a request's completion callback.
#[derive(Debug)]
pub enum CompletionData {
    Timeout,
    WakeUp,
    Work(Box<dyn std::any::Any + Send>),
    ProcessExit { exit_code: i32 },
    /// A connection was accepted; `fd` is the newly constructed socket
    /// descriptor, owned by the caller from this point on.
    SocketAccept { fd: i32 },
    SocketConnect,
    SocketSend { bytes_written: usize },
    /// `disconnected` is set once `recv`/`read` returns zero bytes, meaning
    /// the peer closed its half of the connection.
    SocketReceive { bytes_read: usize, disconnected: bool },
    SocketClose,
    /// `eof` is set once `read` returns zero bytes.
    FileRead { bytes_read: usize, eof: bool },
    FileWrite { bytes_written: usize },
    FileClose,
    FileSystemOp(Result<(), std::io::Error>),
    FilePoll,
    /// Backend-internal: a readiness-based backend reported an fd ready but
    /// hasn't yet run the syscall that turns it into one of the variants
    /// above. `EventLoop::dispatch` always resolves this through
    /// `Backend::complete_async` before a user callback ever sees it.
    Ready,
    Cancelled,
    Err(std::io::Error),
}

/// One slot in the event loop's request table.
///
/// `next`/`prev` are stable slab indices rather than raw pointers: the
/// REDESIGN FLAG against intrusive pointers is resolved by letting the
/// `EventLoop`'s slab own storage and having lists reference entries by
/// index, which keeps "the caller owns the node" without `unsafe`.
pub struct Request {
    pub(crate) state: RequestState,
    pub(crate) kind: Option<RequestKind>,
    pub(crate) token: Token,
    pub(crate) callback: Option<Box<dyn FnMut(CompletionData) + 'static>>,
    pub(crate) next: Option<usize>,
    pub(crate) prev: Option<usize>,
}

impl Request {
    pub(crate) fn empty(token: Token) -> Request {
        Request {
            state: RequestState::Free,
            kind: None,
            token,
            callback: None,
            next: None,
            prev: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Token this request is registered under with the backend.
    pub fn token(&self) -> Token {
        self.token
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("token", &self.token)
            .finish()
    }
}

/// Helper for building a timeout request's deadline from a relative delay.
pub fn deadline_from(delay: Duration) -> Instant {
    Instant::now() + delay
}

/// Returns the error used when a caller tries to cancel a request that was
/// never submitted (Open Question 1: a recoverable error, not a panic).
pub fn cancel_before_submit_error() -> CrateError {
    CrateError::InvalidState("cannot cancel a request that has not been submitted")
}
