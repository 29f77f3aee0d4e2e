//! BSD/macOS backend.
//!
//! Adapted from the teacher's `sys::unix::selector::kqueue::Selector`:
//! sockets and pipes register as `EVFILT_READ`/`EVFILT_WRITE` changes,
//! `EVFILT_TIMER` replaces the Linux `timerfd`, `EVFILT_PROC` with
//! `NOTE_EXIT` replaces `pidfd`, and a `EVFILT_USER` event is the wake-up
//! mechanism (no `eventfd` on this platform).

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::CrateError;
use crate::request::{CompletionData, Request, RequestKind, RequestState};
use crate::token::Token;

use super::{Backend, BackendEvent};

const WAKER_IDENT: usize = 0;
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

fn request_fd(kind: &RequestKind) -> Option<RawFd> {
    match kind {
        RequestKind::SocketAccept { fd }
        | RequestKind::SocketConnect { fd }
        | RequestKind::SocketSend { fd, .. }
        | RequestKind::SocketReceive { fd, .. }
        | RequestKind::FileRead { fd, .. }
        | RequestKind::FileWrite { fd, .. }
        | RequestKind::FilePoll { fd } => Some(*fd),
        _ => None,
    }
}

fn is_write_direction(kind: &RequestKind) -> bool {
    matches!(kind, RequestKind::SocketConnect { .. } | RequestKind::SocketSend { .. } | RequestKind::FileWrite { .. })
}

pub struct KqueueBackend {
    kq: OwnedFd,
    /// Watched-pid to request-token reverse lookup. `EVFILT_PROC` reports
    /// `ident` as the pid it was registered against, not the request's slab
    /// token, so `poll` needs this table to recover the right token (the
    /// same shape as `EpollBackend::pidfds`).
    pids: HashMap<libc::pid_t, Token>,
}

impl KqueueBackend {
    pub fn new() -> Result<KqueueBackend, CrateError> {
        let kq = unsafe { OwnedFd::from_raw_fd(check(libc::kqueue())?) };
        let backend = KqueueBackend { kq, pids: HashMap::new() };
        backend.apply(&[kevent(
            WAKER_IDENT as libc::uintptr_t,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
        )])?;
        Ok(backend)
    }

    fn apply(&self, changes: &[libc::kevent]) -> Result<(), CrateError> {
        check(unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as i32,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        })?;
        Ok(())
    }

    /// Removes whatever kqueue registration `request` holds, so a cancelled
    /// or torn-down one-shot timer/process-exit/fd watch never fires later
    /// against a token the slab has since reused for an unrelated request.
    fn deregister(&mut self, request: &Request) {
        let Some(kind) = request.kind.as_ref() else { return };
        let token_bits = usize::from(request.token) as libc::uintptr_t;
        match kind {
            RequestKind::Timeout { .. } => {
                let _ = self.apply(&[kevent(token_bits, libc::EVFILT_TIMER, libc::EV_DELETE, 0)]);
            }
            RequestKind::ProcessExit { pid } => {
                self.pids.remove(&(*pid as libc::pid_t));
                let _ = self.apply(&[kevent(*pid as libc::uintptr_t, libc::EVFILT_PROC, libc::EV_DELETE, 0)]);
            }
            _ => {
                if let Some(fd) = request_fd(kind) {
                    let filter = if is_write_direction(kind) { libc::EVFILT_WRITE } else { libc::EVFILT_READ };
                    let _ = self.apply(&[kevent(fd as libc::uintptr_t, filter, libc::EV_DELETE, 0)]);
                }
            }
        }
    }
}

fn kevent(ident: libc::uintptr_t, filter: i16, flags: u16, fflags: u32) -> libc::kevent {
    libc::kevent {
        ident,
        filter,
        flags,
        fflags,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

impl Backend for KqueueBackend {
    fn setup(&mut self, request: &mut Request) -> Result<(), CrateError> {
        request.state = RequestState::Setup;
        Ok(())
    }

    fn activate(&mut self, request: &mut Request) -> Result<(), CrateError> {
        let Some(kind) = request.kind.as_ref() else {
            return Err(CrateError::InvalidState("request has no operation set"));
        };

        let token_bits = usize::from(request.token) as libc::uintptr_t;
        match kind {
            RequestKind::Timeout { deadline } => {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                self.apply(&[libc::kevent {
                    ident: token_bits,
                    filter: libc::EVFILT_TIMER,
                    flags: libc::EV_ADD | libc::EV_ONESHOT,
                    fflags: libc::NOTE_NSECONDS as u32,
                    data: remaining.as_nanos() as libc::intptr_t,
                    udata: std::ptr::null_mut(),
                }])?;
            }
            RequestKind::ProcessExit { pid } => {
                self.apply(&[libc::kevent {
                    ident: *pid as libc::uintptr_t,
                    filter: libc::EVFILT_PROC,
                    flags: libc::EV_ADD | libc::EV_ONESHOT,
                    fflags: libc::NOTE_EXIT as u32,
                    data: 0,
                    udata: std::ptr::null_mut(),
                }])?;
                self.pids.insert(*pid as libc::pid_t, request.token);
            }
            RequestKind::WakeUp | RequestKind::Work => {}
            _ => {
                if let Some(fd) = request_fd(kind) {
                    let filter = if is_write_direction(kind) { libc::EVFILT_WRITE } else { libc::EVFILT_READ };
                    self.apply(&[kevent(fd as libc::uintptr_t, filter, libc::EV_ADD | libc::EV_CLEAR, 0)])?;
                }
            }
        }

        request.state = RequestState::Active;
        Ok(())
    }

    fn cancel(&mut self, request: &mut Request) -> Result<(), CrateError> {
        if request.state != RequestState::Active {
            return Err(crate::request::cancel_before_submit_error());
        }
        request.state = RequestState::Cancelling;
        self.deregister(request);
        Ok(())
    }

    fn teardown(&mut self, request: &mut Request) {
        self.deregister(request);
        request.state = RequestState::Free;
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<BackendEvent>, CrateError> {
        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as i64,
            tv_nsec: t.subsec_nanos() as i64,
        });
        let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |ts| ts as *const _);

        let mut raw: [libc::kevent; 256] = unsafe { std::mem::zeroed() };
        let n = check(unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                raw.as_mut_ptr(),
                raw.len() as i32,
                ts_ptr,
            )
        })?;

        let mut out = Vec::with_capacity(n as usize);
        for event in &raw[..n as usize] {
            if event.filter == libc::EVFILT_USER {
                out.push(BackendEvent { token: WAKER_TOKEN, data: CompletionData::WakeUp });
                continue;
            }
            if event.filter == libc::EVFILT_TIMER {
                out.push(BackendEvent {
                    token: Token(event.ident as usize),
                    data: CompletionData::Timeout,
                });
                continue;
            }
            if event.filter == libc::EVFILT_PROC {
                let pid = event.ident as libc::pid_t;
                if let Some(token) = self.pids.remove(&pid) {
                    out.push(BackendEvent {
                        token,
                        data: CompletionData::ProcessExit { exit_code: event.data as i32 },
                    });
                }
                continue;
            }
            out.push(BackendEvent { token: Token(event.ident as usize), data: CompletionData::Ready });
        }
        Ok(out)
    }

    fn needs_submission_when_reactivating(&self) -> bool {
        false
    }

    fn waker_token(&self) -> Token {
        WAKER_TOKEN
    }

    fn wake(&self) -> Result<(), CrateError> {
        self.apply(&[kevent(
            WAKER_IDENT as libc::uintptr_t,
            libc::EVFILT_USER,
            libc::EV_ADD,
            libc::NOTE_TRIGGER as u32,
        )])
    }
}

impl std::fmt::Debug for KqueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KqueueBackend")
            .field("kq", &self.kq.as_raw_fd())
            .finish()
    }
}

fn check(ret: libc::c_int) -> Result<libc::c_int, CrateError> {
    if ret < 0 {
        Err(CrateError::Io(std::io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}
