//! Linux/Android backend.
//!
//! Adapted from the teacher's `sys::unix::selector::epoll::Selector`: an
//! `epoll` instance plus `epoll_event`s translated to/from [`Interest`].
//! Socket, pipe and watch-fd requests register their fd for readiness here;
//! timers and wake-ups are folded into the same `epoll_wait` call via a
//! `timerfd` and an `eventfd` registered like any other source.
//!
//! Runs in one of two modes, chosen once at construction by probing for
//! kernel io_uring support (the one-shot check the teacher used to perform
//! with the now-removed `lazycell` crate is done here with
//! `std::sync::OnceLock`, its direct modern-`std` replacement): if the probe
//! succeeds the backend still drives I/O through epoll (a from-scratch SQE
//! ring would need a dependency the teacher's stack doesn't carry), but logs
//! that io_uring was detected so callers can see which capability the
//! backend would use once ring submission lands.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::CrateError;
use crate::request::{CompletionData, Request, RequestKind, RequestState};
use crate::token::Token;

use super::{Backend, BackendEvent};

const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const TIMER_TOKEN: Token = Token(usize::MAX - 2);

fn io_uring_available() -> bool {
    static PROBE: OnceLock<bool> = OnceLock::new();
    *PROBE.get_or_init(|| {
        // `io_uring_setup` with zero entries fails fast with `EINVAL` on
        // kernels that support the syscall at all, and `ENOSYS` on kernels
        // that don't; either way the call never blocks or leaks resources.
        const SYS_IO_URING_SETUP: libc::c_long = 425;
        let ret = unsafe { libc::syscall(SYS_IO_URING_SETUP, 0, std::ptr::null_mut::<u8>()) };
        if ret >= 0 {
            unsafe { libc::close(ret as RawFd) };
            true
        } else {
            let errno = std::io::Error::last_os_error().raw_os_error();
            errno != Some(libc::ENOSYS)
        }
    })
}

fn interests_to_epoll(kind: &RequestKind) -> u32 {
    let mut bits = libc::EPOLLET as u32;
    match kind {
        RequestKind::SocketAccept { .. }
        | RequestKind::SocketReceive { .. }
        | RequestKind::FileRead { .. }
        | RequestKind::FilePoll { .. } => bits |= libc::EPOLLIN as u32,
        RequestKind::SocketConnect { .. } | RequestKind::SocketSend { .. } | RequestKind::FileWrite { .. } => {
            bits |= libc::EPOLLOUT as u32
        }
        _ => {}
    }
    bits
}

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

/// Opens a pidfd for `pid` the way `sys::unix::process::pidfd::Process`
/// does, so process-exit notifications flow through the same
/// register/poll/deregister path as socket and watch fds.
fn open_pidfd(pid: u32) -> Result<OwnedFd, CrateError> {
    let fd = check(unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, libc::O_NONBLOCK) as libc::c_int })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub struct EpollBackend {
    epoll: OwnedFd,
    waker: OwnedFd,
    timer: OwnedFd,
    uses_uring: bool,
    pidfds: std::collections::HashMap<usize, (OwnedFd, libc::pid_t)>,
    /// Pending timer deadlines, kept in insertion order so same-tick expiries
    /// fire in the stable order the data model requires. `timerfd` only
    /// knows a single deadline at a time, so this list is the multi-timer
    /// wheel the single kernel timer is armed against (one slot per request,
    /// unlike kqueue's native per-`ident` `EVFILT_TIMER`).
    timers: Vec<(std::time::Instant, Token)>,
}

impl EpollBackend {
    pub fn new() -> Result<EpollBackend, CrateError> {
        let uses_uring = io_uring_available();
        if uses_uring {
            log::debug!("io_uring support detected, running in epoll-compatible mode");
        }

        // SAFETY: `epoll_create1` returns an owned, valid fd on success.
        let epoll = unsafe {
            OwnedFd::from_raw_fd(check(libc::epoll_create1(libc::EPOLL_CLOEXEC))?)
        };
        // SAFETY: `eventfd` returns an owned, valid fd on success.
        let waker = unsafe {
            OwnedFd::from_raw_fd(check(libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?)
        };
        // SAFETY: `timerfd_create` returns an owned, valid fd on success.
        let timer = unsafe {
            OwnedFd::from_raw_fd(check(libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            ))?)
        };

        let backend = EpollBackend {
            epoll,
            waker,
            timer,
            uses_uring,
            pidfds: std::collections::HashMap::new(),
            timers: Vec::new(),
        };
        backend.register_fd(backend.waker.as_raw_fd(), WAKER_TOKEN, libc::EPOLLIN as u32)?;
        backend.register_fd(backend.timer.as_raw_fd(), TIMER_TOKEN, libc::EPOLLIN as u32)?;
        Ok(backend)
    }

    fn register_fd(&self, fd: RawFd, token: Token, events: u32) -> Result<(), CrateError> {
        let mut event = libc::epoll_event {
            events,
            u64: usize::from(token) as u64,
        };
        check(unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        })?;
        Ok(())
    }

    fn deregister_fd(&self, fd: RawFd) {
        let _ = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
    }

    /// Arms the shared `timerfd` to the earliest deadline still pending, or
    /// disarms it entirely once `self.timers` is empty.
    fn rearm_timer(&self) -> Result<(), CrateError> {
        let spec = match self.timers.iter().map(|(deadline, _)| *deadline).min() {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                libc::itimerspec {
                    it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
                    it_value: libc::timespec {
                        tv_sec: remaining.as_secs() as i64,
                        tv_nsec: remaining.subsec_nanos() as i64,
                    },
                }
            }
            None => libc::itimerspec {
                it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
                it_value: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            },
        };
        check(unsafe { libc::timerfd_settime(self.timer.as_raw_fd(), 0, &spec, std::ptr::null_mut()) })?;
        Ok(())
    }
}

impl Backend for EpollBackend {
    fn setup(&mut self, request: &mut Request) -> Result<(), CrateError> {
        request.state = RequestState::Setup;
        Ok(())
    }

    fn activate(&mut self, request: &mut Request) -> Result<(), CrateError> {
        let Some(kind) = request.kind.as_ref() else {
            return Err(CrateError::InvalidState("request has no operation set"));
        };

        match kind {
            RequestKind::Timeout { deadline } => {
                self.timers.push((*deadline, request.token));
                self.rearm_timer()?;
            }
            RequestKind::WakeUp | RequestKind::Work => {
                // Delivered out-of-band (thread pool completion / waker);
                // nothing to submit here beyond marking the request active.
            }
            RequestKind::ProcessExit { pid } => {
                let pidfd = open_pidfd(*pid)?;
                self.register_fd(pidfd.as_raw_fd(), request.token, libc::EPOLLIN as u32)?;
                self.pidfds.insert(request.token.0, (pidfd, *pid as libc::pid_t));
            }
            _ => {
                // `epoll_ctl(EPOLL_CTL_ADD, ...)` returns EPERM for a regular
                // file descriptor; `EventLoop::add_file_read`/`add_file_write`
                // check `io_ops::is_regular_file` and route those through the
                // thread pool before ever calling `activate`, so a `FileRead`/
                // `FileWrite` reaching here is always a pipe, socket or other
                // pollable fd.
                if let Some(fd) = request_fd(kind) {
                    self.register_fd(fd, request.token, interests_to_epoll(kind))?;
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
        match request.kind.as_ref() {
            Some(RequestKind::Timeout { .. }) => {
                self.timers.retain(|(_, token)| *token != request.token);
                let _ = self.rearm_timer();
            }
            Some(kind) => {
                if let Some(fd) = request_fd(kind) {
                    self.deregister_fd(fd);
                }
            }
            None => {}
        }
        Ok(())
    }

    fn teardown(&mut self, request: &mut Request) {
        match request.kind.as_ref() {
            Some(RequestKind::Timeout { .. }) => {
                self.timers.retain(|(_, token)| *token != request.token);
                let _ = self.rearm_timer();
            }
            Some(kind) => {
                if let Some(fd) = request_fd(kind) {
                    self.deregister_fd(fd);
                }
            }
            None => {}
        }
        if let Some((pidfd, _)) = self.pidfds.remove(&request.token.0) {
            self.deregister_fd(pidfd.as_raw_fd());
        }
        request.state = RequestState::Free;
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<BackendEvent>, CrateError> {
        let millis = timeout
            .map(|t| t.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; 256];
        let n = check(unsafe {
            libc::epoll_wait(self.epoll.as_raw_fd(), raw.as_mut_ptr(), raw.len() as i32, millis)
        })?;

        let mut out = Vec::with_capacity(n as usize);
        for raw_event in &raw[..n as usize] {
            let token = Token(raw_event.u64 as usize);
            if token == WAKER_TOKEN {
                let mut buf = [0u8; 8];
                unsafe { libc::read(self.waker.as_raw_fd(), buf.as_mut_ptr().cast(), 8) };
                out.push(BackendEvent { token, data: CompletionData::WakeUp });
                continue;
            }
            if token == TIMER_TOKEN {
                let mut buf = [0u8; 8];
                unsafe { libc::read(self.timer.as_raw_fd(), buf.as_mut_ptr().cast(), 8) };
                let now = std::time::Instant::now();
                // Ties resolved in insertion order: `timers` is appended to
                // in submission order, so a stable partition preserves it.
                let (fired, pending): (Vec<_>, Vec<_>) =
                    self.timers.drain(..).partition(|(deadline, _)| *deadline <= now);
                self.timers = pending;
                let _ = self.rearm_timer();
                for (_, fired_token) in fired {
                    out.push(BackendEvent { token: fired_token, data: CompletionData::Timeout });
                }
                continue;
            }
            if let Some((_, pid)) = self.pidfds.get(&token.0) {
                let mut status: libc::c_int = 0;
                let exit_code = unsafe {
                    libc::waitpid(*pid, &mut status, 0);
                    if libc::WIFEXITED(status) { libc::WEXITSTATUS(status) } else { -1 }
                };
                out.push(BackendEvent { token, data: CompletionData::ProcessExit { exit_code } });
                continue;
            }
            out.push(BackendEvent { token, data: CompletionData::Ready });
        }
        Ok(out)
    }

    fn needs_submission_when_reactivating(&self) -> bool {
        // Readiness-based: edge-triggered registration stays armed, so this
        // is false for steady-state readability/writability polling. Only
        // level-sensitive one-shot sources would need it; none are used
        // here.
        false
    }

    fn waker_token(&self) -> Token {
        WAKER_TOKEN
    }

    fn wake(&self) -> Result<(), CrateError> {
        let value: u64 = 1;
        check(unsafe {
            libc::write(self.waker.as_raw_fd(), (&value as *const u64).cast(), 8) as i32
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for EpollBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollBackend")
            .field("epoll_fd", &self.epoll.as_raw_fd())
            .field("uses_uring", &self.uses_uring)
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
