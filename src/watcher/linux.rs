//! Real `inotify`-backed folder watching.
//!
//! Grounded on `original_source/Libraries/FileSystemWatcher/FileSystemWatcher.cpp`'s
//! recursive-watch comment ("recursive watching is simulated by adding a
//! watch descriptor per subdirectory on the fly"): `inotify` only ever
//! watches the directories it's told to, so a new subdirectory appearing
//! under an already-watched one is caught via `IN_CREATE` and immediately
//! handed its own watch descriptor.
//!
//! [`Runner::Thread`](super::Runner::Thread) keeps a dedicated background
//! thread blocking in `libc::poll` over the inotify fd (the original's
//! `ThreadRunner`). [`Runner::EventLoop`](super::Runner::EventLoop) instead
//! registers the same inotify fd with `EventLoop::add_file_poll`, so its
//! notifications flow through the same request/completion machinery as
//! every other request type, with no dedicated thread at all.

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::CrateError;
use crate::event_loop::{EventLoop, RequestHandle};
use crate::request::CompletionData;

use super::{Notification, Operation, Sink};

const EVENT_HEADER: usize = std::mem::size_of::<libc::inotify_event>();
const READ_BUF_LEN: usize = 16 * (EVENT_HEADER + 256);

const WATCH_MASK: u32 = (libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_DELETE_SELF
    | libc::IN_MODIFY
    | libc::IN_ATTRIB
    | libc::IN_CLOSE_WRITE
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO) as u32;

fn check(ret: RawFd) -> Result<RawFd, CrateError> {
    if ret < 0 {
        Err(CrateError::Io(std::io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}

pub(crate) struct InotifyFolder {
    /// Owned by this struct only on the `Runner::EventLoop` path, where
    /// nothing else holds the fd; on `Runner::Thread` the spawned thread
    /// owns it instead (see `run`'s `inotify: OwnedFd` parameter).
    inotify: Option<OwnedFd>,
    stop: Option<Arc<StopEvent>>,
    join: Option<JoinHandle<()>>,
    /// The live `add_file_poll` registration, present only on the
    /// event-loop-driven path. Dropping it does not deregister the request
    /// from the event loop's slab (there's no reachable `&mut EventLoop` from
    /// `Drop`); closing `inotify` below deregisters it at the kernel level,
    /// which is enough to stop notifications, but the loop's slab slot and
    /// `active_count` are only reclaimed when the loop itself next tears the
    /// request down. Recorded as an accepted limitation in DESIGN.md.
    _request: Option<RequestHandle>,
}

struct StopEvent {
    fd: OwnedFd,
    requested: AtomicBool,
}

impl StopEvent {
    fn new() -> Result<StopEvent, CrateError> {
        let fd = unsafe { check(libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))? };
        Ok(StopEvent {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            requested: AtomicBool::new(false),
        })
    }

    fn signal(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            let one: u64 = 1;
            unsafe {
                libc::write(self.fd.as_raw_fd(), (&one as *const u64).cast(), 8);
            }
        }
    }
}

impl InotifyFolder {
    /// Starts a dedicated background thread blocking in `libc::poll` over
    /// the inotify fd (`Runner::Thread`).
    pub(crate) fn start(base_path: &Path, sink: Sink) -> Result<InotifyFolder, CrateError> {
        let inotify_fd = unsafe { check(libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC))? };
        let inotify = unsafe { OwnedFd::from_raw_fd(inotify_fd) };
        let stop = Arc::new(StopEvent::new()?);
        let mut watches = WatchTable::new(inotify_fd);
        watches.add_recursive(base_path)?;

        let base_path = base_path.to_path_buf();
        let thread_stop = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name("filesystem-watcher".into())
            .spawn(move || run(base_path, inotify, watches, sink, thread_stop))
            .map_err(|e| CrateError::Io(std::io::Error::other(e)))?;

        Ok(InotifyFolder {
            inotify: None,
            stop: Some(stop),
            join: Some(join),
            _request: None,
        })
    }

    /// Registers the inotify fd with `event_loop` via `add_file_poll`
    /// instead of spawning a thread (`Runner::EventLoop` on Linux).
    pub(crate) fn start_on_event_loop(
        base_path: &Path,
        event_loop: &mut EventLoop,
        mut on_change: Box<dyn FnMut(Notification) + Send>,
    ) -> Result<InotifyFolder, CrateError> {
        let inotify_fd = unsafe { check(libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC))? };
        let inotify = unsafe { OwnedFd::from_raw_fd(inotify_fd) };
        let mut watches = WatchTable::new(inotify_fd);
        watches.add_recursive(base_path)?;

        let base_path = base_path.to_path_buf();
        let handle = event_loop.add_file_poll(inotify_fd, move |data| {
            if matches!(data, CompletionData::FilePoll) {
                drain_and_dispatch(inotify_fd, &base_path, &mut watches, &mut |n| on_change(n));
            }
        })?;

        Ok(InotifyFolder {
            inotify: Some(inotify),
            stop: None,
            join: None,
            _request: Some(handle),
        })
    }
}

impl Drop for InotifyFolder {
    fn drop(&mut self) {
        if let Some(stop) = &self.stop {
            stop.signal();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        // Dropping `self.inotify` (event-loop path) closes the fd, which
        // deregisters it from the kernel backend; the event loop's own slab
        // slot for the `add_file_poll` request is reclaimed lazily, see the
        // `_request` field doc.
    }
}

struct WatchTable {
    inotify: RawFd,
    by_wd: HashMap<i32, PathBuf>,
}

impl WatchTable {
    fn new(inotify: RawFd) -> WatchTable {
        WatchTable { inotify, by_wd: HashMap::new() }
    }

    fn add(&mut self, absolute: &Path, relative: &Path) -> Result<(), CrateError> {
        let c_path = std::ffi::CString::new(absolute.as_os_str().as_encoded_bytes())
            .map_err(|_| CrateError::InvalidState("watch path contains a NUL byte"))?;
        let wd = unsafe { check(libc::inotify_add_watch(self.inotify, c_path.as_ptr(), WATCH_MASK))? };
        self.by_wd.insert(wd, relative.to_path_buf());
        Ok(())
    }

    /// Adds `base_path` itself plus every subdirectory under it, relative
    /// paths stored as the key for notifications.
    fn add_recursive(&mut self, base_path: &Path) -> Result<(), CrateError> {
        self.add(base_path, Path::new(""))?;
        let mut stack = vec![base_path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    let relative = path.strip_prefix(base_path).unwrap_or(&path).to_path_buf();
                    self.add(&path, &relative)?;
                    stack.push(path);
                }
            }
        }
        Ok(())
    }

    fn relative_for(&self, wd: i32) -> Option<&Path> {
        self.by_wd.get(&wd).map(|p| p.as_path())
    }
}

fn classify(mask: u32) -> Operation {
    if mask & (libc::IN_CREATE | libc::IN_DELETE | libc::IN_MOVED_FROM | libc::IN_MOVED_TO | libc::IN_DELETE_SELF) != 0 {
        Operation::AddRemoveRename
    } else {
        Operation::Modified
    }
}

/// Reads and dispatches every pending inotify event, looping until `EAGAIN`.
///
/// The thread-based `run` below only reads once per `libc::poll` wakeup,
/// which is safe under level-triggered `poll(2)` (it will simply report
/// readable again next iteration if anything was left unread). The
/// event-loop-driven path registers this fd edge-triggered (every backend
/// registers `EPOLLET`/`EV_CLEAR`), so a single read per wakeup could miss
/// events still buffered in the kernel; looping to `EAGAIN` here keeps both
/// callers correct with one implementation.
fn drain_and_dispatch(inotify: RawFd, base_path: &Path, watches: &mut WatchTable, deliver: &mut dyn FnMut(Notification)) {
    let mut buf = [0u8; READ_BUF_LEN];
    loop {
        let n = unsafe { libc::read(inotify, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            return;
        }

        let mut offset = 0usize;
        let mut new_dirs = Vec::new();
        while offset + EVENT_HEADER <= n as usize {
            let event = unsafe { &*(buf.as_ptr().add(offset) as *const libc::inotify_event) };
            let name_len = event.len as usize;
            let name = if name_len > 0 {
                let name_bytes = &buf[offset + EVENT_HEADER..offset + EVENT_HEADER + name_len];
                match CStr::from_bytes_until_nul(name_bytes) {
                    Ok(cstr) => Some(cstr.to_string_lossy().into_owned()),
                    Err(_) => None,
                }
            } else {
                None
            };

            if let Some(parent_relative) = watches.relative_for(event.wd).map(Path::to_path_buf) {
                let relative_path = match &name {
                    Some(name) => parent_relative.join(name),
                    None => parent_relative.clone(),
                };

                let is_new_dir = event.mask & libc::IN_CREATE != 0 && event.mask & libc::IN_ISDIR as u32 != 0;
                if is_new_dir {
                    new_dirs.push(relative_path.clone());
                }

                deliver(Notification {
                    base_path: base_path.to_path_buf(),
                    relative_path,
                    operation: classify(event.mask),
                });
            }

            offset += EVENT_HEADER + name_len;
        }

        for relative in new_dirs {
            let absolute = base_path.join(&relative);
            let _ = watches.add(&absolute, &relative);
        }
    }
}

fn run(base_path: PathBuf, inotify: OwnedFd, mut watches: WatchTable, mut sink: Sink, stop: Arc<StopEvent>) {
    loop {
        let mut poll_fds = [
            libc::pollfd { fd: inotify.as_raw_fd(), events: libc::POLLIN, revents: 0 },
            libc::pollfd { fd: stop.fd.as_raw_fd(), events: libc::POLLIN, revents: 0 },
        ];
        let ready = unsafe { libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, -1) };
        if ready <= 0 {
            continue;
        }
        if poll_fds[1].revents != 0 {
            return;
        }
        if poll_fds[0].revents == 0 {
            continue;
        }

        drain_and_dispatch(inotify.as_raw_fd(), &base_path, &mut watches, &mut |n| sink.deliver(n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_create_as_add_remove_rename() {
        assert_eq!(classify(libc::IN_CREATE as u32), Operation::AddRemoveRename);
        assert_eq!(classify(libc::IN_MODIFY as u32), Operation::Modified);
    }
}
