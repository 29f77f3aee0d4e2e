//! Per-folder file-system change notifications.
//!
//! Grounded on `original_source/Libraries/FileSystemWatcher/FileSystemWatcher.h`:
//! one [`FileSystemWatcher`] owns any number of [`FolderWatcher`]s, each
//! watching one directory and delivering [`Notification`]s that carry the
//! base watched path, a path relative to it, and a coarse
//! [`Operation`] (the original's "changes are grouped in two categories").
//!
//! Two delivery modes, matching the original's `ThreadRunner` /
//! `EventLoopRunner`:
//! - [`Runner::Thread`]: a dedicated background watcher thread invokes the
//!   user callback directly. Per the original's documented contract, the
//!   caller is responsible for synchronising their own state.
//! - [`Runner::EventLoop`]: notifications flow through the same
//!   request/completion machinery as every other request type, driven by
//!   the `&mut EventLoop` the caller passes to
//!   [`FileSystemWatcher::watch`]. On Linux this is literal: the inotify fd
//!   is registered with `EventLoop::add_file_poll` and no thread is spawned
//!   at all. Platforms without a cheap single-fd kernel primitive reachable
//!   from this crate's dependency stack (FSEvents needs CoreServices
//!   bindings; `ReadDirectoryChangesW` needs an IOCP association the
//!   generic `Backend` trait doesn't expose) fall back to a background
//!   thread that polls a directory snapshot and only enqueues notifications
//!   plus signals a [`crate::event_loop::WakeHandle`]; the callback itself
//!   still runs later, on the loop thread, inside
//!   [`FileSystemWatcher::dispatch_pending`] — the same "batched
//!   notifications marshaled onto the loop thread" shape the original's
//!   macOS `EventLoopRunner` uses for its FSEvents stream.
//!
//! [`Runner::Thread`] always uses a dedicated thread regardless of
//! platform, since the original's `ThreadRunner` is documented to deliver
//! notifications off the caller's thread by design. On Linux that thread
//! (like the `EventLoop`-driven path) blocks on real `inotify` reads
//! (`libc::inotify_add_watch`/`read`); elsewhere it polls a directory
//! snapshot, diffing entries to synthesize the same `Notification`
//! contract. Recorded as a deliberate simplification in `DESIGN.md`.

mod linux;
mod poll_backend;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::CrateError;
use crate::event_loop::{EventLoop, WakeHandle};

/// Coarse classification of a file-system change, matching the original's
/// "changes are grouped in two categories" design (precise add/remove/
/// rename/modify distinctions aren't consistent across platforms).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// A file or directory's contents and/or timestamp changed.
    Modified,
    /// A file or directory was added, removed, or renamed.
    AddRemoveRename,
}

/// One change notification.
#[derive(Debug, Clone)]
pub struct Notification {
    /// The directory passed to [`FileSystemWatcher::watch`].
    pub base_path: PathBuf,
    /// Path of the changed entry, relative to `base_path`.
    pub relative_path: PathBuf,
    pub operation: Operation,
}

impl Notification {
    /// Full (absolute) path of the changed entry.
    pub fn full_path(&self) -> PathBuf {
        self.base_path.join(&self.relative_path)
    }
}

/// Which thread a [`FolderWatcher`]'s callback runs on.
pub enum Runner<'a> {
    /// Invoke the callback directly from the watcher's background thread.
    Thread,
    /// Drive notifications through `event_loop`'s own request machinery. On
    /// Linux this registers the inotify fd via `add_file_poll` with no
    /// thread involved; elsewhere a background thread queues notifications
    /// and wakes the loop, with the callback itself running later from
    /// [`FileSystemWatcher::dispatch_pending`].
    EventLoop(&'a mut EventLoop),
}

pub(crate) type Queue = Arc<Mutex<VecDeque<Notification>>>;

/// Backend-specific per-folder state.
enum Backend {
    Linux(linux::InotifyFolder),
    Poll(poll_backend::PollFolder),
}

/// A single watched directory, returned by [`FileSystemWatcher::watch`].
pub struct FolderWatcher {
    base_path: PathBuf,
    backend: Backend,
}

impl FolderWatcher {
    /// Stops watching this folder and releases its background thread /
    /// kernel resources. Also implied by `Drop`.
    pub fn stop_watching(self) {
        drop(self);
    }

    pub fn path(&self) -> &Path {
        &self.base_path
    }
}

struct EventLoopSink {
    queue: Queue,
    on_change: Box<dyn FnMut(Notification) + Send>,
}

/// Owns zero or more [`FolderWatcher`]s plus the pending-notification queues
/// for any of them opened with [`Runner::EventLoop`].
#[derive(Default)]
pub struct FileSystemWatcher {
    /// Whether relative paths are normalised to forward slashes regardless
    /// of host convention (§6: "forward-slash-normalised when the caller
    /// sets `forwardSlashes = true`").
    pub forward_slashes: bool,
    event_loop_sinks: Vec<EventLoopSink>,
}

impl FileSystemWatcher {
    pub fn new() -> FileSystemWatcher {
        FileSystemWatcher {
            forward_slashes: false,
            event_loop_sinks: Vec::new(),
        }
    }

    /// Starts watching `path` for changes.
    ///
    /// With [`Runner::Thread`], `on_change` is invoked directly from the
    /// background watcher thread. With [`Runner::EventLoop`], `on_change`
    /// is retained by `self` and only invoked later, from
    /// [`FileSystemWatcher::dispatch_pending`].
    pub fn watch(
        &mut self,
        path: impl AsRef<Path>,
        runner: Runner<'_>,
        on_change: impl FnMut(Notification) + Send + 'static,
    ) -> Result<FolderWatcher, CrateError> {
        let base_path = path.as_ref().to_path_buf();
        let forward_slashes = self.forward_slashes;

        match runner {
            Runner::Thread => {
                let on_change = wrap_forward_slashes(forward_slashes, on_change);
                let backend = start_backend(&base_path, Sink::Direct(Box::new(on_change)))?;
                Ok(FolderWatcher { base_path, backend })
            }
            #[cfg(all(unix, any(target_os = "linux", target_os = "android")))]
            Runner::EventLoop(event_loop) => {
                let on_change = wrap_forward_slashes(forward_slashes, on_change);
                let folder = linux::InotifyFolder::start_on_event_loop(&base_path, event_loop, Box::new(on_change))?;
                Ok(FolderWatcher { base_path, backend: Backend::Linux(folder) })
            }
            #[cfg(not(all(unix, any(target_os = "linux", target_os = "android"))))]
            Runner::EventLoop(event_loop) => {
                let handle = event_loop.wake_handle();
                let queue: Queue = Arc::new(Mutex::new(VecDeque::new()));
                let backend = start_backend(&base_path, Sink::Queued(Arc::clone(&queue), handle))?;
                self.event_loop_sinks.push(EventLoopSink {
                    queue,
                    on_change: Box::new(wrap_forward_slashes(forward_slashes, on_change)),
                });
                Ok(FolderWatcher { base_path, backend })
            }
        }
    }

    /// Drains every [`Runner::EventLoop`] folder's pending notifications
    /// and invokes their callbacks. Call this from the loop thread, e.g.
    /// from an [`crate::event_loop::EventLoop::add_work`] completion or a
    /// periodic timer — mirrors the original's "marshal batched
    /// notifications onto the loop thread" behaviour.
    ///
    /// A no-op for any watcher whose notifications already flow through
    /// `EventLoop`'s own request callbacks (Linux's `add_file_poll`-backed
    /// `Runner::EventLoop`, which never populates `event_loop_sinks`).
    pub fn dispatch_pending(&mut self) {
        for sink in &mut self.event_loop_sinks {
            let drained: Vec<_> = sink.queue.lock().unwrap().drain(..).collect();
            for notification in drained {
                (sink.on_change)(notification);
            }
        }
    }
}

/// Where a backend should send notifications.
pub(crate) enum Sink {
    Direct(Box<dyn FnMut(Notification) + Send>),
    Queued(Queue, WakeHandle),
}

impl Sink {
    pub(crate) fn deliver(&mut self, notification: Notification) {
        match self {
            Sink::Direct(callback) => callback(notification),
            Sink::Queued(queue, wake) => {
                queue.lock().unwrap().push_back(notification);
                let _ = wake.wake();
            }
        }
    }
}

fn wrap_forward_slashes(
    forward_slashes: bool,
    mut on_change: impl FnMut(Notification) + Send + 'static,
) -> impl FnMut(Notification) + Send + 'static {
    move |mut notification: Notification| {
        if forward_slashes {
            let normalised: String = notification
                .relative_path
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            notification.relative_path = PathBuf::from(normalised);
        }
        on_change(notification);
    }
}

#[cfg(all(unix, any(target_os = "linux", target_os = "android")))]
fn start_backend(base_path: &Path, sink: Sink) -> Result<Backend, CrateError> {
    linux::InotifyFolder::start(base_path, sink).map(Backend::Linux)
}

#[cfg(not(all(unix, any(target_os = "linux", target_os = "android"))))]
fn start_backend(base_path: &Path, sink: Sink) -> Result<Backend, CrateError> {
    poll_backend::PollFolder::start(base_path, sink, Duration::from_millis(200)).map(Backend::Poll)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_full_path_joins_base_and_relative() {
        let n = Notification {
            base_path: PathBuf::from("/tmp/project"),
            relative_path: PathBuf::from("src/main.rs"),
            operation: Operation::Modified,
        };
        assert_eq!(n.full_path(), PathBuf::from("/tmp/project/src/main.rs"));
    }
}
