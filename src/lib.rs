//! Single-threaded asynchronous I/O event loop with buffer-pooled streams
//! and a hot-reloadable native plugin registry.
//!
//! The crate is organized leaves-first, mirroring the dependency order of
//! the subsystems it implements:
//!
//! - [`threadpool`] — fixed worker pool used as a fallback for operations
//!   the chosen kernel backend cannot perform asynchronously.
//! - [`backend`] / [`token`] / [`request`] — the per-OS kernel abstraction
//!   and the typed request family it drives.
//! - [`event_loop`] — the request lifecycle state machine tying the two
//!   together.
//! - [`buffers`] — the reference-counted buffer pool streams are built on.
//! - [`stream`] — readable/writable/duplex/transform streams and the
//!   [`stream::Pipeline`] that wires them together with back-pressure.
//! - [`watcher`] — file-system change notifications, themselves delivered
//!   through the event loop.
//! - [`plugin`] — scans, compiles and hot-reloads native dynamic libraries.
//!
//! See `DESIGN.md` in the repository root for how each module is grounded
//! in prior art.

pub mod backend;
pub mod buffers;
pub mod error;
pub mod event_loop;
mod io_ops;
pub mod plugin;
pub mod request;
pub mod stream;
pub mod threadpool;
pub mod token;
pub mod watcher;

pub use buffers::{BufferPool, BufferView};
pub use error::{CrateError, Result};
pub use event_loop::{EventLoop, EventLoopConfig, RequestHandle, WakeHandle};
pub use plugin::{LoadMode, PluginDefinition, PluginRegistry, PluginScanner};
pub use request::{CompletionData, RequestKind, RequestState};
pub use stream::{Duplex, IoKind, Pipeline, ReadableStream, RequestSink, RequestSource, TransformStream, WritableStream};
pub use threadpool::{ThreadPool, ThreadPoolConfig};
pub use token::Token;
pub use watcher::{FileSystemWatcher, FolderWatcher, Notification, Operation, Runner};
