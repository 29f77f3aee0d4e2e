//! Bridges a raw file/socket descriptor into the stream layer by issuing
//! read/write requests against an [`EventLoop`] and handing the resulting
//! [`BufferView`]s to a [`ReadableStream`]/[`WritableStream`].
//!
//! This is the "RequestStream adapter" named in the crate layout: streams
//! themselves know nothing about descriptors or the event loop, only about
//! buffers and back-pressure, exactly like the original's
//! `AsyncReadableStream` taking a `Function<Result()> asyncRead` rather than
//! owning a file handle directly. [`RequestSource`] drains a readable fd one
//! chunk at a time; [`RequestSink`] is its mirror image for a writable one.

use crate::buffers::{BufferPool, BufferView};
use crate::error::CrateError;
use crate::event_loop::EventLoop;
use crate::request::CompletionData;

/// Whether a [`RequestSource`]/[`RequestSink`] drives a plain file
/// descriptor or a socket — the two differ only in which `RequestKind`
/// variant they submit, since both are readiness-only at the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    File,
    Socket,
}

/// Issues one `FileRead`/`SocketReceive` request per call to
/// [`RequestSource::read_once`], delivering the resulting bytes (or EOF,
/// signalled by a zero-length buffer) to the supplied callback.
pub struct RequestSource {
    fd: i32,
    kind: IoKind,
    pool: BufferPool,
}

impl RequestSource {
    pub fn new(fd: i32, kind: IoKind, pool: BufferPool) -> RequestSource {
        RequestSource { fd, kind, pool }
    }

    /// Submits a single read against `event_loop`, invoking `on_data` with
    /// the bytes received (an empty buffer means end-of-stream) once it
    /// completes.
    pub fn read_once(
        &self,
        event_loop: &mut EventLoop,
        on_data: impl FnOnce(Result<BufferView, CrateError>) + 'static,
    ) -> Result<(), CrateError> {
        let buffer = self.pool.acquire()?;
        let returned_buffer = buffer.clone();
        let mut on_data = Some(on_data);
        let callback = move |data: CompletionData| {
            let Some(callback) = on_data.take() else {
                return;
            };
            match data {
                CompletionData::FileRead { .. } | CompletionData::SocketReceive { .. } => {
                    callback(Ok(returned_buffer.clone()));
                }
                CompletionData::Err(err) => callback(Err(CrateError::Io(err))),
                CompletionData::Cancelled => callback(Err(CrateError::Cancelled)),
                _ => {}
            }
        };
        match self.kind {
            IoKind::File => event_loop.add_file_read(self.fd, buffer, callback)?,
            IoKind::Socket => event_loop.add_socket_receive(self.fd, buffer, callback)?,
        };
        Ok(())
    }
}

/// Issues one `FileWrite`/`SocketSend` request per call to
/// [`RequestSink::write_once`], writing as many bytes of `buffer` as the fd
/// accepts in one `write(2)` and reporting the count back.
pub struct RequestSink {
    fd: i32,
    kind: IoKind,
}

impl RequestSink {
    pub fn new(fd: i32, kind: IoKind) -> RequestSink {
        RequestSink { fd, kind }
    }

    /// Submits a single write of `buffer` against `event_loop`, invoking
    /// `on_written` with the number of bytes actually accepted once the fd
    /// reports writable.
    pub fn write_once(
        &self,
        event_loop: &mut EventLoop,
        buffer: BufferView,
        on_written: impl FnOnce(Result<usize, CrateError>) + 'static,
    ) -> Result<(), CrateError> {
        let mut on_written = Some(on_written);
        let callback = move |data: CompletionData| {
            let Some(callback) = on_written.take() else {
                return;
            };
            match data {
                CompletionData::FileWrite { bytes_written } | CompletionData::SocketSend { bytes_written } => {
                    callback(Ok(bytes_written))
                }
                CompletionData::Err(err) => callback(Err(CrateError::Io(err))),
                CompletionData::Cancelled => callback(Err(CrateError::Cancelled)),
                _ => {}
            }
        };
        match self.kind {
            IoKind::File => event_loop.add_file_write(self.fd, buffer, callback)?,
            IoKind::Socket => event_loop.add_socket_send(self.fd, buffer, callback)?,
        };
        Ok(())
    }
}
