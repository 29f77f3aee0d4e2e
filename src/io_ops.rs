//! Raw syscalls behind a ready fd, shared by every readiness-based backend.
//!
//! `epoll`/`kqueue` only ever report "this fd is ready"; turning that into
//! the rich [`CompletionData`] the request family promises (bytes read, EOF,
//! disconnected, an accepted fd, ...) is the same handful of syscalls
//! regardless of which backend reported the readiness, so it lives here once
//! instead of being duplicated per backend.

use crate::buffers::BufferView;
use crate::request::{CompletionData, Request, RequestKind};

/// Runs the syscall `request.kind` implies now that its fd is ready,
/// producing the [`CompletionData`] its callback will see.
///
/// Called from [`crate::backend::Backend::complete_async`]'s default body.
/// Kinds with no readiness-driven syscall (`Timeout`, `WakeUp`, `Work`,
/// `ProcessExit`, `SocketClose`, `FileClose`, `FileSystemOp`) never reach
/// here; they're completed elsewhere in `EventLoop` before a backend is ever
/// involved.
pub(crate) fn complete_readiness(request: &mut Request) -> CompletionData {
    let Some(kind) = request.kind.as_ref() else {
        return CompletionData::Err(std::io::Error::other("request has no operation set"));
    };
    match kind {
        RequestKind::SocketAccept { fd } => match accept_fd(*fd) {
            Ok(accepted) => CompletionData::SocketAccept { fd: accepted },
            Err(err) => CompletionData::Err(err),
        },
        RequestKind::SocketConnect { fd } => match connect_status(*fd) {
            Ok(()) => CompletionData::SocketConnect,
            Err(err) => CompletionData::Err(err),
        },
        RequestKind::SocketSend { fd, buffer } | RequestKind::FileWrite { fd, buffer } => {
            match write_fd(*fd, buffer) {
                Ok(bytes_written) => match kind {
                    RequestKind::SocketSend { .. } => CompletionData::SocketSend { bytes_written },
                    _ => CompletionData::FileWrite { bytes_written },
                },
                Err(err) => CompletionData::Err(err),
            }
        }
        RequestKind::SocketReceive { fd, buffer } => match read_fd(*fd, buffer) {
            Ok(bytes_read) => CompletionData::SocketReceive { bytes_read, disconnected: bytes_read == 0 },
            Err(err) => CompletionData::Err(err),
        },
        RequestKind::FileRead { fd, buffer } => match read_fd(*fd, buffer) {
            Ok(bytes_read) => CompletionData::FileRead { bytes_read, eof: bytes_read == 0 },
            Err(err) => CompletionData::Err(err),
        },
        RequestKind::FilePoll { .. } => CompletionData::FilePoll,
        RequestKind::Timeout { .. }
        | RequestKind::WakeUp
        | RequestKind::Work
        | RequestKind::ProcessExit { .. }
        | RequestKind::SocketClose { .. }
        | RequestKind::FileClose { .. }
        | RequestKind::FileSystemOp => {
            CompletionData::Err(std::io::Error::other("request kind has no readiness completion"))
        }
    }
}

#[cfg(unix)]
pub(crate) fn read_fd(fd: i32, buffer: &BufferView) -> std::io::Result<usize> {
    buffer.with_bytes_mut(|buf| {
        let capacity = buf.capacity().max(4096);
        buf.reserve(capacity);
        let ptr = buf.as_mut_ptr();
        let n = unsafe { libc::read(fd, ptr.cast(), buf.capacity()) };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            unsafe { buf.set_len(n as usize) };
            Ok(n as usize)
        }
    })
}

#[cfg(not(unix))]
pub(crate) fn read_fd(_fd: i32, _buffer: &BufferView) -> std::io::Result<usize> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "raw fd read only implemented for unix"))
}

#[cfg(unix)]
pub(crate) fn write_fd(fd: i32, buffer: &BufferView) -> std::io::Result<usize> {
    buffer.with_bytes(|buf| {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}

#[cfg(not(unix))]
pub(crate) fn write_fd(_fd: i32, _buffer: &BufferView) -> std::io::Result<usize> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "raw fd write only implemented for unix"))
}

#[cfg(unix)]
pub(crate) fn close_fd(fd: i32) -> std::io::Result<()> {
    let ret = unsafe { libc::close(fd) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
pub(crate) fn close_fd(_fd: i32) -> std::io::Result<()> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "raw fd close only implemented for unix"))
}

/// Accepts one pending connection from a listening socket, returning the
/// newly constructed (non-blocking, close-on-exec) socket descriptor.
#[cfg(unix)]
pub(crate) fn accept_fd(fd: i32) -> std::io::Result<i32> {
    let accepted = unsafe { libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) };
    if accepted < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(accepted)
    }
}

#[cfg(not(unix))]
pub(crate) fn accept_fd(_fd: i32) -> std::io::Result<i32> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "raw fd accept only implemented for unix"))
}

/// Checks whether a mid-`connect(2)` socket finished connecting
/// successfully, via `SO_ERROR`.
#[cfg(unix)]
pub(crate) fn connect_status(fd: i32) -> std::io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if err != 0 {
        return Err(std::io::Error::from_raw_os_error(err));
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn connect_status(_fd: i32) -> std::io::Result<()> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "raw fd connect only implemented for unix"))
}

/// Whether `fd` refers to a regular file. epoll and kqueue both refuse (or
/// on epoll, fail with `EPERM`) to register a regular file for readiness, so
/// `EventLoop::add_file_read`/`add_file_write` check this before ever
/// calling `Backend::activate`, routing regular-file I/O through the thread
/// pool instead.
#[cfg(unix)]
pub(crate) fn is_regular_file(fd: i32) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(fd, &mut stat) };
    ret == 0 && (stat.st_mode & libc::S_IFMT) == libc::S_IFREG
}

#[cfg(not(unix))]
pub(crate) fn is_regular_file(_fd: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPool;

    #[test]
    fn regular_file_is_detected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(file.as_file());
        assert!(is_regular_file(fd));
    }

    #[test]
    fn pipe_is_not_a_regular_file() {
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert!(!is_regular_file(fds[0]));
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn read_fd_reports_eof_on_empty_pipe_with_writer_closed() {
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        unsafe { libc::close(fds[1]) };
        let pool = BufferPool::new(64, 1);
        let buffer = pool.acquire().unwrap();
        let n = read_fd(fds[0], &buffer).unwrap();
        assert_eq!(n, 0);
        unsafe { libc::close(fds[0]) };
    }
}
