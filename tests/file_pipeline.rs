//! A `RequestSource` reading from one end of a pipe delivers its bytes to a
//! `ReadableStream`, and an empty chunk on EOF ends it.

#![cfg(unix)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use nexus_io::buffers::BufferPool;
use nexus_io::stream::{IoKind, ReadableStream, RequestSource};
use nexus_io::EventLoop;

fn make_nonblocking_pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(ret, 0);
    for fd in fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    }
    (fds[0], fds[1])
}

#[test]
fn file_pipeline_round_trips_through_a_pipe() {
    let (read_fd, write_fd) = make_nonblocking_pipe();
    let payload = b"hello from the writer";
    let written = unsafe { libc::write(write_fd, payload.as_ptr().cast(), payload.len()) };
    assert_eq!(written as usize, payload.len());
    unsafe { libc::close(write_fd) };

    let mut event_loop = EventLoop::new().unwrap();
    let pool = BufferPool::new(4096, 4);
    let source = RequestSource::new(read_fd, IoKind::File, pool);
    let readable = Rc::new(RefCell::new(ReadableStream::new(64 * 1024)));

    let received = Rc::new(RefCell::new(Vec::new()));
    let received_clone = Rc::clone(&received);
    readable.borrow_mut().on_data(move |chunk| {
        chunk.with_bytes(|bytes| received_clone.borrow_mut().extend_from_slice(bytes));
    });

    let ended = Rc::new(RefCell::new(false));
    let ended_clone = Rc::clone(&ended);
    readable.borrow_mut().on_end(move || *ended_clone.borrow_mut() = true);

    let readable_for_callback = Rc::clone(&readable);
    source
        .read_once(&mut event_loop, move |result| {
            let buffer = result.unwrap();
            if buffer.len() == 0 {
                readable_for_callback.borrow_mut().end();
            } else {
                readable_for_callback.borrow_mut().push(buffer);
            }
        })
        .unwrap();

    event_loop.run_once(Some(Duration::from_secs(5))).unwrap();

    assert_eq!(&received.borrow()[..], &payload[..]);
    unsafe { libc::close(read_fd) };
}

/// A real disk file (not a pipe) read through `RequestSource` exercises the
/// thread-pool bypass `add_file_read` takes for regular files, since epoll
/// refuses to register one for readiness.
#[test]
fn file_pipeline_reads_a_real_disk_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
    std::fs::write(&path, &payload).unwrap();

    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).unwrap();
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
    assert!(fd >= 0, "open failed: {}", std::io::Error::last_os_error());

    let mut event_loop = EventLoop::new().unwrap();
    let pool = BufferPool::new(4096, 4);
    let source = RequestSource::new(fd, IoKind::File, pool);

    let received = Rc::new(RefCell::new(Vec::new()));
    let received_clone = Rc::clone(&received);
    source
        .read_once(&mut event_loop, move |result| {
            let buffer = result.unwrap();
            buffer.with_bytes(|bytes| received_clone.borrow_mut().extend_from_slice(bytes));
        })
        .unwrap();

    event_loop.run_once(Some(Duration::from_secs(5))).unwrap();

    assert_eq!(&received.borrow()[..], &payload[..]);
    unsafe { libc::close(fd) };
}
