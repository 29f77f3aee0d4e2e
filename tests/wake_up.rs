//! A `WakeHandle` cloned onto another thread unblocks a loop parked in
//! `run_once` with no other pending work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nexus_io::EventLoop;

#[test]
fn cross_thread_wake_unblocks_run_once() {
    let mut event_loop = EventLoop::new().unwrap();
    let waker = event_loop.wake_handle();
    let woken = Arc::new(AtomicBool::new(false));
    let woken_by_thread = Arc::clone(&woken);

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        woken_by_thread.store(true, Ordering::SeqCst);
        waker.wake().unwrap();
    });

    // No requests are pending, so this call only returns once `wake()`
    // delivers the `WakeUp` completion (or the timeout elapses, which
    // would mean the wake-up was missed).
    event_loop.run_once(Some(Duration::from_secs(5))).unwrap();

    handle.join().unwrap();
    assert!(woken.load(Ordering::SeqCst));
}
