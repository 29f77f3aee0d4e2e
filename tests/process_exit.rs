//! Watching a spawned child's pid resolves once it terminates, carrying its
//! exit code.

#![cfg(unix)]

use std::cell::RefCell;
use std::process::Command;
use std::rc::Rc;
use std::time::Duration;

use nexus_io::request::CompletionData;
use nexus_io::EventLoop;

#[test]
fn process_exit_reports_exit_code() {
    let mut child = Command::new("true").spawn().expect("spawn `true`");
    let pid = child.id();

    let mut event_loop = EventLoop::new().unwrap();
    let exit_code = Rc::new(RefCell::new(None));
    let recorded = Rc::clone(&exit_code);

    event_loop
        .add_process_exit(pid, move |data| {
            if let CompletionData::ProcessExit { exit_code } = data {
                *recorded.borrow_mut() = Some(exit_code);
            }
        })
        .unwrap();

    event_loop.run_once(Some(Duration::from_secs(5))).unwrap();
    let _ = child.wait();

    assert_eq!(*exit_code.borrow(), Some(0));
}
