//! Watching a directory with `Runner::Thread` reports a file created in it
//! shortly after `watch()` returns.

use std::sync::mpsc;
use std::time::Duration;

use nexus_io::watcher::{FileSystemWatcher, Operation, Runner};

#[test]
fn thread_runner_reports_file_creation() {
    let dir = tempfile::tempdir().unwrap();
    let mut watcher = FileSystemWatcher::default();
    let (tx, rx) = mpsc::channel();

    let _folder = watcher
        .watch(dir.path(), Runner::Thread, move |notification| {
            let _ = tx.send(notification);
        })
        .unwrap();

    // Give the watcher's background thread time to finish installing its
    // watch (inotify_add_watch / the poll backend's first snapshot) before
    // the change happens.
    std::thread::sleep(Duration::from_millis(100));
    std::fs::write(dir.path().join("new_file.txt"), b"content").unwrap();

    let notification = rx.recv_timeout(Duration::from_secs(5)).expect("notification delivered");
    assert_eq!(notification.relative_path, std::path::Path::new("new_file.txt"));
    assert_eq!(notification.operation, Operation::AddRemoveRename);
}
