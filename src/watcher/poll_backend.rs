//! Directory-snapshot-diffing folder watcher, used wherever there is no
//! cheap single-fd kernel change-notification primitive available to this
//! crate (everything except Linux — see the module-level doc comment).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crate::error::CrateError;

use super::{Notification, Operation, Sink};

#[derive(Clone, PartialEq, Eq)]
struct EntryStamp {
    modified: Option<SystemTime>,
    is_dir: bool,
}

pub(crate) struct PollFolder {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PollFolder {
    pub(crate) fn start(base_path: &Path, sink: Sink, interval: Duration) -> Result<PollFolder, CrateError> {
        if !base_path.is_dir() {
            return Err(CrateError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "watch path is not a directory",
            )));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let base_path = base_path.to_path_buf();
        let thread_stop = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name("filesystem-watcher-poll".into())
            .spawn(move || run(base_path, sink, interval, thread_stop))
            .map_err(|e| CrateError::Io(std::io::Error::other(e)))?;

        Ok(PollFolder {
            stop,
            join: Some(join),
        })
    }
}

impl Drop for PollFolder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn snapshot(base_path: &Path) -> HashMap<PathBuf, EntryStamp> {
    let mut out = HashMap::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(relative) = stack.pop() {
        let absolute = base_path.join(&relative);
        let Ok(entries) = std::fs::read_dir(&absolute) else { continue };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let entry_relative = relative.join(&name);
            let Ok(metadata) = entry.metadata() else { continue };
            let is_dir = metadata.is_dir();
            out.insert(
                entry_relative.clone(),
                EntryStamp {
                    modified: metadata.modified().ok(),
                    is_dir,
                },
            );
            if is_dir {
                stack.push(entry_relative);
            }
        }
    }
    out
}

fn run(base_path: PathBuf, mut sink: Sink, interval: Duration, stop: Arc<AtomicBool>) {
    let mut previous = snapshot(&base_path);
    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(interval);
        if stop.load(Ordering::SeqCst) {
            return;
        }

        let current = snapshot(&base_path);

        for (relative_path, stamp) in &current {
            match previous.get(relative_path) {
                None => sink.deliver(Notification {
                    base_path: base_path.clone(),
                    relative_path: relative_path.clone(),
                    operation: Operation::AddRemoveRename,
                }),
                Some(before) if before.modified != stamp.modified => sink.deliver(Notification {
                    base_path: base_path.clone(),
                    relative_path: relative_path.clone(),
                    operation: Operation::Modified,
                }),
                Some(_) => {}
            }
        }

        for relative_path in previous.keys() {
            if !current.contains_key(relative_path) {
                sink.deliver(Notification {
                    base_path: base_path.clone(),
                    relative_path: relative_path.clone(),
                    operation: Operation::AddRemoveRename,
                });
            }
        }

        previous = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_picks_up_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file.txt"), b"hi").unwrap();

        let snap = snapshot(dir.path());
        assert!(snap.contains_key(Path::new("sub")));
        assert!(snap.contains_key(Path::new("sub/file.txt")));
    }
}
