//! Fixed-size worker pool used as the fallback path for work that the kernel
//! backend can't do asynchronously (DNS lookups, blocking file I/O on
//! backends without native async file support, plugin compilation).
//!
//! Grounded on `original_source/Libraries/Threading/ThreadPool.h`: a mutex
//! guards a FIFO task queue, a condition variable wakes idle workers, and a
//! second condition variable lets callers block on a specific task's
//! completion. `parking_lot::{Mutex, Condvar}` stand in for the original's
//! platform mutex/condition-variable pair.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::error::CrateError;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Configuration for a [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Number of worker threads. Defaults to [`num_cpus::get`].
    pub worker_threads: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> ThreadPoolConfig {
        ThreadPoolConfig {
            worker_threads: num_cpus::get().max(1),
        }
    }
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    task_available: Condvar,
    shutting_down: AtomicBool,
    active_tasks: Mutex<u64>,
    all_done: Condvar,
}

/// A fixed-size pool of worker threads draining a shared FIFO queue.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `config.worker_threads` worker threads, each blocking on the
    /// shared queue until work arrives or the pool is destroyed.
    pub fn new(config: ThreadPoolConfig) -> ThreadPool {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            task_available: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            active_tasks: Mutex::new(0),
            all_done: Condvar::new(),
        });

        let workers = (0..config.worker_threads.max(1))
            .map(|idx| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("nexus-io-worker-{idx}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn thread pool worker")
            })
            .collect();

        ThreadPool { shared, workers }
    }

    /// Queues a task for execution on the next available worker.
    ///
    /// Returns [`CrateError::InvalidState`] if the pool is already shutting
    /// down (a capacity-style programmer-misuse error per the error
    /// taxonomy, kept recoverable rather than panicking).
    pub fn queue_task<F>(&self, task: F) -> Result<(), CrateError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(CrateError::InvalidState(
                "thread pool is shutting down, cannot queue new tasks",
            ));
        }

        *self.shared.active_tasks.lock() += 1;
        self.shared.queue.lock().push_back(Box::new(task));
        self.shared.task_available.notify_one();
        Ok(())
    }

    /// Blocks the calling thread until every task queued so far has
    /// finished running.
    pub fn wait_for_all_tasks(&self) {
        let mut active = self.shared.active_tasks.lock();
        while *active != 0 {
            self.shared.all_done.wait(&mut active);
        }
    }

    /// Number of worker threads in the pool.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if shared.shutting_down.load(Ordering::Acquire) {
                    break None;
                }
                shared.task_available.wait(&mut queue);
            }
        };

        match task {
            Some(task) => {
                task();
                let mut active = shared.active_tasks.lock();
                *active -= 1;
                if *active == 0 {
                    shared.all_done.notify_all();
                }
            }
            None => break,
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.task_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_queued_tasks() {
        let pool = ThreadPool::new(ThreadPoolConfig { worker_threads: 2 });
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.queue_task(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.wait_for_all_tasks();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn rejects_tasks_after_drop_is_in_progress() {
        let pool = ThreadPool::new(ThreadPoolConfig { worker_threads: 1 });
        pool.shared.shutting_down.store(true, Ordering::Release);
        let err = pool.queue_task(|| {}).unwrap_err();
        assert!(matches!(err, CrateError::InvalidState(_)));
    }
}
