//! Threading Primitives
//!
//! Named worker pool used for fetch, decode and payload assembly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};

/// Task for the worker pool
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool for background work
///
/// A pool built with zero workers runs every task inline on the submitting
/// thread. That mode exists for deterministic tests and single-threaded tools.
pub struct WorkerPool {
    name: String,
    workers: Vec<Worker>,
    sender: Option<Sender<Task>>,
    shutdown: Arc<AtomicBool>,
    task_count: Arc<AtomicUsize>,
}

struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        name: String,
        receiver: Receiver<Task>,
        shutdown: Arc<AtomicBool>,
        task_count: Arc<AtomicUsize>,
    ) -> std::io::Result<Self> {
        let thread = thread::Builder::new().name(name).spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match receiver.recv_timeout(Duration::from_millis(100)) {
                    Ok(task) => {
                        task();
                        task_count.fetch_sub(1, Ordering::AcqRel);
                    }
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;

        Ok(Self {
            thread: Some(thread),
        })
    }
}

impl WorkerPool {
    /// Create a new pool with the specified number of workers
    ///
    /// Threads are named `<name>-<index>`. If the OS refuses to spawn a thread
    /// the pool keeps the workers it has; with none it degrades to inline.
    pub fn new(name: impl Into<String>, num_workers: usize) -> Self {
        let name = name.into();
        let (sender, receiver) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let task_count = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            match Worker::spawn(
                format!("{}-{}", name, index),
                receiver.clone(),
                shutdown.clone(),
                task_count.clone(),
            ) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    log::error!("failed to spawn worker {}-{}: {}", name, index, err);
                    break;
                }
            }
        }

        let sender = if workers.is_empty() { None } else { Some(sender) };

        Self {
            name,
            workers,
            sender,
            shutdown,
            task_count,
        }
    }

    /// Create a pool that runs every task on the submitting thread
    pub fn inline(name: impl Into<String>) -> Self {
        Self::new(name, 0)
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of worker threads
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Whether tasks execute inline on the caller
    pub fn is_inline(&self) -> bool {
        self.sender.is_none()
    }

    /// Submit a task to the pool
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            task();
            return;
        };

        self.task_count.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = sender.send(Box::new(task)) {
            // Workers are gone; run on the caller rather than dropping the work
            self.task_count.fetch_sub(1, Ordering::AcqRel);
            log::warn!("{}: worker channel closed, running task inline", self.name);
            (err.into_inner())();
        }
    }

    /// Get the number of submitted tasks that have not finished
    pub fn pending_tasks(&self) -> usize {
        self.task_count.load(Ordering::Acquire)
    }

    /// Check if the pool is idle
    pub fn is_idle(&self) -> bool {
        self.pending_tasks() == 0
    }

    /// Block until all submitted tasks have finished or `timeout` passes
    ///
    /// Returns true when the pool drained in time.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while !self.is_idle() {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::yield_now();
        }
        true
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .field("pending", &self.pending_tasks())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        drop(self.sender.take());

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
