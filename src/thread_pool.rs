use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Barrier,
    },
    thread::{Builder, JoinHandle},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{Error, Result};

pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// FIFO task queue shared by every worker.
struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl TaskQueue {
    fn push(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolShutDown);
        }
        tasks.push_back(task);
        drop(tasks);
        self.condvar.notify_one();
        Ok(())
    }

    /// Blocks until a task is available. Returns `None` once shutdown was requested and the
    /// queue is drained.
    fn pop(&self) -> Option<Task> {
        let mut tasks = self.tasks.lock();
        loop {
            if let Some(task) = tasks.pop_front() {
                return Some(task);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            self.condvar.wait(&mut tasks);
        }
    }
}

/// Result handle for a task submitted with [`ThreadPool::submit`].
pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has run and returns its result.
    ///
    /// Fails with [`Error::TaskCanceled`] if the task panicked.
    pub fn join(self) -> Result<T> {
        self.receiver.recv().map_err(|_| Error::TaskCanceled)
    }

    /// Returns the result if the task already finished.
    pub fn try_join(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

/// Fixed set of long-lived worker threads pulling tasks from one shared queue.
pub struct ThreadPool {
    workers: Mutex<Vec<JoinHandle<()>>>,
    queue: Arc<TaskQueue>,
    next_id: AtomicUsize,
}

impl Default for ThreadPool {
    fn default() -> Self {
        let default_capacity = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_POOL_CAPACITY);
        Self::new(default_capacity)
    }
}

impl ThreadPool {
    /// Starts `capacity` workers. Returns once all of them are running.
    pub fn new(capacity: usize) -> Self {
        let pool = Self {
            workers: Mutex::new(Vec::with_capacity(capacity)),
            queue: Arc::new(TaskQueue {
                tasks: Mutex::new(VecDeque::new()),
                condvar: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            next_id: AtomicUsize::new(0),
        };
        pool.add_workers(capacity);
        pool
    }

    /// Grows the pool by `count` workers.
    pub fn add_workers(&self, count: usize) {
        if count == 0 {
            return;
        }
        // wait for the new workers to be running before returning
        let barrier = Arc::new(Barrier::new(count + 1));
        let mut workers = self.workers.lock();

        for _ in 0..count {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let queue = Arc::clone(&self.queue);
            let barrier = Arc::clone(&barrier);
            let thread = Builder::new()
                .name(format!("millrace-worker-{id}"))
                .spawn(move || {
                    barrier.wait();
                    while let Some(task) = queue.pop() {
                        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                            error!(worker = id, "task panicked");
                        }
                    }
                    debug!(worker = id, "worker exiting");
                })
                .expect("failed to spawn worker thread");
            workers.push(thread);
        }
        drop(workers);

        barrier.wait();
    }

    /// Queues a task without a result channel.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Box::new(task))
    }

    /// Queues a task and returns a handle to its result.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        self.queue.push(Box::new(move || {
            // the handle may have been dropped; the result is then discarded
            let _ = sender.send(task());
        }))?;
        Ok(TaskHandle { receiver })
    }

    pub fn workers_len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn pending(&self) -> usize {
        self.queue.tasks.lock().len()
    }

    /// Stops accepting tasks, lets the workers drain what is queued, and joins them.
    pub fn shutdown(&self) {
        {
            let _tasks = self.queue.tasks.lock();
            self.queue.shutdown.store(true, Ordering::Release);
        }
        self.queue.condvar.notify_all();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
