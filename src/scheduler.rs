//! # Work-Stealing Fiber Scheduler
//!
//! M:N cooperative scheduler with work-stealing.
//!
//! ## Design
//!
//! - A fixed pool of worker threads, each with a local FIFO deque
//! - A global injection queue for fibers submitted from outside the pool and
//!   for fibers that spent their step budget
//! - Work-stealing between workers for load balancing
//! - Idle workers park on a condvar for at most `idle_park`
//!
//! Each runtime owns its scheduler; several can coexist in one process. A
//! worker only ever pushes to its local deque when the submitted fiber
//! belongs to the worker's own scheduler.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerConfig;
use crate::error::RuntimeError;
use crate::interpreter::{FiberRuntime, Slice};

type Task = Box<FiberRuntime>;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

struct LocalQueue {
    scheduler: u64,
    deque: Deque<Task>,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

/// State shared by the scheduler handle and its workers.
struct Shared {
    id: u64,
    config: SchedulerConfig,
    /// Global injection queue.
    global_queue: Injector<Task>,
    /// Stealers for work-stealing.
    stealers: Vec<Stealer<Task>>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Number of running worker loops.
    active_workers: AtomicUsize,
    /// Number of workers parked or about to park.
    sleepers: AtomicUsize,
    idle: Mutex<()>,
    wake: Condvar,
}

/// Work-stealing scheduler for fibers.
pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<(thread::ThreadId, JoinHandle<()>)>>,
}

impl Scheduler {
    /// Create a scheduler and start its worker threads. If a worker cannot
    /// be spawned, the ones already running are stopped.
    pub(crate) fn new(config: SchedulerConfig) -> Result<Self, RuntimeError> {
        let id = NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed);
        let worker_count = config.num_workers.max(1);

        let mut deques = Vec::with_capacity(worker_count);
        let mut stealers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            deques.push(deque);
        }

        let shared = Arc::new(Shared {
            id,
            config,
            global_queue: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            idle: Mutex::new(()),
            wake: Condvar::new(),
        });

        let scheduler = Self {
            shared,
            threads: Mutex::new(Vec::with_capacity(worker_count)),
        };
        for (index, deque) in deques.into_iter().enumerate() {
            let worker = Worker {
                index,
                shared: scheduler.shared.clone(),
            };
            let name = format!("skein-worker-{}", index);
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run_loop(deque))
            {
                Ok(handle) => scheduler.threads.lock().push((handle.thread().id(), handle)),
                Err(err) => {
                    tracing::error!(scheduler = id, worker = index, error = %err, "worker spawn failed");
                    scheduler.shutdown();
                    return Err(RuntimeError::ThreadSpawn {
                        thread: name,
                        message: err.to_string(),
                    });
                }
            }
        }

        tracing::debug!(scheduler = id, workers = worker_count, "scheduler started");
        Ok(scheduler)
    }

    /// Get the number of workers.
    pub(crate) fn num_workers(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Number of worker loops currently running.
    pub(crate) fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Acquire)
    }

    /// Queue a runnable fiber.
    pub(crate) fn submit(&self, task: Task) {
        if self.is_shutting_down() {
            tracing::trace!(fiber = %task.id, "fiber dropped by a stopped scheduler");
            return;
        }
        let scheduler = self.shared.id;
        let leftover = LOCAL.with(|local| match &*local.borrow() {
            Some(queue) if queue.scheduler == scheduler => {
                queue.deque.push(task);
                None
            }
            _ => Some(task),
        });
        match leftover {
            Some(task) => {
                self.shared.global_queue.push(task);
                self.shared.notify_one();
            }
            None => {
                if self.shared.config.work_stealing {
                    self.shared.notify_one();
                }
            }
        }
    }

    /// Request scheduler shutdown and join the workers.
    ///
    /// Fibers still queued are dropped. Called from a worker thread, that
    /// worker is left to exit on its own.
    pub(crate) fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _idle = self.shared.idle.lock();
            self.shared.wake.notify_all();
        }
        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for (id, handle) in threads {
            if id != current {
                let _ = handle.join();
            }
        }
        while let Steal::Success(_) | Steal::Retry = self.shared.global_queue.steal() {}
        tracing::debug!(scheduler = self.shared.id, "scheduler stopped");
    }

    /// Check if the scheduler is shutting down.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Shared {
    fn notify_one(&self) {
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _idle = self.idle.lock();
            self.wake.notify_one();
        }
    }

    fn park(&self) {
        let mut idle = self.idle.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        if self.global_queue.is_empty() && !self.shutdown.load(Ordering::Acquire) {
            self.wake.wait_for(&mut idle, self.config.idle_park);
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A worker thread in the scheduler.
struct Worker {
    index: usize,
    shared: Arc<Shared>,
}

impl Worker {
    /// Run the worker loop.
    fn run_loop(self, deque: Deque<Task>) {
        self.shared.active_workers.fetch_add(1, Ordering::AcqRel);
        LOCAL.with(|local| {
            *local.borrow_mut() = Some(LocalQueue {
                scheduler: self.shared.id,
                deque,
            })
        });
        tracing::trace!(worker = self.index, "worker started");

        while !self.shared.shutdown.load(Ordering::Acquire) {
            match self.find_work() {
                Some(task) => self.run_fiber(task),
                None => self.shared.park(),
            }
        }

        LOCAL.with(|local| local.borrow_mut().take());
        self.shared.active_workers.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(worker = self.index, "worker stopped");
    }

    /// Find work using work-stealing.
    fn find_work(&self) -> Option<Task> {
        // 1. Local queue first
        let local = LOCAL.with(|local| local.borrow().as_ref().and_then(|q| q.deque.pop()));
        if local.is_some() {
            return local;
        }

        // 2. Global queue
        loop {
            match self.shared.global_queue.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        // 3. Other workers
        if self.shared.config.work_stealing {
            for (i, stealer) in self.shared.stealers.iter().enumerate() {
                if i == self.index {
                    continue;
                }
                loop {
                    match stealer.steal() {
                        Steal::Success(task) => return Some(task),
                        Steal::Empty => break,
                        Steal::Retry => continue,
                    }
                }
            }
        }

        None
    }

    /// Run one slice of a fiber.
    fn run_fiber(&self, task: Task) {
        match task.run_slice() {
            Slice::Yielded(task) => {
                // Yielded fibers go to the back of the global queue.
                self.shared.global_queue.push(task);
                self.shared.notify_one();
            }
            Slice::Suspended | Slice::Done => {}
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            num_workers: workers,
            idle_park: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new(config(3)).unwrap();
        assert_eq!(scheduler.num_workers(), 3);
        scheduler.shutdown();
        assert!(scheduler.is_shutting_down());
        assert_eq!(scheduler.active_workers(), 0);
    }

    #[test]
    fn test_zero_workers_still_runs_one() {
        let scheduler = Scheduler::new(config(0)).unwrap();
        assert_eq!(scheduler.num_workers(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let scheduler = Scheduler::new(config(2)).unwrap();
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(scheduler.is_shutting_down());
    }
}
