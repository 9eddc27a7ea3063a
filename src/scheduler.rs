//! Single-threaded fixed-rate task runner.
//!
//! Every [`IntervalScheduler`] owns one worker thread. Tasks registered with
//! [`IntervalScheduler::schedule`] fire immediately and then every `period`,
//! measured from when they were scheduled rather than from when the previous
//! run finished. A slow run delays the next one but never causes a skip; the
//! missed runs fire back-to-back once the worker is free. Runs of different
//! tasks never overlap because there is only one worker.
//!
//! A task that returns an error or panics is logged and keeps its slot.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use tracing::{debug, warn};

pub type Task = Box<dyn FnMut() -> Result<()> + Send>;

struct Scheduled {
    name: String,
    period: Duration,
    next_due: Instant,
    task: Task,
}

struct Shared {
    tasks: Mutex<Vec<Scheduled>>,
    wake: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Vec<Scheduled>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cheap handle that can stop a scheduler from inside one of its own tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Stop firing ticks. Does not wait for the worker to exit.
    pub fn cancel(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

pub struct IntervalScheduler {
    handle: SchedulerHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl IntervalScheduler {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(Vec::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(&worker_shared))?;
        let worker_id = worker.thread().id();
        Ok(Self {
            handle: SchedulerHandle { shared },
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Register `task` to run now and then every `period`.
    /// Fails for a zero period, which would never yield the worker.
    pub fn schedule<F>(&self, name: &str, period: Duration, task: F) -> Result<()>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        ensure!(!period.is_zero(), "task {name} has a zero period");
        let shared = &self.handle.shared;
        if shared.shutdown.load(Ordering::Acquire) {
            debug!(task = name, "scheduler already cancelled, not scheduling");
            return Ok(());
        }
        shared.lock().push(Scheduled {
            name: name.to_string(),
            period,
            next_due: Instant::now(),
            task: Box::new(task),
        });
        shared.wake.notify_all();
        Ok(())
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stop the scheduler. A run already in progress finishes first; nothing
    /// fires afterwards. Safe to call more than once and from any thread,
    /// including from within a scheduled task.
    pub fn cancel(&self) {
        self.handle.cancel();
        if thread::current().id() == self.worker_id {
            return;
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("scheduler worker exited with a panic");
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

impl Drop for IntervalScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let mut tasks = shared.lock();
        let index = loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            let next = tasks
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| t.next_due)
                .map(|(i, t)| (i, t.next_due));
            match next {
                None => {
                    tasks = shared
                        .wake
                        .wait(tasks)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some((i, due)) => {
                    let now = Instant::now();
                    if due <= now {
                        break i;
                    }
                    tasks = shared
                        .wake
                        .wait_timeout(tasks, due - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        };

        // Run without holding the lock so tasks can schedule more work.
        let mut entry = tasks.swap_remove(index);
        drop(tasks);

        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        run_task(&mut entry);
        entry.next_due += entry.period;
        shared.lock().push(entry);
    }
}

fn run_task(entry: &mut Scheduled) {
    match panic::catch_unwind(AssertUnwindSafe(|| (entry.task)())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(task = %entry.name, error = ?err, "scheduled task failed");
        }
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "<non-string panic>".to_string());
            warn!(task = %entry.name, panic = %msg, "scheduled task panicked");
        }
    }
}
