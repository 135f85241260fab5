//! Background repair executor.
//!
//! Repairs are scheduled from the write path when a conflict hints that the
//! replica has diverged. They run on dedicated threads so they are neither
//! rolled back with the caller's transaction nor blocked by the locks it
//! holds. The queue is bounded: when it stays full, the repair is dropped
//! and left for the next resync sweep.

use crate::config::RepairConfig;
use crate::queue::{OfferError, TaskQueue};
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use twinstore_storage::{RepositoryError, RepositoryResult};

/// A unit of repair work.
pub type RepairJob = Box<dyn FnOnce() -> RepositoryResult<()> + Send + 'static>;

/// Receives every repair that failed or panicked.
pub type FailureHandler = Arc<dyn Fn(&RepairFailure) + Send + Sync>;

/// A repair that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairFailure {
    /// What was being repaired.
    pub label: String,
    /// Error or panic message.
    pub message: String,
    /// True if the repair panicked rather than returning an error.
    pub panicked: bool,
}

impl fmt::Display for RepairFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = if self.panicked { "panicked" } else { "failed" };
        write!(f, "repair of {} {}: {}", self.label, what, self.message)
    }
}

/// Counters of an executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairStats {
    /// Repairs accepted into the queue.
    pub submitted: u64,
    /// Repairs that finished successfully.
    pub completed: u64,
    /// Repairs that returned an error.
    pub failed: u64,
    /// Repairs refused because the queue was full or closed.
    pub dropped: u64,
    /// Repairs that panicked.
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    panicked: AtomicU64,
}

struct Task {
    label: String,
    job: RepairJob,
}

/// Bounded pool of repair threads.
pub struct RepairExecutor {
    config: RepairConfig,
    queue: Arc<TaskQueue<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl RepairExecutor {
    /// Starts an executor whose failures are only logged.
    pub fn new(config: RepairConfig) -> RepositoryResult<Self> {
        Self::with_failure_handler(config, Arc::new(log_failure))
    }

    /// Starts an executor that reports failures to `handler`.
    pub fn with_failure_handler(config: RepairConfig, handler: FailureHandler) -> RepositoryResult<Self> {
        let queue = Arc::new(TaskQueue::new(config.capacity));
        let counters = Arc::new(Counters::default());
        let mut workers = Vec::with_capacity(config.workers);
        for n in 0..config.workers.max(1) {
            let worker_queue = Arc::clone(&queue);
            let counters = Arc::clone(&counters);
            let handler = Arc::clone(&handler);
            let spawned = thread::Builder::new()
                .name(format!("twinstore-repair-{n}"))
                .spawn(move || work(&worker_queue, &counters, &handler));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    queue.close();
                    return Err(RepositoryError::Unavailable(format!(
                        "cannot start repair worker: {e}"
                    )));
                }
            }
        }
        debug!(workers = workers.len(), capacity = config.capacity, "repair executor started");
        Ok(Self {
            config,
            queue,
            workers: Mutex::new(workers),
            counters,
        })
    }

    /// Queues a repair. Returns false if it was dropped because the queue
    /// stayed full or the executor is shut down.
    pub fn submit<F>(&self, label: impl Into<String>, job: F) -> bool
    where
        F: FnOnce() -> RepositoryResult<()> + Send + 'static,
    {
        let task = Task {
            label: label.into(),
            job: Box::new(job),
        };
        match self.queue.offer(task, self.config.offer_timeout) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(OfferError::Full(task)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    repair = %task.label,
                    capacity = self.config.capacity,
                    "repair queue saturated, dropping repair"
                );
                false
            }
            Err(OfferError::Closed(task)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(repair = %task.label, "repair executor shut down, dropping repair");
                false
            }
        }
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> RepairStats {
        let c = &self.counters;
        RepairStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
        }
    }

    /// Returns the number of repairs waiting for a worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Waits until every queued repair has run. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.queue.wait_idle(timeout)
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.queue.is_closed()
    }

    /// Lets queued repairs finish for up to `timeout`, then stops the
    /// workers. Repairs still queued after the timeout are dropped. Returns
    /// false if any were dropped.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let drained = self.queue.wait_idle(timeout);
        self.queue.close();
        let abandoned = self.queue.drain_pending();
        if !abandoned.is_empty() {
            self.counters
                .dropped
                .fetch_add(abandoned.len() as u64, Ordering::Relaxed);
            warn!(abandoned = abandoned.len(), "repair executor stopped with repairs still queued");
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let joined = workers.len();
        for handle in workers {
            if handle.join().is_err() {
                error!("repair worker exited abnormally");
            }
        }
        if joined > 0 {
            info!(stats = ?self.stats(), "repair executor shut down");
        }
        drained && abandoned.is_empty()
    }
}

impl Drop for RepairExecutor {
    fn drop(&mut self) {
        self.queue.close();
    }
}

impl fmt::Debug for RepairExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepairExecutor")
            .field("config", &self.config)
            .field("pending", &self.queue.len())
            .field("stats", &self.stats())
            .finish()
    }
}

fn work(queue: &TaskQueue<Task>, counters: &Counters, handler: &FailureHandler) {
    while let Some(task) = queue.take() {
        let Task { label, job } = task;
        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(())) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                handler(&RepairFailure {
                    label,
                    message: e.to_string(),
                    panicked: false,
                });
            }
            Err(payload) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                handler(&RepairFailure {
                    label,
                    message: panic_message(payload.as_ref()),
                    panicked: true,
                });
            }
        }
        queue.done();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_failure(failure: &RepairFailure) {
    if failure.panicked {
        error!(repair = %failure.label, message = %failure.message, "repair panicked");
    } else {
        warn!(repair = %failure.label, error = %failure.message, "repair failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn config() -> RepairConfig {
        RepairConfig::new(1).with_capacity(4)
    }

    #[test]
    fn runs_submitted_jobs() {
        let executor = RepairExecutor::new(config()).unwrap();
        let (tx, rx) = mpsc::channel();
        for n in 0..3 {
            let tx = tx.clone();
            assert!(executor.submit(format!("job-{n}"), move || {
                tx.send(n).unwrap();
                Ok(())
            }));
        }
        assert!(executor.wait_idle(Duration::from_secs(5)));
        let mut seen: Vec<i32> = rx.try_iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(executor.stats().completed, 3);
    }

    #[test]
    fn failures_and_panics_reach_handler() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        let executor = RepairExecutor::with_failure_handler(
            config(),
            Arc::new(move |f: &RepairFailure| sink.lock().push(f.clone())),
        )
        .unwrap();

        executor.submit("bad", || Err(RepositoryError::Unavailable("down".into())));
        executor.submit("boom", || panic!("repair exploded"));
        executor.submit("good", || Ok(()));
        assert!(executor.wait_idle(Duration::from_secs(5)));

        let failures = failures.lock();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].label, "bad");
        assert!(!failures[0].panicked);
        assert_eq!(failures[1].message, "repair exploded");
        assert!(failures[1].panicked);

        let stats = executor.stats();
        assert_eq!((stats.failed, stats.panicked, stats.completed), (1, 1, 1));
    }

    #[test]
    fn saturated_queue_drops() {
        let config = RepairConfig::new(1)
            .with_capacity(1)
            .with_offer_timeout(Duration::from_millis(5));
        let executor = RepairExecutor::new(config).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        executor.submit("blocker", move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok(())
        });
        started_rx.recv().unwrap();
        assert!(executor.submit("queued", || Ok(())));
        assert!(!executor.submit("dropped", || Ok(())));
        assert_eq!(executor.stats().dropped, 1);

        release_tx.send(()).unwrap();
        assert!(executor.shutdown(Duration::from_secs(5)));
        assert_eq!(executor.stats().completed, 2);
    }

    #[test]
    fn submit_after_shutdown_is_refused() {
        let executor = RepairExecutor::new(config()).unwrap();
        assert!(executor.shutdown(Duration::from_secs(1)));
        assert!(executor.is_shut_down());
        assert!(!executor.submit("late", || Ok(())));
    }
}
