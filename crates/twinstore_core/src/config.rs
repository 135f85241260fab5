//! Configuration for replicated repositories and resync sweeps.

use crate::cancel::CancelToken;
use std::fmt;
use std::time::Duration;
use twinstore_storage::{Filter, Value};

/// Configuration of a [`ReplicatedRepository`](crate::ReplicatedRepository).
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Background repair executor settings.
    pub repair: RepairConfig,
    /// Which side's natural order a resync sweep prefers.
    pub order_preference: OrderPreference,
    /// Whether large-object properties are wrapped so that writes through
    /// them reach the master.
    pub replicate_lobs: bool,
}

impl ReplicationConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            repair: RepairConfig::default(),
            order_preference: OrderPreference::default(),
            replicate_lobs: true,
        }
    }

    /// Sets the repair executor configuration.
    #[must_use]
    pub fn with_repair(mut self, repair: RepairConfig) -> Self {
        self.repair = repair;
        self
    }

    /// Sets the natural order preference.
    #[must_use]
    pub fn with_order_preference(mut self, preference: OrderPreference) -> Self {
        self.order_preference = preference;
        self
    }

    /// Enables or disables large-object replication.
    #[must_use]
    pub fn with_lob_replication(mut self, enabled: bool) -> Self {
        self.replicate_lobs = enabled;
        self
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings of the background repair executor.
#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum number of queued repairs.
    pub capacity: usize,
    /// How long a submission waits for queue space before the repair is
    /// dropped.
    pub offer_timeout: Duration,
    /// How long shutdown waits for queued repairs to finish.
    pub shutdown_timeout: Duration,
}

impl RepairConfig {
    /// Creates a configuration with the given worker count.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            capacity: 1024,
            offer_timeout: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the queue capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Sets the submission timeout.
    #[must_use]
    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.offer_timeout = timeout;
        self
    }

    /// Sets the shutdown drain timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Which store's clustered order a resync sweep walks in when both offer
/// one that fits the primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderPreference {
    /// Prefer the replica's order. The replica is the side being
    /// rewritten, so walking it in physical order is cheapest.
    #[default]
    ReplicaFirst,
    /// Prefer the master's order.
    MasterFirst,
}

/// Settings of the optional resync repair worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum number of queued repair actions.
    pub capacity: usize,
    /// How long the sweep waits to queue one action.
    pub offer_timeout: Duration,
    /// How long the sweep waits for the worker to drain at the end.
    pub drain_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            capacity: 256,
            offer_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(60),
        }
    }
}

/// Options of one resync sweep.
#[derive(Clone)]
pub struct ResyncOptions {
    /// Fraction of full throughput to use, clamped to `[0, 1]`.
    pub desired_speed: f64,
    /// Restricts the sweep to matching rows.
    pub filter: Option<Filter>,
    /// Values for positional parameters in `filter`.
    pub params: Vec<Value>,
    /// Explicit sweep order. Must contain every primary key property.
    pub order: Option<Vec<String>>,
    /// Rows scanned before the replica transaction is committed and
    /// reopened.
    pub commit_interval: u64,
    /// Repair actions performed before the replica transaction is
    /// committed and reopened.
    pub max_repairs_per_commit: u64,
    /// Runs repair actions on a dedicated worker thread when set.
    pub worker: Option<WorkerOptions>,
    /// Only counts divergences without repairing them.
    pub dry_run: bool,
    /// Stops the sweep when cancelled.
    pub cancel: CancelToken,
    /// Number of work samples the throttle averages over.
    pub throttle_window: usize,
    /// Smallest sleep the throttle performs.
    pub sleep_precision: Duration,
}

impl ResyncOptions {
    /// Creates options for a full-speed sweep over every row.
    #[must_use]
    pub fn new() -> Self {
        Self {
            desired_speed: 1.0,
            filter: None,
            params: Vec::new(),
            order: None,
            commit_interval: 1000,
            max_repairs_per_commit: 100,
            worker: None,
            dry_run: false,
            cancel: CancelToken::new(),
            throttle_window: 100,
            sleep_precision: Duration::from_millis(10),
        }
    }

    /// Sets the desired speed as a fraction of full throughput, clamped to
    /// `[0, 1]`. NaN means full speed.
    #[must_use]
    pub fn with_speed(mut self, desired_speed: f64) -> Self {
        self.desired_speed = if desired_speed.is_nan() {
            1.0
        } else {
            desired_speed.clamp(0.0, 1.0)
        };
        self
    }

    /// Restricts the sweep to rows matching `filter`.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the filter parameters.
    #[must_use]
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Sets an explicit sweep order.
    #[must_use]
    pub fn with_order<S: AsRef<str>>(mut self, properties: &[S]) -> Self {
        self.order = Some(properties.iter().map(|p| p.as_ref().to_string()).collect());
        self
    }

    /// Sets the scanned-row commit watermark.
    #[must_use]
    pub fn with_commit_interval(mut self, rows: u64) -> Self {
        self.commit_interval = rows.max(1);
        self
    }

    /// Sets the repair-action commit cap.
    #[must_use]
    pub fn with_max_repairs_per_commit(mut self, repairs: u64) -> Self {
        self.max_repairs_per_commit = repairs.max(1);
        self
    }

    /// Runs repairs on a dedicated worker.
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerOptions) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Enables or disables dry-run mode.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the throttle window and sleep precision.
    #[must_use]
    pub fn with_throttle(mut self, window: usize, sleep_precision: Duration) -> Self {
        self.throttle_window = window.max(1);
        self.sleep_precision = sleep_precision;
        self
    }
}

impl Default for ResyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResyncOptions")
            .field("desired_speed", &self.desired_speed)
            .field("filter", &self.filter.as_ref().map(ToString::to_string))
            .field("params", &self.params.len())
            .field("order", &self.order)
            .field("commit_interval", &self.commit_interval)
            .field("max_repairs_per_commit", &self.max_repairs_per_commit)
            .field("worker", &self.worker)
            .field("dry_run", &self.dry_run)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
