//! Bulk master/replica resynchronization.
//!
//! A sweep walks the master and the replica of one record type in the same
//! key order and merges the two streams. A key present only in the replica
//! is deleted, a key present only in the master is inserted, and a key
//! present in both with differing properties is replaced from the master.
//!
//! Replica writes accumulate in one replica transaction that is committed
//! every `commit_interval` rows or `max_repairs_per_commit` repairs. The
//! replica cursor is closed before each commit and reopened after the last
//! row it returned, so the sweep never holds a cursor across a commit.
//!
//! Replica rows whose encoding no longer decodes are deleted when the store
//! can still name their key and that key falls within the sweep filter,
//! and skipped otherwise. Master rows are read
//! through a suspended context without a transaction.

use crate::config::{OrderPreference, ResyncOptions, WorkerOptions};
use crate::queue::{OfferError, TaskQueue};
use crate::throttle::Throttle;
use crate::trigger::{key_record, RepairAction, ReplicationTrigger};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use twinstore_storage::{
    Context, Cursor, FetchError, FetchResult, Query, Record, Repository, RepositoryError,
    RepositoryResult, Schema, Storage, Transaction,
};

/// Counters describing one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    /// Record type swept.
    pub schema: String,
    /// Replica rows read.
    pub scanned_replica: u64,
    /// Master rows read.
    pub scanned_master: u64,
    /// Keys on which the two sides disagreed.
    pub divergent: u64,
    /// Replica entries inserted from the master.
    pub inserted: u64,
    /// Replica entries without a master counterpart that were deleted.
    pub deleted: u64,
    /// Replica entries deleted and reinserted from the master.
    pub replaced: u64,
    /// Replica entries updated in place because they could not be deleted.
    pub updated_in_place: u64,
    /// Divergences that could not be repaired.
    pub failed: u64,
    /// Undecodable replica rows deleted by key.
    pub corrupt_deleted: u64,
    /// Undecodable replica rows stepped over.
    pub corrupt_skipped: u64,
    /// Replica transaction commits.
    pub commits: u64,
    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u64,
    /// True if divergences were only counted.
    pub dry_run: bool,
}

impl ResyncReport {
    /// Returns true if the sweep found nothing to repair and no corrupt
    /// rows.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.divergent == 0 && self.corrupt_deleted == 0 && self.corrupt_skipped == 0
    }

    /// Returns the number of divergences that were repaired.
    #[must_use]
    pub fn repaired(&self) -> u64 {
        self.inserted + self.deleted + self.replaced + self.updated_in_place
    }

    fn record(&mut self, outcome: PersistOutcome) {
        match outcome {
            Ok(RepairAction::None) => {}
            Ok(RepairAction::Inserted) => self.inserted += 1,
            Ok(RepairAction::Deleted) => self.deleted += 1,
            Ok(RepairAction::Replaced) => self.replaced += 1,
            Ok(RepairAction::UpdatedInPlace) => self.updated_in_place += 1,
            Err(()) => self.failed += 1,
        }
    }

    fn absorb(&mut self, other: &ResyncReport) {
        self.inserted += other.inserted;
        self.deleted += other.deleted;
        self.replaced += other.replaced;
        self.updated_in_place += other.updated_in_place;
        self.failed += other.failed;
    }
}

type PersistOutcome = Result<RepairAction, ()>;

/// Chooses the order both sides are swept in.
///
/// An explicit order must name primary key properties only. Otherwise the
/// first natural order (in `preference` order) made of primary key
/// properties only is used. Either is completed with the remaining primary
/// key properties so the order is total. Without a usable natural order the
/// primary key itself is used.
///
/// # Errors
///
/// Fails with [`RepositoryError::Config`] if `explicit` names an unknown or
/// non-key property, or repeats one.
pub fn sweep_order(
    schema: &Schema,
    explicit: Option<&[String]>,
    replica_natural: Option<Vec<String>>,
    master_natural: Option<Vec<String>>,
    preference: OrderPreference,
) -> RepositoryResult<Vec<String>> {
    let key: Vec<String> = schema
        .primary_key()
        .iter()
        .map(|&i| schema.property(i).name.clone())
        .collect();

    if let Some(order) = explicit {
        if !within_key(&key, order) {
            return Err(RepositoryError::Config(format!(
                "resync order {order:?} of {} must name distinct primary key properties",
                schema.name()
            )));
        }
        return Ok(complete(&key, order));
    }

    let candidates = match preference {
        OrderPreference::ReplicaFirst => [replica_natural, master_natural],
        OrderPreference::MasterFirst => [master_natural, replica_natural],
    };
    for candidate in candidates.into_iter().flatten() {
        if !candidate.is_empty() && within_key(&key, &candidate) {
            return Ok(complete(&key, &candidate));
        }
    }
    Ok(key)
}

fn within_key(key: &[String], order: &[String]) -> bool {
    order.iter().enumerate().all(|(n, p)| key.contains(p) && !order[..n].contains(p))
}

fn complete(key: &[String], order: &[String]) -> Vec<String> {
    let mut full = order.to_vec();
    full.extend(key.iter().filter(|p| !order.contains(p)).cloned());
    full
}

/// Current row of one side of the merge. `End` sorts after every row.
enum Head {
    Row(Record),
    End,
}

fn compare_heads(query: &Query, replica: &Head, master: &Head) -> Option<Ordering> {
    match (replica, master) {
        (Head::End, Head::End) => None,
        (Head::Row(_), Head::End) => Some(Ordering::Less),
        (Head::End, Head::Row(_)) => Some(Ordering::Greater),
        (Head::Row(r), Head::Row(m)) => Some(query.compare(r, m)),
    }
}

fn fetch(cursor: &mut dyn Cursor) -> FetchResult<Option<Record>> {
    if !cursor.has_next()? {
        return Ok(None);
    }
    cursor.next().map(Some)
}

/// Replica side of the merge: a lazily (re)opened cursor inside the sweep's
/// replica transaction.
struct ReplicaSide<'a> {
    storage: &'a dyn Storage,
    repository: &'a dyn Repository,
    query: &'a Query,
    dry_run: bool,
    base: Context,
    txn: Option<Arc<dyn Transaction>>,
    cursor: Option<Box<dyn Cursor>>,
    last: Option<Record>,
    skipped_since_last: usize,
}

impl<'a> ReplicaSide<'a> {
    fn new(storage: &'a dyn Storage, repository: &'a dyn Repository, query: &'a Query, dry_run: bool) -> Self {
        Self {
            storage,
            repository,
            query,
            dry_run,
            base: Context::new().suspended(),
            txn: None,
            cursor: None,
            last: None,
            skipped_since_last: 0,
        }
    }

    /// Returns the context replica work runs under, entering the sweep
    /// transaction if none is open. Dry runs never write and use no
    /// transaction.
    fn cx(&mut self) -> RepositoryResult<Context> {
        if self.dry_run {
            return Ok(self.base.clone());
        }
        let txn = match &self.txn {
            Some(txn) => Arc::clone(txn),
            None => {
                let txn = self.repository.enter_transaction(&self.base, None)?;
                self.txn = Some(Arc::clone(&txn));
                txn
            }
        };
        Ok(self.base.with_transaction(txn))
    }

    fn open(&mut self) -> RepositoryResult<()> {
        let cx = self.cx()?;
        let mut cursor = match &self.last {
            Some(last) => self.storage.query_after(&cx, self.query, last)?,
            None => self.storage.query(&cx, self.query)?,
        };
        if self.skipped_since_last > 0 {
            cursor.skip_next(self.skipped_since_last)?;
        }
        self.cursor = Some(cursor);
        Ok(())
    }

    fn close_cursor(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            if let Err(e) = cursor.close() {
                debug!(error = %e, "cannot close replica cursor");
            }
        }
    }

    fn advance(&mut self, report: &mut ResyncReport) -> RepositoryResult<Head> {
        loop {
            if self.cursor.is_none() {
                self.open()?;
            }
            let Some(cursor) = self.cursor.as_mut() else {
                return Ok(Head::End);
            };
            match fetch(cursor.as_mut()) {
                Ok(Some(row)) => {
                    report.scanned_replica += 1;
                    self.last = Some(row.clone());
                    self.skipped_since_last = 0;
                    return Ok(Head::Row(row));
                }
                Ok(None) => return Ok(Head::End),
                Err(e) if e.is_corrupt() => self.step_over_corrupt(e, report)?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns true if the row keyed by `recovered` is known to match the
    /// sweep filter. Filters on non-key properties cannot be judged from a
    /// key alone.
    fn within_filter(&self, recovered: &Record) -> bool {
        let schema = recovered.schema();
        let filter = &self.query.filter;
        filter
            .properties()
            .iter()
            .all(|p| schema.index_of(p).is_some_and(|i| schema.primary_key().contains(&i)))
            && filter.matches(recovered).unwrap_or(false)
    }

    /// Deletes or skips an undecodable row and reopens the cursor past it.
    fn step_over_corrupt(&mut self, err: FetchError, report: &mut ResyncReport) -> RepositoryResult<()> {
        self.close_cursor();
        match err.recovered_key().filter(|k| k.is_primary_key_initialized()) {
            Some(recovered) => {
                let key = recovered.to_string_key_only();
                let mut stale = key_record(self.storage, recovered);
                let deleted = if self.dry_run {
                    false
                } else if !self.within_filter(recovered) {
                    debug!(record = %key, "corrupt replica row may lie outside the filter, leaving it");
                    false
                } else {
                    let cx = self.cx()?;
                    match self.storage.try_delete(&cx, &mut stale) {
                        Ok(deleted) => deleted,
                        Err(e) => {
                            warn!(record = %key, error = %e, "cannot delete corrupt replica row");
                            false
                        }
                    }
                };
                if deleted {
                    report.corrupt_deleted += 1;
                    info!(record = %key, "deleted corrupt replica row");
                } else {
                    report.corrupt_skipped += 1;
                    warn!(record = %key, "skipping corrupt replica row");
                }
                self.last = Some(stale);
                self.skipped_since_last = 0;
            }
            None => {
                report.corrupt_skipped += 1;
                self.skipped_since_last += 1;
                warn!(
                    after = ?self.last.as_ref().map(Record::to_string_key_only),
                    skipped = self.skipped_since_last,
                    error = %err,
                    "skipping corrupt replica row without recoverable key"
                );
            }
        }
        if let Err(reopen) = self.open() {
            error!(error = %reopen, "cannot reopen replica cursor past corrupt row");
            return Err(err.into());
        }
        Ok(())
    }

    fn commit(&mut self) -> RepositoryResult<bool> {
        self.close_cursor();
        let Some(txn) = self.txn.take() else {
            return Ok(false);
        };
        let committed = txn.commit();
        if let Err(e) = txn.exit() {
            warn!(transaction = %txn.id(), error = %e, "cannot exit resync transaction");
        }
        committed?;
        Ok(true)
    }

    fn abandon(&mut self) {
        self.close_cursor();
        if let Some(txn) = self.txn.take() {
            if let Err(e) = txn.exit() {
                warn!(transaction = %txn.id(), error = %e, "cannot exit resync transaction");
            }
        }
    }
}

struct MasterSide {
    cursor: Box<dyn Cursor>,
}

impl MasterSide {
    fn advance(&mut self, report: &mut ResyncReport) -> RepositoryResult<Head> {
        match fetch(self.cursor.as_mut())? {
            Some(row) => {
                report.scanned_master += 1;
                Ok(Head::Row(row))
            }
            None => Ok(Head::End),
        }
    }
}

/// A divergence handed to the resync worker.
struct Divergence {
    replica: Option<Record>,
    master: Option<Record>,
}

struct Worker<'q> {
    queue: &'q TaskQueue<Divergence>,
    options: &'q WorkerOptions,
}

struct Sweep<'a> {
    trigger: &'a ReplicationTrigger,
    options: &'a ResyncOptions,
    query: &'a Query,
    replica: ReplicaSide<'a>,
    master: MasterSide,
    throttle: Throttle,
    report: ResyncReport,
    rows_since_commit: u64,
    repairs_since_commit: u64,
}

impl Sweep<'_> {
    fn merge(&mut self, worker: Option<&Worker<'_>>) -> RepositoryResult<()> {
        let mut replica_head = self.replica.advance(&mut self.report)?;
        let mut master_head = self.master.advance(&mut self.report)?;
        while let Some(order) = compare_heads(self.query, &replica_head, &master_head) {
            if self.options.cancel.is_cancelled() {
                return Err(RepositoryError::Interrupted);
            }
            match order {
                Ordering::Less => {
                    if let Head::Row(row) = &replica_head {
                        self.reconcile(worker, Some(row), None)?;
                    }
                    replica_head = self.replica.advance(&mut self.report)?;
                }
                Ordering::Greater => {
                    if let Head::Row(row) = &master_head {
                        self.reconcile(worker, None, Some(row))?;
                    }
                    master_head = self.master.advance(&mut self.report)?;
                }
                Ordering::Equal => {
                    if let (Head::Row(r), Head::Row(m)) = (&replica_head, &master_head) {
                        if !r.equal_properties(m) {
                            self.reconcile(worker, Some(r), Some(m))?;
                        }
                    }
                    replica_head = self.replica.advance(&mut self.report)?;
                    master_head = self.master.advance(&mut self.report)?;
                }
            }
            self.throttle
                .throttle(self.options.desired_speed, &self.options.cancel)
                .map_err(|_| RepositoryError::Interrupted)?;
            self.rows_since_commit += 1;
            if self.rows_since_commit >= self.options.commit_interval
                || self.repairs_since_commit >= self.options.max_repairs_per_commit
            {
                self.commit()?;
            }
        }
        self.commit()
    }

    fn reconcile(
        &mut self,
        worker: Option<&Worker<'_>>,
        replica: Option<&Record>,
        master: Option<&Record>,
    ) -> RepositoryResult<()> {
        self.report.divergent += 1;
        if self.options.dry_run {
            return Ok(());
        }
        self.repairs_since_commit += 1;
        match worker {
            Some(worker) => {
                let task = Divergence {
                    replica: replica.cloned(),
                    master: master.cloned(),
                };
                match worker.queue.offer(task, worker.options.offer_timeout) {
                    Ok(()) => Ok(()),
                    Err(OfferError::Full(_)) => Err(RepositoryError::QueueTimeout {
                        waited: worker.options.offer_timeout,
                    }),
                    Err(OfferError::Closed(_)) => Err(RepositoryError::Closed),
                }
            }
            None => {
                let cx = self.replica.cx()?;
                let outcome = self.trigger.resync_entries(&cx, replica, master).map_err(|_| ());
                self.report.record(outcome);
                Ok(())
            }
        }
    }

    fn commit(&mut self) -> RepositoryResult<()> {
        if self.replica.commit()? {
            self.report.commits += 1;
        }
        self.rows_since_commit = 0;
        self.repairs_since_commit = 0;
        Ok(())
    }
}

fn work(queue: &TaskQueue<Divergence>, trigger: &ReplicationTrigger, tallies: &Mutex<ResyncReport>) {
    let cx = Context::new().suspended();
    while let Some(task) = queue.take() {
        let outcome = trigger
            .resync_entries(&cx, task.replica.as_ref(), task.master.as_ref())
            .map_err(|_| ());
        tallies.lock().record(outcome);
        queue.done();
    }
}

/// Runs one sweep over the type `trigger` replicates.
pub(crate) fn run(
    trigger: &ReplicationTrigger,
    replica_repo: &dyn Repository,
    preference: OrderPreference,
    options: &ResyncOptions,
) -> RepositoryResult<ResyncReport> {
    let started = Instant::now();
    let schema = trigger.schema();
    let Some(master) = trigger.master_storage()? else {
        return Err(RepositoryError::Unsupported(format!(
            "master does not hold type {}, nothing to resync against",
            schema.name()
        )));
    };
    let replica = trigger.replica();

    let order = sweep_order(
        schema,
        options.order.as_deref(),
        replica.natural_order(),
        master.natural_order(),
        preference,
    )?;
    let query = match &options.filter {
        Some(filter) => Query::filtered(filter.bind(&options.params)?),
        None => Query::all(),
    }
    .order_by(&order);

    info!(
        schema = schema.name(),
        ?order,
        speed = options.desired_speed,
        dry_run = options.dry_run,
        "resync started"
    );

    let master_cursor = master.query(&Context::new().suspended(), &query)?;
    let mut sweep = Sweep {
        trigger,
        options,
        query: &query,
        replica: ReplicaSide::new(replica.as_ref(), replica_repo, &query, options.dry_run),
        master: MasterSide {
            cursor: master_cursor,
        },
        throttle: Throttle::new(options.throttle_window, options.sleep_precision),
        report: ResyncReport {
            schema: schema.name().to_string(),
            dry_run: options.dry_run,
            ..ResyncReport::default()
        },
        rows_since_commit: 0,
        repairs_since_commit: 0,
    };

    let result = match options.worker.as_ref().filter(|_| !options.dry_run) {
        None => sweep.merge(None),
        Some(worker_options) => merge_with_worker(&mut sweep, worker_options),
    };
    if let Err(e) = sweep.master.cursor.close() {
        debug!(error = %e, "cannot close master cursor");
    }
    if result.is_err() {
        sweep.replica.abandon();
    }

    let mut report = sweep.report;
    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match &result {
        Ok(()) => info!(
            schema = %report.schema,
            scanned_replica = report.scanned_replica,
            scanned_master = report.scanned_master,
            divergent = report.divergent,
            repaired = report.repaired(),
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "resync finished"
        ),
        Err(e) => error!(schema = %report.schema, error = %e, ?report, "resync aborted"),
    }
    result.map(|()| report)
}

fn merge_with_worker(sweep: &mut Sweep<'_>, options: &WorkerOptions) -> RepositoryResult<()> {
    let queue = TaskQueue::new(options.capacity);
    let tallies = Mutex::new(ResyncReport::default());
    let trigger = sweep.trigger;

    let result = thread::scope(|scope| {
        let spawned = thread::Builder::new()
            .name("twinstore-resync".to_string())
            .spawn_scoped(scope, || work(&queue, trigger, &tallies));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                return Err(RepositoryError::Unavailable(format!(
                    "cannot start resync worker: {e}"
                )))
            }
        };

        let worker = Worker {
            queue: &queue,
            options,
        };
        let merged = sweep.merge(Some(&worker));
        let drained = queue.wait_idle(options.drain_timeout);
        queue.close();
        let abandoned = queue.drain_pending().len();
        if handle.join().is_err() {
            error!("resync worker exited abnormally");
        }
        if abandoned > 0 {
            warn!(abandoned, "resync worker stopped with repairs still queued");
        }
        merged?;
        if drained {
            Ok(())
        } else {
            Err(RepositoryError::QueueTimeout {
                waited: options.drain_timeout,
            })
        }
    });
    sweep.report.absorb(&tallies.lock());
    result
}
