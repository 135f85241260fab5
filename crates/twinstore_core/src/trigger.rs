//! Write-through replication trigger.
//!
//! A [`ReplicationTrigger`] is registered on the replica storage of one
//! record type. Every insert, update and delete issued against that storage
//! reaches the trigger's "before" hook first, which performs the same write
//! on the master and copies the master's authoritative result back into the
//! replica record before the replica write proceeds.
//!
//! Conflicts reported by the master (uniqueness violations, optimistic-lock
//! failures) are returned to the caller unchanged. Because they hint that
//! the replica has drifted, the trigger also schedules an asynchronous
//! repair of the affected record on the [`RepairExecutor`].
//!
//! Replication is skipped for calls made under a suspended [`Context`].
//! Repair and resync write through suspended contexts so they never recurse
//! into the master or re-run user triggers.

use crate::repair::RepairExecutor;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, trace, warn};
use twinstore_storage::{
    Context, FetchError, FetchResult, PersistError, PersistResult, Record, Repository,
    RepositoryError, RepositoryResult, Schema, Storage, Trigger, TriggerManager, TriggerState,
    TriggerStates,
};
use uuid::Uuid;

/// Whether the master side of a replicated type can be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    /// Master storage is in hand.
    Available,
    /// The master cannot hold this type; the replica alone is used.
    Unsupported,
    /// The master could not be reached. Acquisition is retried on the next
    /// write; until then writes fail with
    /// [`PersistError::MasterUnavailable`].
    Unreachable,
}

enum MasterSlot {
    Available(Arc<dyn Storage>),
    Unsupported,
    Unreachable(String),
}

impl MasterSlot {
    fn state(&self) -> MasterState {
        match self {
            Self::Available(_) => MasterState::Available,
            Self::Unsupported => MasterState::Unsupported,
            Self::Unreachable(_) => MasterState::Unreachable,
        }
    }
}

/// Outcome of reconciling one replica entry with its master entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    /// Both entries already agreed.
    None,
    /// The replica entry was missing and has been inserted.
    Inserted,
    /// The replica entry had no master counterpart and has been deleted.
    Deleted,
    /// The replica entry was deleted and reinserted from the master.
    Replaced,
    /// The replica entry could not be deleted and was updated in place.
    UpdatedInPlace,
}

/// Converts master-side unavailability into the dedicated write failure.
pub(crate) fn master_failure(err: PersistError) -> PersistError {
    match err {
        PersistError::Fetch(FetchError::Unavailable(message)) => {
            PersistError::MasterUnavailable(message)
        }
        other => other,
    }
}

/// Returns a record of `storage`'s layout carrying the key of `source`:
/// the primary key when initialized, otherwise every initialized property
/// so an alternate key can resolve the row.
pub(crate) fn key_record(storage: &dyn Storage, source: &Record) -> Record {
    let mut target = storage.prepare();
    if source.is_primary_key_initialized() {
        source.copy_primary_key_properties(&mut target);
    } else {
        source.copy_all_properties(&mut target);
    }
    target
}

/// Replication trigger for one record type.
pub struct ReplicationTrigger {
    this: Weak<ReplicationTrigger>,
    schema: Arc<Schema>,
    replica: Arc<dyn Storage>,
    replica_repo: Arc<dyn Repository>,
    master_repo: Arc<dyn Repository>,
    master: Mutex<MasterSlot>,
    executor: Arc<RepairExecutor>,
    user_triggers: TriggerManager,
    scope: Uuid,
}

impl ReplicationTrigger {
    /// Creates the trigger, acquiring master storage if possible.
    ///
    /// An unreachable master is not an error here: the trigger starts in
    /// [`MasterState::Unreachable`] and retries on the first write.
    ///
    /// # Errors
    ///
    /// Fails with [`RepositoryError::Unsupported`] when the master cannot
    /// hold the type and the type is not independent, and propagates any
    /// other failure except unavailability.
    pub fn new(
        schema: Arc<Schema>,
        replica: Arc<dyn Storage>,
        replica_repo: Arc<dyn Repository>,
        master_repo: Arc<dyn Repository>,
        executor: Arc<RepairExecutor>,
    ) -> RepositoryResult<Arc<Self>> {
        let slot = match master_repo.storage_for(&schema) {
            Ok(storage) => MasterSlot::Available(storage),
            Err(e) if e.is_unsupported() && schema.is_independent() => {
                debug!(schema = schema.name(), "master lacks independent type, replica only");
                MasterSlot::Unsupported
            }
            Err(e) if e.is_unavailable() => {
                warn!(schema = schema.name(), error = %e, "master unreachable, will retry on write");
                MasterSlot::Unreachable(e.to_string())
            }
            Err(e) => return Err(e),
        };
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            schema,
            replica,
            replica_repo,
            master_repo,
            master: Mutex::new(slot),
            executor,
            user_triggers: TriggerManager::new(),
            scope: Uuid::new_v4(),
        }))
    }

    /// Returns the record type.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns the replica storage the trigger is registered on.
    #[must_use]
    pub fn replica(&self) -> &Arc<dyn Storage> {
        &self.replica
    }

    /// Returns the current master state.
    #[must_use]
    pub fn master_state(&self) -> MasterState {
        self.master.lock().state()
    }

    /// Returns the triggers registered by users of the replicated storage.
    /// They run inside this trigger and are skipped while replication is
    /// suspended.
    #[must_use]
    pub fn user_triggers(&self) -> &TriggerManager {
        &self.user_triggers
    }

    /// Returns the identity that scopes large-object wrappers created for
    /// this trigger.
    #[must_use]
    pub fn scope(&self) -> Uuid {
        self.scope
    }

    /// Returns the master storage, acquiring it if an earlier attempt
    /// found the master unreachable. `None` means the master does not
    /// hold this type.
    pub fn master_storage(&self) -> PersistResult<Option<Arc<dyn Storage>>> {
        let mut slot = self.master.lock();
        match &*slot {
            MasterSlot::Available(storage) => return Ok(Some(Arc::clone(storage))),
            MasterSlot::Unsupported => return Ok(None),
            MasterSlot::Unreachable(_) => {}
        }
        match self.master_repo.storage_for(&self.schema) {
            Ok(storage) => {
                info!(schema = self.schema.name(), "master storage acquired");
                *slot = MasterSlot::Available(Arc::clone(&storage));
                Ok(Some(storage))
            }
            Err(e) if e.is_unsupported() && self.schema.is_independent() => {
                *slot = MasterSlot::Unsupported;
                Ok(None)
            }
            Err(e) if e.is_unsupported() => Err(PersistError::Unsupported(e.to_string())),
            Err(e) => {
                debug!(schema = self.schema.name(), error = %e, "master still unreachable");
                *slot = MasterSlot::Unreachable(e.to_string());
                Err(PersistError::MasterUnavailable(e.to_string()))
            }
        }
    }

    fn master_insert(&self, cx: &Context, replica: &mut Record) -> PersistResult<()> {
        let Some(master) = self.master_storage()? else {
            return Ok(());
        };
        let mut entry = master.prepare();
        replica.copy_all_properties(&mut entry);
        match master.insert(cx, &mut entry) {
            Ok(()) => {
                // Generated keys, sequences and versions come back from the
                // master. Everything stays dirty so the replica writes it.
                entry.copy_all_properties(replica);
                replica.mark_all_properties_dirty();
                Ok(())
            }
            Err(e) if e.is_unique_conflict() => {
                debug!(record = %replica.to_string_key_only(), "master insert conflict");
                self.repair(replica);
                Err(e)
            }
            Err(e) => Err(master_failure(e)),
        }
    }

    fn master_update(&self, cx: &Context, replica: &mut Record) -> PersistResult<()> {
        let Some(master) = self.master_storage()? else {
            return Ok(());
        };
        let mut entry = key_record(master.as_ref(), replica);

        if !replica.has_dirty_properties() {
            // Nothing to write: refresh the replica from the master.
            match master.load(cx, &mut entry) {
                Ok(true) => {}
                Ok(false) => {
                    self.delete_replica(replica);
                    return Err(PersistError::no_such_record(replica.to_string_key_only()));
                }
                Err(e) => return Err(master_failure(e.into())),
            }
        } else {
            replica.copy_version_property(&mut entry);
            replica.copy_dirty_properties(&mut entry);
            match master.update(cx, &mut entry) {
                Ok(()) => {}
                Err(e) if e.is_no_such_record() => {
                    self.delete_replica(replica);
                    return Err(e);
                }
                Err(e) if e.is_optimistic_lock() => {
                    debug!(record = %replica.to_string_key_only(), "master version conflict");
                    self.repair(replica);
                    return Err(e);
                }
                Err(e) => return Err(master_failure(e)),
            }
        }
        entry.copy_unequal_properties(replica);
        Ok(())
    }

    fn master_delete(&self, cx: &Context, replica: &Record) -> PersistResult<()> {
        let Some(master) = self.master_storage()? else {
            return Ok(());
        };
        let mut entry = key_record(master.as_ref(), replica);
        match master.try_delete(cx, &mut entry) {
            Ok(true) => {}
            Ok(false) => {
                trace!(record = %replica.to_string_key_only(), "master entry already gone");
            }
            Err(e) => match master_failure(e) {
                unavailable @ PersistError::MasterUnavailable(_) => return Err(unavailable),
                other => {
                    warn!(
                        record = %replica.to_string_key_only(),
                        error = %other,
                        "master delete failed, leaving it to resync"
                    );
                }
            },
        }
        Ok(())
    }

    /// Deletes the replica entry for `replica` outside the caller's
    /// transaction, so it survives the caller rolling back after the
    /// failure it is about to receive.
    fn delete_replica(&self, replica: &Record) {
        let cx = Context::new().suspended();
        let mut stale = key_record(self.replica.as_ref(), replica);
        match self.replica.try_delete(&cx, &mut stale) {
            Ok(true) => {
                info!(record = %replica.to_string_key_only(), "deleted replica entry missing from master");
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    record = %replica.to_string_key_only(),
                    error = %e,
                    "cannot delete replica entry missing from master"
                );
            }
        }
    }

    /// Makes the replica entry agree with the master entry.
    ///
    /// Either entry may be absent. The work runs in one replica
    /// transaction, nested in the context's transaction if it has one, with
    /// replication suspended. Failures abort that transaction, are logged,
    /// and are returned.
    pub fn resync_entries(
        &self,
        cx: &Context,
        replica_entry: Option<&Record>,
        master_entry: Option<&Record>,
    ) -> PersistResult<RepairAction> {
        match (replica_entry, master_entry) {
            (None, None) => return Ok(RepairAction::None),
            (Some(r), Some(m)) if r.equal_properties(m) => return Ok(RepairAction::None),
            _ => {}
        }

        let cx = cx.suspended();
        let txn = self.replica_repo.enter_transaction(&cx, None)?;
        let txn_cx = cx.with_transaction(Arc::clone(&txn));
        let result = self
            .apply_entries(&txn_cx, replica_entry, master_entry)
            .and_then(|action| txn.commit().map(|()| action));
        if let Err(e) = txn.exit() {
            warn!(transaction = %txn.id(), error = %e, "cannot exit repair transaction");
        }

        let key = replica_entry
            .or(master_entry)
            .map(Record::to_string_key_only)
            .unwrap_or_default();
        match &result {
            Ok(action) => debug!(record = %key, ?action, "entry resynchronized"),
            Err(e) => error!(record = %key, error = %e, "cannot resynchronize entry"),
        }
        result
    }

    fn apply_entries(
        &self,
        cx: &Context,
        replica_entry: Option<&Record>,
        master_entry: Option<&Record>,
    ) -> PersistResult<RepairAction> {
        match (replica_entry, master_entry) {
            (None, None) => Ok(RepairAction::None),
            (None, Some(master)) => {
                let mut fresh = self.replica.prepare();
                master.copy_all_properties(&mut fresh);
                fresh.mark_all_properties_dirty();
                self.insert_replica(cx, &mut fresh)?;
                Ok(RepairAction::Inserted)
            }
            (Some(replica), None) => {
                let mut stale = key_record(self.replica.as_ref(), replica);
                self.replica.try_delete(cx, &mut stale)?;
                Ok(RepairAction::Deleted)
            }
            (Some(replica), Some(master)) => {
                // Properties the master cannot hold keep their replica
                // values; everything else follows the master, unset included.
                let mut fresh = self.replica.prepare();
                replica.copy_all_properties(&mut fresh);
                master.mirror_supported_properties(&mut fresh);
                fresh.mark_all_properties_dirty();

                let mut stale = key_record(self.replica.as_ref(), replica);
                match self.replica.delete(cx, &mut stale) {
                    Ok(()) => {
                        self.insert_replica(cx, &mut fresh)?;
                        Ok(RepairAction::Replaced)
                    }
                    Err(delete_err) => {
                        warn!(
                            record = %replica.to_string_key_only(),
                            error = %delete_err,
                            "cannot delete replica entry, updating in place"
                        );
                        self.replica.update(cx, &mut fresh).map_err(|update_err| {
                            error!(
                                record = %replica.to_string_key_only(),
                                error = %update_err,
                                "cannot update replica entry in place, abandoning repair"
                            );
                            update_err
                        })?;
                        Ok(RepairAction::UpdatedInPlace)
                    }
                }
            }
        }
    }

    fn insert_replica(&self, cx: &Context, fresh: &mut Record) -> PersistResult<()> {
        match self.replica.insert(cx, fresh) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(
                    record = %fresh.to_string_key_only(),
                    error = %first,
                    "replica insert failed, retrying after delete"
                );
                let mut stale = key_record(self.replica.as_ref(), fresh);
                self.replica.try_delete(cx, &mut stale)?;
                fresh.mark_all_properties_dirty();
                self.replica.insert(cx, fresh)
            }
        }
    }

    /// Schedules an asynchronous repair of the entry `replica` refers to.
    ///
    /// Both views are loaded first; nothing is scheduled when the key
    /// cannot be resolved, when neither side holds the entry, or when both
    /// already agree. Returns true if a repair was queued.
    pub fn repair(&self, replica: &Record) -> bool {
        let candidate = replica.clone();
        let master = match self.master_storage() {
            Ok(Some(master)) => master,
            Ok(None) => return false,
            Err(e) => {
                debug!(record = %candidate.to_string_key_only(), error = %e, "no master, repair skipped");
                return false;
            }
        };
        let cx = Context::new().suspended();
        let views = self
            .load_view(&cx, self.replica.as_ref(), &candidate)
            .and_then(|r| Ok((r, self.load_view(&cx, master.as_ref(), &candidate)?)));
        match views {
            Ok((None, None)) => return false,
            Ok((Some(r), Some(m))) if r.equal_properties(&m) => return false,
            Ok(_) => {}
            Err(e) => {
                debug!(record = %candidate.to_string_key_only(), error = %e, "cannot load entry, repair skipped");
                return false;
            }
        }

        let Some(this) = self.this.upgrade() else {
            return false;
        };
        let label = candidate.to_string_key_only();
        self.executor
            .submit(label, move || this.run_repair(&candidate).map(|_| ()))
    }

    /// Re-verifies and repairs one entry under a fresh replica transaction.
    fn run_repair(&self, candidate: &Record) -> RepositoryResult<RepairAction> {
        let Some(master) = self.master_storage()? else {
            return Ok(RepairAction::None);
        };
        let base = Context::new().suspended();
        let txn = self.replica_repo.enter_transaction(&base, None)?;
        let cx = base.with_transaction(Arc::clone(&txn));
        let result = self.verify_and_resync(&cx, master.as_ref(), candidate).and_then(|action| {
            txn.commit()?;
            Ok(action)
        });
        if let Err(e) = txn.exit() {
            warn!(transaction = %txn.id(), error = %e, "cannot exit repair transaction");
        }
        result.map_err(RepositoryError::from)
    }

    fn verify_and_resync(&self, cx: &Context, master: &dyn Storage, candidate: &Record) -> PersistResult<RepairAction> {
        let replica_view = self.load_view(cx, self.replica.as_ref(), candidate)?;
        let master_view = self.load_view(cx, master, candidate)?;
        self.resync_entries(cx, replica_view.as_ref(), master_view.as_ref())
    }

    /// Loads the entry `candidate` refers to from `storage`. A replica row
    /// that no longer decodes is returned as a key-only record so it gets
    /// replaced.
    fn load_view(&self, cx: &Context, storage: &dyn Storage, candidate: &Record) -> FetchResult<Option<Record>> {
        let mut view = key_record(storage, candidate);
        match storage.load(cx, &mut view) {
            Ok(true) => Ok(Some(view)),
            Ok(false) => Ok(None),
            Err(e) if e.is_corrupt() && candidate.is_primary_key_initialized() => {
                let recovered = e
                    .recovered_key()
                    .cloned()
                    .unwrap_or_else(|| key_record(storage, candidate));
                Ok(Some(recovered))
            }
            Err(e) => Err(e),
        }
    }
}

fn user_states(state: TriggerState) -> Option<TriggerStates> {
    state
        .and_then(|s| s.downcast::<TriggerStates>().ok())
        .map(|s| *s)
}

impl Trigger for ReplicationTrigger {
    fn before_insert(&self, cx: &Context, record: &mut Record) -> PersistResult<TriggerState> {
        if cx.is_suspended() {
            return Ok(None);
        }
        let states = self.user_triggers.before_insert(cx, record)?;
        match self.master_insert(cx, record) {
            Ok(()) => Ok(Some(Box::new(states))),
            Err(e) => {
                self.user_triggers.failed_insert(cx, record, states);
                Err(e)
            }
        }
    }

    fn after_insert(&self, cx: &Context, record: &mut Record, state: TriggerState) -> PersistResult<()> {
        match user_states(state) {
            Some(states) => self.user_triggers.after_insert(cx, record, states),
            None => Ok(()),
        }
    }

    fn failed_insert(&self, cx: &Context, record: &Record, state: TriggerState) {
        if let Some(states) = user_states(state) {
            self.user_triggers.failed_insert(cx, record, states);
        }
    }

    fn before_update(&self, cx: &Context, record: &mut Record) -> PersistResult<TriggerState> {
        if cx.is_suspended() {
            return Ok(None);
        }
        let states = self.user_triggers.before_update(cx, record)?;
        match self.master_update(cx, record) {
            Ok(()) => Ok(Some(Box::new(states))),
            Err(e) => {
                self.user_triggers.failed_update(cx, record, states);
                Err(e)
            }
        }
    }

    fn after_update(&self, cx: &Context, record: &mut Record, state: TriggerState) -> PersistResult<()> {
        match user_states(state) {
            Some(states) => self.user_triggers.after_update(cx, record, states),
            None => Ok(()),
        }
    }

    fn failed_update(&self, cx: &Context, record: &Record, state: TriggerState) {
        if let Some(states) = user_states(state) {
            self.user_triggers.failed_update(cx, record, states);
        }
    }

    fn before_delete(&self, cx: &Context, record: &mut Record) -> PersistResult<TriggerState> {
        if cx.is_suspended() {
            return Ok(None);
        }
        let states = self.user_triggers.before_delete(cx, record)?;
        match self.master_delete(cx, record) {
            Ok(()) => Ok(Some(Box::new(states))),
            Err(e) => {
                self.user_triggers.failed_delete(cx, record, states);
                Err(e)
            }
        }
    }

    fn after_delete(&self, cx: &Context, record: &mut Record, state: TriggerState) -> PersistResult<()> {
        match user_states(state) {
            Some(states) => self.user_triggers.after_delete(cx, record, states),
            None => Ok(()),
        }
    }

    fn failed_delete(&self, cx: &Context, record: &Record, state: TriggerState) {
        if let Some(states) = user_states(state) {
            self.user_triggers.failed_delete(cx, record, states);
        }
    }

    fn after_load(&self, cx: &Context, record: &mut Record) -> FetchResult<()> {
        if cx.is_suspended() {
            return Ok(());
        }
        self.user_triggers.after_load(cx, record)
    }
}

impl fmt::Debug for ReplicationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationTrigger")
            .field("schema", &self.schema.name())
            .field("replica", &self.replica_repo.name())
            .field("master", &self.master_repo.name())
            .field("master_state", &self.master_state())
            .field("user_triggers", &self.user_triggers.len())
            .finish()
    }
}
