//! Replicated storage for one record type.
//!
//! Reads are served by the replica. Writes go to the replica storage, whose
//! registered [`ReplicationTrigger`] performs each write on the master
//! first. When the caller is not already inside a transaction covering the
//! replica, every write is wrapped in a composite master/replica
//! transaction so both sides commit or roll back together.

use crate::lob::LobReplicationTrigger;
use crate::transaction::RepositoryPair;
use crate::trigger::{master_failure, MasterState, ReplicationTrigger};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use twinstore_storage::{
    Context, Cursor, FetchResult, LobKind, PersistResult, Query, Record, RecordLayout, Schema,
    Storage, Transaction, Trigger, TriggerId,
};

/// A [`Storage`] that keeps a replica in step with its master.
pub struct ReplicatedStorage {
    trigger: Arc<ReplicationTrigger>,
    pair: RepositoryPair,
    registrations: Vec<TriggerId>,
}

impl ReplicatedStorage {
    /// Registers `trigger` on its replica storage and returns the facade.
    ///
    /// With `replicate_lobs`, large-object wrappers are registered for the
    /// blob and clob properties of the type, ahead of the replication
    /// trigger so user triggers already see the wrapped handles.
    pub(crate) fn new(trigger: Arc<ReplicationTrigger>, pair: RepositoryPair, replicate_lobs: bool) -> Self {
        let replica = Arc::clone(trigger.replica());
        let mut registrations = Vec::new();
        if replicate_lobs {
            for kind in [LobKind::Binary, LobKind::Character] {
                if let Some(lobs) = LobReplicationTrigger::for_kind(kind, &trigger) {
                    registrations.push(replica.add_trigger(Arc::new(lobs)));
                }
            }
        }
        let hook: Arc<dyn Trigger> = Arc::clone(&trigger) as Arc<dyn Trigger>;
        registrations.push(replica.add_trigger(hook));
        debug!(
            schema = trigger.schema().name(),
            triggers = registrations.len(),
            master_state = ?trigger.master_state(),
            "replicated storage ready"
        );
        Self {
            trigger,
            pair,
            registrations,
        }
    }

    /// Returns the replication trigger.
    #[must_use]
    pub fn trigger(&self) -> &Arc<ReplicationTrigger> {
        &self.trigger
    }

    /// Returns whether the master side is usable.
    #[must_use]
    pub fn master_state(&self) -> MasterState {
        self.trigger.master_state()
    }

    /// Returns the underlying replica storage.
    #[must_use]
    pub fn replica_storage(&self) -> &Arc<dyn Storage> {
        self.trigger.replica()
    }

    fn replica(&self) -> &dyn Storage {
        self.trigger.replica().as_ref()
    }

    fn enter(&self, cx: &Context) -> PersistResult<Arc<dyn Transaction>> {
        let txn = if self.master_state() == MasterState::Unsupported {
            self.pair.replica.enter_transaction(cx, None)?
        } else {
            self.pair.enter(cx, None)?
        };
        Ok(txn)
    }

    /// Runs `op` inside a transaction that spans master and replica.
    ///
    /// Suspended contexts and contexts already carrying a replica
    /// transaction run `op` as they are.
    fn in_transaction<T>(&self, cx: &Context, op: impl FnOnce(&Context) -> PersistResult<T>) -> PersistResult<T> {
        if cx.is_suspended() || cx.transaction_for(self.pair.replica.id()).is_some() {
            return op(cx);
        }
        let txn = self.enter(cx)?;
        let txn_cx = cx.with_transaction(Arc::clone(&txn));
        let result = op(&txn_cx).and_then(|value| {
            txn.commit()?;
            Ok(value)
        });
        if let Err(e) = txn.exit() {
            warn!(transaction = %txn.id(), error = %e, "cannot exit write transaction");
        }
        result
    }
}

impl Storage for ReplicatedStorage {
    fn schema(&self) -> &Arc<Schema> {
        self.trigger.schema()
    }

    fn layout(&self) -> &Arc<RecordLayout> {
        self.replica().layout()
    }

    fn prepare(&self) -> Record {
        self.replica().prepare()
    }

    fn load(&self, cx: &Context, record: &mut Record) -> FetchResult<bool> {
        self.replica().load(cx, record)
    }

    fn query(&self, cx: &Context, query: &Query) -> FetchResult<Box<dyn Cursor>> {
        self.replica().query(cx, query)
    }

    fn query_after(&self, cx: &Context, query: &Query, after: &Record) -> FetchResult<Box<dyn Cursor>> {
        self.replica().query_after(cx, query, after)
    }

    fn insert(&self, cx: &Context, record: &mut Record) -> PersistResult<()> {
        self.in_transaction(cx, |cx| self.replica().insert(cx, record))
    }

    fn update(&self, cx: &Context, record: &mut Record) -> PersistResult<()> {
        self.in_transaction(cx, |cx| self.replica().update(cx, record))
    }

    fn delete(&self, cx: &Context, record: &mut Record) -> PersistResult<()> {
        self.in_transaction(cx, |cx| self.replica().delete(cx, record))
    }

    fn truncate(&self, cx: &Context) -> PersistResult<()> {
        self.in_transaction(cx, |cx| {
            if !cx.is_suspended() {
                if let Some(master) = self.trigger.master_storage()? {
                    master.truncate(cx).map_err(master_failure)?;
                }
            }
            self.replica().truncate(&cx.suspended())
        })
    }

    fn add_trigger(&self, trigger: Arc<dyn Trigger>) -> TriggerId {
        self.trigger.user_triggers().add(trigger)
    }

    fn remove_trigger(&self, id: TriggerId) -> bool {
        self.trigger.user_triggers().remove(id)
    }

    fn natural_order(&self) -> Option<Vec<String>> {
        self.replica().natural_order()
    }
}

impl Drop for ReplicatedStorage {
    fn drop(&mut self) {
        let replica = self.trigger.replica();
        for id in self.registrations.drain(..) {
            replica.remove_trigger(id);
        }
    }
}

impl fmt::Debug for ReplicatedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedStorage")
            .field("schema", &self.trigger.schema().name())
            .field("master_state", &self.master_state())
            .field("registrations", &self.registrations)
            .finish()
    }
}
