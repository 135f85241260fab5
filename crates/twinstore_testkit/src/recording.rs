//! Call-recording repository wrappers.
//!
//! [`RecordingRepository`] wraps any repository and counts the calls made
//! on the storages it hands out. Tests use it to show that repair and
//! resync never reach the master's write path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use twinstore_storage::{
    Capability, CapabilityKind, Context, Cursor, FetchResult, IsolationLevel, PersistResult, Query,
    Record, RecordLayout, Repository, RepositoryId, RepositoryResult, Schema, Storage, Transaction,
    Trigger, TriggerId,
};

/// Counts of calls by operation name.
#[derive(Debug, Default)]
pub struct CallLog {
    counts: Mutex<HashMap<&'static str, usize>>,
}

impl CallLog {
    fn hit(&self, op: &'static str) {
        *self.counts.lock().entry(op).or_insert(0) += 1;
    }

    /// Returns how often `op` was called.
    pub fn count(&self, op: &str) -> usize {
        self.counts.lock().get(op).copied().unwrap_or(0)
    }

    /// Returns the number of insert, update, delete and truncate calls.
    pub fn writes(&self) -> usize {
        ["insert", "update", "delete", "truncate"]
            .iter()
            .map(|op| self.count(op))
            .sum()
    }

    /// Forgets every recorded call.
    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

/// A repository whose storages record their calls.
pub struct RecordingRepository {
    inner: Arc<dyn Repository>,
    log: Arc<CallLog>,
}

impl RecordingRepository {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Repository>) -> Self {
        Self {
            inner,
            log: Arc::new(CallLog::default()),
        }
    }

    /// Returns the shared call log.
    pub fn log(&self) -> &Arc<CallLog> {
        &self.log
    }
}

impl Repository for RecordingRepository {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn id(&self) -> RepositoryId {
        self.inner.id()
    }

    fn storage_for(&self, schema: &Arc<Schema>) -> RepositoryResult<Arc<dyn Storage>> {
        let inner = self.inner.storage_for(schema)?;
        Ok(Arc::new(RecordingStorage {
            inner,
            log: Arc::clone(&self.log),
        }))
    }

    fn enter_transaction(
        &self,
        cx: &Context,
        isolation: Option<IsolationLevel>,
    ) -> RepositoryResult<Arc<dyn Transaction>> {
        self.log.hit("enter_transaction");
        self.inner.enter_transaction(cx, isolation)
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability> {
        self.inner.capability(kind)
    }

    fn close(&self) -> RepositoryResult<()> {
        self.inner.close()
    }
}

/// A storage that records its calls.
pub struct RecordingStorage {
    inner: Arc<dyn Storage>,
    log: Arc<CallLog>,
}

impl Storage for RecordingStorage {
    fn schema(&self) -> &Arc<Schema> {
        self.inner.schema()
    }

    fn layout(&self) -> &Arc<RecordLayout> {
        self.inner.layout()
    }

    fn load(&self, cx: &Context, record: &mut Record) -> FetchResult<bool> {
        self.log.hit("load");
        self.inner.load(cx, record)
    }

    fn query(&self, cx: &Context, query: &Query) -> FetchResult<Box<dyn Cursor>> {
        self.log.hit("query");
        self.inner.query(cx, query)
    }

    fn query_after(&self, cx: &Context, query: &Query, after: &Record) -> FetchResult<Box<dyn Cursor>> {
        self.log.hit("query");
        self.inner.query_after(cx, query, after)
    }

    fn insert(&self, cx: &Context, record: &mut Record) -> PersistResult<()> {
        self.log.hit("insert");
        self.inner.insert(cx, record)
    }

    fn update(&self, cx: &Context, record: &mut Record) -> PersistResult<()> {
        self.log.hit("update");
        self.inner.update(cx, record)
    }

    fn delete(&self, cx: &Context, record: &mut Record) -> PersistResult<()> {
        self.log.hit("delete");
        self.inner.delete(cx, record)
    }

    fn truncate(&self, cx: &Context) -> PersistResult<()> {
        self.log.hit("truncate");
        self.inner.truncate(cx)
    }

    fn add_trigger(&self, trigger: Arc<dyn Trigger>) -> TriggerId {
        self.inner.add_trigger(trigger)
    }

    fn remove_trigger(&self, id: TriggerId) -> bool {
        self.inner.remove_trigger(id)
    }

    fn natural_order(&self) -> Option<Vec<String>> {
        self.inner.natural_order()
    }
}
