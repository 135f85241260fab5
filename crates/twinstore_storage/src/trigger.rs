//! Storage triggers.
//!
//! A [`Trigger`] observes writes and loads on one storage. Registrations
//! live in a [`TriggerManager`], an ordered list in which every entry can
//! be enabled or disabled on its own. Each "before" hook may return a state
//! value; the manager keeps those in [`TriggerStates`] keyed by trigger id
//! and hands each trigger its own state in the matching "after" or
//! "failed" hook.

use crate::context::Context;
use crate::error::{FetchResult, PersistResult};
use crate::record::Record;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// State passed from a "before" hook to its "after" or "failed" hook.
pub type TriggerState = Option<Box<dyn Any + Send>>;

/// Identifier of a trigger registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerId(u64);

impl TriggerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trigger-{}", self.0)
    }
}

/// Hooks around storage operations. Every hook defaults to a no-op.
#[allow(unused_variables)]
pub trait Trigger: Send + Sync {
    /// Runs before a record is inserted. An error cancels the insert.
    fn before_insert(&self, cx: &Context, record: &mut Record) -> PersistResult<TriggerState> {
        Ok(None)
    }

    /// Runs after a successful insert.
    fn after_insert(&self, cx: &Context, record: &mut Record, state: TriggerState) -> PersistResult<()> {
        Ok(())
    }

    /// Runs after an insert failed, once `before_insert` succeeded.
    fn failed_insert(&self, cx: &Context, record: &Record, state: TriggerState) {}

    /// Runs before a record is updated. An error cancels the update.
    fn before_update(&self, cx: &Context, record: &mut Record) -> PersistResult<TriggerState> {
        Ok(None)
    }

    /// Runs after a successful update.
    fn after_update(&self, cx: &Context, record: &mut Record, state: TriggerState) -> PersistResult<()> {
        Ok(())
    }

    /// Runs after an update failed, once `before_update` succeeded.
    fn failed_update(&self, cx: &Context, record: &Record, state: TriggerState) {}

    /// Runs before a record is deleted. An error cancels the delete.
    fn before_delete(&self, cx: &Context, record: &mut Record) -> PersistResult<TriggerState> {
        Ok(None)
    }

    /// Runs after a successful delete.
    fn after_delete(&self, cx: &Context, record: &mut Record, state: TriggerState) -> PersistResult<()> {
        Ok(())
    }

    /// Runs after a delete failed, once `before_delete` succeeded.
    fn failed_delete(&self, cx: &Context, record: &Record, state: TriggerState) {}

    /// Runs after a record was loaded or fetched from a cursor.
    fn after_load(&self, cx: &Context, record: &mut Record) -> FetchResult<()> {
        Ok(())
    }
}

/// "Before" results collected across all enabled triggers.
#[derive(Default)]
pub struct TriggerStates {
    entries: Vec<(TriggerId, TriggerState)>,
}

impl TriggerStates {
    /// Takes the state stored for `id`.
    pub fn take(&mut self, id: TriggerId) -> TriggerState {
        self.entries
            .iter_mut()
            .find(|(entry, _)| *entry == id)
            .and_then(|(_, state)| state.take())
    }

    /// Returns the number of triggers that ran.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn ids(&self) -> Vec<TriggerId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }
}

impl fmt::Debug for TriggerStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(id, s)| (id, s.is_some())))
            .finish()
    }
}

struct Registration {
    id: TriggerId,
    trigger: Arc<dyn Trigger>,
    enabled: AtomicBool,
}

#[derive(Clone, Copy)]
enum Op {
    Insert,
    Update,
    Delete,
}

/// Ordered, individually switchable list of triggers.
#[derive(Default)]
pub struct TriggerManager {
    registrations: RwLock<Vec<Arc<Registration>>>,
}

impl TriggerManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a trigger and returns its registration id.
    pub fn add(&self, trigger: Arc<dyn Trigger>) -> TriggerId {
        let id = TriggerId::next();
        self.registrations.write().push(Arc::new(Registration {
            id,
            trigger,
            enabled: AtomicBool::new(true),
        }));
        id
    }

    /// Removes a registration. Returns false if it was not present.
    pub fn remove(&self, id: TriggerId) -> bool {
        let mut regs = self.registrations.write();
        let before = regs.len();
        regs.retain(|r| r.id != id);
        regs.len() != before
    }

    /// Enables or disables one registration. Returns false if unknown.
    pub fn set_enabled(&self, id: TriggerId, enabled: bool) -> bool {
        match self.registrations.read().iter().find(|r| r.id == id) {
            Some(r) => {
                r.enabled.store(enabled, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Returns true if the registration exists and is enabled.
    #[must_use]
    pub fn is_enabled(&self, id: TriggerId) -> bool {
        self.registrations
            .read()
            .iter()
            .any(|r| r.id == id && r.enabled.load(Ordering::SeqCst))
    }

    /// Returns the number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    // Snapshot so hooks can re-enter storage without holding the lock.
    fn active(&self) -> Vec<Arc<Registration>> {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.enabled.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }

    fn lookup(&self, ids: &[TriggerId]) -> Vec<Arc<Registration>> {
        let regs = self.registrations.read();
        ids.iter()
            .filter_map(|id| regs.iter().find(|r| r.id == *id).cloned())
            .collect()
    }

    fn before(&self, op: Op, cx: &Context, record: &mut Record) -> PersistResult<TriggerStates> {
        let mut states = TriggerStates::default();
        for reg in self.active() {
            let result = match op {
                Op::Insert => reg.trigger.before_insert(cx, record),
                Op::Update => reg.trigger.before_update(cx, record),
                Op::Delete => reg.trigger.before_delete(cx, record),
            };
            match result {
                Ok(state) => states.entries.push((reg.id, state)),
                Err(e) => {
                    self.failed(op, cx, record, states);
                    return Err(e);
                }
            }
        }
        Ok(states)
    }

    fn after(&self, op: Op, cx: &Context, record: &mut Record, mut states: TriggerStates) -> PersistResult<()> {
        for reg in self.lookup(&states.ids()) {
            let state = states.take(reg.id);
            match op {
                Op::Insert => reg.trigger.after_insert(cx, record, state)?,
                Op::Update => reg.trigger.after_update(cx, record, state)?,
                Op::Delete => reg.trigger.after_delete(cx, record, state)?,
            }
        }
        Ok(())
    }

    fn failed(&self, op: Op, cx: &Context, record: &Record, mut states: TriggerStates) {
        let mut regs = self.lookup(&states.ids());
        regs.reverse();
        for reg in regs {
            let state = states.take(reg.id);
            match op {
                Op::Insert => reg.trigger.failed_insert(cx, record, state),
                Op::Update => reg.trigger.failed_update(cx, record, state),
                Op::Delete => reg.trigger.failed_delete(cx, record, state),
            }
        }
    }

    /// Runs `before_insert` on every enabled trigger in order. If one fails,
    /// the triggers that already ran get `failed_insert` in reverse order.
    pub fn before_insert(&self, cx: &Context, record: &mut Record) -> PersistResult<TriggerStates> {
        self.before(Op::Insert, cx, record)
    }

    /// Runs `after_insert` for the triggers that ran `before_insert`.
    pub fn after_insert(&self, cx: &Context, record: &mut Record, states: TriggerStates) -> PersistResult<()> {
        self.after(Op::Insert, cx, record, states)
    }

    /// Runs `failed_insert` for the triggers that ran `before_insert`.
    pub fn failed_insert(&self, cx: &Context, record: &Record, states: TriggerStates) {
        self.failed(Op::Insert, cx, record, states);
    }

    /// Runs `before_update` on every enabled trigger in order.
    pub fn before_update(&self, cx: &Context, record: &mut Record) -> PersistResult<TriggerStates> {
        self.before(Op::Update, cx, record)
    }

    /// Runs `after_update` for the triggers that ran `before_update`.
    pub fn after_update(&self, cx: &Context, record: &mut Record, states: TriggerStates) -> PersistResult<()> {
        self.after(Op::Update, cx, record, states)
    }

    /// Runs `failed_update` for the triggers that ran `before_update`.
    pub fn failed_update(&self, cx: &Context, record: &Record, states: TriggerStates) {
        self.failed(Op::Update, cx, record, states);
    }

    /// Runs `before_delete` on every enabled trigger in order.
    pub fn before_delete(&self, cx: &Context, record: &mut Record) -> PersistResult<TriggerStates> {
        self.before(Op::Delete, cx, record)
    }

    /// Runs `after_delete` for the triggers that ran `before_delete`.
    pub fn after_delete(&self, cx: &Context, record: &mut Record, states: TriggerStates) -> PersistResult<()> {
        self.after(Op::Delete, cx, record, states)
    }

    /// Runs `failed_delete` for the triggers that ran `before_delete`.
    pub fn failed_delete(&self, cx: &Context, record: &Record, states: TriggerStates) {
        self.failed(Op::Delete, cx, record, states);
    }

    /// Runs `after_load` on every enabled trigger in order.
    pub fn after_load(&self, cx: &Context, record: &mut Record) -> FetchResult<()> {
        for reg in self.active() {
            reg.trigger.after_load(cx, record)?;
        }
        Ok(())
    }

    /// Runs a write through the before/after/failed protocol.
    ///
    /// `write` performs the actual store operation. The record is passed
    /// through every stage so hooks see the values the store produced.
    pub fn run_insert<F>(&self, cx: &Context, record: &mut Record, write: F) -> PersistResult<()>
    where
        F: FnOnce(&mut Record) -> PersistResult<()>,
    {
        self.run(Op::Insert, cx, record, write)
    }

    /// Update counterpart of [`run_insert`](Self::run_insert).
    pub fn run_update<F>(&self, cx: &Context, record: &mut Record, write: F) -> PersistResult<()>
    where
        F: FnOnce(&mut Record) -> PersistResult<()>,
    {
        self.run(Op::Update, cx, record, write)
    }

    /// Delete counterpart of [`run_insert`](Self::run_insert).
    pub fn run_delete<F>(&self, cx: &Context, record: &mut Record, write: F) -> PersistResult<()>
    where
        F: FnOnce(&mut Record) -> PersistResult<()>,
    {
        self.run(Op::Delete, cx, record, write)
    }

    fn run<F>(&self, op: Op, cx: &Context, record: &mut Record, write: F) -> PersistResult<()>
    where
        F: FnOnce(&mut Record) -> PersistResult<()>,
    {
        let states = self.before(op, cx, record)?;
        match write(record) {
            Ok(()) => self.after(op, cx, record, states),
            Err(e) => {
                debug!(record = %record.to_string_key_only(), error = %e, "store write failed");
                self.failed(op, cx, record, states);
                Err(e)
            }
        }
    }
}

impl fmt::Debug for TriggerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regs = self.registrations.read();
        f.debug_list()
            .entries(
                regs.iter()
                    .map(|r| (r.id, r.enabled.load(Ordering::SeqCst))),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistError;
    use crate::record::RecordLayout;
    use crate::schema::{PropertyKind, Schema};
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_before: bool,
    }

    impl Trigger for Recorder {
        fn before_insert(&self, _cx: &Context, _r: &mut Record) -> PersistResult<TriggerState> {
            self.log.lock().push(format!("{}:before", self.name));
            if self.fail_before {
                return Err(PersistError::Unsupported("refused".into()));
            }
            Ok(Some(Box::new(self.name)))
        }

        fn after_insert(&self, _cx: &Context, _r: &mut Record, state: TriggerState) -> PersistResult<()> {
            let state = state.and_then(|s| s.downcast::<&'static str>().ok());
            self.log.lock().push(format!("{}:after:{}", self.name, state.map_or("-", |s| *s)));
            Ok(())
        }

        fn failed_insert(&self, _cx: &Context, _r: &Record, _state: TriggerState) {
            self.log.lock().push(format!("{}:failed", self.name));
        }
    }

    fn record() -> Record {
        let schema = Schema::builder("T")
            .key("id", PropertyKind::Integer)
            .build()
            .unwrap();
        Record::new(RecordLayout::new(schema)).with("id", 1).unwrap()
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, fail_before: bool) -> Arc<dyn Trigger> {
        Arc::new(Recorder {
            name,
            log: Arc::clone(log),
            fail_before,
        })
    }

    #[test]
    fn dispatches_in_order_with_own_state() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = TriggerManager::new();
        mgr.add(recorder("a", &log, false));
        mgr.add(recorder("b", &log, false));

        let mut r = record();
        mgr.run_insert(&Context::new(), &mut r, |_| Ok(())).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["a:before", "b:before", "a:after:a", "b:after:b"]
        );
    }

    #[test]
    fn disabled_triggers_are_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = TriggerManager::new();
        let a = mgr.add(recorder("a", &log, false));
        mgr.add(recorder("b", &log, false));
        assert!(mgr.set_enabled(a, false));
        assert!(!mgr.is_enabled(a));

        let mut r = record();
        mgr.run_insert(&Context::new(), &mut r, |_| Ok(())).unwrap();
        assert_eq!(*log.lock(), vec!["b:before", "b:after:b"]);
    }

    #[test]
    fn before_failure_unwinds_earlier_triggers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = TriggerManager::new();
        mgr.add(recorder("a", &log, false));
        mgr.add(recorder("b", &log, true));

        let mut r = record();
        let called = std::cell::Cell::new(false);
        let err = mgr
            .run_insert(&Context::new(), &mut r, |_| {
                called.set(true);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, PersistError::Unsupported(_)));
        assert!(!called.get());
        assert_eq!(*log.lock(), vec!["a:before", "b:before", "a:failed"]);
    }

    #[test]
    fn write_failure_runs_failed_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = TriggerManager::new();
        mgr.add(recorder("a", &log, false));

        let mut r = record();
        let err = mgr
            .run_insert(&Context::new(), &mut r, |_| Err(PersistError::unique("T{id=1}", "pk")))
            .unwrap_err();
        assert!(err.is_unique_conflict());
        assert_eq!(*log.lock(), vec!["a:before", "a:failed"]);
    }

    #[test]
    fn remove_unregisters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mgr = TriggerManager::new();
        let id = mgr.add(recorder("a", &log, false));
        assert!(mgr.remove(id));
        assert!(!mgr.remove(id));
        assert_eq!(mgr.len(), 0);
    }
}
