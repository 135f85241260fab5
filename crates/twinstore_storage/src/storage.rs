//! The per-type storage contract.

use crate::context::Context;
use crate::cursor::Cursor;
use crate::error::{FetchResult, PersistResult};
use crate::query::Query;
use crate::record::{Record, RecordLayout};
use crate::schema::Schema;
use crate::trigger::{Trigger, TriggerId};
use std::sync::Arc;

/// Access to the records of one type in one repository.
///
/// All writes run registered triggers. The `try_*` variants turn the
/// expected failure of each operation into `Ok(false)`: a uniqueness
/// conflict for inserts, absence of the row for updates and deletes. Any
/// other failure still propagates.
pub trait Storage: Send + Sync {
    /// Returns the record type.
    fn schema(&self) -> &Arc<Schema>;

    /// Returns how this store sees the record type.
    fn layout(&self) -> &Arc<RecordLayout>;

    /// Returns a blank record for this store.
    fn prepare(&self) -> Record {
        Record::new(Arc::clone(self.layout()))
    }

    /// Loads a record in place.
    ///
    /// The primary key selects the row; when it is not fully initialized
    /// the first fully initialized alternate key is used instead. Returns
    /// false if no row matches.
    fn load(&self, cx: &Context, record: &mut Record) -> FetchResult<bool>;

    /// Opens a cursor over the rows matching `query`.
    fn query(&self, cx: &Context, query: &Query) -> FetchResult<Box<dyn Cursor>>;

    /// Opens a cursor over the rows matching `query` that sort strictly
    /// after `after` in the query's order.
    fn query_after(&self, cx: &Context, query: &Query, after: &Record) -> FetchResult<Box<dyn Cursor>>;

    /// Inserts a record.
    fn insert(&self, cx: &Context, record: &mut Record) -> PersistResult<()>;

    /// Inserts a record, returning false on a uniqueness conflict.
    fn try_insert(&self, cx: &Context, record: &mut Record) -> PersistResult<bool> {
        match self.insert(cx, record) {
            Ok(()) => Ok(true),
            Err(e) if e.is_unique_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Writes the dirty properties of a record.
    fn update(&self, cx: &Context, record: &mut Record) -> PersistResult<()>;

    /// Updates a record, returning false if it does not exist.
    fn try_update(&self, cx: &Context, record: &mut Record) -> PersistResult<bool> {
        match self.update(cx, record) {
            Ok(()) => Ok(true),
            Err(e) if e.is_no_such_record() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Deletes a record by key.
    fn delete(&self, cx: &Context, record: &mut Record) -> PersistResult<()>;

    /// Deletes a record, returning false if it does not exist.
    fn try_delete(&self, cx: &Context, record: &mut Record) -> PersistResult<bool> {
        match self.delete(cx, record) {
            Ok(()) => Ok(true),
            Err(e) if e.is_no_such_record() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Removes every row without running triggers.
    fn truncate(&self, cx: &Context) -> PersistResult<()>;

    /// Registers a trigger.
    fn add_trigger(&self, trigger: Arc<dyn Trigger>) -> TriggerId;

    /// Unregisters a trigger. Returns false if it was not registered.
    fn remove_trigger(&self, id: TriggerId) -> bool;

    /// Returns the properties rows are physically ordered by, if any.
    fn natural_order(&self) -> Option<Vec<String>>;
}
