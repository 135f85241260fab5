//! Cursors over in-memory query results.

use super::table::RowKey;
use super::EngineState;
use crate::context::Context;
use crate::cursor::Cursor;
use crate::error::{FetchError, FetchResult};
use crate::record::Record;
use crate::trigger::TriggerManager;
use crate::value::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// One query result, positioned by its sort values and primary key.
pub(crate) struct Entry {
    pub(crate) sort: Vec<Value>,
    pub(crate) key: RowKey,
    item: FetchResult<Record>,
}

impl Entry {
    pub(crate) fn new(sort: Vec<Value>, key: RowKey, item: FetchResult<Record>) -> Self {
        Self { sort, key, item }
    }
}

/// Cursor returned by [`MemoryStorage`](super::MemoryStorage) queries.
///
/// Results are captured when the query opens. Rows that failed to decode
/// stay in position and raise their error when reached.
pub struct MemoryCursor {
    engine: Arc<EngineState>,
    entries: VecDeque<Entry>,
    cx: Context,
    triggers: Arc<TriggerManager>,
}

impl MemoryCursor {
    pub(crate) fn new(
        engine: Arc<EngineState>,
        entries: Vec<Entry>,
        cx: Context,
        triggers: Arc<TriggerManager>,
    ) -> Self {
        Self {
            engine,
            entries: entries.into(),
            cx,
            triggers,
        }
    }
}

impl Cursor for MemoryCursor {
    fn has_next(&mut self) -> FetchResult<bool> {
        if self.entries.is_empty() {
            return Ok(false);
        }
        self.engine.check_available()?;
        Ok(true)
    }

    fn next(&mut self) -> FetchResult<Record> {
        self.engine.check_available()?;
        let entry = self
            .entries
            .pop_front()
            .ok_or_else(|| FetchError::no_such_record("cursor exhausted"))?;
        let mut record = entry.item?;
        self.triggers.after_load(&self.cx, &mut record)?;
        Ok(record)
    }

    fn skip_next(&mut self, n: usize) -> FetchResult<usize> {
        let n = n.min(self.entries.len());
        self.entries.drain(..n);
        Ok(n)
    }

    fn close(&mut self) -> FetchResult<()> {
        self.entries.clear();
        Ok(())
    }
}
