//! Per-type storage of the in-memory engine.

use super::cursor::{Entry, MemoryCursor};
use super::encoding::{decode_row, encode_row, StoredValue, CORRUPT_ROW};
use super::lob::MemoryLob;
use super::table::{RowKey, StoredRow, Table};
use super::transaction::MemoryTransaction;
use super::EngineState;
use crate::context::Context;
use crate::cursor::Cursor;
use crate::error::{FetchError, FetchResult, PersistError, PersistResult};
use crate::lob::{LobBuffer, LobKind, LobRef};
use crate::query::{OrderTerm, Query};
use crate::record::{PropertyState, Record, RecordLayout};
use crate::schema::Schema;
use crate::storage::Storage;
use crate::trigger::{Trigger, TriggerId, TriggerManager};
use crate::value::Value;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Storage for one record type in a [`MemoryRepository`](super::MemoryRepository).
///
/// Writes take effect immediately. When the context carries a transaction
/// of the owning repository, previous row images are logged so the
/// transaction can roll them back.
pub struct MemoryStorage {
    engine: Arc<EngineState>,
    schema: Arc<Schema>,
    layout: Arc<RecordLayout>,
    table: Arc<RwLock<Table>>,
    triggers: Arc<TriggerManager>,
    natural_order: Option<Vec<String>>,
}

impl MemoryStorage {
    pub(crate) fn new(
        engine: Arc<EngineState>,
        layout: Arc<RecordLayout>,
        natural_order: Option<Vec<String>>,
    ) -> Self {
        Self {
            engine,
            schema: Arc::clone(layout.schema()),
            layout,
            table: Arc::new(RwLock::new(Table::new())),
            triggers: Arc::new(TriggerManager::new()),
            natural_order,
        }
    }

    /// Returns the number of stored rows, including undecodable ones.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.table.read().rows.len()
    }

    /// Returns the registered triggers.
    #[must_use]
    pub fn triggers(&self) -> &TriggerManager {
        &self.triggers
    }

    /// Overwrites the stored encoding of the row with primary key `key` so
    /// that it no longer decodes. When `recoverable` is true, fetching the
    /// row still reports its primary key. Returns false if no such row.
    pub fn corrupt_row(&self, key: &[Value], recoverable: bool) -> bool {
        let mut table = self.table.write();
        match table.rows.get_mut(&RowKey(key.to_vec())) {
            Some(row) => {
                row.bytes = CORRUPT_ROW.to_vec();
                row.key_recoverable = recoverable;
                debug!(repository = %self.engine.name, schema = self.schema.name(), ?key, recoverable, "row corrupted");
                true
            }
            None => false,
        }
    }

    fn transaction<'a>(&self, cx: &'a Context) -> PersistResult<Option<&'a MemoryTransaction>> {
        let Some(txn) = cx.transaction_for(self.engine.id) else {
            return Ok(None);
        };
        let txn = txn
            .as_any()
            .downcast_ref::<MemoryTransaction>()
            .ok_or_else(|| {
                PersistError::Unsupported(format!(
                    "{} does not belong to repository {}",
                    txn.id(),
                    self.engine.name
                ))
            })?;
        txn.check_open()?;
        Ok(Some(txn))
    }

    fn key_from(&self, get: impl Fn(usize) -> Option<Value>, indexes: &[usize]) -> Option<RowKey> {
        let mut values = Vec::with_capacity(indexes.len());
        for &i in indexes {
            match get(i) {
                Some(Value::Null) | None => return None,
                Some(v) => values.push(v),
            }
        }
        Some(RowKey(values))
    }

    fn record_value(record: &Record) -> impl Fn(usize) -> Option<Value> + '_ {
        move |i| (record.state(i) != PropertyState::Uninitialized).then(|| record.value(i).clone())
    }

    fn primary_key(&self, record: &Record) -> Option<RowKey> {
        self.key_from(Self::record_value(record), self.schema.primary_key())
    }

    fn alternate_keys_with(&self, get: impl Fn(usize) -> Option<Value>) -> Vec<Option<RowKey>> {
        self.schema
            .alternate_keys()
            .iter()
            .map(|ak| self.key_from(&get, &ak.properties))
            .collect()
    }

    /// Resolves the primary key of the row `record` refers to. `Ok(None)`
    /// means the record names an alternate key that no row holds.
    fn resolve_key(&self, table: &Table, record: &Record) -> FetchResult<Option<RowKey>> {
        if let Some(key) = self.primary_key(record) {
            return Ok(Some(key));
        }
        for (i, ak) in self.schema.alternate_keys().iter().enumerate() {
            if let Some(alt) = self.key_from(Self::record_value(record), &ak.properties) {
                return Ok(table.find_by_alternate(i, &alt));
            }
        }
        Err(FetchError::InvalidQuery(format!(
            "{} has no initialized key",
            record.to_string_key_only()
        )))
    }

    fn key_only(&self, key: &RowKey) -> Record {
        let mut record = self.prepare();
        for (n, &i) in self.schema.primary_key().iter().enumerate() {
            record.load_at(i, key.0[n].clone(), PropertyState::Clean);
        }
        record
    }

    fn key_value(&self, key: &RowKey, property: &str) -> Value {
        self.schema
            .index_of(property)
            .and_then(|i| self.schema.primary_key().iter().position(|&k| k == i))
            .map_or(Value::Null, |n| key.0[n].clone())
    }

    fn lob_handle(&self, table: &Table, locator: u64, kind: LobKind, buffer: Arc<LobBuffer>) -> LobRef {
        LobRef::new(MemoryLob::new(
            Arc::clone(&self.engine),
            table.store,
            locator,
            kind,
            buffer,
        ))
    }

    /// Encodes property `index` of `record`, importing foreign large objects
    /// into this table.
    fn to_slot(&self, table: &mut Table, record: &mut Record, index: usize) -> PersistResult<StoredValue> {
        let value = record.value(index).clone();
        Ok(match value {
            Value::Null => StoredValue::Null,
            Value::Bool(b) => StoredValue::Bool(b),
            Value::Integer(n) => StoredValue::Integer(n),
            Value::Text(s) => StoredValue::Text(s),
            Value::Bytes(b) => StoredValue::Bytes(b),
            Value::Blob(lob) | Value::Clob(lob) => {
                let id = lob.identity();
                if id.store == table.store && table.lobs.contains_key(&id.locator) {
                    StoredValue::Lob(id.locator)
                } else {
                    let data = lob.read_to_vec()?;
                    let (locator, buffer) = table.allocate_lob(data);
                    trace!(schema = self.schema.name(), locator, "imported large object");
                    let local = self.lob_handle(table, locator, lob.kind(), buffer);
                    record.replace_lob(index, local);
                    StoredValue::Lob(locator)
                }
            }
        })
    }

    fn from_slot(&self, table: &Table, index: usize, slot: StoredValue) -> Value {
        match slot {
            StoredValue::Null => Value::Null,
            StoredValue::Bool(b) => Value::Bool(b),
            StoredValue::Integer(n) => Value::Integer(n),
            StoredValue::Text(s) => Value::Text(s),
            StoredValue::Bytes(b) => Value::Bytes(b),
            StoredValue::Lob(locator) => {
                let kind = self
                    .schema
                    .property(index)
                    .kind
                    .lob_kind()
                    .unwrap_or(LobKind::Binary);
                let buffer = table
                    .lobs
                    .get(&locator)
                    .cloned()
                    .unwrap_or_else(|| LobBuffer::new(Vec::new()));
                let handle = self.lob_handle(table, locator, kind, buffer);
                match kind {
                    LobKind::Binary => Value::Blob(handle),
                    LobKind::Character => Value::Clob(handle),
                }
            }
        }
    }

    fn load_slots(&self, table: &Table, slots: Vec<Option<StoredValue>>, record: &mut Record) {
        for (i, slot) in slots.into_iter().enumerate() {
            if !record.layout().is_supported(i) {
                continue;
            }
            match slot {
                Some(s) => record.load_at(i, self.from_slot(table, i, s), PropertyState::Clean),
                None => record.load_at(i, Value::Null, PropertyState::Uninitialized),
            }
        }
    }

    fn materialize(&self, table: &Table, key: &RowKey, row: &StoredRow, record: &mut Record) -> FetchResult<()> {
        let slots = decode_row(&row.bytes, self.schema.len()).map_err(|message| {
            let recovered = row.key_recoverable.then(|| self.key_only(key));
            let at = self.key_only(key).to_string_key_only();
            FetchError::corrupt(format!("{at}: {message}"), recovered)
        })?;
        self.load_slots(table, slots, record);
        Ok(())
    }

    fn write_row(&self, table: &mut Table, txn: Option<&MemoryTransaction>, key: RowKey, row: Option<StoredRow>) {
        let previous = match row {
            Some(row) => table.rows.insert(key.clone(), row),
            None => table.rows.remove(&key),
        };
        if let Some(txn) = txn {
            txn.record(&self.table, key, previous);
        }
    }

    fn insert_row(&self, txn: Option<&MemoryTransaction>, record: &mut Record) -> PersistResult<()> {
        for (i, p) in self.schema.properties().iter().enumerate() {
            if let Some(seq) = &p.sequence {
                if record.state(i) == PropertyState::Uninitialized {
                    let next = self.engine.next_sequence(seq);
                    record.load_at(i, Value::Integer(next), PropertyState::Dirty);
                }
            }
        }
        if self.engine.master {
            if let Some(v) = self.schema.version() {
                if record.state(v) == PropertyState::Uninitialized {
                    record.load_at(v, Value::Integer(1), PropertyState::Dirty);
                }
            }
        }

        let key = self.primary_key(record).ok_or_else(|| {
            PersistError::Unsupported(format!(
                "primary key of {} is not initialized",
                self.schema.name()
            ))
        })?;
        let alt_keys = self.alternate_keys_with(Self::record_value(record));

        let mut table = self.table.write();
        if table.rows.contains_key(&key) {
            return Err(PersistError::unique(record.to_string_key_only(), "primary key"));
        }
        if let Some(i) = table.alternate_conflict(&key, &alt_keys) {
            return Err(PersistError::unique(
                record.to_string_key_only(),
                self.schema.alternate_keys()[i].name.clone(),
            ));
        }
        let mut slots = Vec::with_capacity(self.schema.len());
        for i in 0..self.schema.len() {
            if record.state(i) == PropertyState::Uninitialized || !self.layout.is_supported(i) {
                slots.push(None);
            } else {
                slots.push(Some(self.to_slot(&mut table, record, i)?));
            }
        }
        let bytes = encode_row(&slots)?;
        self.write_row(
            &mut table,
            txn,
            key,
            Some(StoredRow {
                bytes,
                alt_keys,
                key_recoverable: true,
            }),
        );
        drop(table);
        record.mark_properties_clean();
        Ok(())
    }

    fn update_row(&self, txn: Option<&MemoryTransaction>, record: &mut Record) -> PersistResult<()> {
        let mut table = self.table.write();
        let key = self
            .resolve_key(&table, record)?
            .ok_or_else(|| PersistError::no_such_record(record.to_string_key_only()))?;
        let row = table
            .rows
            .get(&key)
            .cloned()
            .ok_or_else(|| PersistError::no_such_record(record.to_string_key_only()))?;
        let mut slots = decode_row(&row.bytes, self.schema.len())
            .map_err(|message| PersistError::Fetch(FetchError::corrupt(message, None)))?;

        let dirty: Vec<usize> = (0..self.schema.len())
            .filter(|&i| record.state(i) == PropertyState::Dirty && self.layout.is_supported(i))
            .collect();
        if !dirty.is_empty() {
            let version = self.schema.version().filter(|_| self.engine.master);
            let stored_version = version.and_then(|v| match slots[v] {
                Some(StoredValue::Integer(n)) => Some(n),
                _ => None,
            });
            if version.is_some() && record.version() != stored_version {
                return Err(PersistError::OptimisticLock {
                    key: record.to_string_key_only(),
                    expected: record.version(),
                    actual: stored_version,
                });
            }
            for &i in &dirty {
                slots[i] = Some(self.to_slot(&mut table, record, i)?);
            }
            if let Some(v) = version {
                slots[v] = Some(StoredValue::Integer(stored_version.unwrap_or(0) + 1));
            }
            let alt_keys = self.alternate_keys_with(|i| slots[i].as_ref().map(scalar));
            if let Some(i) = table.alternate_conflict(&key, &alt_keys) {
                return Err(PersistError::unique(
                    record.to_string_key_only(),
                    self.schema.alternate_keys()[i].name.clone(),
                ));
            }
            let bytes = encode_row(&slots)?;
            self.write_row(
                &mut table,
                txn,
                key,
                Some(StoredRow {
                    bytes,
                    alt_keys,
                    key_recoverable: true,
                }),
            );
        }
        self.load_slots(&table, slots, record);
        Ok(())
    }

    fn delete_row(&self, txn: Option<&MemoryTransaction>, record: &Record) -> PersistResult<()> {
        let mut table = self.table.write();
        let key = self
            .resolve_key(&table, record)?
            .filter(|key| table.rows.contains_key(key))
            .ok_or_else(|| PersistError::no_such_record(record.to_string_key_only()))?;
        self.write_row(&mut table, txn, key, None);
        Ok(())
    }

    fn open(&self, cx: &Context, query: &Query, after: Option<&Record>) -> FetchResult<Box<dyn Cursor>> {
        self.engine.check_available()?;
        let table = self.table.read();
        let mut entries = Vec::new();
        for (key, row) in &table.rows {
            let mut record = self.prepare();
            match self.materialize(&table, key, row, &mut record) {
                Ok(()) => {
                    if query.filter.matches(&record)? {
                        let sort = sort_values(&query.order, |p| record.get(p).cloned());
                        entries.push(Entry::new(sort, key.clone(), Ok(record)));
                    }
                }
                Err(e) => {
                    let sort = sort_values(&query.order, |p| Some(self.key_value(key, p)));
                    entries.push(Entry::new(sort, key.clone(), Err(e)));
                }
            }
        }
        drop(table);

        entries.sort_by(|a, b| compare_positions(&query.order, (a.sort.as_slice(), &a.key), (b.sort.as_slice(), &b.key)));
        if let Some(after) = after {
            let sort = sort_values(&query.order, |p| after.get(p).cloned());
            let key = RowKey(after.key_values());
            entries.retain(|e| {
                compare_positions(&query.order, (e.sort.as_slice(), &e.key), (sort.as_slice(), &key)) == Ordering::Greater
            });
        }
        Ok(Box::new(MemoryCursor::new(
            Arc::clone(&self.engine),
            entries,
            cx.clone(),
            Arc::clone(&self.triggers),
        )))
    }
}

fn scalar(slot: &StoredValue) -> Value {
    match slot {
        StoredValue::Bool(b) => Value::Bool(*b),
        StoredValue::Integer(n) => Value::Integer(*n),
        StoredValue::Text(s) => Value::Text(s.clone()),
        StoredValue::Bytes(b) => Value::Bytes(b.clone()),
        StoredValue::Null | StoredValue::Lob(_) => Value::Null,
    }
}

fn sort_values(order: &[OrderTerm], get: impl Fn(&str) -> Option<Value>) -> Vec<Value> {
    order
        .iter()
        .map(|t| get(&t.property).unwrap_or(Value::Null))
        .collect()
}

fn compare_positions(order: &[OrderTerm], a: (&[Value], &RowKey), b: (&[Value], &RowKey)) -> Ordering {
    for (n, term) in order.iter().enumerate() {
        let ord = a.0[n].cmp_key(&b.0[n]);
        let ord = if term.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.1.cmp(b.1)
}

impl Storage for MemoryStorage {
    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn layout(&self) -> &Arc<RecordLayout> {
        &self.layout
    }

    fn load(&self, cx: &Context, record: &mut Record) -> FetchResult<bool> {
        self.engine.check_available()?;
        let found = {
            let table = self.table.read();
            match self.resolve_key(&table, record)? {
                Some(key) => match table.rows.get(&key) {
                    Some(row) => {
                        self.materialize(&table, &key, row, record)?;
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if found {
            self.triggers.after_load(cx, record)?;
        }
        Ok(found)
    }

    fn query(&self, cx: &Context, query: &Query) -> FetchResult<Box<dyn Cursor>> {
        self.open(cx, query, None)
    }

    fn query_after(&self, cx: &Context, query: &Query, after: &Record) -> FetchResult<Box<dyn Cursor>> {
        self.open(cx, query, Some(after))
    }

    fn insert(&self, cx: &Context, record: &mut Record) -> PersistResult<()> {
        self.engine.check_available()?;
        let txn = self.transaction(cx)?;
        self.triggers
            .run_insert(cx, record, |record| self.insert_row(txn, record))
    }

    fn update(&self, cx: &Context, record: &mut Record) -> PersistResult<()> {
        self.engine.check_available()?;
        let txn = self.transaction(cx)?;
        self.triggers
            .run_update(cx, record, |record| self.update_row(txn, record))
    }

    fn delete(&self, cx: &Context, record: &mut Record) -> PersistResult<()> {
        self.engine.check_available()?;
        let txn = self.transaction(cx)?;
        self.triggers
            .run_delete(cx, record, |record| self.delete_row(txn, record))
    }

    fn truncate(&self, cx: &Context) -> PersistResult<()> {
        self.engine.check_available()?;
        let txn = self.transaction(cx)?;
        let mut table = self.table.write();
        let keys: Vec<RowKey> = table.rows.keys().cloned().collect();
        debug!(repository = %self.engine.name, schema = self.schema.name(), rows = keys.len(), "truncate");
        for key in keys {
            self.write_row(&mut table, txn, key, None);
        }
        Ok(())
    }

    fn add_trigger(&self, trigger: Arc<dyn Trigger>) -> TriggerId {
        self.triggers.add(trigger)
    }

    fn remove_trigger(&self, id: TriggerId) -> bool {
        self.triggers.remove(id)
    }

    fn natural_order(&self) -> Option<Vec<String>> {
        self.natural_order.clone()
    }
}
