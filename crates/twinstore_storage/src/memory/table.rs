//! Row tables of the in-memory engine.

use crate::value::Value;
use crate::lob::LobBuffer;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Primary key values of a row, ordered with [`Value::cmp_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RowKey(pub(crate) Vec<Value>);

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            let ord = a.cmp_key(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One stored row.
///
/// Alternate key values are kept outside the encoded bytes so uniqueness
/// checks and deletes work on rows that no longer decode.
#[derive(Debug, Clone)]
pub(crate) struct StoredRow {
    pub(crate) bytes: Vec<u8>,
    pub(crate) alt_keys: Vec<Option<RowKey>>,
    pub(crate) key_recoverable: bool,
}

pub(crate) struct Table {
    pub(crate) store: Uuid,
    pub(crate) rows: BTreeMap<RowKey, StoredRow>,
    pub(crate) lobs: HashMap<u64, Arc<LobBuffer>>,
    next_lob: u64,
}

impl Table {
    pub(crate) fn new() -> Self {
        Self {
            store: Uuid::new_v4(),
            rows: BTreeMap::new(),
            lobs: HashMap::new(),
            next_lob: 1,
        }
    }

    pub(crate) fn allocate_lob(&mut self, data: Vec<u8>) -> (u64, Arc<LobBuffer>) {
        let locator = self.next_lob;
        self.next_lob += 1;
        let buffer = LobBuffer::new(data);
        self.lobs.insert(locator, Arc::clone(&buffer));
        (locator, buffer)
    }

    /// Finds the primary key of the row holding `alt` in alternate key
    /// slot `index`.
    pub(crate) fn find_by_alternate(&self, index: usize, alt: &RowKey) -> Option<RowKey> {
        self.rows
            .iter()
            .find(|(_, row)| row.alt_keys.get(index).and_then(Option::as_ref) == Some(alt))
            .map(|(key, _)| key.clone())
    }

    /// Returns the index of the first alternate key of `alt_keys` already
    /// held by a row other than `own`.
    pub(crate) fn alternate_conflict(&self, own: &RowKey, alt_keys: &[Option<RowKey>]) -> Option<usize> {
        alt_keys.iter().enumerate().find_map(|(i, alt)| {
            let alt = alt.as_ref()?;
            match self.find_by_alternate(i, alt) {
                Some(holder) if &holder != own => Some(i),
                _ => None,
            }
        })
    }
}
