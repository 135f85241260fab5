//! Row encoding for the in-memory engine.
//!
//! Rows are stored as CBOR arrays with one slot per schema property.
//! Uninitialized and unsupported properties occupy a `null` slot; large
//! objects are stored by locator into the table's LOB map.

use crate::error::{PersistError, PersistResult};
use serde::{Deserialize, Serialize};

/// Encoded form of a single property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum StoredValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
    Bytes(Vec<u8>),
    Lob(u64),
}

/// Bytes that no valid row decodes from. CBOR reserves additional-info 28
/// for unsigned integers.
pub(crate) const CORRUPT_ROW: &[u8] = &[0x1c, 0xde, 0xad];

pub(crate) fn encode_row(slots: &[Option<StoredValue>]) -> PersistResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(&slots, &mut out)
        .map_err(|e| PersistError::io_with("encode row", e.to_string()))?;
    Ok(out)
}

pub(crate) fn decode_row(bytes: &[u8], width: usize) -> Result<Vec<Option<StoredValue>>, String> {
    let slots: Vec<Option<StoredValue>> =
        ciborium::from_reader(bytes).map_err(|e| format!("undecodable row: {e}"))?;
    if slots.len() != width {
        return Err(format!(
            "row has {} slots, expected {width}",
            slots.len()
        ));
    }
    Ok(slots)
}
