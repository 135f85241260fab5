//! Property values.

use crate::lob::LobRef;
use std::cmp::Ordering;
use std::fmt;

/// A single property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Inline bytes.
    Bytes(Vec<u8>),
    /// Binary large object.
    Blob(LobRef),
    /// Character large object.
    Clob(LobRef),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) => 2,
            Value::Text(_) => 3,
            Value::Bytes(_) => 4,
            Value::Blob(_) => 5,
            Value::Clob(_) => 6,
        }
    }

    /// Total order used for keys and query ordering.
    ///
    /// Values of different kinds order by kind. Large objects order by
    /// locator, which is stable but carries no meaning.
    pub fn cmp_key(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) | (Value::Clob(a), Value::Clob(b)) => {
                let (a, b) = (a.identity(), b.identity());
                (a.store, a.locator).cmp(&(b.store, b.locator))
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Compares values by content. Large objects are read and compared
    /// byte for byte; everything else uses `==`.
    pub fn content_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Blob(a), Value::Blob(b)) | (Value::Clob(a), Value::Clob(b)) => a.content_eq(b),
            _ => self == other,
        }
    }

    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer, if this is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the text, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the bytes, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the large-object handle, if this is a blob or clob.
    pub fn as_lob(&self) -> Option<&LobRef> {
        match self {
            Value::Blob(l) | Value::Clob(l) => Some(l),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Blob(_) => f.write_str("<blob>"),
            Value::Clob(_) => f.write_str("<clob>"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
