//! Error types for storage and repository operations.
//!
//! Failures fall into three families. Fetch failures come from the read
//! path, persist failures from the write path, and repository failures from
//! configuration, lifecycle and bulk operations. Conditions that callers
//! branch on (absence of a row, uniqueness and optimistic-lock conflicts,
//! corrupt encodings) are dedicated variants rather than message text.

use crate::record::Record;
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Boxed cause attached to I/O-style failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type for read-path operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Result type for write-path operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Result type for repository-level operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Errors raised while reading records.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The requested record does not exist.
    #[error("no such record: {key}")]
    NoSuchRecord {
        /// Key-only description of the record.
        key: String,
    },

    /// A stored record could not be decoded.
    ///
    /// When the store can still identify the row, `recovered` holds a
    /// record with at least its primary key properties initialized.
    #[error("corrupt encoding: {message}")]
    CorruptEncoding {
        /// Description of the decoding failure.
        message: String,
        /// Partially recovered record, if any.
        recovered: Option<Box<Record>>,
    },

    /// The operation was interrupted while waiting.
    #[error("fetch interrupted")]
    Interrupted,

    /// The operation timed out.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The store is not reachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The query is malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Wrapped low-level failure.
    #[error("fetch failed: {message}")]
    Io {
        /// Description of the failure.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<BoxError>,
    },
}

impl FetchError {
    /// Creates a no-such-record error.
    pub fn no_such_record(key: impl Into<String>) -> Self {
        Self::NoSuchRecord { key: key.into() }
    }

    /// Creates a corrupt-encoding error.
    pub fn corrupt(message: impl Into<String>, recovered: Option<Record>) -> Self {
        Self::CorruptEncoding {
            message: message.into(),
            recovered: recovered.map(Box::new),
        }
    }

    /// Creates a wrapped I/O error without a cause.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a wrapped I/O error with a cause.
    pub fn io_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Returns true if this error means the row does not exist.
    pub fn is_no_such_record(&self) -> bool {
        matches!(self, Self::NoSuchRecord { .. })
    }

    /// Returns true if this error reports an undecodable row.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::CorruptEncoding { .. })
    }

    /// Returns the record recovered from a corrupt row, if any.
    pub fn recovered_key(&self) -> Option<&Record> {
        match self {
            Self::CorruptEncoding { recovered, .. } => recovered.as_deref(),
            _ => None,
        }
    }
}

/// Errors raised while writing records.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The record to update or delete does not exist.
    #[error("no such record: {key}")]
    NoSuchRecord {
        /// Key-only description of the record.
        key: String,
    },

    /// A primary or alternate key is already taken.
    #[error("unique constraint {constraint} violated by {key}")]
    UniqueConstraint {
        /// Key-only description of the record.
        key: String,
        /// Name of the violated key.
        constraint: String,
    },

    /// The record's version does not match the stored version.
    #[error("optimistic lock failure on {key}: expected version {expected:?}, found {actual:?}")]
    OptimisticLock {
        /// Key-only description of the record.
        key: String,
        /// Version carried by the record being written.
        expected: Option<i64>,
        /// Version currently stored.
        actual: Option<i64>,
    },

    /// The master store could not be reached for a write-through.
    #[error("master unavailable: {0}")]
    MasterUnavailable(String),

    /// The store does not support the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A read performed as part of the write failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Wrapped low-level failure.
    #[error("persist failed: {message}")]
    Io {
        /// Description of the failure.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<BoxError>,
    },
}

impl PersistError {
    /// Creates a no-such-record error.
    pub fn no_such_record(key: impl Into<String>) -> Self {
        Self::NoSuchRecord { key: key.into() }
    }

    /// Creates a uniqueness-conflict error.
    pub fn unique(key: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self::UniqueConstraint {
            key: key.into(),
            constraint: constraint.into(),
        }
    }

    /// Creates a wrapped I/O error without a cause.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a wrapped I/O error with a cause.
    pub fn io_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Returns true if the target row does not exist.
    pub fn is_no_such_record(&self) -> bool {
        match self {
            Self::NoSuchRecord { .. } => true,
            Self::Fetch(e) => e.is_no_such_record(),
            _ => false,
        }
    }

    /// Returns true if this is a uniqueness conflict.
    pub fn is_unique_conflict(&self) -> bool {
        matches!(self, Self::UniqueConstraint { .. })
    }

    /// Returns true if this is an optimistic-lock conflict.
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Self::OptimisticLock { .. })
    }
}

/// Errors raised by repositories and bulk operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The repository cannot provide the requested type or feature.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The repository is temporarily unreachable.
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    /// The repository has been closed.
    #[error("repository is closed")]
    Closed,

    /// A bounded work queue could not accept or drain work in time.
    #[error("work queue did not keep up within {waited:?}")]
    QueueTimeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// A long-running operation was cancelled.
    #[error("operation interrupted")]
    Interrupted,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid record type definition.
    #[error(transparent)]
    Schema(#[from] crate::schema::SchemaError),

    /// Read failure.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Write failure.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl RepositoryError {
    /// Returns true if the repository lacks support for a type or feature.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }

    /// Returns true if the repository could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Fetch(FetchError::Unavailable(_))
        )
    }
}

impl From<RepositoryError> for PersistError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Persist(p) => p,
            RepositoryError::Fetch(f) => Self::Fetch(f),
            RepositoryError::Unavailable(m) => Self::Fetch(FetchError::Unavailable(m)),
            other => Self::io_with("repository operation failed", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_error_classification() {
        assert!(PersistError::no_such_record("k").is_no_such_record());
        assert!(PersistError::Fetch(FetchError::no_such_record("k")).is_no_such_record());
        assert!(PersistError::unique("k", "pk").is_unique_conflict());
        assert!(!PersistError::unique("k", "pk").is_no_such_record());

        let err = PersistError::OptimisticLock {
            key: "k".into(),
            expected: Some(1),
            actual: Some(2),
        };
        assert!(err.is_optimistic_lock());
        assert!(err.to_string().contains("expected version Some(1)"));
    }

    #[test]
    fn io_error_keeps_source() {
        let cause = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = FetchError::io_with("read row", cause);
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "fetch failed: read row");
    }

    #[test]
    fn repository_error_classification() {
        assert!(RepositoryError::Unsupported("x".into()).is_unsupported());
        assert!(RepositoryError::Unavailable("x".into()).is_unavailable());
        assert!(RepositoryError::Fetch(FetchError::Unavailable("x".into())).is_unavailable());
        assert!(!RepositoryError::Closed.is_unavailable());
    }
}
