//! Repository, transaction and capability contracts.

use crate::context::Context;
use crate::error::{PersistResult, RepositoryResult};
use crate::query::Filter;
use crate::schema::Schema;
use crate::storage::Storage;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier of a repository instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryId(Uuid);

impl RepositoryId {
    /// Generates a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Allocates the next identifier.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Transaction isolation levels, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum IsolationLevel {
    /// Uncommitted changes of other transactions are visible.
    ReadUncommitted,
    /// Only committed changes are visible.
    #[default]
    ReadCommitted,
    /// Rows read stay stable for the life of the transaction.
    RepeatableRead,
    /// Full serializability.
    Serializable,
}

/// A unit of work against one repository, or a composite over several.
///
/// Committing makes the work done so far durable (or merges it into the
/// enclosing transaction when nested) and leaves the transaction open for
/// further work. Exiting rolls back anything not committed and closes it.
pub trait Transaction: Send + Sync {
    /// Returns the transaction id.
    fn id(&self) -> TransactionId;

    /// Returns the repository this transaction belongs to.
    fn repository_id(&self) -> RepositoryId;

    /// Returns the effective isolation level.
    fn isolation(&self) -> IsolationLevel;

    /// Commits the work done so far.
    fn commit(&self) -> PersistResult<()>;

    /// Rolls back uncommitted work and closes the transaction. Exiting an
    /// already exited transaction is a no-op.
    fn exit(&self) -> PersistResult<()>;

    /// Returns the transaction that belongs to `repository`: `self` when
    /// the ids match, or the matching member of a composite.
    fn member(&self, repository: RepositoryId) -> Option<&dyn Transaction>;

    /// Returns `self` for downcasting by the owning repository.
    fn as_any(&self) -> &dyn Any;
}

/// Optional repository features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    /// Index metadata.
    IndexInfo,
    /// Named sequences.
    Sequence,
    /// Orderly shutdown.
    Shutdown,
    /// Bulk master/replica resynchronization.
    Resync,
}

/// A capability instance returned by [`Repository::capability`].
#[derive(Clone)]
pub enum Capability {
    /// Index metadata.
    IndexInfo(Arc<dyn IndexInfoCapability>),
    /// Named sequences.
    Sequence(Arc<dyn SequenceCapability>),
    /// Orderly shutdown.
    Shutdown(Arc<dyn ShutdownCapability>),
    /// Bulk resynchronization.
    Resync(Arc<dyn ResyncCapability>),
}

impl Capability {
    /// Returns the kind of this capability.
    #[must_use]
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::IndexInfo(_) => CapabilityKind::IndexInfo,
            Self::Sequence(_) => CapabilityKind::Sequence,
            Self::Shutdown(_) => CapabilityKind::Shutdown,
            Self::Resync(_) => CapabilityKind::Resync,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability::{:?}", self.kind())
    }
}

/// Description of one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Indexed properties, in order.
    pub properties: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// Whether rows are physically stored in this order.
    pub clustered: bool,
}

/// Reports the indexes a repository maintains for a type.
pub trait IndexInfoCapability: Send + Sync {
    /// Returns the indexes of `schema`.
    fn indexes(&self, schema: &Schema) -> RepositoryResult<Vec<IndexInfo>>;
}

/// Named monotonic sequences.
pub trait SequenceCapability: Send + Sync {
    /// Returns the next value of the named sequence.
    fn next_value(&self, name: &str) -> PersistResult<i64>;
}

/// Orderly shutdown of a repository and its background work.
pub trait ShutdownCapability: Send + Sync {
    /// Shuts the repository down. Repeated calls are no-ops.
    fn shutdown(&self) -> RepositoryResult<()>;
}

/// Bulk master/replica resynchronization for one type.
pub trait ResyncCapability: Send + Sync {
    /// Sweeps both stores and heals every divergence found.
    ///
    /// `desired_speed` is the fraction of full throughput to use, clamped
    /// to `[0, 1]`; `1.0` disables throttling.
    fn resync(
        &self,
        schema: &Arc<Schema>,
        desired_speed: f64,
        filter: Option<&Filter>,
    ) -> RepositoryResult<()>;
}

/// A source of storages and transactions.
pub trait Repository: Send + Sync {
    /// Returns the repository name.
    fn name(&self) -> &str;

    /// Returns the repository id.
    fn id(&self) -> RepositoryId;

    /// Returns the storage for `schema`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Fails with [`RepositoryError::Unsupported`](crate::RepositoryError::Unsupported)
    /// when the repository cannot hold the type.
    fn storage_for(&self, schema: &Arc<Schema>) -> RepositoryResult<Arc<dyn Storage>>;

    /// Enters a transaction, nested inside the context's transaction for
    /// this repository if there is one.
    fn enter_transaction(
        &self,
        cx: &Context,
        isolation: Option<IsolationLevel>,
    ) -> RepositoryResult<Arc<dyn Transaction>>;

    /// Returns the requested capability, if supported.
    fn capability(&self, kind: CapabilityKind) -> Option<Capability>;

    /// Closes the repository.
    fn close(&self) -> RepositoryResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_levels_are_ordered() {
        assert!(IsolationLevel::ReadUncommitted < IsolationLevel::ReadCommitted);
        assert!(IsolationLevel::RepeatableRead < IsolationLevel::Serializable);
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn transaction_ids_are_unique() {
        let a = TransactionId::next();
        let b = TransactionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }
}
