//! Per-operation execution context.
//!
//! Every storage and repository call receives a [`Context`]. It names the
//! transaction the call participates in and whether replication hooks are
//! active. Contexts are cheap to clone and are derived rather than mutated,
//! so suspending replication for one nested operation never affects a
//! concurrent or enclosing one.

use crate::repository::{RepositoryId, Transaction};
use std::fmt;
use std::sync::Arc;

/// Whether replication hooks run for calls made under a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationMode {
    /// Hooks run normally.
    #[default]
    Active,
    /// Hooks are skipped. Used by repair and resync so they do not recurse
    /// into the master or re-run user triggers.
    Suspended,
}

/// Execution context for a single logical operation.
#[derive(Clone, Default)]
pub struct Context {
    mode: ReplicationMode,
    transaction: Option<Arc<dyn Transaction>>,
}

impl Context {
    /// Creates an active context outside any transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the replication mode.
    #[must_use]
    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    /// Returns true if replication hooks must be skipped.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.mode == ReplicationMode::Suspended
    }

    /// Derives a context with replication suspended.
    #[must_use]
    pub fn suspended(&self) -> Self {
        Self {
            mode: ReplicationMode::Suspended,
            transaction: self.transaction.clone(),
        }
    }

    /// Derives a context without a transaction. Writes made under it commit
    /// on their own.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self {
            mode: self.mode,
            transaction: None,
        }
    }

    /// Derives a context that participates in `transaction`.
    #[must_use]
    pub fn with_transaction(&self, transaction: Arc<dyn Transaction>) -> Self {
        Self {
            mode: self.mode,
            transaction: Some(transaction),
        }
    }

    /// Returns the attached transaction, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<&Arc<dyn Transaction>> {
        self.transaction.as_ref()
    }

    /// Returns the part of the attached transaction that belongs to the
    /// given repository.
    #[must_use]
    pub fn transaction_for(&self, repository: RepositoryId) -> Option<&dyn Transaction> {
        self.transaction
            .as_deref()
            .and_then(|txn| txn.member(repository))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("mode", &self.mode)
            .field("transaction", &self.transaction.as_ref().map(|t| t.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_contexts_do_not_leak_mode() {
        let cx = Context::new();
        let inner = cx.suspended();
        assert!(inner.is_suspended());
        assert!(!cx.is_suspended());
        assert!(inner.detached().is_suspended());
        assert!(cx.transaction().is_none());
    }
}
