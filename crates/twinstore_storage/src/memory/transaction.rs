//! Undo-log transactions for the in-memory engine.
//!
//! Writes are applied to the table immediately and the previous row image
//! is appended to the transaction's undo log. Exiting without commit
//! replays the log backwards. Committing a nested transaction hands its
//! log to the parent, so the parent can still roll the work back.

use super::table::{RowKey, StoredRow, Table};
use crate::error::{PersistError, PersistResult};
use crate::repository::{IsolationLevel, RepositoryId, Transaction, TransactionId};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::Arc;
use tracing::trace;

pub(crate) struct UndoEntry {
    table: Arc<RwLock<Table>>,
    key: RowKey,
    previous: Option<StoredRow>,
}

pub(crate) struct TxnLog {
    undo: Vec<UndoEntry>,
    open: bool,
}

/// A transaction on a [`MemoryRepository`](super::MemoryRepository).
pub struct MemoryTransaction {
    id: TransactionId,
    repository: RepositoryId,
    isolation: IsolationLevel,
    log: Arc<Mutex<TxnLog>>,
    parent: Option<Arc<Mutex<TxnLog>>>,
}

impl MemoryTransaction {
    pub(crate) fn new(repository: RepositoryId, isolation: IsolationLevel, parent: Option<&MemoryTransaction>) -> Self {
        Self {
            id: TransactionId::next(),
            repository,
            isolation,
            log: Arc::new(Mutex::new(TxnLog {
                undo: Vec::new(),
                open: true,
            })),
            parent: parent.map(|p| Arc::clone(&p.log)),
        }
    }

    /// Returns true until the transaction exits.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.log.lock().open
    }

    pub(crate) fn check_open(&self) -> PersistResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(PersistError::io(format!("{} has already exited", self.id)))
        }
    }

    pub(crate) fn record(&self, table: &Arc<RwLock<Table>>, key: RowKey, previous: Option<StoredRow>) {
        self.log.lock().undo.push(UndoEntry {
            table: Arc::clone(table),
            key,
            previous,
        });
    }

    fn rollback(entries: Vec<UndoEntry>) {
        for entry in entries.into_iter().rev() {
            let mut table = entry.table.write();
            match entry.previous {
                Some(row) => {
                    table.rows.insert(entry.key, row);
                }
                None => {
                    table.rows.remove(&entry.key);
                }
            }
        }
    }
}

impl Transaction for MemoryTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn repository_id(&self) -> RepositoryId {
        self.repository
    }

    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn commit(&self) -> PersistResult<()> {
        let entries = {
            let mut log = self.log.lock();
            if !log.open {
                return Err(PersistError::io(format!("{} has already exited", self.id)));
            }
            std::mem::take(&mut log.undo)
        };
        trace!(txn = %self.id, changes = entries.len(), nested = self.parent.is_some(), "commit");
        if let Some(parent) = &self.parent {
            parent.lock().undo.extend(entries);
        }
        Ok(())
    }

    fn exit(&self) -> PersistResult<()> {
        let entries = {
            let mut log = self.log.lock();
            if !log.open {
                return Ok(());
            }
            log.open = false;
            std::mem::take(&mut log.undo)
        };
        if !entries.is_empty() {
            trace!(txn = %self.id, changes = entries.len(), "rollback");
        }
        Self::rollback(entries);
        Ok(())
    }

    fn member(&self, repository: RepositoryId) -> Option<&dyn Transaction> {
        (repository == self.repository).then_some(self as &dyn Transaction)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        let entries = {
            let mut log = self.log.lock();
            log.open = false;
            std::mem::take(&mut log.undo)
        };
        Self::rollback(entries);
    }
}
