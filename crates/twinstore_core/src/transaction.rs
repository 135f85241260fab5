//! Paired master/replica transactions.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use twinstore_storage::{
    Context, IsolationLevel, PersistError, PersistResult, Repository, RepositoryError,
    RepositoryId, RepositoryResult, Transaction, TransactionId,
};

/// The two repositories behind a replicated repository, plus the identity
/// their composite transactions carry.
#[derive(Clone)]
pub(crate) struct RepositoryPair {
    pub(crate) id: RepositoryId,
    pub(crate) master: Arc<dyn Repository>,
    pub(crate) replica: Arc<dyn Repository>,
}

impl RepositoryPair {
    pub(crate) fn new(master: Arc<dyn Repository>, replica: Arc<dyn Repository>) -> Self {
        Self {
            id: RepositoryId::generate(),
            master,
            replica,
        }
    }

    /// Enters a composite transaction: master first, then replica.
    pub(crate) fn enter(
        &self,
        cx: &Context,
        isolation: Option<IsolationLevel>,
    ) -> RepositoryResult<Arc<dyn Transaction>> {
        let txn = ReplicatedTransaction::enter(self, cx, isolation)?;
        Ok(Arc::new(txn))
    }
}

/// A master transaction and a replica transaction that commit and exit
/// together.
///
/// Both members are always driven: when the master commit or exit fails,
/// the replica's is still attempted. The first failure is returned and a
/// second one is logged.
pub struct ReplicatedTransaction {
    id: TransactionId,
    repository: RepositoryId,
    master: Arc<dyn Transaction>,
    replica: Arc<dyn Transaction>,
}

impl ReplicatedTransaction {
    fn enter(pair: &RepositoryPair, cx: &Context, isolation: Option<IsolationLevel>) -> RepositoryResult<Self> {
        let master = pair.master.enter_transaction(cx, isolation).map_err(|e| {
            if e.is_unavailable() {
                RepositoryError::Persist(PersistError::MasterUnavailable(e.to_string()))
            } else {
                e
            }
        })?;
        let replica = match pair.replica.enter_transaction(cx, isolation) {
            Ok(replica) => replica,
            Err(e) => {
                if let Err(exit) = master.exit() {
                    warn!(transaction = %master.id(), error = %exit, "cannot exit master transaction");
                }
                return Err(e);
            }
        };
        Ok(Self {
            id: TransactionId::next(),
            repository: pair.id,
            master,
            replica,
        })
    }

    /// Returns the master member.
    #[must_use]
    pub fn master(&self) -> &Arc<dyn Transaction> {
        &self.master
    }

    /// Returns the replica member.
    #[must_use]
    pub fn replica(&self) -> &Arc<dyn Transaction> {
        &self.replica
    }

    fn both(&self, op: &str, master: PersistResult<()>, replica: PersistResult<()>) -> PersistResult<()> {
        match (master, replica) {
            (Ok(()), replica) => replica,
            (Err(first), Ok(())) => Err(first),
            (Err(first), Err(second)) => {
                warn!(
                    transaction = %self.id,
                    member = %self.replica.id(),
                    error = %second,
                    "replica {op} also failed"
                );
                Err(first)
            }
        }
    }
}

impl Transaction for ReplicatedTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn repository_id(&self) -> RepositoryId {
        self.repository
    }

    fn isolation(&self) -> IsolationLevel {
        self.master.isolation().min(self.replica.isolation())
    }

    fn commit(&self) -> PersistResult<()> {
        let master = self.master.commit();
        let replica = self.replica.commit();
        self.both("commit", master, replica)
    }

    fn exit(&self) -> PersistResult<()> {
        let master = self.master.exit();
        let replica = self.replica.exit();
        self.both("exit", master, replica)
    }

    fn member(&self, repository: RepositoryId) -> Option<&dyn Transaction> {
        if repository == self.repository {
            return Some(self);
        }
        self.master
            .member(repository)
            .or_else(|| self.replica.member(repository))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for ReplicatedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedTransaction")
            .field("id", &self.id)
            .field("master", &self.master.id())
            .field("replica", &self.replica.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use twinstore_storage::memory::MemoryRepository;

    struct Scripted {
        id: TransactionId,
        repository: RepositoryId,
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
        name: &'static str,
    }

    impl Scripted {
        fn new(name: &'static str, fail: bool, calls: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Transaction> {
            Arc::new(Self {
                id: TransactionId::next(),
                repository: RepositoryId::generate(),
                fail,
                calls: Arc::clone(calls),
                name,
            })
        }

        fn outcome(&self, op: &str) -> PersistResult<()> {
            self.calls.lock().push(format!("{}.{op}", self.name));
            if self.fail {
                Err(PersistError::io(format!("{} {op} failed", self.name)))
            } else {
                Ok(())
            }
        }
    }

    impl Transaction for Scripted {
        fn id(&self) -> TransactionId {
            self.id
        }
        fn repository_id(&self) -> RepositoryId {
            self.repository
        }
        fn isolation(&self) -> IsolationLevel {
            if self.name == "master" {
                IsolationLevel::Serializable
            } else {
                IsolationLevel::ReadCommitted
            }
        }
        fn commit(&self) -> PersistResult<()> {
            self.outcome("commit")
        }
        fn exit(&self) -> PersistResult<()> {
            self.outcome("exit")
        }
        fn member(&self, repository: RepositoryId) -> Option<&dyn Transaction> {
            (repository == self.repository).then_some(self as &dyn Transaction)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn pair(master_fails: bool, replica_fails: bool) -> (ReplicatedTransaction, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let txn = ReplicatedTransaction {
            id: TransactionId::next(),
            repository: RepositoryId::generate(),
            master: Scripted::new("master", master_fails, &calls),
            replica: Scripted::new("replica", replica_fails, &calls),
        };
        (txn, calls)
    }

    #[test]
    fn commit_drives_both_members_in_order() {
        let (txn, calls) = pair(false, false);
        txn.commit().unwrap();
        assert_eq!(*calls.lock(), vec!["master.commit", "replica.commit"]);
    }

    #[test]
    fn replica_still_committed_when_master_fails() {
        let (txn, calls) = pair(true, false);
        let err = txn.commit().unwrap_err();
        assert!(err.to_string().contains("master commit failed"));
        assert_eq!(*calls.lock(), vec!["master.commit", "replica.commit"]);
    }

    #[test]
    fn first_failure_wins() {
        let (txn, _calls) = pair(true, true);
        let err = txn.exit().unwrap_err();
        assert!(err.to_string().contains("master exit failed"));

        let (txn, _calls) = pair(false, true);
        let err = txn.exit().unwrap_err();
        assert!(err.to_string().contains("replica exit failed"));
    }

    #[test]
    fn isolation_is_the_weaker_member() {
        let (txn, _calls) = pair(false, false);
        assert_eq!(txn.isolation(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn member_lookup_reaches_both_sides() {
        let (txn, _calls) = pair(false, false);
        let master_id = txn.master().repository_id();
        let replica_id = txn.replica().repository_id();
        assert_eq!(txn.member(master_id).map(|t| t.id()), Some(txn.master().id()));
        assert_eq!(txn.member(replica_id).map(|t| t.id()), Some(txn.replica().id()));
        assert_eq!(txn.member(txn.repository_id()).map(|t| t.id()), Some(txn.id()));
        assert!(txn.member(RepositoryId::generate()).is_none());
    }

    #[test]
    fn offline_master_refuses_composite_transaction() {
        let master = MemoryRepository::builder("master").master(true).offline().build();
        let replica = MemoryRepository::builder("replica").build();
        let pair = RepositoryPair::new(Arc::new(master), Arc::new(replica));
        let err = pair.enter(&Context::new(), None).err().expect("enter should fail");
        assert!(matches!(
            err,
            RepositoryError::Persist(PersistError::MasterUnavailable(_))
        ));
    }
}
