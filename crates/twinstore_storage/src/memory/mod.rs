//! In-memory reference engine.
//!
//! [`MemoryRepository`] implements the full repository contract on top of
//! ordered in-process tables. It is the engine used by tests and by the
//! command line tool, and it can simulate the conditions the reconciliation
//! engine has to cope with: a repository that is offline, types or
//! properties a repository cannot represent, and rows whose stored encoding
//! no longer decodes.
//!
//! A repository built as a *master* enforces optimistic locking through the
//! version property and assigns versions itself. Non-master repositories
//! store whatever values they are given, which is what a replica needs.
//!
//! # Example
//!
//! ```rust
//! use twinstore_storage::memory::MemoryRepository;
//! use twinstore_storage::{Context, PropertyKind, Repository, Schema, Storage};
//!
//! let schema = Schema::builder("User")
//!     .key("id", PropertyKind::Integer)
//!     .property("name", PropertyKind::Text)
//!     .build()
//!     .unwrap();
//! let repo = MemoryRepository::builder("main").build();
//! let users = repo.storage_for(&schema).unwrap();
//!
//! let cx = Context::new();
//! let mut user = users.prepare().with("id", 1).unwrap().with("name", "ada").unwrap();
//! users.insert(&cx, &mut user).unwrap();
//!
//! let mut found = users.prepare().with("id", 1).unwrap();
//! assert!(users.load(&cx, &mut found).unwrap());
//! assert_eq!(found.get("name").and_then(|v| v.as_text()), Some("ada"));
//! ```

mod cursor;
mod encoding;
mod lob;
mod storage;
mod table;
mod transaction;

pub use cursor::MemoryCursor;
pub use lob::MemoryLob;
pub use storage::MemoryStorage;
pub use transaction::MemoryTransaction;

use crate::context::Context;
use crate::error::{FetchError, FetchResult, PersistResult, RepositoryError, RepositoryResult};
use crate::record::RecordLayout;
use crate::repository::{
    Capability, CapabilityKind, IndexInfo, IndexInfoCapability, IsolationLevel, Repository,
    RepositoryId, SequenceCapability, ShutdownCapability, Transaction,
};
use crate::schema::Schema;
use crate::storage::Storage;
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// State shared by a repository and everything it hands out.
pub(crate) struct EngineState {
    pub(crate) id: RepositoryId,
    pub(crate) name: String,
    pub(crate) master: bool,
    online: AtomicBool,
    closed: AtomicBool,
    sequences: Mutex<HashMap<String, i64>>,
}

impl EngineState {
    pub(crate) fn check_available(&self) -> FetchResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(FetchError::Unavailable(format!("repository {} is closed", self.name)))
        } else if !self.online.load(Ordering::SeqCst) {
            Err(FetchError::Unavailable(format!("repository {} is offline", self.name)))
        } else {
            Ok(())
        }
    }

    pub(crate) fn next_sequence(&self, name: &str) -> i64 {
        let mut sequences = self.sequences.lock();
        let next = sequences.entry(name.to_string()).or_insert(0);
        *next += 1;
        *next
    }
}

struct Shared {
    engine: Arc<EngineState>,
    unsupported_types: HashSet<String>,
    unsupported_properties: HashMap<String, Vec<String>>,
    natural_orders: HashMap<String, Vec<String>>,
    disabled_capabilities: HashSet<CapabilityKind>,
    storages: Mutex<HashMap<String, Arc<MemoryStorage>>>,
}

/// Builder for [`MemoryRepository`].
#[derive(Debug, Clone)]
pub struct MemoryRepositoryBuilder {
    name: String,
    master: bool,
    online: bool,
    unsupported_types: HashSet<String>,
    unsupported_properties: HashMap<String, Vec<String>>,
    natural_orders: HashMap<String, Vec<String>>,
    disabled_capabilities: HashSet<CapabilityKind>,
}

impl MemoryRepositoryBuilder {
    /// Makes the repository a master: it assigns and checks versions.
    #[must_use]
    pub fn master(mut self, master: bool) -> Self {
        self.master = master;
        self
    }

    /// Starts the repository offline.
    #[must_use]
    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    /// Refuses storage for the named type.
    #[must_use]
    pub fn unsupported_type(mut self, schema: &str) -> Self {
        self.unsupported_types.insert(schema.to_string());
        self
    }

    /// Leaves out an independent property of the named type.
    #[must_use]
    pub fn unsupported_property(mut self, schema: &str, property: &str) -> Self {
        self.unsupported_properties
            .entry(schema.to_string())
            .or_default()
            .push(property.to_string());
        self
    }

    /// Declares the physical row order of the named type.
    #[must_use]
    pub fn natural_order(mut self, schema: &str, properties: &[&str]) -> Self {
        self.natural_orders.insert(
            schema.to_string(),
            properties.iter().map(|p| (*p).to_string()).collect(),
        );
        self
    }

    /// Withholds a capability.
    #[must_use]
    pub fn without_capability(mut self, kind: CapabilityKind) -> Self {
        self.disabled_capabilities.insert(kind);
        self
    }

    /// Builds the repository.
    #[must_use]
    pub fn build(self) -> MemoryRepository {
        MemoryRepository {
            shared: Arc::new(Shared {
                engine: Arc::new(EngineState {
                    id: RepositoryId::generate(),
                    name: self.name,
                    master: self.master,
                    online: AtomicBool::new(self.online),
                    closed: AtomicBool::new(false),
                    sequences: Mutex::new(HashMap::new()),
                }),
                unsupported_types: self.unsupported_types,
                unsupported_properties: self.unsupported_properties,
                natural_orders: self.natural_orders,
                disabled_capabilities: self.disabled_capabilities,
                storages: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// An in-memory repository. Cloning yields another handle to the same
/// repository.
#[derive(Clone)]
pub struct MemoryRepository {
    shared: Arc<Shared>,
}

impl MemoryRepository {
    /// Starts building a repository.
    pub fn builder(name: impl Into<String>) -> MemoryRepositoryBuilder {
        MemoryRepositoryBuilder {
            name: name.into(),
            master: false,
            online: true,
            unsupported_types: HashSet::new(),
            unsupported_properties: HashMap::new(),
            natural_orders: HashMap::new(),
            disabled_capabilities: HashSet::new(),
        }
    }

    /// Returns true if this repository enforces versions.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.shared.engine.master
    }

    /// Takes the repository on- or offline. While offline every operation
    /// fails as unavailable.
    pub fn set_online(&self, online: bool) {
        info!(repository = %self.shared.engine.name, online, "availability changed");
        self.shared.engine.online.store(online, Ordering::SeqCst);
    }

    /// Returns true if the repository is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.shared.engine.online.load(Ordering::SeqCst)
    }

    /// Returns the concrete storage for `schema`.
    pub fn memory_storage(&self, schema: &Arc<Schema>) -> RepositoryResult<Arc<MemoryStorage>> {
        let shared = &self.shared;
        if shared.engine.closed.load(Ordering::SeqCst) {
            return Err(RepositoryError::Closed);
        }
        if !self.is_online() {
            return Err(RepositoryError::Unavailable(format!(
                "repository {} is offline",
                shared.engine.name
            )));
        }
        if shared.unsupported_types.contains(schema.name()) {
            return Err(RepositoryError::Unsupported(format!(
                "repository {} does not support type {}",
                shared.engine.name,
                schema.name()
            )));
        }

        let mut storages = shared.storages.lock();
        if let Some(existing) = storages.get(schema.name()) {
            if existing.schema().as_ref() != schema.as_ref() {
                return Err(RepositoryError::Config(format!(
                    "type {} is already registered with a different definition",
                    schema.name()
                )));
            }
            return Ok(Arc::clone(existing));
        }

        let unsupported = shared
            .unsupported_properties
            .get(schema.name())
            .cloned()
            .unwrap_or_default();
        let layout = RecordLayout::with_unsupported(Arc::clone(schema), &unsupported);
        let storage = Arc::new(MemoryStorage::new(
            Arc::clone(&shared.engine),
            layout,
            shared.natural_orders.get(schema.name()).cloned(),
        ));
        debug!(repository = %shared.engine.name, schema = schema.name(), "storage created");
        storages.insert(schema.name().to_string(), Arc::clone(&storage));
        Ok(storage)
    }

    /// Corrupts the stored encoding of one row. See
    /// [`MemoryStorage::corrupt_row`].
    pub fn corrupt_row(&self, schema: &Arc<Schema>, key: &[Value], recoverable: bool) -> RepositoryResult<bool> {
        Ok(self.memory_storage(schema)?.corrupt_row(key, recoverable))
    }

    fn capability_enabled(&self, kind: CapabilityKind) -> bool {
        !self.shared.disabled_capabilities.contains(&kind)
    }
}

impl Repository for MemoryRepository {
    fn name(&self) -> &str {
        &self.shared.engine.name
    }

    fn id(&self) -> RepositoryId {
        self.shared.engine.id
    }

    fn storage_for(&self, schema: &Arc<Schema>) -> RepositoryResult<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = self.memory_storage(schema)?;
        Ok(storage)
    }

    fn enter_transaction(
        &self,
        cx: &Context,
        isolation: Option<IsolationLevel>,
    ) -> RepositoryResult<Arc<dyn Transaction>> {
        self.shared.engine.check_available()?;
        let parent = cx
            .transaction_for(self.id())
            .and_then(|t| t.as_any().downcast_ref::<MemoryTransaction>())
            .filter(|t| t.is_open());
        let isolation = isolation
            .or_else(|| parent.map(|p| p.isolation()))
            .unwrap_or_default();
        let txn = MemoryTransaction::new(self.id(), isolation, parent);
        Ok(Arc::new(txn))
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability> {
        if !self.capability_enabled(kind) {
            return None;
        }
        let this = Arc::new(self.clone());
        match kind {
            CapabilityKind::IndexInfo => Some(Capability::IndexInfo(this)),
            CapabilityKind::Sequence => Some(Capability::Sequence(this)),
            CapabilityKind::Shutdown => Some(Capability::Shutdown(this)),
            CapabilityKind::Resync => None,
        }
    }

    fn close(&self) -> RepositoryResult<()> {
        if !self.shared.engine.closed.swap(true, Ordering::SeqCst) {
            info!(repository = %self.shared.engine.name, "repository closed");
        }
        Ok(())
    }
}

impl IndexInfoCapability for MemoryRepository {
    fn indexes(&self, schema: &Schema) -> RepositoryResult<Vec<IndexInfo>> {
        let names = |indexes: &[usize]| -> Vec<String> {
            indexes
                .iter()
                .map(|&i| schema.property(i).name.clone())
                .collect()
        };
        let natural = self.shared.natural_orders.get(schema.name());
        let primary = names(schema.primary_key());
        let mut out = vec![IndexInfo {
            name: "primary".into(),
            clustered: natural.map_or(true, |n| *n == primary),
            properties: primary,
            unique: true,
        }];
        for ak in schema.alternate_keys() {
            out.push(IndexInfo {
                name: ak.name.clone(),
                properties: names(&ak.properties),
                unique: true,
                clustered: false,
            });
        }
        if let Some(order) = natural.filter(|n| **n != out[0].properties) {
            out.push(IndexInfo {
                name: "natural".into(),
                properties: order.clone(),
                unique: false,
                clustered: true,
            });
        }
        Ok(out)
    }
}

impl SequenceCapability for MemoryRepository {
    fn next_value(&self, name: &str) -> PersistResult<i64> {
        self.shared.engine.check_available()?;
        Ok(self.shared.engine.next_sequence(name))
    }
}

impl ShutdownCapability for MemoryRepository {
    fn shutdown(&self) -> RepositoryResult<()> {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::collect;
    use crate::error::PersistError;
    use crate::lob::LobRef;
    use crate::query::{CompareOp, Filter, Query};
    use crate::record::{PropertyState, Record};
    use crate::schema::PropertyKind;

    fn schema() -> Arc<Schema> {
        Schema::builder("Account")
            .key("id", PropertyKind::Integer)
            .required("email", PropertyKind::Text)
            .property("name", PropertyKind::Text)
            .property("avatar", PropertyKind::Blob)
            .independent_property("cache", PropertyKind::Text)
            .version("version")
            .alternate_key("by_email", &["email"])
            .build()
            .unwrap()
    }

    fn account(storage: &Arc<dyn Storage>, id: i64, email: &str) -> Record {
        storage
            .prepare()
            .with("id", id)
            .unwrap()
            .with("email", email)
            .unwrap()
    }

    fn ids(storage: &Arc<dyn Storage>, query: &Query) -> Vec<i64> {
        collect(storage.query(&Context::new(), query).unwrap())
            .unwrap()
            .iter()
            .map(|r| r.get("id").and_then(Value::as_integer).unwrap())
            .collect()
    }

    #[test]
    fn insert_load_update_delete() {
        let repo = MemoryRepository::builder("m").master(true).build();
        let s = repo.storage_for(&schema()).unwrap();
        let cx = Context::new();

        let mut a = account(&s, 1, "a@x");
        s.insert(&cx, &mut a).unwrap();
        assert_eq!(a.version(), Some(1));
        assert!(!a.has_dirty_properties());

        let mut loaded = s.prepare().with("email", "a@x").unwrap();
        assert!(s.load(&cx, &mut loaded).unwrap());
        assert_eq!(loaded.get("id"), Some(&Value::Integer(1)));

        loaded.set("name", "Ann").unwrap();
        s.update(&cx, &mut loaded).unwrap();
        assert_eq!(loaded.version(), Some(2));
        assert_eq!(loaded.state_of("name"), Some(PropertyState::Clean));

        let mut gone = s.prepare().with("id", 1).unwrap();
        s.delete(&cx, &mut gone).unwrap();
        assert!(!s.try_delete(&cx, &mut gone).unwrap());
        assert!(!s.load(&cx, &mut s.prepare().with("id", 1).unwrap()).unwrap());
    }

    #[test]
    fn master_checks_versions() {
        let repo = MemoryRepository::builder("m").master(true).build();
        let s = repo.storage_for(&schema()).unwrap();
        let cx = Context::new();
        s.insert(&cx, &mut account(&s, 1, "a@x")).unwrap();

        let mut stale = s.prepare().with("id", 1).unwrap().with("version", 7).unwrap();
        stale.set("name", "x").unwrap();
        let err = s.update(&cx, &mut stale).unwrap_err();
        assert!(err.is_optimistic_lock());
        assert!(matches!(
            err,
            PersistError::OptimisticLock {
                expected: Some(7),
                actual: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn replica_stores_given_versions() {
        let repo = MemoryRepository::builder("r").build();
        let s = repo.storage_for(&schema()).unwrap();
        let cx = Context::new();
        let mut a = account(&s, 1, "a@x").with("version", 5).unwrap();
        s.insert(&cx, &mut a).unwrap();
        let mut b = s.prepare().with("id", 1).unwrap().with("version", 9).unwrap();
        s.update(&cx, &mut b).unwrap();
        assert_eq!(b.version(), Some(9));
    }

    #[test]
    fn uniqueness_is_enforced() {
        let repo = MemoryRepository::builder("m").build();
        let s = repo.storage_for(&schema()).unwrap();
        let cx = Context::new();
        s.insert(&cx, &mut account(&s, 1, "a@x")).unwrap();
        let err = s.insert(&cx, &mut account(&s, 1, "b@x")).unwrap_err();
        assert!(err.is_unique_conflict());
        let err = s.insert(&cx, &mut account(&s, 2, "a@x")).unwrap_err();
        assert!(matches!(err, PersistError::UniqueConstraint { ref constraint, .. } if constraint == "by_email"));
        assert!(!s.try_insert(&cx, &mut account(&s, 2, "a@x")).unwrap());
        assert!(!s.try_update(&cx, &mut account(&s, 9, "z@x")).unwrap());
    }

    #[test]
    fn queries_filter_order_and_resume() {
        let repo = MemoryRepository::builder("m").build();
        let s = repo.storage_for(&schema()).unwrap();
        let cx = Context::new();
        for (id, name) in [(3, "c"), (1, "z"), (2, "a"), (4, "b")] {
            let mut r = account(&s, id, &format!("{id}@x")).with("name", name).unwrap();
            s.insert(&cx, &mut r).unwrap();
        }

        assert_eq!(ids(&s, &Query::all()), vec![1, 2, 3, 4]);
        assert_eq!(ids(&s, &Query::all().order_by(&["name"])), vec![2, 4, 3, 1]);
        let q = Query::filtered(Filter::compare("id", CompareOp::Ge, 2)).order_by(&["id"]);
        assert_eq!(ids(&s, &q), vec![2, 3, 4]);

        let after = s.prepare().with("id", 2).unwrap();
        let rest = collect(s.query_after(&cx, &q, &after).unwrap()).unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn corrupt_rows_surface_with_recovered_key() {
        let repo = MemoryRepository::builder("r").build();
        let schema = schema();
        let s = repo.storage_for(&schema).unwrap();
        let cx = Context::new();
        for id in 1..=3 {
            s.insert(&cx, &mut account(&s, id, &format!("{id}@x"))).unwrap();
        }
        assert!(repo.corrupt_row(&schema, &[Value::Integer(2)], true).unwrap());

        let mut cursor = s.query(&cx, &Query::all().order_by(&["id"])).unwrap();
        assert_eq!(cursor.next().unwrap().get("id"), Some(&Value::Integer(1)));
        let err = cursor.next().unwrap_err();
        let key = err.recovered_key().unwrap();
        assert_eq!(key.get("id"), Some(&Value::Integer(2)));
        assert_eq!(cursor.next().unwrap().get("id"), Some(&Value::Integer(3)));

        let mut bad = s.prepare().with("id", 2).unwrap();
        assert!(s.load(&cx, &mut bad).unwrap_err().is_corrupt());
        assert!(s.try_delete(&cx, &mut bad).unwrap());
        assert_eq!(ids(&s, &Query::all()), vec![1, 3]);
    }

    #[test]
    fn unrecoverable_corruption_has_no_key() {
        let repo = MemoryRepository::builder("r").build();
        let schema = schema();
        let s = repo.storage_for(&schema).unwrap();
        let cx = Context::new();
        s.insert(&cx, &mut account(&s, 1, "1@x")).unwrap();
        repo.corrupt_row(&schema, &[Value::Integer(1)], false).unwrap();
        let mut cursor = s.query(&cx, &Query::all()).unwrap();
        let err = cursor.next().unwrap_err();
        assert!(err.is_corrupt());
        assert!(err.recovered_key().is_none());
    }

    #[test]
    fn transactions_roll_back_and_nest() {
        let repo = MemoryRepository::builder("m").build();
        let s = repo.storage_for(&schema()).unwrap();
        let root = Context::new();

        let outer = repo.enter_transaction(&root, None).unwrap();
        let cx = root.with_transaction(Arc::clone(&outer));
        s.insert(&cx, &mut account(&s, 1, "1@x")).unwrap();

        let inner = repo.enter_transaction(&cx, None).unwrap();
        let icx = cx.with_transaction(Arc::clone(&inner));
        s.insert(&icx, &mut account(&s, 2, "2@x")).unwrap();
        inner.commit().unwrap();
        inner.exit().unwrap();

        let nested = repo.enter_transaction(&cx, None).unwrap();
        let ncx = cx.with_transaction(Arc::clone(&nested));
        s.insert(&ncx, &mut account(&s, 3, "3@x")).unwrap();
        nested.exit().unwrap();
        assert_eq!(ids(&s, &Query::all()), vec![1, 2]);

        outer.exit().unwrap();
        assert!(ids(&s, &Query::all()).is_empty());
        assert!(s.insert(&cx, &mut account(&s, 4, "4@x")).is_err());
    }

    #[test]
    fn committed_work_survives_exit() {
        let repo = MemoryRepository::builder("m").build();
        let s = repo.storage_for(&schema()).unwrap();
        let root = Context::new();
        let txn = repo.enter_transaction(&root, Some(IsolationLevel::Serializable)).unwrap();
        assert_eq!(txn.isolation(), IsolationLevel::Serializable);
        let cx = root.with_transaction(Arc::clone(&txn));
        s.insert(&cx, &mut account(&s, 1, "1@x")).unwrap();
        txn.commit().unwrap();
        s.insert(&cx, &mut account(&s, 2, "2@x")).unwrap();
        txn.exit().unwrap();
        assert_eq!(ids(&s, &Query::all()), vec![1]);
    }

    #[test]
    fn unsupported_properties_and_types() {
        let schema = schema();
        let repo = MemoryRepository::builder("m")
            .unsupported_property("Account", "cache")
            .unsupported_type("Other")
            .build();
        let s = repo.storage_for(&schema).unwrap();
        assert!(!s.prepare().is_property_supported("cache"));

        let other = Schema::builder("Other")
            .key("id", PropertyKind::Integer)
            .build()
            .unwrap();
        assert!(repo.storage_for(&other).err().expect("storage_for should fail").is_unsupported());
    }

    #[test]
    fn offline_repository_is_unavailable() {
        let repo = MemoryRepository::builder("m").offline().build();
        assert!(repo.storage_for(&schema()).err().expect("storage_for should fail").is_unavailable());
        repo.set_online(true);
        let s = repo.storage_for(&schema()).unwrap();
        repo.set_online(false);
        let err = s.insert(&Context::new(), &mut account(&s, 1, "1@x")).unwrap_err();
        assert!(matches!(err, PersistError::Fetch(FetchError::Unavailable(_))));
    }

    #[test]
    fn foreign_lobs_are_imported() {
        let repo = MemoryRepository::builder("m").build();
        let s = repo.storage_for(&schema()).unwrap();
        let cx = Context::new();
        let detached = LobRef::blob(b"png".to_vec());
        let mut a = account(&s, 1, "1@x")
            .with("avatar", Value::Blob(detached.clone()))
            .unwrap();
        s.insert(&cx, &mut a).unwrap();
        let stored = a.get("avatar").and_then(Value::as_lob).unwrap().clone();
        assert_ne!(stored, detached);
        assert_eq!(stored.read_to_vec().unwrap(), b"png");

        stored.replace(b"jpg").unwrap();
        let mut again = s.prepare().with("id", 1).unwrap();
        s.load(&cx, &mut again).unwrap();
        let lob = again.get("avatar").and_then(Value::as_lob).unwrap();
        assert_eq!(lob, &stored);
        assert_eq!(lob.read_to_vec().unwrap(), b"jpg");
    }

    #[test]
    fn capabilities() {
        let repo = MemoryRepository::builder("m")
            .natural_order("Account", &["id"])
            .without_capability(CapabilityKind::Shutdown)
            .build();
        assert!(repo.capability(CapabilityKind::Shutdown).is_none());
        assert!(repo.capability(CapabilityKind::Resync).is_none());
        let Some(Capability::IndexInfo(info)) = repo.capability(CapabilityKind::IndexInfo) else {
            panic!("index info missing");
        };
        let indexes = info.indexes(&schema()).unwrap();
        assert!(indexes[0].clustered);
        assert_eq!(indexes[1].name, "by_email");
        let Some(Capability::Sequence(seq)) = repo.capability(CapabilityKind::Sequence) else {
            panic!("sequence missing");
        };
        assert_eq!(seq.next_value("s").unwrap(), 1);
        assert_eq!(seq.next_value("s").unwrap(), 2);
    }
}
