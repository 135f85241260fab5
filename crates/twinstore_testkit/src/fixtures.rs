//! Test fixtures and repository helpers.
//!
//! Provides record types covering the shapes the reconciliation engine
//! treats differently, and [`Twin`], a replicated repository over two
//! in-memory repositories that tests can also reach directly.

use std::sync::Arc;
use std::time::Duration;
use twinstore_core::{ReplicatedRepository, ReplicationConfig};
use twinstore_storage::memory::{MemoryRepository, MemoryRepositoryBuilder, MemoryStorage};
use twinstore_storage::{collect, Context, PropertyKind, Query, Record, Repository, Schema, Storage, Value};

/// `Item`: integer key, two plain properties and a version.
pub fn item_schema() -> Arc<Schema> {
    Schema::builder("Item")
        .key("id", PropertyKind::Integer)
        .property("name", PropertyKind::Text)
        .property("qty", PropertyKind::Integer)
        .version("version")
        .build()
        .expect("Invalid item schema")
}

/// `Account`: integer key, unique email alternate key and a version.
pub fn account_schema() -> Arc<Schema> {
    Schema::builder("Account")
        .key("id", PropertyKind::Integer)
        .required("email", PropertyKind::Text)
        .property("name", PropertyKind::Text)
        .independent_property("last_seen", PropertyKind::Integer)
        .version("version")
        .alternate_key("by_email", &["email"])
        .build()
        .expect("Invalid account schema")
}

/// `Document`: carries a clob and a blob.
pub fn document_schema() -> Arc<Schema> {
    Schema::builder("Document")
        .key("id", PropertyKind::Integer)
        .property("title", PropertyKind::Text)
        .property("body", PropertyKind::Clob)
        .property("attachment", PropertyKind::Blob)
        .version("version")
        .build()
        .expect("Invalid document schema")
}

/// `Shipment`: composite key, used to exercise sweep ordering.
pub fn shipment_schema() -> Arc<Schema> {
    Schema::builder("Shipment")
        .key("order_id", PropertyKind::Integer)
        .key("line", PropertyKind::Integer)
        .property("carrier", PropertyKind::Text)
        .build()
        .expect("Invalid shipment schema")
}

/// `AuditEntry`: authoritative, never replicated.
pub fn audit_schema() -> Arc<Schema> {
    Schema::builder("AuditEntry")
        .key("id", PropertyKind::Integer)
        .property("message", PropertyKind::Text)
        .authoritative()
        .build()
        .expect("Invalid audit schema")
}

/// `Draft`: independent, the master may not hold it at all.
pub fn draft_schema() -> Arc<Schema> {
    Schema::builder("Draft")
        .key("id", PropertyKind::Integer)
        .property("text", PropertyKind::Text)
        .independent()
        .build()
        .expect("Invalid draft schema")
}

/// A replicated repository plus direct handles on its two sides.
pub struct Twin {
    /// The master repository.
    pub master: MemoryRepository,
    /// The replica repository.
    pub replica: MemoryRepository,
    /// The repository under test.
    pub repo: ReplicatedRepository,
}

impl Twin {
    /// Creates a twin with default configuration.
    pub fn new() -> Self {
        Self::with_config(ReplicationConfig::default())
    }

    /// Creates a twin with the given configuration.
    pub fn with_config(config: ReplicationConfig) -> Self {
        Self::build(
            MemoryRepository::builder("master").master(true),
            MemoryRepository::builder("replica"),
            config,
        )
    }

    /// Creates a twin from customized repository builders.
    pub fn build(master: MemoryRepositoryBuilder, replica: MemoryRepositoryBuilder, config: ReplicationConfig) -> Self {
        let master = master.build();
        let replica = replica.build();
        let repo = ReplicatedRepository::builder("twin")
            .master(Arc::new(master.clone()))
            .replica(Arc::new(replica.clone()))
            .config(config)
            .build()
            .expect("Failed to build replicated repository");
        Self { master, replica, repo }
    }

    /// Returns the master's own storage for `schema`.
    pub fn master_storage(&self, schema: &Arc<Schema>) -> Arc<MemoryStorage> {
        self.master
            .memory_storage(schema)
            .expect("Failed to open master storage")
    }

    /// Returns the replica's own storage for `schema`.
    pub fn replica_storage(&self, schema: &Arc<Schema>) -> Arc<MemoryStorage> {
        self.replica
            .memory_storage(schema)
            .expect("Failed to open replica storage")
    }

    /// Returns the replicated storage for `schema`.
    pub fn storage(&self, schema: &Arc<Schema>) -> Arc<dyn Storage> {
        self.repo
            .storage_for(schema)
            .expect("Failed to open replicated storage")
    }

    /// Waits for background repairs, failing the test after five seconds.
    pub fn wait_for_repairs(&self) {
        assert!(
            self.repo.wait_for_repairs(Duration::from_secs(5)),
            "background repairs did not finish"
        );
    }
}

impl Default for Twin {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds an `Item` record for `storage`.
pub fn item(storage: &dyn Storage, id: i64, name: &str, qty: i64) -> Record {
    storage
        .prepare()
        .with("id", id)
        .and_then(|r| r.with("name", name))
        .and_then(|r| r.with("qty", qty))
        .expect("Invalid item")
}

/// Builds a key-only record for `storage`.
pub fn key(storage: &dyn Storage, id: i64) -> Record {
    storage.prepare().with("id", id).expect("Invalid key")
}

/// Inserts `record` directly, with replication suspended.
pub fn seed(storage: &dyn Storage, record: &mut Record) {
    storage
        .insert(&Context::new().suspended(), record)
        .expect("Failed to seed record");
}

/// Inserts `record` into the master, then the master's copy into the
/// replica, so both sides agree.
pub fn seed_both(twin: &Twin, schema: &Arc<Schema>, record: &Record) {
    let master = twin.master_storage(schema);
    let replica = twin.replica_storage(schema);
    let mut on_master = master.prepare();
    record.copy_all_properties(&mut on_master);
    seed(master.as_ref(), &mut on_master);
    let mut on_replica = replica.prepare();
    on_master.copy_all_properties(&mut on_replica);
    on_replica.mark_all_properties_dirty();
    seed(replica.as_ref(), &mut on_replica);
}

/// Loads the row with integer key `id`, with replication suspended.
pub fn load(storage: &dyn Storage, id: i64) -> Option<Record> {
    let mut record = key(storage, id);
    storage
        .load(&Context::new().suspended(), &mut record)
        .expect("Failed to load record")
        .then_some(record)
}

/// Returns every row in primary key order, with replication suspended.
pub fn rows(storage: &dyn Storage) -> Vec<Record> {
    let cursor = storage
        .query(&Context::new().suspended(), &Query::all())
        .expect("Failed to query");
    collect(cursor).expect("Failed to read rows")
}

/// Returns the integer keys of every row.
pub fn ids(storage: &dyn Storage) -> Vec<i64> {
    rows(storage)
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_integer))
        .collect()
}

/// Returns true if master and replica hold the same rows.
pub fn converged(master: &dyn Storage, replica: &dyn Storage) -> bool {
    let master_rows = rows(master);
    let replica_rows = rows(replica);
    master_rows.len() == replica_rows.len()
        && master_rows
            .iter()
            .zip(&replica_rows)
            .all(|(m, r)| m.equal_properties(r))
}

/// Asserts that both sides of `twin` hold the same rows of `schema`.
pub fn assert_converged(twin: &Twin, schema: &Arc<Schema>) {
    let master = rows(twin.master_storage(schema).as_ref());
    let replica = rows(twin.replica_storage(schema).as_ref());
    assert_eq!(
        master.len(),
        replica.len(),
        "row counts differ: master {master:?}, replica {replica:?}"
    );
    for (m, r) in master.iter().zip(&replica) {
        assert!(m.equal_properties(r), "rows differ: master {m:?}, replica {r:?}");
    }
}
