//! The replicated repository.
//!
//! [`ReplicatedRepository`] pairs a master with a replica and hands out a
//! [`ReplicatedStorage`] per record type. It owns the background
//! [`RepairExecutor`] shared by every type and exposes bulk
//! resynchronization both as inherent methods and as the
//! [`ResyncCapability`].

use crate::config::{ReplicationConfig, ResyncOptions};
use crate::repair::{FailureHandler, RepairExecutor, RepairStats};
use crate::resync::{self, ResyncReport};
use crate::storage::ReplicatedStorage;
use crate::transaction::RepositoryPair;
use crate::trigger::ReplicationTrigger;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use twinstore_storage::{
    Capability, CapabilityKind, Context, Filter, IsolationLevel, Repository, RepositoryError,
    RepositoryId, RepositoryResult, ResyncCapability, Schema, ShutdownCapability, Storage,
    Transaction,
};

/// Builder for [`ReplicatedRepository`].
pub struct ReplicatedRepositoryBuilder {
    name: String,
    master: Option<Arc<dyn Repository>>,
    replica: Option<Arc<dyn Repository>>,
    config: ReplicationConfig,
    failure_handler: Option<FailureHandler>,
}

impl ReplicatedRepositoryBuilder {
    /// Sets the authoritative repository.
    #[must_use]
    pub fn master(mut self, master: Arc<dyn Repository>) -> Self {
        self.master = Some(master);
        self
    }

    /// Sets the repository kept in step with the master.
    #[must_use]
    pub fn replica(mut self, replica: Arc<dyn Repository>) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    /// Routes failed and panicked background repairs to `handler` instead
    /// of only logging them.
    #[must_use]
    pub fn failure_handler(mut self, handler: FailureHandler) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    /// Builds the repository and starts its repair workers.
    ///
    /// # Errors
    ///
    /// Fails with [`RepositoryError::Config`] if either side is missing,
    /// and with [`RepositoryError::Unavailable`] if the workers cannot be
    /// started.
    pub fn build(self) -> RepositoryResult<ReplicatedRepository> {
        let master = self
            .master
            .ok_or_else(|| RepositoryError::Config("replicated repository needs a master".into()))?;
        let replica = self
            .replica
            .ok_or_else(|| RepositoryError::Config("replicated repository needs a replica".into()))?;
        let executor = match self.failure_handler {
            Some(handler) => RepairExecutor::with_failure_handler(self.config.repair.clone(), handler)?,
            None => RepairExecutor::new(self.config.repair.clone())?,
        };
        info!(
            repository = %self.name,
            master = master.name(),
            replica = replica.name(),
            "replicated repository opened"
        );
        Ok(ReplicatedRepository {
            inner: Arc::new(Inner {
                name: self.name,
                pair: RepositoryPair::new(master, replica),
                config: self.config,
                executor: Arc::new(executor),
                closed: AtomicBool::new(false),
                pool: Mutex::new(HashMap::new()),
            }),
        })
    }
}

#[derive(Clone)]
struct PoolEntry {
    storage: Arc<dyn Storage>,
    replicated: Option<Arc<ReplicatedStorage>>,
}

type PoolSlot = Arc<Mutex<Option<PoolEntry>>>;

struct Inner {
    name: String,
    pair: RepositoryPair,
    config: ReplicationConfig,
    executor: Arc<RepairExecutor>,
    closed: AtomicBool,
    pool: Mutex<HashMap<String, PoolSlot>>,
}

/// A master and a replica presented as one repository.
///
/// Cloning yields another handle to the same repository.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use twinstore_core::ReplicatedRepository;
/// use twinstore_storage::memory::MemoryRepository;
/// use twinstore_storage::{Context, PropertyKind, Repository, Schema, Storage};
///
/// let schema = Schema::builder("Note")
///     .key("id", PropertyKind::Integer)
///     .property("body", PropertyKind::Text)
///     .build()
///     .unwrap();
/// let master = MemoryRepository::builder("master").master(true).build();
/// let replica = MemoryRepository::builder("replica").build();
/// let repo = ReplicatedRepository::builder("notes")
///     .master(Arc::new(master.clone()))
///     .replica(Arc::new(replica))
///     .build()
///     .unwrap();
///
/// let notes = repo.storage_for(&schema).unwrap();
/// let mut note = notes.prepare().with("id", 1).unwrap().with("body", "hi").unwrap();
/// notes.insert(&Context::new(), &mut note).unwrap();
///
/// let mut on_master = master.storage_for(&schema).unwrap().prepare().with("id", 1).unwrap();
/// assert!(master.storage_for(&schema).unwrap().load(&Context::new(), &mut on_master).unwrap());
/// repo.close().unwrap();
/// ```
#[derive(Clone)]
pub struct ReplicatedRepository {
    inner: Arc<Inner>,
}

impl ReplicatedRepository {
    /// Starts building a replicated repository.
    pub fn builder(name: impl Into<String>) -> ReplicatedRepositoryBuilder {
        ReplicatedRepositoryBuilder {
            name: name.into(),
            master: None,
            replica: None,
            config: ReplicationConfig::default(),
            failure_handler: None,
        }
    }

    /// Returns the master repository.
    #[must_use]
    pub fn master(&self) -> &Arc<dyn Repository> {
        &self.inner.pair.master
    }

    /// Returns the replica repository.
    #[must_use]
    pub fn replica(&self) -> &Arc<dyn Repository> {
        &self.inner.pair.replica
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ReplicationConfig {
        &self.inner.config
    }

    /// Returns the background repair counters.
    #[must_use]
    pub fn repair_stats(&self) -> RepairStats {
        self.inner.executor.stats()
    }

    /// Waits until every queued background repair has run. Returns false
    /// on timeout.
    pub fn wait_for_repairs(&self, timeout: Duration) -> bool {
        self.inner.executor.wait_idle(timeout)
    }

    /// Returns true once the repository has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> RepositoryResult<()> {
        if self.is_closed() {
            Err(RepositoryError::Closed)
        } else {
            Ok(())
        }
    }

    /// Returns the pooled entry for `schema`, creating it on first use.
    /// Concurrent first callers for one type wait for a single creation.
    fn entry(&self, schema: &Arc<Schema>) -> RepositoryResult<PoolEntry> {
        self.check_open()?;
        let slot: PoolSlot = {
            let mut pool = self.inner.pool.lock();
            Arc::clone(pool.entry(schema.name().to_string()).or_default())
        };
        let mut entry = slot.lock();
        if let Some(existing) = entry.as_ref() {
            if existing.storage.schema().as_ref() != schema.as_ref() {
                return Err(RepositoryError::Config(format!(
                    "type {} is already registered with a different definition",
                    schema.name()
                )));
            }
            return Ok(existing.clone());
        }
        let created = self.create(schema)?;
        *entry = Some(created.clone());
        Ok(created)
    }

    fn create(&self, schema: &Arc<Schema>) -> RepositoryResult<PoolEntry> {
        let pair = &self.inner.pair;
        if schema.is_authoritative() {
            let storage = match pair.master.storage_for(schema) {
                Ok(storage) => storage,
                Err(e) if e.is_unsupported() && schema.is_independent() => {
                    debug!(schema = schema.name(), "master lacks authoritative type, using replica");
                    pair.replica.storage_for(schema)?
                }
                Err(e) => return Err(e),
            };
            debug!(schema = schema.name(), "authoritative type bypasses replication");
            return Ok(PoolEntry {
                storage,
                replicated: None,
            });
        }

        let replica = pair.replica.storage_for(schema)?;
        let trigger = ReplicationTrigger::new(
            Arc::clone(schema),
            replica,
            Arc::clone(&pair.replica),
            Arc::clone(&pair.master),
            Arc::clone(&self.inner.executor),
        )?;
        let replicated = Arc::new(ReplicatedStorage::new(
            trigger,
            pair.clone(),
            self.inner.config.replicate_lobs,
        ));
        Ok(PoolEntry {
            storage: Arc::clone(&replicated) as Arc<dyn Storage>,
            replicated: Some(replicated),
        })
    }

    /// Returns the replicated storage for `schema`.
    ///
    /// # Errors
    ///
    /// Fails with [`RepositoryError::Unsupported`] for authoritative types,
    /// which are not replicated.
    pub fn replicated_storage(&self, schema: &Arc<Schema>) -> RepositoryResult<Arc<ReplicatedStorage>> {
        self.entry(schema)?.replicated.ok_or_else(|| {
            RepositoryError::Unsupported(format!(
                "type {} is authoritative and not replicated",
                schema.name()
            ))
        })
    }

    /// Sweeps master and replica of `schema` and repairs every divergence
    /// found. `desired_speed` is the fraction of full throughput to use.
    pub fn resync(
        &self,
        schema: &Arc<Schema>,
        desired_speed: f64,
        filter: Option<&Filter>,
    ) -> RepositoryResult<ResyncReport> {
        let mut options = ResyncOptions::new().with_speed(desired_speed);
        if let Some(filter) = filter {
            options = options.with_filter(filter.clone());
        }
        self.resync_with(schema, &options)
    }

    /// Sweeps `schema` with full control over the sweep.
    ///
    /// # Errors
    ///
    /// Fails with [`RepositoryError::Interrupted`] when cancelled,
    /// [`RepositoryError::QueueTimeout`] when the resync worker falls
    /// behind, and with the underlying failure when a cursor breaks in a
    /// way that cannot be stepped over.
    pub fn resync_with(&self, schema: &Arc<Schema>, options: &ResyncOptions) -> RepositoryResult<ResyncReport> {
        let storage = self.replicated_storage(schema)?;
        resync::run(
            storage.trigger(),
            self.inner.pair.replica.as_ref(),
            self.inner.config.order_preference,
            options,
        )
    }

    fn stop(&self, via_shutdown: bool) -> RepositoryResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.inner.executor.shutdown(self.inner.config.repair.shutdown_timeout) {
            warn!(repository = %self.inner.name, "repairs abandoned at close");
        }
        self.inner.pool.lock().clear();

        let stop_side = |side: &Arc<dyn Repository>| match side.capability(CapabilityKind::Shutdown) {
            Some(Capability::Shutdown(shutdown)) if via_shutdown => shutdown.shutdown(),
            _ => side.close(),
        };
        let master = stop_side(&self.inner.pair.master);
        let replica = stop_side(&self.inner.pair.replica);
        info!(repository = %self.inner.name, stats = ?self.repair_stats(), "replicated repository closed");
        match (master, replica) {
            (Err(e), replica) => {
                if let Err(second) = replica {
                    warn!(repository = %self.inner.name, error = %second, "replica also failed to close");
                }
                Err(e)
            }
            (Ok(()), replica) => replica,
        }
    }
}

impl Repository for ReplicatedRepository {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn id(&self) -> RepositoryId {
        self.inner.pair.id
    }

    fn storage_for(&self, schema: &Arc<Schema>) -> RepositoryResult<Arc<dyn Storage>> {
        Ok(self.entry(schema)?.storage)
    }

    fn enter_transaction(
        &self,
        cx: &Context,
        isolation: Option<IsolationLevel>,
    ) -> RepositoryResult<Arc<dyn Transaction>> {
        self.check_open()?;
        self.inner.pair.enter(cx, isolation)
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability> {
        let pair = &self.inner.pair;
        match kind {
            CapabilityKind::IndexInfo => pair
                .replica
                .capability(kind)
                .or_else(|| pair.master.capability(kind)),
            CapabilityKind::Sequence => pair
                .master
                .capability(kind)
                .or_else(|| pair.replica.capability(kind)),
            CapabilityKind::Shutdown => {
                let either = pair.master.capability(kind).is_some() || pair.replica.capability(kind).is_some();
                either.then(|| Capability::Shutdown(Arc::new(self.clone())))
            }
            CapabilityKind::Resync => Some(Capability::Resync(Arc::new(self.clone()))),
        }
    }

    fn close(&self) -> RepositoryResult<()> {
        self.stop(false)
    }
}

impl ShutdownCapability for ReplicatedRepository {
    fn shutdown(&self) -> RepositoryResult<()> {
        self.stop(true)
    }
}

impl ResyncCapability for ReplicatedRepository {
    fn resync(
        &self,
        schema: &Arc<Schema>,
        desired_speed: f64,
        filter: Option<&Filter>,
    ) -> RepositoryResult<()> {
        ReplicatedRepository::resync(self, schema, desired_speed, filter).map(|_| ())
    }
}

impl fmt::Debug for ReplicatedRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedRepository")
            .field("name", &self.inner.name)
            .field("master", &self.inner.pair.master.name())
            .field("replica", &self.inner.pair.replica.name())
            .field("types", &self.inner.pool.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
