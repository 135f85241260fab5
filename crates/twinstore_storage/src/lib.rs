//! # twinstore storage
//!
//! Record, storage and repository contracts for twinstore, plus an
//! in-memory reference engine.
//!
//! The reconciliation engine in `twinstore_core` only ever talks to stores
//! through the traits defined here, so any engine that implements
//! [`Repository`], [`Storage`] and [`Cursor`] can serve as master or
//! replica.
//!
//! ## Design Principles
//!
//! - Records are dynamic: a [`Schema`] describes a type and a [`Record`]
//!   carries one value and one dirty-state per property
//! - Every call takes an explicit [`Context`] naming the transaction and
//!   whether replication hooks run
//! - Failures are structured: callers branch on error variants, never on
//!   message text
//! - Everything is `Send + Sync` and safe to share across threads
//!
//! ## Modules
//!
//! - [`memory`] - in-memory repositories for tests and tools

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod context;
mod cursor;
mod error;
mod lob;
pub mod memory;
mod query;
mod record;
mod repository;
mod schema;
mod storage;
mod trigger;
mod value;

pub use context::{Context, ReplicationMode};
pub use cursor::{collect, Cursor, VecCursor};
pub use error::{
    BoxError, FetchError, FetchResult, PersistError, PersistResult, RepositoryError,
    RepositoryResult,
};
pub use lob::{DetachedLob, Lob, LobBuffer, LobIdentity, LobKind, LobRef};
pub use query::{CompareOp, Filter, Operand, OrderTerm, Query};
pub use record::{PropertyState, Record, RecordLayout};
pub use repository::{
    Capability, CapabilityKind, IndexInfo, IndexInfoCapability, IsolationLevel, Repository,
    RepositoryId, ResyncCapability, SequenceCapability, ShutdownCapability, Transaction,
    TransactionId,
};
pub use schema::{AlternateKey, PropertyDef, PropertyKind, Schema, SchemaBuilder, SchemaError};
pub use storage::Storage;
pub use trigger::{Trigger, TriggerId, TriggerManager, TriggerState, TriggerStates};
pub use value::Value;
