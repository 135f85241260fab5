//! # twinstore core
//!
//! Master/replica reconciliation for twinstore.
//!
//! This crate provides:
//! - Write-through replication of every replica write to the master
//! - Background repair of entries a conflict shows to have drifted
//! - Bulk resynchronization sweeps with throttling and corruption recovery
//! - Large-object write mirroring
//! - Composite master/replica transactions
//!
//! ## Architecture
//!
//! A [`ReplicatedRepository`] pairs a master repository with a replica. For
//! each record type it registers a [`ReplicationTrigger`] on the replica
//! storage and hands out a [`ReplicatedStorage`]:
//! 1. Reads are served by the replica
//! 2. Writes run the master operation first, copy the authoritative result
//!    back, then write the replica
//! 3. Conflicts return the master's error and queue a repair on the
//!    [`RepairExecutor`]
//! 4. [`ReplicatedRepository::resync`] merges both stores in key order and
//!    heals every difference it meets
//!
//! ## Key Invariants
//!
//! - The master is authoritative; the replica is only ever made to match it
//! - Repair and resync write under a suspended [`Context`], so they never
//!   reach the master or re-run user triggers
//! - Conflicts reach the caller unchanged even when a repair is scheduled
//! - Background repairs never block the writer: a saturated queue drops the
//!   repair and leaves it to the next sweep
//!
//! [`Context`]: twinstore_storage::Context

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod config;
mod lob;
mod queue;
mod repair;
mod repository;
mod resync;
mod storage;
mod throttle;
mod transaction;
mod trigger;

pub use cancel::CancelToken;
pub use config::{OrderPreference, RepairConfig, ReplicationConfig, ResyncOptions, WorkerOptions};
pub use lob::{LobReplicationTrigger, ReplicatedLob, TeeWriter};
pub use queue::{OfferError, TaskQueue};
pub use repair::{FailureHandler, RepairExecutor, RepairFailure, RepairJob, RepairStats};
pub use repository::{ReplicatedRepository, ReplicatedRepositoryBuilder};
pub use resync::{sweep_order, ResyncReport};
pub use storage::ReplicatedStorage;
pub use throttle::{Clock, ManualClock, SystemClock, Throttle, MIN_SPEED};
pub use transaction::ReplicatedTransaction;
pub use trigger::{MasterState, RepairAction, ReplicationTrigger};
