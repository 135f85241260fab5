//! # twinstore testkit
//!
//! Test utilities for twinstore.
//!
//! This crate provides:
//! - Record types and paired in-memory master/replica fixtures
//! - Property-based generators for divergent master/replica contents
//! - A recording repository wrapper that counts storage calls
//!
//! ## Usage
//!
//! ```rust
//! use twinstore_testkit::prelude::*;
//! use twinstore_storage::{Context, Repository, Storage};
//!
//! let twin = Twin::new();
//! let schema = item_schema();
//! let items = twin.repo.storage_for(&schema).unwrap();
//! let mut item = items.prepare().with("id", 1).unwrap().with("name", "bolt").unwrap();
//! items.insert(&Context::new(), &mut item).unwrap();
//! assert_converged(&twin, &schema);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod recording;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::recording::*;
}

pub use fixtures::*;
pub use generators::*;
pub use recording::*;
