//! CLI command implementations.

pub mod resync;
pub mod snapshot;
pub mod verify;
