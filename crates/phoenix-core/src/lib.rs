//! Phoenix Core - Shared types and traits
//!
//! This crate defines the core abstractions used across:
//! - phoenix-orchestrator (failover engine and `phoenix` binary)
//! - provider implementations (compute backends, blob storage)
//!
//! Key types:
//! - ComputeProvider / BlobStore / Workspace traits (capability interfaces)
//! - Protected instances, standby associations, snapshots, failover events
//! - Error types

pub mod error;
pub mod failover;
pub mod traits;
pub mod types;

pub use error::*;
pub use failover::*;
pub use traits::*;
pub use types::*;
