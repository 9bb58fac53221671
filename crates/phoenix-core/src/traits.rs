//! Capability interfaces for Phoenix
//!
//! The orchestrator works through these interfaces ONLY - never concrete
//! provider types. Implementations live outside the orchestration core
//! (cloud SDK adapters) or in the orchestrator's simulated/test backends.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::*;

/// Creates, destroys and inspects compute instances on the spot GPU market
/// and on reliable CPU hosts.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Capacity currently offered for `constraints`, cheapest first
    async fn search(&self, constraints: &CapacityConstraints) -> Result<Vec<Candidate>>;

    /// Request an instance for `candidate`; it may not be reachable yet
    async fn provision(&self, candidate: &Candidate) -> Result<InstanceHandle>;

    async fn destroy(&self, handle: &InstanceHandle) -> Result<()>;

    async fn health(&self, handle: &InstanceHandle) -> Result<HostHealth>;

    /// Access to the instance's workspace (data directory)
    async fn workspace(&self, handle: &InstanceHandle) -> Result<Arc<dyn Workspace>>;
}

/// Durable, content-addressed blob storage used for snapshots.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data`; the returned reference is its content address
    async fn put(&self, data: Vec<u8>) -> Result<ContentRef>;

    async fn get(&self, content_ref: &ContentRef) -> Result<Vec<u8>>;

    /// Commit state of a previously put blob
    async fn status(&self, content_ref: &ContentRef) -> Result<BlobStatus>;

    async fn exists(&self, content_ref: &ContentRef) -> Result<bool> {
        Ok(self.status(content_ref).await? == BlobStatus::Committed)
    }
}

/// File-level view of an instance's workspace.
///
/// Paths are relative, `/`-separated and never contain `..`.
#[async_trait]
pub trait Workspace: Send + Sync {
    async fn manifest(&self) -> Result<WorkspaceManifest>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Remove a file; removing a missing file is not an error
    async fn remove(&self, path: &str) -> Result<()>;

    /// Move `from` over `to`, replacing any file at `to`
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}
