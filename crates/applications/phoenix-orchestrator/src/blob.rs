//! In-memory blob storage
//!
//! Content-addressed like the real backends. Commits can be delayed by a
//! number of status polls, or made to fail, to exercise the snapshot
//! manager's polling paths.

use async_trait::async_trait;
use phoenix_core::{BlobStatus, BlobStore, ContentRef, PhoenixError, Result};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug)]
struct StoredBlob {
    data: Vec<u8>,
    /// Status polls left before the blob reports committed
    polls_until_commit: u32,
    failed: bool,
}

#[derive(Debug, Default)]
struct Faults {
    commit_after_polls: u32,
    fail_commits: bool,
    fail_puts: bool,
}

/// Blob store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<ContentRef, StoredBlob>>,
    faults: Mutex<Faults>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// New blobs report `pending` for `polls` status calls
    pub async fn set_commit_delay(&self, polls: u32) {
        self.faults.lock().await.commit_after_polls = polls;
    }

    /// New blobs end up `failed`
    pub async fn set_fail_commits(&self, fail: bool) {
        self.faults.lock().await.fail_commits = fail;
    }

    /// `put` returns an error
    pub async fn set_fail_puts(&self, fail: bool) {
        self.faults.lock().await.fail_puts = fail;
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    /// Overwrite stored bytes without changing the address (corruption test hook)
    pub async fn corrupt(&self, content_ref: &ContentRef, data: Vec<u8>) {
        if let Some(blob) = self.blobs.lock().await.get_mut(content_ref) {
            blob.data = data;
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: Vec<u8>) -> Result<ContentRef> {
        let (delay, fail_commit) = {
            let faults = self.faults.lock().await;
            if faults.fail_puts {
                return Err(PhoenixError::storage("injected put failure"));
            }
            (faults.commit_after_polls, faults.fail_commits)
        };

        let content_ref = ContentRef::of(&data);
        let mut blobs = self.blobs.lock().await;
        // Identical content is already stored (and committed or pending)
        blobs.entry(content_ref.clone()).or_insert(StoredBlob {
            data,
            polls_until_commit: delay,
            failed: fail_commit,
        });
        Ok(content_ref)
    }

    async fn get(&self, content_ref: &ContentRef) -> Result<Vec<u8>> {
        let blobs = self.blobs.lock().await;
        match blobs.get(content_ref) {
            Some(blob) if !blob.failed && blob.polls_until_commit == 0 => Ok(blob.data.clone()),
            Some(_) => Err(PhoenixError::storage(format!(
                "blob {} is not committed",
                content_ref
            ))),
            None => Err(PhoenixError::BlobNotFound(content_ref.to_string())),
        }
    }

    async fn status(&self, content_ref: &ContentRef) -> Result<BlobStatus> {
        let mut blobs = self.blobs.lock().await;
        let blob = blobs
            .get_mut(content_ref)
            .ok_or_else(|| PhoenixError::BlobNotFound(content_ref.to_string()))?;
        if blob.failed {
            return Ok(BlobStatus::Failed);
        }
        if blob.polls_until_commit > 0 {
            blob.polls_until_commit -= 1;
            return Ok(BlobStatus::Pending);
        }
        Ok(BlobStatus::Committed)
    }
}
