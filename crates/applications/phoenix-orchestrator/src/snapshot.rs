//! Snapshot creation and restore
//!
//! A snapshot is a set of content-addressed blobs, one per workspace file,
//! plus a manifest blob listing them:
//!
//! ```text
//! create:  workspace ──read──▶ put(file) ... put(manifest) ──poll status──▶ success
//! restore: get(manifest) ──get+verify every file──▶ apply_staged(target) ──▶ marker
//! ```
//!
//! Nothing is written to the target until every file has been fetched and
//! its digest verified, so a corrupt or incomplete snapshot never leaves a
//! half-restored workspace that looks complete.

use crate::config::SnapshotConfig;
use crate::error::{OrchestratorError, Result};
use crate::instance::InstanceRegistry;
use crate::workspace::{RestoreMarker, apply_staged, user_manifest};
use chrono::{DateTime, Utc};
use phoenix_core::{
    BlobStatus, BlobStore, ComputeProvider, ContentRef, InstanceHandle, InstanceId, Snapshot,
    SnapshotStatus, content_digest,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One file inside a stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ArchivedFile {
    size: u64,
    digest: String,
    content_ref: ContentRef,
}

/// Manifest blob of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotManifest {
    snapshot_id: String,
    source_instance: InstanceId,
    created_at: DateTime<Utc>,
    files: BTreeMap<String, ArchivedFile>,
}

/// Outcome of a successful restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub snapshot_id: String,
    pub file_count: usize,
    pub bytes_restored: u64,
}

struct PeriodicTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Creates, catalogues and restores snapshots
pub struct SnapshotManager {
    blobs: Arc<dyn BlobStore>,
    compute: Arc<dyn ComputeProvider>,
    config: SnapshotConfig,
    catalog: RwLock<HashMap<String, Snapshot>>,
    /// Replacement id → the instance it replaced
    lineage: RwLock<HashMap<InstanceId, InstanceId>>,
    periodic: Mutex<HashMap<InstanceId, PeriodicTask>>,
}

impl SnapshotManager {
    pub fn new(blobs: Arc<dyn BlobStore>, compute: Arc<dyn ComputeProvider>, config: SnapshotConfig) -> Self {
        Self {
            blobs,
            compute,
            config,
            catalog: RwLock::new(HashMap::new()),
            lineage: RwLock::new(HashMap::new()),
            periodic: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot the workspace of `source`.
    ///
    /// The snapshot is catalogued as `pending` immediately and ends up
    /// `success` or `failed`; a failed snapshot is never used for restore.
    pub async fn create(&self, source: &InstanceHandle, name: Option<String>) -> Result<Snapshot> {
        let id = format!("snap-{}", Uuid::new_v4().simple());
        let mut snapshot = Snapshot {
            id: id.clone(),
            name: name.unwrap_or_else(|| format!("{}-{}", source.id, Utc::now().format("%Y%m%dT%H%M%S"))),
            source_instance: source.id.clone(),
            status: SnapshotStatus::Pending,
            size_bytes: 0,
            file_count: 0,
            content_ref: None,
            created_at: Utc::now(),
        };
        self.catalog.write().await.insert(id.clone(), snapshot.clone());
        info!(snapshot_id = %id, instance_id = %source.id, "Creating snapshot");

        match self.upload(&snapshot, source).await {
            Ok((manifest_ref, file_count, size_bytes)) => {
                snapshot.status = SnapshotStatus::Success;
                snapshot.content_ref = Some(manifest_ref);
                snapshot.file_count = file_count;
                snapshot.size_bytes = size_bytes;
                info!(
                    snapshot_id = %id,
                    files = file_count,
                    bytes = size_bytes,
                    "Snapshot committed"
                );
            }
            Err(e) => {
                snapshot.status = SnapshotStatus::Failed;
                warn!(snapshot_id = %id, error = %e, "Snapshot failed");
                self.catalog.write().await.insert(id, snapshot);
                return Err(match e {
                    OrchestratorError::SnapshotCreateFailure(_) => e,
                    other => OrchestratorError::snapshot_create(other.to_string()),
                });
            }
        }

        self.catalog.write().await.insert(id, snapshot.clone());
        Ok(snapshot)
    }

    async fn upload(&self, snapshot: &Snapshot, source: &InstanceHandle) -> Result<(ContentRef, usize, u64)> {
        let workspace = self.compute.workspace(source).await?;
        let manifest = user_manifest(workspace.as_ref()).await?;

        let mut files = BTreeMap::new();
        for path in manifest.files.keys() {
            let data = workspace.read(path).await?;
            let entry = ArchivedFile {
                size: data.len() as u64,
                digest: content_digest(&data),
                content_ref: self.blobs.put(data).await?,
            };
            files.insert(path.clone(), entry);
        }

        let archived = SnapshotManifest {
            snapshot_id: snapshot.id.clone(),
            source_instance: snapshot.source_instance.clone(),
            created_at: snapshot.created_at,
            files,
        };
        let manifest_ref = self.blobs.put(serde_json::to_vec(&archived)?).await?;

        let mut pending: Vec<&ContentRef> = archived.files.values().map(|f| &f.content_ref).collect();
        pending.push(&manifest_ref);
        pending.sort();
        pending.dedup();

        let timeout = Duration::from_secs(self.config.create_timeout_secs);
        tokio::time::timeout(timeout, self.wait_committed(&pending))
            .await
            .map_err(|_| {
                OrchestratorError::snapshot_create(format!("blobs not committed within {:?}", timeout))
            })??;

        let size = archived.files.values().map(|f| f.size).sum();
        Ok((manifest_ref, archived.files.len(), size))
    }

    async fn wait_committed(&self, refs: &[&ContentRef]) -> Result<()> {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        for content_ref in refs {
            loop {
                match self.blobs.status(content_ref).await? {
                    BlobStatus::Committed => break,
                    BlobStatus::Failed => {
                        return Err(OrchestratorError::snapshot_create(format!(
                            "storage reported blob {} failed",
                            content_ref
                        )));
                    }
                    BlobStatus::Pending => {
                        debug!(blob = %content_ref, "Blob pending");
                        tokio::time::sleep(poll).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Restore `snapshot_id` onto `target`.
    ///
    /// The target needs no pre-existing data; files it holds that are not
    /// part of the snapshot are left alone.
    pub async fn restore(&self, snapshot_id: &str, target: &InstanceHandle) -> Result<RestoreReport> {
        let snapshot = self
            .get(snapshot_id)
            .await
            .ok_or_else(|| OrchestratorError::snapshot_restore(format!("unknown snapshot {}", snapshot_id)))?;
        let manifest_ref = match (&snapshot.status, &snapshot.content_ref) {
            (SnapshotStatus::Success, Some(r)) => r.clone(),
            (status, _) => {
                return Err(OrchestratorError::snapshot_restore(format!(
                    "snapshot {} is {:?}",
                    snapshot_id, status
                )));
            }
        };

        info!(snapshot_id = %snapshot_id, target = %target.id, "Restoring snapshot");
        let files = self.fetch_verified(&manifest_ref).await?;

        let workspace = self
            .compute
            .workspace(target)
            .await
            .map_err(|e| OrchestratorError::snapshot_restore(format!("target workspace: {}", e)))?;
        let marker = RestoreMarker {
            source: snapshot.id.clone(),
            source_instance: snapshot.source_instance.clone(),
            file_count: files.len(),
            bytes: files.values().map(|d| d.len() as u64).sum(),
            restored_at: Utc::now(),
        };
        let bytes_restored = apply_staged(workspace.as_ref(), &files, &marker).await?;

        info!(snapshot_id = %snapshot_id, target = %target.id, bytes = bytes_restored, "Snapshot restored");
        Ok(RestoreReport {
            snapshot_id: snapshot.id,
            file_count: files.len(),
            bytes_restored,
        })
    }

    async fn fetch_verified(&self, manifest_ref: &ContentRef) -> Result<BTreeMap<String, Vec<u8>>> {
        let raw = self
            .blobs
            .get(manifest_ref)
            .await
            .map_err(|e| OrchestratorError::snapshot_restore(format!("manifest: {}", e)))?;
        if &ContentRef::of(&raw) != manifest_ref {
            return Err(OrchestratorError::snapshot_restore("manifest digest mismatch"));
        }
        let manifest: SnapshotManifest = serde_json::from_slice(&raw)
            .map_err(|e| OrchestratorError::snapshot_restore(format!("manifest: {}", e)))?;

        let mut files = BTreeMap::new();
        for (path, entry) in manifest.files {
            let data = self
                .blobs
                .get(&entry.content_ref)
                .await
                .map_err(|e| OrchestratorError::snapshot_restore(format!("{}: {}", path, e)))?;
            if data.len() as u64 != entry.size || content_digest(&data) != entry.digest {
                return Err(OrchestratorError::snapshot_restore(format!(
                    "{}: content does not match recorded digest",
                    path
                )));
            }
            files.insert(path, data);
        }
        Ok(files)
    }

    pub async fn get(&self, snapshot_id: &str) -> Option<Snapshot> {
        self.catalog.read().await.get(snapshot_id).cloned()
    }

    /// Snapshots of `instance_id`, oldest first
    pub async fn list(&self, instance_id: &InstanceId) -> Vec<Snapshot> {
        let mut snapshots: Vec<_> = self
            .catalog
            .read()
            .await
            .values()
            .filter(|s| &s.source_instance == instance_id)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Newest successful snapshot of `instance_id` or of the instances it replaced
    pub async fn latest_successful(&self, instance_id: &InstanceId) -> Option<Snapshot> {
        let lineage = self.lineage.read().await;
        let catalog = self.catalog.read().await;

        let mut current = Some(instance_id.clone());
        while let Some(id) = current {
            let latest = catalog
                .values()
                .filter(|s| s.source_instance == id && s.status == SnapshotStatus::Success)
                .max_by_key(|s| s.created_at);
            if let Some(snapshot) = latest {
                return Some(snapshot.clone());
            }
            current = lineage.get(&id).cloned();
        }
        None
    }

    /// Record that `new` replaced `old`, so older snapshots stay reachable
    pub async fn adopt(&self, old: &InstanceId, new: &InstanceId) {
        self.lineage.write().await.insert(new.clone(), old.clone());
    }

    /// Snapshot `instance_id` every `interval`, starting now
    pub async fn start_periodic(self: &Arc<Self>, instances: InstanceRegistry, instance_id: &InstanceId, interval: Duration) {
        let mut tasks = self.periodic.lock().await;
        if tasks.get(instance_id).is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let (shutdown, mut rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let id = instance_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rx.changed() => break,
                }
                let instance = match instances.get(&id).await {
                    Ok(instance) => instance,
                    Err(_) => break,
                };
                if let Err(e) = manager.create(&instance.handle(), None).await {
                    warn!(instance_id = %id, error = %e, "Periodic snapshot failed");
                }
            }
        });

        info!(instance_id = %instance_id, interval_secs = interval.as_secs(), "Periodic snapshots started");
        tasks.insert(instance_id.clone(), PeriodicTask { shutdown, handle });
    }

    pub async fn stop_periodic(&self, instance_id: &InstanceId) -> bool {
        let task = self.periodic.lock().await.remove(instance_id);
        match task {
            Some(task) => {
                let _ = task.shutdown.send(true);
                if let Err(e) = task.handle.await {
                    warn!(instance_id = %instance_id, error = %e, "Periodic snapshot task ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    pub async fn is_periodic(&self, instance_id: &InstanceId) -> bool {
        self.periodic
            .lock()
            .await
            .get(instance_id)
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub async fn shutdown(&self) {
        let ids: Vec<InstanceId> = self.periodic.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_periodic(&id).await;
        }
    }
}
