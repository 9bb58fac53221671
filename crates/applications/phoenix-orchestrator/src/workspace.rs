//! Workspace backends and staged file transfer
//!
//! Two [`Workspace`] implementations:
//! - [`LocalWorkspace`]: a directory on the local filesystem (`tokio::fs`)
//! - [`MemoryWorkspace`]: an in-memory map, used by the simulated cloud
//!
//! and [`apply_staged`], the all-or-nothing write used by restores: every
//! file is fetched and verified before the first write, files are written
//! under `.phoenix/staging/` and renamed into place only once all of them
//! are staged, and the `.phoenix/restored.json` marker is written last.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use phoenix_core::{
    FileEntry, InstanceId, PhoenixError, Result as CoreResult, Workspace, WorkspaceManifest,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

/// Directory reserved for orchestrator bookkeeping inside a workspace
pub const INTERNAL_DIR: &str = ".phoenix";

/// Marker written after a restore completed
pub const RESTORE_MARKER: &str = ".phoenix/restored.json";

/// Restored files are written here before being moved into place
pub const STAGING_DIR: &str = ".phoenix/staging";

/// Whether `path` is orchestrator bookkeeping rather than user data
pub fn is_internal_path(path: &str) -> bool {
    path == INTERNAL_DIR || path.starts_with(".phoenix/")
}

/// Manifest without orchestrator bookkeeping
pub async fn user_manifest(workspace: &dyn Workspace) -> CoreResult<WorkspaceManifest> {
    let mut manifest = workspace.manifest().await?;
    manifest.files.retain(|path, _| !is_internal_path(path));
    Ok(manifest)
}

/// Validate a relative workspace path
pub fn validate_path(path: &str) -> CoreResult<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|c| c.is_empty() || c == "." || c == "..");
    if bad {
        return Err(PhoenixError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Written last by a completed restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreMarker {
    /// Snapshot id, or `live:<host>` for a copy from a standby host
    pub source: String,
    pub source_instance: InstanceId,
    pub file_count: usize,
    pub bytes: u64,
    pub restored_at: DateTime<Utc>,
}

/// Read the restore marker, if the workspace looks restored
pub async fn read_restore_marker(workspace: &dyn Workspace) -> Option<RestoreMarker> {
    let manifest = workspace.manifest().await.ok()?;
    if !manifest.files.contains_key(RESTORE_MARKER) {
        return None;
    }
    let raw = workspace.read(RESTORE_MARKER).await.ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Write verified `files` into `target`, then the marker.
///
/// Returns the number of bytes written. Files are staged first; if staging
/// fails the staged copies are removed and the target's existing files are
/// untouched. No marker exists unless every file was moved into place.
pub async fn apply_staged(
    target: &dyn Workspace,
    files: &BTreeMap<String, Vec<u8>>,
    marker: &RestoreMarker,
) -> Result<u64> {
    let marker_bytes = serde_json::to_vec_pretty(marker)?;

    // A stale marker from an earlier restore must not survive a new attempt
    target.remove(RESTORE_MARKER).await?;

    let mut staged: Vec<(String, &str)> = Vec::with_capacity(files.len());
    let mut bytes = 0u64;
    for (path, data) in files {
        let staging = format!("{}/{}", STAGING_DIR, path);
        if let Err(e) = target.write(&staging, data).await {
            warn!(path = %path, error = %e, "Restore staging failed, discarding staged files");
            discard_staged(target, staged.iter().map(|(s, _)| s.as_str())).await;
            return Err(OrchestratorError::snapshot_restore(format!(
                "write of {} failed: {}",
                path, e
            )));
        }
        staged.push((staging, path));
        bytes += data.len() as u64;
    }

    for (i, (staging, path)) in staged.iter().enumerate() {
        if let Err(e) = target.rename(staging, path).await {
            warn!(path = %path, error = %e, "Restore promotion failed");
            discard_staged(target, staged[i..].iter().map(|(s, _)| s.as_str())).await;
            return Err(OrchestratorError::snapshot_restore(format!(
                "move of {} into place failed: {}",
                path, e
            )));
        }
    }

    target
        .write(RESTORE_MARKER, &marker_bytes)
        .await
        .map_err(|e| OrchestratorError::snapshot_restore(format!("marker write failed: {}", e)))?;

    debug!(files = files.len(), bytes, "Staged restore applied");
    Ok(bytes)
}

async fn discard_staged<'a>(target: &dyn Workspace, paths: impl Iterator<Item = &'a str>) {
    for path in paths {
        if let Err(e) = target.remove(path).await {
            warn!(path = %path, error = %e, "Could not remove staged file");
        }
    }
}

/// Copy every user file of `source` onto `target` (live standby restore)
pub async fn copy_workspace(
    source: &dyn Workspace,
    target: &dyn Workspace,
    source_instance: &InstanceId,
    source_label: &str,
) -> Result<u64> {
    let manifest = user_manifest(source)
        .await
        .map_err(|e| OrchestratorError::snapshot_restore(format!("source manifest: {}", e)))?;

    let mut files = BTreeMap::new();
    for path in manifest.files.keys() {
        let data = source
            .read(path)
            .await
            .map_err(|e| OrchestratorError::snapshot_restore(format!("read {}: {}", path, e)))?;
        files.insert(path.clone(), data);
    }

    let marker = RestoreMarker {
        source: format!("live:{}", source_label),
        source_instance: source_instance.clone(),
        file_count: files.len(),
        bytes: files.values().map(|d| d.len() as u64).sum(),
        restored_at: Utc::now(),
    };
    apply_staged(target, &files, &marker).await
}

/// In-memory workspace
#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Remaining writes before writes start failing (fault injection)
    writes_left: Mutex<Option<usize>>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Let `n` more writes succeed, then fail every write
    pub async fn fail_writes_after(&self, n: usize) {
        *self.writes_left.lock().await = Some(n);
    }

    /// Stop failing writes
    pub async fn heal(&self) {
        *self.writes_left.lock().await = None;
    }

    /// Snapshot of all contents (including bookkeeping files)
    pub async fn contents(&self) -> BTreeMap<String, Vec<u8>> {
        self.files.lock().await.clone()
    }
}

#[async_trait]
impl Workspace for MemoryWorkspace {
    async fn manifest(&self) -> CoreResult<WorkspaceManifest> {
        let files = self.files.lock().await;
        let mut manifest = WorkspaceManifest::default();
        for (path, data) in files.iter() {
            manifest.insert(path.clone(), FileEntry::for_content(data));
        }
        Ok(manifest)
    }

    async fn read(&self, path: &str) -> CoreResult<Vec<u8>> {
        validate_path(path)?;
        self.files
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| PhoenixError::workspace(format!("no such file: {}", path)))
    }

    async fn write(&self, path: &str, data: &[u8]) -> CoreResult<()> {
        validate_path(path)?;
        {
            let mut left = self.writes_left.lock().await;
            if let Some(n) = left.as_mut() {
                if *n == 0 {
                    return Err(PhoenixError::workspace("injected write failure"));
                }
                *n -= 1;
            }
        }
        self.files.lock().await.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn remove(&self, path: &str) -> CoreResult<()> {
        validate_path(path)?;
        self.files.lock().await.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> CoreResult<()> {
        validate_path(from)?;
        validate_path(to)?;
        let mut files = self.files.lock().await;
        let data = files
            .remove(from)
            .ok_or_else(|| PhoenixError::workspace(format!("no such file: {}", from)))?;
        files.insert(to.to_string(), data);
        Ok(())
    }
}

/// Directory-backed workspace
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> CoreResult<PathBuf> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.root.clone(), |acc, c| acc.join(c)))
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn manifest(&self) -> CoreResult<WorkspaceManifest> {
        let mut manifest = WorkspaceManifest::default();
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(manifest);
        }

        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                // In-flight temp files from `write`
                if name.ends_with(".phoenix-tmp") {
                    continue;
                }
                let rel = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                };
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((entry.path(), rel));
                } else if file_type.is_file() {
                    let data = tokio::fs::read(entry.path()).await?;
                    manifest.insert(rel, FileEntry::for_content(&data));
                }
            }
        }
        Ok(manifest)
    }

    async fn read(&self, path: &str) -> CoreResult<Vec<u8>> {
        let full = self.full_path(path)?;
        Ok(tokio::fs::read(full).await?)
    }

    async fn write(&self, path: &str, data: &[u8]) -> CoreResult<()> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Readers never observe a half-written file
        let mut tmp = full.clone().into_os_string();
        tmp.push(".phoenix-tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &full).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> CoreResult<()> {
        let full = self.full_path(path)?;
        match tokio::fs::remove_file(full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> CoreResult<()> {
        let from = self.full_path(from)?;
        let to = self.full_path(to)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, to).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("phoenix-ws-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("models/llama/config.json").is_ok());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("a/../b").is_err());
        assert!(validate_path("a//b").is_err());
        assert!(validate_path("").is_err());
    }

    #[tokio::test]
    async fn test_local_workspace_nested_files() {
        let root = temp_root();
        let ws = LocalWorkspace::new(&root);

        ws.write("data/train.csv", b"a,b\n1,2\n").await.unwrap();
        ws.write("notes.md", b"# hi").await.unwrap();

        let manifest = ws.manifest().await.unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.files["data/train.csv"].size, 8);
        assert_eq!(ws.read("notes.md").await.unwrap(), b"# hi");

        ws.remove("notes.md").await.unwrap();
        ws.remove("notes.md").await.unwrap();
        assert_eq!(ws.manifest().await.unwrap().len(), 1);

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let ws = LocalWorkspace::new(temp_root());
        assert!(ws.manifest().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_workspace_writes_marker_last() {
        let source = MemoryWorkspace::new();
        source.write("a.txt", b"alpha").await.unwrap();
        source.write("dir/b.bin", &[0u8, 1, 2, 3]).await.unwrap();

        let target = MemoryWorkspace::new();
        let bytes = copy_workspace(&source, &target, &InstanceId::new("gpu-1"), "cpu-1")
            .await
            .unwrap();
        assert_eq!(bytes, 9);

        let marker = read_restore_marker(&target).await.unwrap();
        assert_eq!(marker.source, "live:cpu-1");
        assert_eq!(marker.file_count, 2);

        let restored = user_manifest(&target).await.unwrap();
        assert_eq!(restored, user_manifest(&source).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_back_and_leaves_no_marker() {
        let source = MemoryWorkspace::new();
        for i in 0..5 {
            source.write(&format!("f{}.txt", i), b"data").await.unwrap();
        }
        let target = MemoryWorkspace::new();
        target.fail_writes_after(3).await;

        let err = copy_workspace(&source, &target, &InstanceId::new("gpu-1"), "cpu-1")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::SnapshotRestoreFailure(_)));

        assert!(read_restore_marker(&target).await.is_none());
        assert!(target.contents().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_apply_keeps_existing_files() {
        let source = MemoryWorkspace::new();
        for name in ["a.txt", "b.txt", "c.txt"] {
            source.write(name, b"new").await.unwrap();
        }
        let target = MemoryWorkspace::new();
        target.write("a.txt", b"old").await.unwrap();
        target.write("keep.txt", b"mine").await.unwrap();
        target.fail_writes_after(1).await;

        assert!(copy_workspace(&source, &target, &InstanceId::new("gpu-1"), "cpu-1")
            .await
            .is_err());

        let contents = target.contents().await;
        assert_eq!(contents.len(), 2);
        assert_eq!(contents["a.txt"], b"old");
        assert_eq!(contents["keep.txt"], b"mine");
    }

    #[tokio::test]
    async fn test_local_apply_replaces_files_and_clears_staging() {
        let root = temp_root();
        let target = LocalWorkspace::new(&root);
        target.write("models/w.bin", b"stale").await.unwrap();

        let mut files = BTreeMap::new();
        files.insert("models/w.bin".to_string(), b"fresh".to_vec());
        files.insert("notes.md".to_string(), b"# notes".to_vec());
        let marker = RestoreMarker {
            source: "snap-1".into(),
            source_instance: InstanceId::new("gpu-1"),
            file_count: 2,
            bytes: 12,
            restored_at: Utc::now(),
        };
        assert_eq!(apply_staged(&target, &files, &marker).await.unwrap(), 12);

        assert_eq!(target.read("models/w.bin").await.unwrap(), b"fresh");
        let manifest = target.manifest().await.unwrap();
        assert!(!manifest.files.keys().any(|p| p.starts_with(STAGING_DIR)));
        assert_eq!(read_restore_marker(&target).await.unwrap().source, "snap-1");

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
