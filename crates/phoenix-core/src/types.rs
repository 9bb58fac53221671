//! Core types shared across Phoenix components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for an instance (protected GPU or standby host)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a protected instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Provisioning,
    Online,
    Degraded,
    FailingOver,
    Offline,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Online => "online",
            InstanceStatus::Degraded => "degraded",
            InstanceStatus::FailingOver => "failing_over",
            InstanceStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Backend class an instance runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Spot GPU market (cheap, preemptible)
    SpotGpu,
    /// Reserved GPU capacity (warm pool)
    ReservedGpu,
    /// Reliable CPU host (standby)
    ReliableCpu,
}

impl Backend {
    pub fn is_gpu(&self) -> bool {
        matches!(self, Backend::SpotGpu | Backend::ReservedGpu)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::SpotGpu => write!(f, "spot-gpu"),
            Backend::ReservedGpu => write!(f, "reserved-gpu"),
            Backend::ReliableCpu => write!(f, "reliable-cpu"),
        }
    }
}

/// Provider-side reference to a running (or requested) instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: InstanceId,
    pub backend: Backend,
    pub region: String,
    pub address: Option<String>,
}

/// Reachability reported by a compute provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostHealth {
    Online,
    Unreachable,
}

/// A GPU compute resource enrolled in failover protection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedInstance {
    pub id: InstanceId,
    pub status: InstanceStatus,
    /// GPU class, e.g. "RTX_4090"
    pub gpu_class: String,
    /// Hourly price in USD at enrolment. Replacements keep it, so the
    /// replacement price ceiling does not drift across failovers.
    pub hourly_price: f64,
    pub region: String,
    pub owner: String,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProtectedInstance {
    pub fn new(
        id: impl Into<String>,
        gpu_class: impl Into<String>,
        hourly_price: f64,
        region: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            id: InstanceId::new(id),
            status: InstanceStatus::Online,
            gpu_class: gpu_class.into(),
            hourly_price,
            region: region.into(),
            owner: owner.into(),
            address: None,
            created_at: Utc::now(),
        }
    }

    /// Provider handle for this instance (always a spot GPU)
    pub fn handle(&self) -> InstanceHandle {
        InstanceHandle {
            id: self.id.clone(),
            backend: Backend::SpotGpu,
            region: self.region.clone(),
            address: self.address.clone(),
        }
    }
}

/// Synchronization state of a standby association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Provisioning,
    Syncing,
    Ready,
    FailoverActive,
    /// Sync failures exceeded the threshold; operator attention needed
    Degraded,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Provisioning => "provisioning",
            SyncState::Syncing => "syncing",
            SyncState::Ready => "ready",
            SyncState::FailoverActive => "failover_active",
            SyncState::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Binds a protected instance to its standby host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandbyAssociation {
    pub id: String,
    pub instance_id: InstanceId,
    pub standby: InstanceHandle,
    pub sync_state: SyncState,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_count: u64,
    /// Standby hourly price in USD
    pub hourly_price: f64,
    pub consecutive_failures: u32,
}

/// Protection strategy variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Disabled,
    CpuStandby,
    WarmPool,
    RegionalVolume,
    Snapshot,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::Disabled,
        StrategyKind::CpuStandby,
        StrategyKind::WarmPool,
        StrategyKind::RegionalVolume,
        StrategyKind::Snapshot,
    ];

    /// Whether the strategy keeps a standby host associated
    pub fn holds_standby(&self) -> bool {
        matches!(self, StrategyKind::CpuStandby | StrategyKind::WarmPool)
    }

    /// Backend of the standby host this strategy keeps, if any
    pub fn standby_backend(&self) -> Option<Backend> {
        match self {
            StrategyKind::CpuStandby => Some(Backend::ReliableCpu),
            StrategyKind::WarmPool => Some(Backend::ReservedGpu),
            _ => None,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyKind::Disabled => "disabled",
            StrategyKind::CpuStandby => "cpu_standby",
            StrategyKind::WarmPool => "warm_pool",
            StrategyKind::RegionalVolume => "regional_volume",
            StrategyKind::Snapshot => "snapshot",
        };
        f.write_str(s)
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(StrategyKind::Disabled),
            "cpu_standby" => Ok(StrategyKind::CpuStandby),
            "warm_pool" => Ok(StrategyKind::WarmPool),
            "regional_volume" => Ok(StrategyKind::RegionalVolume),
            "snapshot" => Ok(StrategyKind::Snapshot),
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

/// Strategy-specific parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Target zone for standby hosts / volumes, e.g. "fr-par-2"
    #[serde(default)]
    pub target_zone: Option<String>,

    /// Machine class for the standby host, e.g. "cpu-4x16"
    #[serde(default)]
    pub machine_class: Option<String>,

    /// Disk size in GB
    #[serde(default = "default_disk_size_gb")]
    pub disk_size_gb: u32,

    /// Seconds between synchronization cycles
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Seconds between periodic snapshots (`snapshot` / `regional_volume`)
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    /// Use spot capacity (true) or reserved capacity (false) for the replacement
    #[serde(default = "default_true")]
    pub use_spot: bool,

    /// Trigger failover automatically on detected loss
    #[serde(default = "default_true")]
    pub auto_failover: bool,

    /// Retry recovery automatically after a transient failure
    #[serde(default = "default_true")]
    pub auto_recovery: bool,

    /// Allow the replacement GPU outside the volume's region
    #[serde(default)]
    pub allow_cross_region: bool,
}

fn default_disk_size_gb() -> u32 {
    100
}

fn default_sync_interval_secs() -> u64 {
    1
}

fn default_snapshot_interval_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            target_zone: None,
            machine_class: None,
            disk_size_gb: default_disk_size_gb(),
            sync_interval_secs: default_sync_interval_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            use_spot: true,
            auto_failover: true,
            auto_recovery: true,
            allow_cross_region: false,
        }
    }
}

/// Per-instance choice of protection mechanism
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverStrategyConfig {
    pub instance_id: InstanceId,
    pub strategy: StrategyKind,
    #[serde(default)]
    pub params: StrategyParams,
    pub updated_at: DateTime<Utc>,
}

impl FailoverStrategyConfig {
    pub fn new(instance_id: InstanceId, strategy: StrategyKind) -> Self {
        Self {
            instance_id,
            strategy,
            params: StrategyParams::default(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_params(mut self, params: StrategyParams) -> Self {
        self.params = params;
        self
    }
}

/// Content address of a blob (hex SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRef(pub String);

impl ContentRef {
    /// Compute the content address of `data`
    pub fn of(data: &[u8]) -> Self {
        Self(content_digest(data))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hex SHA-256 digest of `data`
pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Commit state of a blob in durable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobStatus {
    Pending,
    Committed,
    Failed,
}

/// Snapshot creation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    Success,
    Failed,
}

/// Immutable, point-in-time backup of an instance's workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub source_instance: InstanceId,
    pub status: SnapshotStatus,
    pub size_bytes: u64,
    pub file_count: usize,
    /// Manifest blob; never changes once status is `success`
    pub content_ref: Option<ContentRef>,
    pub created_at: DateTime<Utc>,
}

/// One file in a workspace manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    pub digest: String,
}

impl FileEntry {
    pub fn for_content(data: &[u8]) -> Self {
        Self {
            size: data.len() as u64,
            digest: content_digest(data),
        }
    }
}

/// Files of a workspace keyed by relative path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    pub files: BTreeMap<String, FileEntry>,
}

/// Difference between two manifests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDelta {
    /// Paths that are new or whose content changed
    pub changed: Vec<String>,
    /// Paths that no longer exist
    pub removed: Vec<String>,
}

impl ManifestDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

impl WorkspaceManifest {
    pub fn insert(&mut self, path: impl Into<String>, entry: FileEntry) {
        self.files.insert(path.into(), entry);
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|e| e.size).sum()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// What must be applied to a copy described by `previous` to match `self`
    pub fn delta_from(&self, previous: &WorkspaceManifest) -> ManifestDelta {
        let changed = self
            .files
            .iter()
            .filter(|(path, entry)| previous.files.get(*path) != Some(*entry))
            .map(|(path, _)| path.clone())
            .collect();
        let removed = previous
            .files
            .keys()
            .filter(|path| !self.files.contains_key(*path))
            .cloned()
            .collect();
        ManifestDelta { changed, removed }
    }
}

/// Requirements for new capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConstraints {
    pub backend: Backend,
    /// Required GPU class (GPU backends only)
    pub gpu_class: Option<String>,
    /// Machine class (CPU backends only)
    pub machine_class: Option<String>,
    /// Upper bound on hourly price in USD
    pub max_hourly_price: Option<f64>,
    /// Acceptable regions in order of preference
    pub regions: Vec<String>,
}

/// Capacity offered by a provider in answer to a search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub offer_id: String,
    pub backend: Backend,
    pub gpu_class: Option<String>,
    pub region: String,
    pub hourly_price: f64,
}
