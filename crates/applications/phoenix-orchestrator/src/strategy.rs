//! Protection strategies: validation, cost model and switching
//!
//! ## Cost model
//!
//! Estimates are a function of the protected GPU's own hourly price:
//!
//! ```text
//! disabled         0
//! cpu_standby      standby CPU hourly rate              (fixed class)
//! warm_pool        gpu_price × warm_pool_factor         (same price class)
//! regional_volume  disk_gb × volume_gb_month / 730
//! snapshot         disk_gb × storage_gb_month / 730
//! ```
//!
//! ## Switching
//!
//! A switch is a release-then-acquire transaction: resources of the old
//! strategy (standby host, sync loop, periodic snapshots) are torn down
//! before anything is provisioned for the new one, and the new
//! configuration is stored only after that.
//!
//! Switches and failovers share a per-instance lock in [`StrategyStore`]:
//! a failover registers itself under that lock, and a switch holds it from
//! its check to its last step, so a switch never overlaps a running
//! failover of the same instance.

use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, StatusEvent};
use crate::instance::InstanceRegistry;
use crate::snapshot::SnapshotManager;
use crate::standby::{Controller, StandbyRegistry};
use crate::sync::SyncEngine;
use chrono::Utc;
use phoenix_core::{
    Backend, CapacityConstraints, ComputeProvider, FailoverStrategyConfig, HostHealth,
    InstanceId, ProtectedInstance, StrategyKind, StrategyParams,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounds on the workspace disk size (GB)
pub const MIN_DISK_GB: u32 = 10;
pub const MAX_DISK_GB: u32 = 16_384;

/// Bounds on the sync interval (seconds)
pub const MAX_SYNC_INTERVAL_SECS: u64 = 3600;

const HOURS_PER_MONTH: f64 = 730.0;

/// Region names: lowercase `[a-z0-9-]`, at least one dash, no empty segment
pub fn is_valid_region(region: &str) -> bool {
    !region.is_empty()
        && region.contains('-')
        && region
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && region.split('-').all(|segment| !segment.is_empty())
}

/// Zone names: `<region>-<n>` (e.g. `fr-par-2`) or `<region><letter>` (e.g. `us-east-1a`)
pub fn is_valid_zone(zone: &str) -> bool {
    region_of_zone(zone).is_some()
}

/// Region a zone belongs to
pub fn region_of_zone(zone: &str) -> Option<String> {
    let last = zone.chars().last()?;
    if last.is_ascii_lowercase() {
        let region = &zone[..zone.len() - 1];
        let ends_with_digit = region.chars().last().is_some_and(|c| c.is_ascii_digit());
        return (ends_with_digit && is_valid_region(region)).then(|| region.to_string());
    }

    let (region, index) = zone.rsplit_once('-')?;
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    is_valid_region(region).then(|| region.to_string())
}

/// Check a strategy configuration before it is accepted
pub fn validate_config(config: &FailoverStrategyConfig) -> Result<()> {
    let p = &config.params;

    if !(MIN_DISK_GB..=MAX_DISK_GB).contains(&p.disk_size_gb) {
        return Err(OrchestratorError::config(format!(
            "disk_size_gb must be within {}..={} (got {})",
            MIN_DISK_GB, MAX_DISK_GB, p.disk_size_gb
        )));
    }
    if !(1..=MAX_SYNC_INTERVAL_SECS).contains(&p.sync_interval_secs) {
        return Err(OrchestratorError::config(format!(
            "sync_interval_secs must be within 1..={} (got {})",
            MAX_SYNC_INTERVAL_SECS, p.sync_interval_secs
        )));
    }
    if p.snapshot_interval_secs == 0 {
        return Err(OrchestratorError::config("snapshot_interval_secs must be positive"));
    }
    if let Some(zone) = &p.target_zone {
        if !is_valid_zone(zone) {
            return Err(OrchestratorError::config(format!("invalid zone name: {}", zone)));
        }
    }
    if let Some(class) = &p.machine_class {
        if class.trim().is_empty() {
            return Err(OrchestratorError::config("machine_class must not be empty"));
        }
    }

    match config.strategy {
        StrategyKind::RegionalVolume if p.target_zone.is_none() => Err(OrchestratorError::config(
            "regional_volume requires a target_zone for the volume",
        )),
        StrategyKind::CpuStandby | StrategyKind::WarmPool | StrategyKind::Snapshot
            if p.allow_cross_region =>
        {
            Err(OrchestratorError::config(
                "allow_cross_region only applies to regional_volume",
            ))
        }
        _ => Ok(()),
    }
}

/// Rates used to price strategies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Always-on standby CPU host, USD/hour
    pub cpu_standby_hourly: f64,
    /// Reserved GPU price relative to the spot price it protects
    pub warm_pool_factor: f64,
    /// Region-local block volume, USD per GB-month
    pub volume_gb_month: f64,
    /// Object storage for snapshots, USD per GB-month
    pub storage_gb_month: f64,
    /// Snapshot restore throughput, MB/s
    pub restore_mb_per_sec: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            cpu_standby_hourly: 0.08,
            warm_pool_factor: 1.0,
            volume_gb_month: 0.10,
            storage_gb_month: 0.023,
            restore_mb_per_sec: 200.0,
        }
    }
}

/// Relative cost class shown next to an estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    None,
    Lowest,
    Low,
    Moderate,
    Highest,
}

/// Incremental cost and expected recovery time of one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEstimate {
    pub strategy: StrategyKind,
    pub extra_resource: String,
    /// Added on top of the GPU's own price, USD/hour
    pub extra_hourly_cost: f64,
    pub tier: CostTier,
    /// Time until the workload is served again (CPU standby or new GPU)
    pub expected_continuity_secs: Option<u64>,
    /// Time until the workload runs on a GPU again
    pub expected_recovery_secs: Option<u64>,
}

impl CostModel {
    pub fn estimate(&self, strategy: StrategyKind, gpu_hourly_price: f64, params: &StrategyParams) -> StrategyEstimate {
        let disk_gb = params.disk_size_gb as f64;
        let restore_secs = (disk_gb * 1024.0 / self.restore_mb_per_sec).ceil() as u64;

        let (extra_resource, extra_hourly_cost, tier, continuity, recovery) = match strategy {
            StrategyKind::Disabled => ("none", 0.0, CostTier::None, None, None),
            StrategyKind::CpuStandby => (
                "always-on CPU host, continuously synced",
                self.cpu_standby_hourly,
                CostTier::Low,
                Some(10),
                Some(300),
            ),
            StrategyKind::WarmPool => (
                "reserved GPU",
                gpu_hourly_price * self.warm_pool_factor,
                CostTier::Highest,
                Some(30),
                Some(60),
            ),
            StrategyKind::RegionalVolume => (
                "region-local volume",
                disk_gb * self.volume_gb_month / HOURS_PER_MONTH,
                CostTier::Moderate,
                None,
                Some(240 + restore_secs / 2),
            ),
            StrategyKind::Snapshot => (
                "periodic backups in durable storage",
                disk_gb * self.storage_gb_month / HOURS_PER_MONTH,
                CostTier::Lowest,
                None,
                Some(300 + restore_secs),
            ),
        };

        StrategyEstimate {
            strategy,
            extra_resource: extra_resource.to_string(),
            extra_hourly_cost,
            tier,
            expected_continuity_secs: continuity.or(recovery),
            expected_recovery_secs: recovery,
        }
    }

    /// Estimates for every strategy
    pub fn compare(&self, gpu_hourly_price: f64, params: &StrategyParams) -> Vec<StrategyEstimate> {
        StrategyKind::ALL
            .iter()
            .map(|s| self.estimate(*s, gpu_hourly_price, params))
            .collect()
    }
}

/// Per-instance strategy records with atomic replace-on-write
#[derive(Debug, Clone, Default)]
pub struct StrategyStore {
    configs: Arc<RwLock<HashMap<InstanceId, FailoverStrategyConfig>>>,
    /// Serializes strategy switches and failover starts per instance
    locks: Arc<Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>>,
    /// Instances with a failover running, and its event
    failovers: Arc<RwLock<HashMap<InstanceId, Vec<Uuid>>>>,
}

impl StrategyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active configuration; instances without a record are `disabled`
    pub async fn get(&self, instance_id: &InstanceId) -> FailoverStrategyConfig {
        self.configs
            .read()
            .await
            .get(instance_id)
            .cloned()
            .unwrap_or_else(|| FailoverStrategyConfig::new(instance_id.clone(), StrategyKind::Disabled))
    }

    /// Replace the record, returning the previous one
    pub async fn replace(&self, config: FailoverStrategyConfig) -> Option<FailoverStrategyConfig> {
        self.configs
            .write()
            .await
            .insert(config.instance_id.clone(), config)
    }

    pub async fn remove(&self, instance_id: &InstanceId) -> Option<FailoverStrategyConfig> {
        self.locks.lock().await.remove(instance_id);
        self.configs.write().await.remove(instance_id)
    }

    /// Move the record of a retired instance to its replacement
    pub async fn rekey(&self, old: &InstanceId, new: &InstanceId) {
        {
            let mut configs = self.configs.write().await;
            if let Some(mut config) = configs.remove(old) {
                config.instance_id = new.clone();
                config.updated_at = Utc::now();
                configs.insert(new.clone(), config);
            }
        }
        self.locks.lock().await.remove(old);
        self.failovers.write().await.remove(old);
    }

    /// Lock serializing changes to one instance's protection
    pub async fn instance_lock(&self, instance_id: &InstanceId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(instance_id.clone()).or_default())
    }

    /// Register a running failover, waiting for a switch in progress
    pub async fn begin_failover(&self, instance_id: &InstanceId, event_id: Uuid) {
        let lock = self.instance_lock(instance_id).await;
        let _guard = lock.lock().await;
        self.failovers
            .write()
            .await
            .entry(instance_id.clone())
            .or_default()
            .push(event_id);
        debug!(instance_id = %instance_id, event_id = %event_id, "Strategy changes blocked by failover");
    }

    /// Unregister `event_id`; other runs of the same instance stay registered
    pub async fn end_failover(&self, instance_id: &InstanceId, event_id: Uuid) {
        let mut failovers = self.failovers.write().await;
        if let Some(running) = failovers.get_mut(instance_id) {
            running.retain(|id| *id != event_id);
            if running.is_empty() {
                failovers.remove(instance_id);
            }
        }
    }

    /// Latest failover currently running for the instance
    pub async fn failover_of(&self, instance_id: &InstanceId) -> Option<Uuid> {
        self.failovers
            .read()
            .await
            .get(instance_id)
            .and_then(|running| running.last().copied())
    }

    pub async fn list(&self) -> Vec<FailoverStrategyConfig> {
        let mut all: Vec<_> = self.configs.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        all
    }
}

/// Applies strategy changes to running instances
pub struct StrategySelector {
    compute: Arc<dyn ComputeProvider>,
    instances: InstanceRegistry,
    standbys: StandbyRegistry,
    store: StrategyStore,
    sync: Arc<SyncEngine>,
    snapshots: Arc<SnapshotManager>,
    events: EventBus,
    cost_model: CostModel,
}

impl StrategySelector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        instances: InstanceRegistry,
        standbys: StandbyRegistry,
        store: StrategyStore,
        sync: Arc<SyncEngine>,
        snapshots: Arc<SnapshotManager>,
        events: EventBus,
    ) -> Self {
        Self {
            compute,
            instances,
            standbys,
            store,
            sync,
            snapshots,
            events,
            cost_model: CostModel::default(),
        }
    }

    pub fn with_cost_model(mut self, cost_model: CostModel) -> Self {
        self.cost_model = cost_model;
        self
    }

    pub fn store(&self) -> &StrategyStore {
        &self.store
    }

    pub async fn current(&self, instance_id: &InstanceId) -> FailoverStrategyConfig {
        self.store.get(instance_id).await
    }

    /// Estimate for the instance's active strategy
    pub async fn estimate(&self, instance_id: &InstanceId) -> Result<StrategyEstimate> {
        let instance = self.instances.get(instance_id).await?;
        let config = self.store.get(instance_id).await;
        Ok(self
            .cost_model
            .estimate(config.strategy, instance.hourly_price, &config.params))
    }

    /// Validate `config` and make it the instance's active strategy.
    ///
    /// If acquiring the new resources fails the instance is left `disabled`
    /// (the old resources are already gone) and the error is returned.
    /// Refused while a failover of the instance is running.
    pub async fn apply(&self, config: FailoverStrategyConfig) -> Result<FailoverStrategyConfig> {
        validate_config(&config)?;
        let instance = self.instances.get(&config.instance_id).await?;

        let lock = self.store.instance_lock(&instance.id).await;
        let _guard = lock.lock().await;

        if let Some(event) = self.store.failover_of(&instance.id).await {
            return Err(OrchestratorError::config(format!(
                "cannot change strategy of {} while failover {} is running",
                instance.id, event
            )));
        }
        if let Some(Controller::Failover(event)) = self.standbys.controller(&instance.id).await {
            return Err(OrchestratorError::config(format!(
                "cannot change strategy of {} while failover {} holds its standby",
                instance.id, event
            )));
        }

        let previous = self.store.get(&instance.id).await;
        info!(
            instance_id = %instance.id,
            from = %previous.strategy,
            to = %config.strategy,
            "Switching protection strategy"
        );

        self.release(&instance.id).await?;

        let mut config = config;
        config.updated_at = Utc::now();
        if let Err(e) = self.acquire(&instance, &config).await {
            warn!(instance_id = %instance.id, strategy = %config.strategy, error = %e, "Strategy resources unavailable, protection disabled");
            self.release(&instance.id).await?;
            let disabled = FailoverStrategyConfig::new(instance.id.clone(), StrategyKind::Disabled);
            self.store.replace(disabled).await;
            self.publish_change(&instance.id, previous.strategy, StrategyKind::Disabled);
            return Err(e);
        }

        self.store.replace(config.clone()).await;
        self.publish_change(&instance.id, previous.strategy, config.strategy);
        Ok(config)
    }

    pub async fn disable(&self, instance_id: &InstanceId) -> Result<FailoverStrategyConfig> {
        self.apply(FailoverStrategyConfig::new(instance_id.clone(), StrategyKind::Disabled))
            .await
    }

    /// Tear down protection, then forget the instance
    pub async fn remove_instance(&self, instance_id: &InstanceId) -> Result<ProtectedInstance> {
        self.disable(instance_id).await?;
        self.store.remove(instance_id).await;
        self.instances.remove(instance_id).await
    }

    fn publish_change(&self, instance_id: &InstanceId, from: StrategyKind, to: StrategyKind) {
        self.events.publish(StatusEvent::StrategyChanged {
            instance_id: instance_id.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }

    /// Stop background work and destroy the standby host, if any
    async fn release(&self, instance_id: &InstanceId) -> Result<()> {
        self.sync.stop(instance_id).await;
        self.snapshots.stop_periodic(instance_id).await;

        if let Some(association) = self.standbys.get(instance_id).await {
            match self.compute.destroy(&association.standby).await {
                Ok(()) => {}
                Err(phoenix_core::PhoenixError::InstanceNotFound(_)) => {
                    warn!(standby = %association.standby.id, "Standby host already gone");
                }
                Err(e) => return Err(e.into()),
            }
            self.standbys.remove(instance_id).await;
            info!(instance_id = %instance_id, standby = %association.standby.id, "Standby destroyed");
        }
        Ok(())
    }

    async fn acquire(&self, instance: &ProtectedInstance, config: &FailoverStrategyConfig) -> Result<()> {
        let params = &config.params;
        match config.strategy {
            StrategyKind::Disabled => Ok(()),
            StrategyKind::CpuStandby | StrategyKind::WarmPool => {
                let backend = config
                    .strategy
                    .standby_backend()
                    .ok_or_else(|| OrchestratorError::Internal("strategy without standby backend".into()))?;
                let region = params
                    .target_zone
                    .as_deref()
                    .and_then(region_of_zone)
                    .unwrap_or_else(|| instance.region.clone());
                let constraints = CapacityConstraints {
                    backend,
                    gpu_class: (backend == Backend::ReservedGpu).then(|| instance.gpu_class.clone()),
                    machine_class: params.machine_class.clone(),
                    max_hourly_price: None,
                    regions: vec![region],
                };

                let candidate = self
                    .compute
                    .search(&constraints)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        OrchestratorError::NoCapacityAvailable(format!(
                            "no {} standby capacity in {:?}",
                            backend, constraints.regions
                        ))
                    })?;
                let standby = self.compute.provision(&candidate).await?;
                self.standbys
                    .create(&instance.id, standby.clone(), candidate.hourly_price)
                    .await?;
                info!(
                    instance_id = %instance.id,
                    standby = %standby.id,
                    backend = %backend,
                    hourly_price = candidate.hourly_price,
                    "Standby provisioned"
                );

                self.sync
                    .start(&instance.id, Duration::from_secs(params.sync_interval_secs))
                    .await;
                Ok(())
            }
            StrategyKind::RegionalVolume | StrategyKind::Snapshot => {
                // The primary must be reachable for the first snapshot
                if self.compute.health(&instance.handle()).await? != HostHealth::Online {
                    return Err(OrchestratorError::snapshot_create(format!(
                        "{} is unreachable",
                        instance.id
                    )));
                }
                self.snapshots
                    .start_periodic(
                        self.instances.clone(),
                        &instance.id,
                        Duration::from_secs(params.snapshot_interval_secs),
                    )
                    .await;
                Ok(())
            }
        }
    }
}
