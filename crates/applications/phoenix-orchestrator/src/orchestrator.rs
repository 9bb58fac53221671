//! Wiring of the failover engine
//!
//! [`Orchestrator`] owns one instance of every component and shares the
//! registries between them. Embedders protect instances through it and
//! reach the components through its public fields.

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::failover::{FailoverContext, FailoverCoordinator, FailoverHandle};
use crate::history::HistoryStore;
use crate::instance::InstanceRegistry;
use crate::monitor::HealthMonitor;
use crate::snapshot::SnapshotManager;
use crate::standby::StandbyRegistry;
use crate::strategy::{StrategySelector, StrategyStore};
use crate::supervisor::FailoverSupervisor;
use crate::sync::SyncEngine;
use phoenix_core::{
    BlobStore, ComputeProvider, FailoverStrategyConfig, InstanceId, ProtectedInstance, TriggerReason,
};
use std::sync::{Arc, OnceLock};
use tracing::info;

pub struct Orchestrator {
    pub compute: Arc<dyn ComputeProvider>,
    pub config: OrchestratorConfig,
    pub instances: InstanceRegistry,
    pub standbys: StandbyRegistry,
    pub strategies: Arc<StrategySelector>,
    pub sync: Arc<SyncEngine>,
    pub snapshots: Arc<SnapshotManager>,
    pub history: HistoryStore,
    pub events: EventBus,
    pub coordinator: Arc<FailoverCoordinator>,
    store: StrategyStore,
    supervisor: OnceLock<Arc<FailoverSupervisor>>,
}

impl Orchestrator {
    /// Engine with in-memory history
    pub fn new(compute: Arc<dyn ComputeProvider>, blobs: Arc<dyn BlobStore>, config: OrchestratorConfig) -> Self {
        Self::with_history(compute, blobs, config, HistoryStore::in_memory())
    }

    /// Engine recording failovers into `history` (e.g. a journal opened
    /// with [`HistoryStore::open`])
    pub fn with_history(
        compute: Arc<dyn ComputeProvider>,
        blobs: Arc<dyn BlobStore>,
        config: OrchestratorConfig,
        history: HistoryStore,
    ) -> Self {
        let instances = InstanceRegistry::new();
        let standbys = StandbyRegistry::new();
        let store = StrategyStore::new();
        let events = EventBus::new();

        let sync = Arc::new(SyncEngine::new(
            Arc::clone(&compute),
            standbys.clone(),
            instances.clone(),
            events.clone(),
            config.sync.clone(),
        ));
        let snapshots = Arc::new(SnapshotManager::new(
            blobs,
            Arc::clone(&compute),
            config.snapshot.clone(),
        ));
        let strategies = Arc::new(StrategySelector::new(
            Arc::clone(&compute),
            instances.clone(),
            standbys.clone(),
            store.clone(),
            Arc::clone(&sync),
            Arc::clone(&snapshots),
            events.clone(),
        ));

        let ctx = FailoverContext {
            compute: Arc::clone(&compute),
            instances: instances.clone(),
            standbys: standbys.clone(),
            strategies: store.clone(),
            sync: Arc::clone(&sync),
            snapshots: Arc::clone(&snapshots),
            history: history.clone(),
            events: events.clone(),
        };
        let coordinator = Arc::new(FailoverCoordinator::new(ctx, config.clone()));

        Self {
            compute,
            config,
            instances,
            standbys,
            strategies,
            sync,
            snapshots,
            history,
            events,
            coordinator,
            store,
            supervisor: OnceLock::new(),
        }
    }

    /// Components a failover works through, for building further coordinators
    pub fn failover_context(&self) -> FailoverContext {
        FailoverContext {
            compute: Arc::clone(&self.compute),
            instances: self.instances.clone(),
            standbys: self.standbys.clone(),
            strategies: self.store.clone(),
            sync: Arc::clone(&self.sync),
            snapshots: Arc::clone(&self.snapshots),
            history: self.history.clone(),
            events: self.events.clone(),
        }
    }

    /// Enrol `instance` and apply its protection strategy
    pub async fn protect(
        &self,
        instance: ProtectedInstance,
        strategy: FailoverStrategyConfig,
    ) -> Result<FailoverStrategyConfig> {
        info!(instance_id = %instance.id, gpu_class = %instance.gpu_class, strategy = %strategy.strategy, "Protecting instance");
        self.instances.register(instance).await;
        self.strategies.apply(strategy).await
    }

    /// Start a failover by hand
    pub async fn trigger(&self, instance_id: &InstanceId, reason: TriggerReason) -> Result<FailoverHandle> {
        self.coordinator.trigger(instance_id, reason).await
    }

    /// Health monitor probing at the configured interval
    pub fn monitor(&self) -> HealthMonitor {
        HealthMonitor::with_interval(Arc::clone(&self.compute), self.instances.clone(), self.config.probe_interval())
    }

    /// Supervisor driving automatic failover and recovery
    pub fn supervisor(&self) -> Arc<FailoverSupervisor> {
        Arc::clone(self.supervisor.get_or_init(|| {
            Arc::new(FailoverSupervisor::new(
                Arc::clone(&self.coordinator),
                self.store.clone(),
                self.standbys.clone(),
                self.config.recovery.clone(),
            ))
        }))
    }

    /// Stop background loops (sync, periodic snapshots, pending retries)
    pub async fn shutdown(&self) {
        if let Some(supervisor) = self.supervisor.get() {
            supervisor.shutdown().await;
        }
        self.sync.shutdown().await;
        self.snapshots.shutdown().await;
        info!("Orchestrator stopped");
    }
}
