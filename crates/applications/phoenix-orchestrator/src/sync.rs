//! Continuous primary → standby synchronization
//!
//! One background task per standby association:
//!
//! ```text
//! every interval:
//!     manifest(primary) ── delta vs last sent ──▶ copy changed / remove deleted ──▶ standby
//!     success → last_sync_at, sync_count += 1, syncing → ready
//!     failure → logged, retried next tick, degraded after N in a row
//! ```
//!
//! Cycles of one association never overlap: the loop awaits each cycle
//! before waiting for the next tick. Cycles are skipped while a failover
//! controls the association.

use crate::config::SyncConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, StatusEvent};
use crate::instance::InstanceRegistry;
use crate::standby::StandbyRegistry;
use crate::workspace::user_manifest;
use chrono::Utc;
use phoenix_core::{ComputeProvider, HostHealth, InstanceId, SyncState, WorkspaceManifest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub files_copied: usize,
    pub files_removed: usize,
    pub bytes_copied: u64,
}

/// Result of a cycle that did not error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Synced(SyncReport),
    /// Association is provisioning, degraded-by-failover or under failover control
    Skipped,
}

struct SyncTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs the per-association synchronization loops
pub struct SyncEngine {
    compute: Arc<dyn ComputeProvider>,
    standbys: StandbyRegistry,
    instances: InstanceRegistry,
    events: EventBus,
    config: SyncConfig,
    tasks: Mutex<HashMap<InstanceId, SyncTask>>,
}

impl SyncEngine {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        standbys: StandbyRegistry,
        instances: InstanceRegistry,
        events: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            compute,
            standbys,
            instances,
            events,
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Default cycle interval from configuration
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    /// Start the loop for `instance_id`; a running loop is left as is
    pub async fn start(self: &Arc<Self>, instance_id: &InstanceId, interval: Duration) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get(instance_id) {
            if !task.handle.is_finished() {
                debug!(instance_id = %instance_id, "Sync loop already running");
                return;
            }
        }

        let (shutdown, rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let id = instance_id.clone();
        let handle = tokio::spawn(async move { engine.run_loop(id, interval, rx).await });

        info!(instance_id = %instance_id, interval_ms = interval.as_millis() as u64, "Sync loop started");
        tasks.insert(instance_id.clone(), SyncTask { shutdown, handle });
    }

    /// Stop the loop for `instance_id` and wait for the in-flight cycle
    pub async fn stop(&self, instance_id: &InstanceId) -> bool {
        let task = self.tasks.lock().await.remove(instance_id);
        match task {
            Some(task) => {
                let _ = task.shutdown.send(true);
                if let Err(e) = task.handle.await {
                    warn!(instance_id = %instance_id, error = %e, "Sync loop ended abnormally");
                }
                info!(instance_id = %instance_id, "Sync loop stopped");
                true
            }
            None => false,
        }
    }

    /// Move the loop from a retired instance id to its replacement
    pub async fn rekey(self: &Arc<Self>, old: &InstanceId, new: &InstanceId, interval: Duration) {
        self.stop(old).await;
        self.start(new, interval).await;
    }

    pub async fn is_running(&self, instance_id: &InstanceId) -> bool {
        self.tasks
            .lock()
            .await
            .get(instance_id)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        let ids: Vec<InstanceId> = self.tasks.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    async fn run_loop(
        self: Arc<Self>,
        instance_id: InstanceId,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut baseline: Option<WorkspaceManifest> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let started = Instant::now();
            match self.run_cycle(&instance_id, &mut baseline).await {
                Ok(CycleOutcome::Synced(report)) => {
                    if report.files_copied + report.files_removed > 0 {
                        debug!(
                            instance_id = %instance_id,
                            copied = report.files_copied,
                            removed = report.files_removed,
                            bytes = report.bytes_copied,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Sync cycle applied delta"
                        );
                    }
                }
                Ok(CycleOutcome::Skipped) => {
                    // Rescan the standby once control comes back
                    baseline = None;
                }
                Err(OrchestratorError::InstanceNotFound(_)) => {
                    debug!(instance_id = %instance_id, "Association or instance gone, sync loop exiting");
                    break;
                }
                Err(e) => {
                    baseline = None;
                    self.handle_failure(&instance_id, &e).await;
                }
            }
        }
    }

    async fn handle_failure(&self, instance_id: &InstanceId, error: &OrchestratorError) {
        // A dead primary is the detector's business, not a transfer failure
        let primary_online = match self.instances.get(instance_id).await {
            Ok(instance) => matches!(
                self.compute.health(&instance.handle()).await,
                Ok(HostHealth::Online)
            ),
            Err(_) => false,
        };
        if !primary_online {
            debug!(instance_id = %instance_id, error = %error, "Sync cycle failed with primary unreachable");
            return;
        }

        warn!(instance_id = %instance_id, error = %error, "Sync cycle failed, retrying next cycle");
        match self
            .standbys
            .record_sync_failure(instance_id, self.config.failure_threshold)
            .await
        {
            Ok(Some(failures)) => {
                self.events.publish(StatusEvent::SyncDegraded {
                    instance_id: instance_id.clone(),
                    consecutive_failures: failures,
                    last_error: error.to_string(),
                    at: Utc::now(),
                });
            }
            Ok(None) => {}
            Err(e) => warn!(instance_id = %instance_id, error = %e, "Could not record sync failure"),
        }
    }

    /// Run one cycle. `baseline` is what the standby is believed to hold;
    /// `None` means "read it from the standby".
    pub async fn run_cycle(
        &self,
        instance_id: &InstanceId,
        baseline: &mut Option<WorkspaceManifest>,
    ) -> Result<CycleOutcome> {
        let association = self
            .standbys
            .get(instance_id)
            .await
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.clone()))?;

        match association.sync_state {
            SyncState::Provisioning => {
                if self.compute.health(&association.standby).await? != HostHealth::Online {
                    return Ok(CycleOutcome::Skipped);
                }
                if !self
                    .standbys
                    .set_state_by_sync(instance_id, SyncState::Syncing)
                    .await?
                {
                    return Ok(CycleOutcome::Skipped);
                }
                info!(instance_id = %instance_id, standby = %association.standby.id, "Standby online, initial sync");
            }
            SyncState::FailoverActive => return Ok(CycleOutcome::Skipped),
            SyncState::Syncing | SyncState::Ready | SyncState::Degraded => {}
        }

        let primary = self.instances.get(instance_id).await?;
        let primary_ws = self.compute.workspace(&primary.handle()).await?;
        let standby_ws = self.compute.workspace(&association.standby).await?;

        let sent = match baseline.take() {
            Some(m) => m,
            None => user_manifest(standby_ws.as_ref())
                .await
                .map_err(|e| OrchestratorError::sync(format!("standby manifest: {}", e)))?,
        };
        let current = user_manifest(primary_ws.as_ref())
            .await
            .map_err(|e| OrchestratorError::sync(format!("primary manifest: {}", e)))?;

        let delta = current.delta_from(&sent);
        let mut report = SyncReport::default();

        for path in &delta.changed {
            let data = primary_ws
                .read(path)
                .await
                .map_err(|e| OrchestratorError::sync(format!("read {}: {}", path, e)))?;
            standby_ws
                .write(path, &data)
                .await
                .map_err(|e| OrchestratorError::sync(format!("write {}: {}", path, e)))?;
            report.files_copied += 1;
            report.bytes_copied += data.len() as u64;
        }
        for path in &delta.removed {
            standby_ws
                .remove(path)
                .await
                .map_err(|e| OrchestratorError::sync(format!("remove {}: {}", path, e)))?;
            report.files_removed += 1;
        }

        *baseline = Some(current);

        if !self.standbys.record_sync_success(instance_id, Utc::now()).await? {
            // Failover took over mid-cycle
            *baseline = None;
            return Ok(CycleOutcome::Skipped);
        }
        Ok(CycleOutcome::Synced(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCloud;
    use phoenix_core::{Backend, ProtectedInstance, Workspace};

    struct Fixture {
        cloud: Arc<SimulatedCloud>,
        engine: Arc<SyncEngine>,
        standbys: StandbyRegistry,
        primary: InstanceId,
    }

    async fn fixture() -> Fixture {
        let cloud = Arc::new(SimulatedCloud::new());
        let primary = cloud.launch_existing("gpu-1", Backend::SpotGpu, "eu-west-1").await;
        let standby = cloud.launch_existing("cpu-1", Backend::ReliableCpu, "eu-west-1").await;

        let instances = InstanceRegistry::new();
        instances
            .register(ProtectedInstance::new("gpu-1", "RTX_4090", 1.5, "eu-west-1", "alice"))
            .await;
        let standbys = StandbyRegistry::new();
        standbys.create(&primary.id, standby, 0.08).await.unwrap();

        let engine = Arc::new(SyncEngine::new(
            cloud.clone(),
            standbys.clone(),
            instances,
            EventBus::new(),
            SyncConfig {
                interval_ms: 20,
                failure_threshold: 2,
            },
        ));
        Fixture {
            cloud,
            engine,
            standbys,
            primary: primary.id,
        }
    }

    #[tokio::test]
    async fn test_cycle_copies_delta_and_marks_ready() {
        let f = fixture().await;
        let primary_ws = f.cloud.memory_workspace(&f.primary).await.unwrap();
        primary_ws.write("a.txt", b"alpha").await.unwrap();
        primary_ws.write("b.txt", b"beta").await.unwrap();

        let mut baseline = None;
        let outcome = f.engine.run_cycle(&f.primary, &mut baseline).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Synced(SyncReport {
                files_copied: 2,
                files_removed: 0,
                bytes_copied: 9,
            })
        );
        let assoc = f.standbys.get(&f.primary).await.unwrap();
        assert_eq!(assoc.sync_state, SyncState::Ready);
        assert_eq!(assoc.sync_count, 1);

        primary_ws.remove("a.txt").await.unwrap();
        primary_ws.write("b.txt", b"BETA!").await.unwrap();
        let outcome = f.engine.run_cycle(&f.primary, &mut baseline).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Synced(SyncReport {
                files_copied: 1,
                files_removed: 1,
                bytes_copied: 5,
            })
        );

        let standby_ws = f.cloud.memory_workspace(&InstanceId::new("cpu-1")).await.unwrap();
        let contents = standby_ws.contents().await;
        assert_eq!(contents.len(), 1);
        assert_eq!(contents["b.txt"], b"BETA!");
        assert_eq!(f.standbys.get(&f.primary).await.unwrap().sync_count, 2);
    }

    #[tokio::test]
    async fn test_cycle_skipped_under_failover_control() {
        let f = fixture().await;
        let mut baseline = None;
        f.engine.run_cycle(&f.primary, &mut baseline).await.unwrap();
        f.standbys
            .acquire_for_failover(&f.primary, uuid::Uuid::new_v4())
            .await
            .unwrap();

        let outcome = f.engine.run_cycle(&f.primary, &mut baseline).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Skipped);
        assert_eq!(f.standbys.get(&f.primary).await.unwrap().sync_count, 1);
    }

    #[tokio::test]
    async fn test_loop_propagates_new_file() {
        let f = fixture().await;
        f.engine.start(&f.primary, Duration::from_millis(20)).await;
        assert!(f.engine.is_running(&f.primary).await);

        let primary_ws = f.cloud.memory_workspace(&f.primary).await.unwrap();
        primary_ws.write("checkpoints/step-100.pt", b"tensor bytes").await.unwrap();

        let standby_ws = f.cloud.memory_workspace(&InstanceId::new("cpu-1")).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(8);
        loop {
            if standby_ws.contents().await.contains_key("checkpoints/step-100.pt") {
                break;
            }
            assert!(Instant::now() < deadline, "file not propagated in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(f.engine.stop(&f.primary).await);
        assert!(!f.engine.is_running(&f.primary).await);
    }

    #[tokio::test]
    async fn test_repeated_failures_degrade_association() {
        let f = fixture().await;
        let mut events = f.engine.events.subscribe();
        let mut baseline = None;
        f.engine.run_cycle(&f.primary, &mut baseline).await.unwrap();

        let standby_ws = f.cloud.memory_workspace(&InstanceId::new("cpu-1")).await.unwrap();
        standby_ws.fail_writes_after(0).await;
        let primary_ws = f.cloud.memory_workspace(&f.primary).await.unwrap();
        primary_ws.write("new.txt", b"x").await.unwrap();

        f.engine.start(&f.primary, Duration::from_millis(10)).await;
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("degraded event")
            .unwrap();
        assert!(matches!(event, StatusEvent::SyncDegraded { consecutive_failures: 2, .. }));
        assert_eq!(f.standbys.get(&f.primary).await.unwrap().sync_state, SyncState::Degraded);

        // recovers once writes succeed again
        standby_ws.heal().await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.standbys.get(&f.primary).await.unwrap().sync_state != SyncState::Ready {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f.engine.shutdown().await;
    }
}
