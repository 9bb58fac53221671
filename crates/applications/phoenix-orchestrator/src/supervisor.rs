//! Automatic failover supervision
//!
//! Connects loss detection to the state machine:
//! - loss signals from [`HealthMonitor`] trigger `hardware_fault` failovers
//!   for instances with `auto_failover` enabled
//! - `notify_preemption` triggers `preemption` failovers (provider notices)
//! - attempts that fail transiently while the standby is serving are
//!   retried after the configured delay, as new events

use crate::config::RecoveryConfig;
use crate::error::{OrchestratorError, Result};
use crate::failover::{FailoverCoordinator, FailoverHandle};
use crate::monitor::HealthMonitor;
use crate::standby::StandbyRegistry;
use crate::strategy::StrategyStore;
use futures::StreamExt;
use phoenix_core::{FailoverEvent, FailoverOutcome, InstanceId, StrategyKind, SyncState, TriggerReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct FailoverSupervisor {
    coordinator: Arc<FailoverCoordinator>,
    strategies: StrategyStore,
    standbys: StandbyRegistry,
    recovery: RecoveryConfig,
    followers: Mutex<JoinSet<()>>,
}

impl FailoverSupervisor {
    pub fn new(
        coordinator: Arc<FailoverCoordinator>,
        strategies: StrategyStore,
        standbys: StandbyRegistry,
        recovery: RecoveryConfig,
    ) -> Self {
        Self {
            coordinator,
            strategies,
            standbys,
            recovery,
            followers: Mutex::new(JoinSet::new()),
        }
    }

    /// Consume loss signals until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, monitor: HealthMonitor, mut shutdown: watch::Receiver<bool>) {
        let mut signals = monitor.loss_stream();
        info!("Failover supervision started");

        loop {
            tokio::select! {
                signal = signals.next() => {
                    let Some(signal) = signal else { break };
                    match self.handle_loss(&signal.instance_id, TriggerReason::HardwareFault).await {
                        Ok(Some(event_id)) => debug!(instance_id = %signal.instance_id, event_id = %event_id, "Loss signal handed to failover"),
                        Ok(None) => {}
                        Err(e) => warn!(instance_id = %signal.instance_id, error = %e, "Loss signal not acted on"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Failover supervision stopped");
    }

    /// The provider announced a preemption of `instance_id`
    pub async fn notify_preemption(self: &Arc<Self>, instance_id: &InstanceId) -> Result<Option<Uuid>> {
        info!(instance_id = %instance_id, "Preemption notice received");
        self.handle_loss(instance_id, TriggerReason::Preemption).await
    }

    /// Trigger a failover if the instance's strategy allows automatic
    /// failover. Returns the event id of the started run.
    pub async fn handle_loss(self: &Arc<Self>, instance_id: &InstanceId, reason: TriggerReason) -> Result<Option<Uuid>> {
        let strategy = self.strategies.get(instance_id).await;
        if strategy.strategy == StrategyKind::Disabled || !strategy.params.auto_failover {
            info!(
                instance_id = %instance_id,
                strategy = %strategy.strategy,
                "Automatic failover not enabled, loss left to the operator"
            );
            return Ok(None);
        }

        let handle = match self.coordinator.trigger(instance_id, reason).await {
            Ok(handle) => handle,
            Err(OrchestratorError::ConcurrentFailoverRejected { phase, .. }) => {
                debug!(instance_id = %instance_id, phase = %phase, "Failover already running");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let event_id = handle.event_id;

        let supervisor = Arc::clone(self);
        let mut followers = self.followers.lock().await;
        reap(&mut followers);
        followers.spawn(async move { supervisor.follow(handle, reason).await });
        Ok(Some(event_id))
    }

    /// Runs still followed (waiting or between retries)
    pub async fn following(&self) -> usize {
        let mut followers = self.followers.lock().await;
        reap(&mut followers);
        followers.len()
    }

    /// Wait for a run, retrying transient failures while the standby serves
    async fn follow(self: Arc<Self>, handle: FailoverHandle, reason: TriggerReason) {
        let mut handle = handle;
        let mut retries = 0u32;

        loop {
            let instance_id = handle.instance_id.clone();
            let event = match handle.wait().await {
                Ok(event) => event,
                Err(e) => {
                    debug!(instance_id = %instance_id, error = %e, "Failover ended before gpu_lost");
                    return;
                }
            };
            if event.outcome == FailoverOutcome::Success {
                return;
            }
            if !self.should_retry(&event, retries).await {
                error!(
                    instance_id = %instance_id,
                    event_id = %event.id,
                    retries,
                    "Failover failed, operator intervention required"
                );
                return;
            }

            retries += 1;
            let delay = Duration::from_secs(self.recovery.retry_delay_secs);
            info!(instance_id = %instance_id, retry = retries, delay_secs = delay.as_secs(), "Retrying failover");
            tokio::time::sleep(delay).await;

            handle = match self.coordinator.trigger(&instance_id, reason).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Retry not started");
                    return;
                }
            };
        }
    }

    async fn should_retry(&self, event: &FailoverEvent, retries: u32) -> bool {
        if retries >= self.recovery.max_auto_retries {
            return false;
        }
        let transient = event
            .failure
            .as_ref()
            .is_some_and(|f| f.kind.is_transient());
        if !transient {
            return false;
        }
        if !self.strategies.get(&event.instance_id).await.params.auto_recovery {
            return false;
        }
        self.standbys
            .get(&event.instance_id)
            .await
            .is_some_and(|a| a.sync_state == SyncState::FailoverActive)
    }

    /// Abort pending retries
    pub async fn shutdown(&self) {
        self.followers.lock().await.abort_all();
    }
}

fn reap(followers: &mut JoinSet<()>) {
    while let Some(done) = followers.try_join_next() {
        if let Err(e) = done {
            if e.is_panic() {
                error!(error = %e, "Failover follower panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::blob::MemoryBlobStore;
    use crate::config::OrchestratorConfig;
    use crate::history::HistoryQuery;
    use crate::orchestrator::Orchestrator;
    use crate::sim::SimulatedCloud;
    use phoenix_core::{
        Backend, FailoverOutcome, FailoverStrategyConfig, FailureKind, ProtectedInstance,
        StrategyKind, StrategyParams, SyncState, TriggerReason,
    };
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_for_events(orchestrator: &Orchestrator, count: usize) -> Vec<phoenix_core::FailoverEvent> {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let events = orchestrator.history.query(&HistoryQuery::default()).await;
            let finished = events.iter().filter(|e| e.is_finished()).count();
            if finished >= count {
                return events;
            }
            assert!(std::time::Instant::now() < deadline, "timed out waiting for events");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_disabled_strategy_is_not_failed_over() {
        let cloud = Arc::new(SimulatedCloud::new());
        let handle = cloud.launch_existing("gpu-1", Backend::SpotGpu, "eu-west-1").await;
        let orchestrator = Orchestrator::new(cloud.clone(), Arc::new(MemoryBlobStore::new()), OrchestratorConfig::fast());
        orchestrator
            .protect(
                ProtectedInstance::new("gpu-1", "RTX_4090", 1.5, "eu-west-1", "alice"),
                FailoverStrategyConfig::new(handle.id.clone(), StrategyKind::Disabled),
            )
            .await
            .unwrap();

        let supervisor = orchestrator.supervisor();
        let started = supervisor.notify_preemption(&handle.id).await.unwrap();
        assert!(started.is_none());
        assert!(!orchestrator.coordinator.is_active(&handle.id).await);
    }

    #[tokio::test]
    async fn test_preemption_notice_runs_failover() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_capacity(Backend::SpotGpu, "RTX_4090", "eu-west-1", 1.4, 1).await;
        let handle = cloud.launch_existing("gpu-1", Backend::SpotGpu, "eu-west-1").await;
        let orchestrator = Orchestrator::new(cloud.clone(), Arc::new(MemoryBlobStore::new()), OrchestratorConfig::fast());
        orchestrator
            .protect(
                ProtectedInstance::new("gpu-1", "RTX_4090", 1.5, "eu-west-1", "alice"),
                FailoverStrategyConfig::new(handle.id.clone(), StrategyKind::Snapshot),
            )
            .await
            .unwrap();

        let supervisor = orchestrator.supervisor();
        cloud.preempt(&handle.id).await;
        let event_id = supervisor.notify_preemption(&handle.id).await.unwrap().unwrap();

        let events = wait_for_events(&orchestrator, 1).await;
        assert_eq!(events[0].id, event_id);
        assert_eq!(events[0].reason, TriggerReason::Preemption);
        assert_eq!(events[0].outcome, FailoverOutcome::Success);

        // The finished follower is reaped
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while supervisor.following().await > 0 {
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_retried_while_standby_serves() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_capacity(Backend::ReliableCpu, "cpu-4", "eu-west-1", 0.08, 1).await;
        let handle = cloud.launch_existing("gpu-1", Backend::SpotGpu, "eu-west-1").await;
        let orchestrator = Orchestrator::new(cloud.clone(), Arc::new(MemoryBlobStore::new()), OrchestratorConfig::fast());
        orchestrator
            .protect(
                ProtectedInstance::new("gpu-1", "RTX_4090", 1.5, "eu-west-1", "alice"),
                FailoverStrategyConfig::new(handle.id.clone(), StrategyKind::CpuStandby),
            )
            .await
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while orchestrator.standbys.get(&handle.id).await.map(|a| a.sync_state) != Some(SyncState::Ready) {
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // No GPU capacity for the first attempt; some appears before the retry
        let supervisor = orchestrator.supervisor();
        cloud.preempt(&handle.id).await;
        supervisor.notify_preemption(&handle.id).await.unwrap().unwrap();

        let first = wait_for_events(&orchestrator, 1).await;
        assert_eq!(first[0].outcome, FailoverOutcome::Failed);
        assert_eq!(first[0].failure.as_ref().unwrap().kind, FailureKind::NoCapacityAvailable);
        cloud.add_capacity(Backend::SpotGpu, "RTX_4090", "eu-west-1", 1.4, 1).await;

        let events = wait_for_events(&orchestrator, 2).await;
        assert_eq!(events.len(), 2);
        let retry = events.iter().find(|e| e.id != first[0].id).unwrap();
        assert_eq!(retry.outcome, FailoverOutcome::Success);
        // the failed event is left as it was
        let failed = orchestrator.history.get(first[0].id).await.unwrap();
        assert_eq!(failed.outcome, FailoverOutcome::Failed);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_retry_without_auto_recovery() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_capacity(Backend::ReliableCpu, "cpu-4", "eu-west-1", 0.08, 1).await;
        let handle = cloud.launch_existing("gpu-1", Backend::SpotGpu, "eu-west-1").await;
        let orchestrator = Orchestrator::new(cloud.clone(), Arc::new(MemoryBlobStore::new()), OrchestratorConfig::fast());
        let params = StrategyParams {
            auto_recovery: false,
            ..Default::default()
        };
        orchestrator
            .protect(
                ProtectedInstance::new("gpu-1", "RTX_4090", 1.5, "eu-west-1", "alice"),
                FailoverStrategyConfig::new(handle.id.clone(), StrategyKind::CpuStandby).with_params(params),
            )
            .await
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while orchestrator.standbys.get(&handle.id).await.map(|a| a.sync_state) != Some(SyncState::Ready) {
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let supervisor = orchestrator.supervisor();
        cloud.preempt(&handle.id).await;
        supervisor.notify_preemption(&handle.id).await.unwrap().unwrap();
        wait_for_events(&orchestrator, 1).await;

        cloud.add_capacity(Backend::SpotGpu, "RTX_4090", "eu-west-1", 1.4, 1).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(orchestrator.history.query(&HistoryQuery::default()).await.len(), 1);
        orchestrator.shutdown().await;
    }
}
