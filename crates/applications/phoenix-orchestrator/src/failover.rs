//! Failover state machine
//!
//! Drives a protected instance through recovery after GPU loss:
//!
//! ```text
//! Loss signal / manual trigger
//!     │
//!     ├── detecting        confirm loss (N failed probes; immediate for manual/preemption)
//!     │                    cancellable up to here
//!     ├── gpu_lost         event recorded, instance failing_over
//!     │
//!     ├── failover_to_cpu  standby association taken over (cpu_standby / warm_pool only)
//!     │
//!     ├── searching_gpu    capacity search with exponential backoff
//!     │
//!     ├── provisioning     request + poll until reachable
//!     │
//!     ├── restoring        live copy from the standby, else latest snapshot
//!     │
//!     └── complete         replacement online, association ready again
//! ```
//!
//! Any phase may end in `failed`. Every phase entry is journaled before the
//! phase runs, so a restarted process resumes from the last attempted phase.
//!
//! The overall timeout bounds `detecting` through `restoring`. Completion
//! runs outside it: once `complete` is recorded the run is not undone.
//!
//! One run per instance: a second trigger is rejected, except that a manual
//! trigger replaces an automatic one that has not yet confirmed loss.

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, StatusEvent};
use crate::history::HistoryStore;
use crate::instance::InstanceRegistry;
use crate::snapshot::SnapshotManager;
use crate::standby::{Release, StandbyRegistry};
use crate::strategy::{StrategyStore, region_of_zone};
use crate::sync::SyncEngine;
use crate::workspace::copy_workspace;
use chrono::{DateTime, Utc};
use phoenix_core::{
    Backend, Candidate, CapacityConstraints, ComputeProvider, FailoverEvent, FailoverPhase,
    FailoverStrategyConfig, HostHealth, InstanceId, InstanceStatus, ProtectedInstance, Replacement, StandbyAssociation, StrategyKind, TriggerReason,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Components the state machine works through
#[derive(Clone)]
pub struct FailoverContext {
    pub compute: Arc<dyn ComputeProvider>,
    pub instances: InstanceRegistry,
    pub standbys: StandbyRegistry,
    pub strategies: StrategyStore,
    pub sync: Arc<SyncEngine>,
    pub snapshots: Arc<SnapshotManager>,
    pub history: HistoryStore,
    pub events: EventBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Open,
    Cancelled,
    Committed,
}

/// Decides the race between `cancel` and the move into `gpu_lost`
struct CancelGate {
    state: Mutex<GateState>,
    signal: watch::Sender<bool>,
}

impl CancelGate {
    fn new(state: GateState) -> Self {
        Self {
            state: Mutex::new(state),
            signal: watch::Sender::new(false),
        }
    }

    async fn cancel(&self) -> bool {
        let mut state = self.state.lock().await;
        match *state {
            GateState::Committed => false,
            GateState::Open | GateState::Cancelled => {
                *state = GateState::Cancelled;
                self.signal.send_replace(true);
                true
            }
        }
    }

    /// Pass the point of no return; false if cancelled first
    async fn commit(&self) -> bool {
        let mut state = self.state.lock().await;
        match *state {
            GateState::Cancelled => false,
            GateState::Open | GateState::Committed => {
                *state = GateState::Committed;
                true
            }
        }
    }

    async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        if rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct ActiveRun {
    event_id: Uuid,
    reason: TriggerReason,
    phase: watch::Receiver<FailoverPhase>,
    gate: Arc<CancelGate>,
}

/// Handle to a running failover
pub struct FailoverHandle {
    pub event_id: Uuid,
    pub instance_id: InstanceId,
    phase: watch::Receiver<FailoverPhase>,
    gate: Arc<CancelGate>,
    join: JoinHandle<Result<FailoverEvent>>,
}

impl FailoverHandle {
    /// Phase most recently entered
    pub fn phase(&self) -> FailoverPhase {
        *self.phase.borrow()
    }

    /// Follow phase changes of this run
    pub fn watch_phase(&self) -> watch::Receiver<FailoverPhase> {
        self.phase.clone()
    }

    /// Cancel the run. Only possible while still `detecting`; returns
    /// whether the cancellation took effect.
    pub async fn cancel(&self) -> bool {
        self.gate.cancel().await
    }

    /// Wait for the run to end.
    ///
    /// Terminal runs return their event (`success` or `failed`). Runs that
    /// never left `detecting` return `DetectionAmbiguous` or `Cancelled`.
    pub async fn wait(self) -> Result<FailoverEvent> {
        self.join
            .await
            .map_err(|e| OrchestratorError::Internal(format!("failover task aborted: {}", e)))?
    }
}

/// Progress of one run, kept outside the phase futures so a timeout
/// can still see how far the run got
struct RunState {
    phase: FailoverPhase,
    last_at: DateTime<Utc>,
    standby_acquired: bool,
    candidate: Option<Candidate>,
    replacement: Option<Replacement>,
}

struct Run {
    event_id: Uuid,
    instance: ProtectedInstance,
    reason: TriggerReason,
    phase_tx: watch::Sender<FailoverPhase>,
    gate: Arc<CancelGate>,
}

/// Runs failovers, at most one per protected instance
pub struct FailoverCoordinator {
    ctx: FailoverContext,
    config: OrchestratorConfig,
    active: Mutex<HashMap<InstanceId, ActiveRun>>,
}

impl FailoverCoordinator {
    pub fn new(ctx: FailoverContext, config: OrchestratorConfig) -> Self {
        Self {
            ctx,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Instances with a run in progress and the phase each is in
    pub async fn active(&self) -> Vec<(InstanceId, Uuid, FailoverPhase)> {
        let mut runs: Vec<_> = self
            .active
            .lock()
            .await
            .iter()
            .map(|(id, run)| (id.clone(), run.event_id, *run.phase.borrow()))
            .collect();
        runs.sort_by(|a, b| a.0.cmp(&b.0));
        runs
    }

    pub async fn is_active(&self, instance_id: &InstanceId) -> bool {
        self.active.lock().await.contains_key(instance_id)
    }

    /// Start a failover for `instance_id`
    pub async fn trigger(self: &Arc<Self>, instance_id: &InstanceId, reason: TriggerReason) -> Result<FailoverHandle> {
        let instance = self.ctx.instances.get(instance_id).await?;

        let mut active = self.active.lock().await;
        if let Some(run) = active.get(instance_id) {
            let phase = *run.phase.borrow();
            let preempts = reason.is_manual()
                && !run.reason.is_manual()
                && phase == FailoverPhase::Detecting
                && run.gate.cancel().await;
            if !preempts {
                warn!(instance_id = %instance_id, phase = %phase, reason = %reason, "Failover already active, trigger rejected");
                return Err(OrchestratorError::ConcurrentFailoverRejected {
                    instance_id: instance_id.clone(),
                    phase,
                });
            }
            info!(instance_id = %instance_id, "Manual trigger replaces unconfirmed automatic detection");
            active.remove(instance_id);
        }

        let event_id = Uuid::new_v4();
        let (phase_tx, phase_rx) = watch::channel(FailoverPhase::Detecting);
        let gate = Arc::new(CancelGate::new(GateState::Open));
        active.insert(
            instance_id.clone(),
            ActiveRun {
                event_id,
                reason,
                phase: phase_rx.clone(),
                gate: Arc::clone(&gate),
            },
        );
        drop(active);

        info!(instance_id = %instance_id, event_id = %event_id, reason = %reason, "Failover triggered");
        let run = Run {
            event_id,
            instance,
            reason,
            phase_tx,
            gate: Arc::clone(&gate),
        };
        let coordinator = Arc::clone(self);
        let join = tokio::spawn(async move { coordinator.execute(run, None).await });

        Ok(FailoverHandle {
            event_id,
            instance_id: instance_id.clone(),
            phase: phase_rx,
            gate,
            join,
        })
    }

    /// Continue an event a previous process left `in_progress`, re-entering
    /// its last recorded phase
    pub async fn resume(self: &Arc<Self>, event: FailoverEvent) -> Result<FailoverHandle> {
        if event.is_finished() {
            return Err(OrchestratorError::Internal(format!("event {} already finished", event.id)));
        }
        let instance = self.ctx.instances.get(&event.instance_id).await?;

        let mut active = self.active.lock().await;
        if let Some(run) = active.get(&event.instance_id) {
            return Err(OrchestratorError::ConcurrentFailoverRejected {
                instance_id: event.instance_id.clone(),
                phase: *run.phase.borrow(),
            });
        }
        let (phase_tx, phase_rx) = watch::channel(event.current_phase());
        let gate = Arc::new(CancelGate::new(GateState::Committed));
        active.insert(
            event.instance_id.clone(),
            ActiveRun {
                event_id: event.id,
                reason: event.reason,
                phase: phase_rx.clone(),
                gate: Arc::clone(&gate),
            },
        );
        drop(active);

        info!(instance_id = %event.instance_id, event_id = %event.id, phase = %event.current_phase(), "Resuming failover");
        let handle_meta = (event.id, event.instance_id.clone());
        let run = Run {
            event_id: event.id,
            instance,
            reason: event.reason,
            phase_tx,
            gate: Arc::clone(&gate),
        };
        let coordinator = Arc::clone(self);
        let join = tokio::spawn(async move { coordinator.execute(run, Some(event)).await });

        Ok(FailoverHandle {
            event_id: handle_meta.0,
            instance_id: handle_meta.1,
            phase: phase_rx,
            gate,
            join,
        })
    }

    /// Resume every `in_progress` event found in history
    pub async fn resume_incomplete(self: &Arc<Self>) -> Vec<Result<FailoverHandle>> {
        let mut handles = Vec::new();
        for event in self.ctx.history.incomplete().await {
            handles.push(self.resume(event).await);
        }
        handles
    }

    async fn execute(self: Arc<Self>, run: Run, resumed: Option<FailoverEvent>) -> Result<FailoverEvent> {
        let result = self.execute_run(&run, resumed).await;
        self.ctx.strategies.end_failover(&run.instance.id, run.event_id).await;

        let mut active = self.active.lock().await;
        if active
            .get(&run.instance.id)
            .is_some_and(|a| a.event_id == run.event_id)
        {
            active.remove(&run.instance.id);
        }
        result
    }

    async fn execute_run(&self, run: &Run, resumed: Option<FailoverEvent>) -> Result<FailoverEvent> {
        let id = &run.instance.id;
        let overall = self.config.overall_timeout();
        let deadline = tokio::time::Instant::now() + overall;

        // Waits out a strategy switch in progress; no switch starts after this
        let registered = tokio::time::timeout_at(deadline, self.ctx.strategies.begin_failover(id, run.event_id)).await;
        if registered.is_err() {
            return Err(OrchestratorError::PhaseTimeout(FailoverPhase::Detecting, overall));
        }

        let mut state = match resumed {
            Some(event) => self.resume_state(run, &event).await,
            None => {
                let detected_at = Utc::now();
                self.publish_phase(run, FailoverPhase::Detecting, detected_at);
                match tokio::time::timeout_at(deadline, self.detect(run)).await {
                    Ok(confirmed) => confirmed?,
                    Err(_) => {
                        info!(instance_id = %id, "Loss not confirmed within the failover timeout");
                        return Err(OrchestratorError::DetectionAmbiguous(id.clone()));
                    }
                }
                if !run.gate.commit().await {
                    info!(instance_id = %id, "Failover cancelled before gpu_lost");
                    return Err(OrchestratorError::Cancelled(id.clone()));
                }

                let mut event = FailoverEvent::open(id.clone(), run.reason, detected_at);
                event.id = run.event_id;
                self.ctx.history.open_event(event).await?;
                RunState {
                    phase: FailoverPhase::Detecting,
                    last_at: detected_at,
                    standby_acquired: false,
                    candidate: None,
                    replacement: None,
                }
            }
        };

        let outcome = tokio::time::timeout_at(deadline, self.drive(run, &mut state)).await;
        let error = match outcome {
            Ok(Ok(bytes)) => match self.finish(run, &mut state, bytes).await {
                Ok(event) => return Ok(event),
                Err(e) => e,
            },
            Ok(Err(e)) => e,
            Err(_) => OrchestratorError::PhaseTimeout(state.phase, overall),
        };
        self.abort(run, &mut state, error).await
    }

    /// `detecting`: Ok once loss is confirmed
    async fn detect(&self, run: &Run) -> Result<()> {
        if matches!(run.reason, TriggerReason::ManualTest | TriggerReason::Preemption) {
            return Ok(());
        }

        let needed = self.config.detection.failed_probes_to_confirm;
        let handle = run.instance.handle();
        let mut failures = 0u32;
        loop {
            let answered = matches!(self.ctx.compute.health(&handle).await, Ok(HostHealth::Online));
            if answered {
                info!(instance_id = %run.instance.id, failures, "Primary answered, loss not confirmed");
                return Err(OrchestratorError::DetectionAmbiguous(run.instance.id.clone()));
            }
            failures += 1;
            debug!(instance_id = %run.instance.id, failures, needed, "Health probe failed");
            if failures >= needed {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.probe_interval()) => {}
                _ = run.gate.cancelled() => {
                    return Err(OrchestratorError::Cancelled(run.instance.id.clone()));
                }
            }
        }
    }

    async fn resume_state(&self, run: &Run, event: &FailoverEvent) -> RunState {
        let mut standby_acquired = false;
        if event.has_phase(FailoverPhase::FailoverToCpu) {
            match self
                .ctx
                .standbys
                .acquire_for_failover(&run.instance.id, run.event_id)
                .await
            {
                Ok(_) => standby_acquired = true,
                Err(e) => warn!(instance_id = %run.instance.id, error = %e, "Standby not re-acquired on resume"),
            }
        }
        RunState {
            phase: event.current_phase(),
            last_at: event.phases.last().map(|p| p.entered_at).unwrap_or_else(Utc::now),
            standby_acquired,
            candidate: None,
            replacement: event.replacement.clone(),
        }
    }

    /// Run the phases up to and including `restoring`; returns the bytes restored
    async fn drive(&self, run: &Run, state: &mut RunState) -> Result<u64> {
        let id = &run.instance.id;
        let strategy = self.ctx.strategies.get(id).await;
        let timeouts = &self.config.failover;

        // The last recorded phase is re-run without a second record
        let mut next = match state.phase {
            FailoverPhase::Detecting => FailoverPhase::GpuLost,
            phase => phase,
        };

        loop {
            if next != state.phase {
                self.enter(run, state, next).await?;
            }

            next = match next {
                FailoverPhase::GpuLost => {
                    self.ctx.instances.set_status(id, InstanceStatus::FailingOver).await?;
                    let standby_ready = strategy.strategy.holds_standby()
                        && self.ctx.standbys.get(id).await.is_some_and(|a| {
                            matches!(
                                a.sync_state,
                                phoenix_core::SyncState::Ready | phoenix_core::SyncState::FailoverActive
                            )
                        });
                    if standby_ready {
                        FailoverPhase::FailoverToCpu
                    } else {
                        FailoverPhase::SearchingGpu
                    }
                }
                FailoverPhase::FailoverToCpu => {
                    let budget = Duration::from_secs(timeouts.failover_to_cpu_timeout_secs);
                    tokio::time::timeout(budget, self.activate_standby(run, state))
                        .await
                        .map_err(|_| OrchestratorError::PhaseTimeout(FailoverPhase::FailoverToCpu, budget))??;
                    FailoverPhase::SearchingGpu
                }
                FailoverPhase::SearchingGpu => {
                    state.candidate = Some(self.search_replacement(&run.instance, &strategy).await?);
                    FailoverPhase::Provisioning
                }
                FailoverPhase::Provisioning => {
                    let budget = Duration::from_secs(timeouts.provisioning_timeout_secs);
                    tokio::time::timeout(budget, self.provision_replacement(run, state, &strategy))
                        .await
                        .map_err(|_| {
                            OrchestratorError::ProviderTimeout(budget, "replacement did not become reachable".into())
                        })??;
                    FailoverPhase::Restoring
                }
                FailoverPhase::Restoring => {
                    let budget = Duration::from_secs(timeouts.restoring_timeout_secs);
                    return tokio::time::timeout(budget, self.restore_replacement(run, state, &strategy))
                        .await
                        .map_err(|_| OrchestratorError::PhaseTimeout(FailoverPhase::Restoring, budget))?;
                }
                FailoverPhase::Detecting | FailoverPhase::Complete | FailoverPhase::Failed => {
                    return Err(OrchestratorError::Internal(format!("cannot run phase {}", next)));
                }
            };
        }
    }

    async fn enter(&self, run: &Run, state: &mut RunState, phase: FailoverPhase) -> Result<()> {
        let at = Utc::now().max(state.last_at);
        self.ctx.history.enter_phase(run.event_id, phase, at).await?;
        state.phase = phase;
        state.last_at = at;
        self.publish_phase(run, phase, at);
        info!(instance_id = %run.instance.id, event_id = %run.event_id, phase = %phase, "Failover phase entered");
        Ok(())
    }

    fn publish_phase(&self, run: &Run, phase: FailoverPhase, at: DateTime<Utc>) {
        run.phase_tx.send_replace(phase);
        self.ctx.events.publish(StatusEvent::PhaseChanged {
            event_id: run.event_id,
            instance_id: run.instance.id.clone(),
            phase,
            at,
        });
    }

    /// `failover_to_cpu`: take the association over; the standby serves
    async fn activate_standby(&self, run: &Run, state: &mut RunState) -> Result<()> {
        let association = self
            .ctx
            .standbys
            .acquire_for_failover(&run.instance.id, run.event_id)
            .await?;
        state.standby_acquired = true;

        if self.ctx.compute.health(&association.standby).await? != HostHealth::Online {
            return Err(phoenix_core::PhoenixError::provider(format!(
                "standby {} is unreachable",
                association.standby.id
            ))
            .into());
        }
        info!(
            instance_id = %run.instance.id,
            standby = %association.standby.id,
            backend = %association.standby.backend,
            "Workload served from standby"
        );
        Ok(())
    }

    fn replacement_regions(&self, instance: &ProtectedInstance, strategy: &FailoverStrategyConfig) -> Vec<String> {
        let fallback = &self.config.failover.fallback_regions;
        let mut regions = match strategy.strategy {
            StrategyKind::RegionalVolume => {
                let home = strategy
                    .params
                    .target_zone
                    .as_deref()
                    .and_then(region_of_zone)
                    .unwrap_or_else(|| instance.region.clone());
                let mut regions = vec![home];
                if strategy.params.allow_cross_region {
                    regions.extend(fallback.iter().cloned());
                }
                regions
            }
            _ => std::iter::once(instance.region.clone())
                .chain(fallback.iter().cloned())
                .collect(),
        };
        let mut seen = std::collections::HashSet::new();
        regions.retain(|r| seen.insert(r.clone()));
        regions
    }

    /// `searching_gpu`: bounded search with exponential backoff
    async fn search_replacement(&self, instance: &ProtectedInstance, strategy: &FailoverStrategyConfig) -> Result<Candidate> {
        let regions = self.replacement_regions(instance, strategy);
        let backends = match strategy.strategy {
            StrategyKind::WarmPool => vec![Backend::ReservedGpu, Backend::SpotGpu],
            _ if strategy.params.use_spot => vec![Backend::SpotGpu],
            _ => vec![Backend::ReservedGpu],
        };
        let max_price = instance.hourly_price * self.config.failover.price_ceiling_multiplier;
        let backoff = &self.config.search;

        for attempt in 1..=backoff.max_attempts {
            for backend in &backends {
                let constraints = CapacityConstraints {
                    backend: *backend,
                    gpu_class: Some(instance.gpu_class.clone()),
                    machine_class: None,
                    max_hourly_price: Some(max_price),
                    regions: regions.clone(),
                };
                match self.ctx.compute.search(&constraints).await {
                    Ok(candidates) => {
                        if let Some(candidate) = pick_candidate(candidates, &regions) {
                            info!(
                                instance_id = %instance.id,
                                offer = %candidate.offer_id,
                                region = %candidate.region,
                                hourly_price = candidate.hourly_price,
                                attempt,
                                "Replacement capacity found"
                            );
                            return Ok(candidate);
                        }
                    }
                    Err(e) => warn!(instance_id = %instance.id, backend = %backend, error = %e, "Capacity search failed"),
                }
            }

            if attempt < backoff.max_attempts {
                let delay = backoff.delay_for(attempt);
                debug!(instance_id = %instance.id, attempt, delay_ms = delay.as_millis() as u64, "No capacity yet, backing off");
                tokio::time::sleep(delay).await;
            }
        }

        Err(OrchestratorError::NoCapacityAvailable(format!(
            "no {} capacity in [{}] at or below ${:.2}/h after {} attempts",
            instance.gpu_class,
            regions.join(", "),
            max_price,
            backoff.max_attempts
        )))
    }

    /// `provisioning`: request the replacement and wait until reachable
    async fn provision_replacement(&self, run: &Run, state: &mut RunState, strategy: &FailoverStrategyConfig) -> Result<()> {
        if state.replacement.is_none() {
            let candidate = match state.candidate.take() {
                Some(c) => c,
                None => self.search_replacement(&run.instance, strategy).await?,
            };
            let replacement = Replacement {
                handle: self.request_replacement(run, candidate.clone()).await?,
                gpu_class: candidate.gpu_class,
                hourly_price: candidate.hourly_price,
            };
            state.replacement = Some(replacement.clone());
            self.ctx.history.record_replacement(run.event_id, replacement).await?;
        }

        let handle = state
            .replacement
            .as_ref()
            .map(|r| r.handle.clone())
            .ok_or_else(|| OrchestratorError::Internal("replacement missing after provisioning".into()))?;

        let poll = Duration::from_millis(self.config.failover.provision_poll_ms);
        loop {
            match self.ctx.compute.health(&handle).await {
                Ok(HostHealth::Online) => break,
                Ok(HostHealth::Unreachable) => debug!(replacement = %handle.id, "Replacement not reachable yet"),
                Err(e) => debug!(replacement = %handle.id, error = %e, "Replacement health probe failed"),
            }
            tokio::time::sleep(poll).await;
        }
        info!(instance_id = %run.instance.id, replacement = %handle.id, "Replacement reachable");
        Ok(())
    }

    /// Send the provisioning request from its own task. If the run stops
    /// waiting (a timeout) before the provider answers, the task destroys
    /// the host it was handed.
    async fn request_replacement(&self, run: &Run, candidate: Candidate) -> Result<phoenix_core::InstanceHandle> {
        let (tx, rx) = oneshot::channel();
        let compute = Arc::clone(&self.ctx.compute);
        let instance_id = run.instance.id.clone();
        tokio::spawn(async move {
            let provisioned = compute.provision(&candidate).await;
            if let Err(Ok(orphan)) = tx.send(provisioned) {
                warn!(instance_id = %instance_id, replacement = %orphan.id, "Replacement arrived after the run gave up, destroying");
                if let Err(e) = compute.destroy(&orphan).await {
                    error!(replacement = %orphan.id, error = %e, "Could not destroy abandoned replacement");
                }
            }
        });
        Ok(rx
            .await
            .map_err(|_| OrchestratorError::Internal("provisioning task ended without an answer".into()))??)
    }

    /// `restoring`: live standby first, then the latest snapshot
    async fn restore_replacement(&self, run: &Run, state: &mut RunState, strategy: &FailoverStrategyConfig) -> Result<u64> {
        let id = &run.instance.id;
        let target = state
            .replacement
            .as_ref()
            .map(|r| r.handle.clone())
            .ok_or_else(|| OrchestratorError::Internal("no replacement to restore onto".into()))?;

        let mut live_error = None;
        if state.standby_acquired {
            if let Some(association) = self.ctx.standbys.get(id).await {
                match self.copy_from_standby(&association, &target).await {
                    Ok(bytes) => {
                        info!(instance_id = %id, source = %association.standby.id, bytes, "Restored from live standby");
                        return Ok(bytes);
                    }
                    Err(e) => {
                        warn!(instance_id = %id, error = %e, "Live restore failed, trying latest snapshot");
                        live_error = Some(e);
                    }
                }
            }
        }

        match self.ctx.snapshots.latest_successful(id).await {
            Some(snapshot) => Ok(self.ctx.snapshots.restore(&snapshot.id, &target).await?.bytes_restored),
            None => match live_error {
                Some(e) => Err(e),
                None if strategy.strategy == StrategyKind::Disabled => {
                    info!(instance_id = %id, "No protection configured, replacement starts empty");
                    Ok(0)
                }
                None => Err(OrchestratorError::snapshot_restore(
                    "no live standby and no successful snapshot to restore from",
                )),
            },
        }
    }

    async fn copy_from_standby(&self, association: &StandbyAssociation, target: &phoenix_core::InstanceHandle) -> Result<u64> {
        let source = self
            .ctx
            .compute
            .workspace(&association.standby)
            .await
            .map_err(|e| OrchestratorError::snapshot_restore(format!("standby workspace: {}", e)))?;
        let destination = self
            .ctx
            .compute
            .workspace(target)
            .await
            .map_err(|e| OrchestratorError::snapshot_restore(format!("replacement workspace: {}", e)))?;
        copy_workspace(
            source.as_ref(),
            destination.as_ref(),
            &association.instance_id,
            association.standby.id.as_str(),
        )
        .await
    }

    /// `complete`: record, then hand everything over to the replacement
    async fn finish(&self, run: &Run, state: &mut RunState, bytes: u64) -> Result<FailoverEvent> {
        let replacement = state
            .replacement
            .clone()
            .ok_or_else(|| OrchestratorError::Internal("completing without a replacement".into()))?;
        let old = run.instance.id.clone();
        let new = replacement.handle.id.clone();
        let strategy = self.ctx.strategies.get(&old).await;

        let at = Utc::now().max(state.last_at);
        let event = self.ctx.history.complete(run.event_id, new.clone(), bytes, at).await?;
        state.phase = FailoverPhase::Complete;
        self.publish_phase(run, FailoverPhase::Complete, at);

        if let Err(e) = self
            .ctx
            .instances
            .replace(&old, &replacement.handle)
            .await
        {
            error!(old = %old, new = %new, error = %e, "Could not register replacement");
        }
        if state.standby_acquired {
            if let Err(e) = self
                .ctx
                .standbys
                .release_after_failover(&old, run.event_id, Release::Recovered { new_instance: new.clone() })
                .await
            {
                error!(old = %old, new = %new, error = %e, "Could not re-associate standby");
            }
        }
        self.ctx.strategies.rekey(&old, &new).await;
        self.ctx.snapshots.adopt(&old, &new).await;

        if self.ctx.standbys.get(&new).await.is_some() {
            let interval = Duration::from_secs(strategy.params.sync_interval_secs);
            self.ctx.sync.rekey(&old, &new, interval).await;
        }
        if self.ctx.snapshots.stop_periodic(&old).await {
            self.ctx
                .snapshots
                .start_periodic(
                    self.ctx.instances.clone(),
                    &new,
                    Duration::from_secs(strategy.params.snapshot_interval_secs),
                )
                .await;
        }

        // The lost GPU is retired in the background; it may already be gone
        let compute = Arc::clone(&self.ctx.compute);
        let retired = run.instance.handle();
        tokio::spawn(async move {
            if let Err(e) = compute.destroy(&retired).await {
                debug!(instance_id = %retired.id, error = %e, "Retired GPU not destroyed");
            }
        });

        self.publish_finished(run, &event);
        info!(
            instance_id = %old,
            replacement = %new,
            bytes_restored = bytes,
            duration_secs = event.duration().map(|d| d.num_milliseconds() as f64 / 1000.0).unwrap_or_default(),
            "Failover complete"
        );
        Ok(event)
    }

    /// `failed`: record, clean up what this run created, keep what survives
    async fn abort(&self, run: &Run, state: &mut RunState, cause: OrchestratorError) -> Result<FailoverEvent> {
        let id = &run.instance.id;
        if state.phase == FailoverPhase::Complete {
            error!(instance_id = %id, error = %cause, "Error after completion, run stays complete");
            return Err(cause);
        }
        let kind = cause.kind();
        error!(instance_id = %id, phase = %state.phase, kind = %kind, error = %cause, "Failover failed");

        if let Some(replacement) = &state.replacement {
            match self.ctx.compute.destroy(&replacement.handle).await {
                Ok(()) => info!(replacement = %replacement.handle.id, "Unused replacement destroyed"),
                Err(e) => warn!(replacement = %replacement.handle.id, error = %e, "Could not destroy unused replacement"),
            }
        }

        let serving = if state.standby_acquired {
            if let Err(e) = self
                .ctx
                .standbys
                .release_after_failover(id, run.event_id, Release::Failed)
                .await
            {
                warn!(instance_id = %id, error = %e, "Could not release standby");
            }
            true
        } else {
            false
        };
        let status = if serving {
            InstanceStatus::Degraded
        } else {
            InstanceStatus::Offline
        };
        if let Err(e) = self.ctx.instances.set_status(id, status).await {
            warn!(instance_id = %id, error = %e, "Could not update instance status");
        }

        let at = Utc::now().max(state.last_at);
        let event = self.ctx.history.fail(run.event_id, kind, cause.to_string(), at).await?;
        state.phase = FailoverPhase::Failed;
        self.publish_phase(run, FailoverPhase::Failed, at);
        self.publish_finished(run, &event);
        Ok(event)
    }

    fn publish_finished(&self, run: &Run, event: &FailoverEvent) {
        self.ctx.events.publish(StatusEvent::FailoverFinished {
            event_id: run.event_id,
            instance_id: run.instance.id.clone(),
            outcome: event.outcome,
            failure_kind: event.failure.as_ref().map(|f| f.kind),
            at: event.finished_at().unwrap_or_else(Utc::now),
        });
    }
}

/// Cheapest candidate in the most preferred region
fn pick_candidate(candidates: Vec<Candidate>, regions: &[String]) -> Option<Candidate> {
    let rank = |c: &Candidate| regions.iter().position(|r| r == &c.region).unwrap_or(usize::MAX);
    candidates
        .into_iter()
        .min_by(|a, b| rank(a).cmp(&rank(b)).then(a.hourly_price.total_cmp(&b.hourly_price)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::config::SearchBackoff;
    use crate::orchestrator::Orchestrator;
    use crate::sim::SimulatedCloud;
    use phoenix_core::{FailoverOutcome, FailureKind, StrategyParams, SyncState, Workspace};

    async fn setup(strategy: StrategyKind) -> (Arc<SimulatedCloud>, Orchestrator, InstanceId) {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_capacity(Backend::ReliableCpu, "cpu-4", "eu-west-1", 0.08, 1).await;
        cloud.add_capacity(Backend::SpotGpu, "RTX_4090", "eu-west-1", 1.40, 2).await;
        let handle = cloud.launch_existing("gpu-1", Backend::SpotGpu, "eu-west-1").await;
        let ws = cloud.memory_workspace(&handle.id).await.unwrap();
        ws.write("data.bin", b"payload").await.unwrap();

        let orchestrator = Orchestrator::new(cloud.clone(), Arc::new(MemoryBlobStore::new()), OrchestratorConfig::fast());
        orchestrator
            .protect(
                ProtectedInstance::new("gpu-1", "RTX_4090", 1.50, "eu-west-1", "alice"),
                FailoverStrategyConfig::new(handle.id.clone(), strategy),
            )
            .await
            .unwrap();
        (cloud, orchestrator, handle.id)
    }

    /// Enrol gpu-1 (with `data.bin`) on an existing cloud
    async fn protect_on(
        cloud: &Arc<SimulatedCloud>,
        config: OrchestratorConfig,
        strategy: StrategyKind,
        params: StrategyParams,
    ) -> (Orchestrator, InstanceId) {
        let handle = cloud.launch_existing("gpu-1", Backend::SpotGpu, "eu-west-1").await;
        let ws = cloud.memory_workspace(&handle.id).await.unwrap();
        ws.write("data.bin", b"payload").await.unwrap();

        let orchestrator = Orchestrator::new(cloud.clone(), Arc::new(MemoryBlobStore::new()), config);
        orchestrator
            .protect(
                ProtectedInstance::new("gpu-1", "RTX_4090", 1.50, "eu-west-1", "alice"),
                FailoverStrategyConfig::new(handle.id.clone(), strategy).with_params(params),
            )
            .await
            .unwrap();
        (orchestrator, handle.id)
    }

    async fn wait_standby_ready(orchestrator: &Orchestrator, id: &InstanceId) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while orchestrator.standbys.get(id).await.map(|a| a.sync_state) != Some(SyncState::Ready) {
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_pick_candidate_prefers_region_then_price() {
        let offer = |region: &str, price: f64| Candidate {
            offer_id: format!("{}-{}", region, price),
            backend: Backend::SpotGpu,
            gpu_class: Some("RTX_4090".into()),
            region: region.into(),
            hourly_price: price,
        };
        let regions = vec!["eu-west-1".to_string(), "eu-west-2".to_string()];
        let picked = pick_candidate(
            vec![offer("eu-west-2", 0.9), offer("eu-west-1", 1.4), offer("eu-west-1", 1.2)],
            &regions,
        )
        .unwrap();
        assert_eq!(picked.region, "eu-west-1");
        assert_eq!(picked.hourly_price, 1.2);
        assert!(pick_candidate(Vec::new(), &regions).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_backs_off_until_exhausted() {
        let cloud = Arc::new(SimulatedCloud::new());
        let handle = cloud.launch_existing("gpu-1", Backend::SpotGpu, "eu-west-1").await;
        let config = OrchestratorConfig::fast().with_search_backoff(SearchBackoff {
            initial_delay_ms: 2000,
            multiplier: 2.0,
            max_delay_ms: 5000,
            max_attempts: 4,
        });
        let orchestrator = Orchestrator::new(cloud.clone(), Arc::new(MemoryBlobStore::new()), config);
        orchestrator
            .protect(
                ProtectedInstance::new("gpu-1", "RTX_4090", 1.50, "eu-west-1", "alice"),
                FailoverStrategyConfig::new(handle.id.clone(), StrategyKind::Disabled),
            )
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let event = orchestrator
            .trigger(&handle.id, TriggerReason::ManualTest)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        // 2s, 4s, then capped at 5s between the four searches
        assert!(started.elapsed() >= Duration::from_secs(11));
        assert_eq!(cloud.search_count().await, 4);
        assert_eq!(event.failure.unwrap().kind, FailureKind::NoCapacityAvailable);
        assert_eq!(
            orchestrator.instances.get(&handle.id).await.unwrap().status,
            InstanceStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_transient_loss_records_nothing() {
        let (_cloud, orchestrator, id) = setup(StrategyKind::Disabled).await;

        let handle = orchestrator
            .coordinator
            .trigger(&id, TriggerReason::HardwareFault)
            .await
            .unwrap();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DetectionAmbiguous(_)));
        assert!(orchestrator.history.query(&Default::default()).await.is_empty());
        assert!(!orchestrator.coordinator.is_active(&id).await);
    }

    #[tokio::test]
    async fn test_cancel_while_detecting() {
        let (cloud, orchestrator, id) = setup(StrategyKind::Disabled).await;
        cloud.preempt(&id).await;

        let mut config = OrchestratorConfig::fast();
        config.detection.failed_probes_to_confirm = 50;
        config.detection.probe_interval_ms = 50;
        let coordinator = Arc::new(FailoverCoordinator::new(orchestrator.failover_context(), config));

        let handle = coordinator.trigger(&id, TriggerReason::HardwareFault).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.cancel().await);
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled(_)));
        assert!(orchestrator.history.query(&Default::default()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_bounded_by_overall_timeout() {
        let (cloud, orchestrator, id) = setup(StrategyKind::Disabled).await;
        cloud.preempt(&id).await;

        let mut config = OrchestratorConfig::fast().with_overall_timeout(Duration::from_secs(1));
        config.detection.failed_probes_to_confirm = 1000;
        config.detection.probe_interval_ms = 50;
        let coordinator = Arc::new(FailoverCoordinator::new(orchestrator.failover_context(), config));

        let started = tokio::time::Instant::now();
        let err = coordinator
            .trigger(&id, TriggerReason::HardwareFault)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DetectionAmbiguous(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(orchestrator.history.query(&Default::default()).await.is_empty());
        assert!(orchestrator.strategies.store().failover_of(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_manual_trigger_preempts_unconfirmed_detection() {
        let (cloud, orchestrator, id) = setup(StrategyKind::Disabled).await;
        cloud.preempt(&id).await;

        let mut config = OrchestratorConfig::fast();
        config.detection.failed_probes_to_confirm = 50;
        config.detection.probe_interval_ms = 50;
        let coordinator = Arc::new(FailoverCoordinator::new(orchestrator.failover_context(), config));

        let automatic = coordinator.trigger(&id, TriggerReason::HardwareFault).await.unwrap();
        let manual = coordinator.trigger(&id, TriggerReason::ManualTest).await.unwrap();

        assert!(matches!(automatic.wait().await, Err(OrchestratorError::Cancelled(_))));
        let event = manual.wait().await.unwrap();
        assert_eq!(event.reason, TriggerReason::ManualTest);
        assert_eq!(event.outcome, FailoverOutcome::Success);
    }

    #[tokio::test]
    async fn test_cancel_after_gpu_lost_is_refused() {
        let (cloud, orchestrator, id) = setup(StrategyKind::Disabled).await;
        cloud.set_provision_delay(20).await;

        let handle = orchestrator
            .coordinator
            .trigger(&id, TriggerReason::ManualTest)
            .await
            .unwrap();
        let mut phases = handle.watch_phase();
        phases
            .wait_for(|p| *p >= FailoverPhase::GpuLost)
            .await
            .unwrap();
        assert!(!handle.cancel().await);
        assert_eq!(handle.wait().await.unwrap().outcome, FailoverOutcome::Success);
    }

    #[tokio::test]
    async fn test_provisioning_timeout_destroys_replacement() {
        let (cloud, orchestrator, id) = setup(StrategyKind::CpuStandby).await;
        cloud.set_never_online(true).await;

        let config = OrchestratorConfig::fast().with_provisioning_timeout(Duration::from_secs(1));
        let coordinator = Arc::new(FailoverCoordinator::new(orchestrator.failover_context(), config));

        // wait for the standby to be ready
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while orchestrator.standbys.get(&id).await.map(|a| a.sync_state) != Some(SyncState::Ready) {
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let event = coordinator
            .trigger(&id, TriggerReason::ManualTest)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(event.outcome, FailoverOutcome::Failed);
        let failure = event.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ProviderTimeout);
        assert_eq!(failure.failed_phase, FailoverPhase::Provisioning);

        let replacement = event.replacement.unwrap().handle.id;
        assert!(!cloud.is_alive(&replacement).await);
        assert_eq!(
            orchestrator.standbys.get(&id).await.unwrap().sync_state,
            SyncState::FailoverActive
        );
        assert_eq!(
            orchestrator.instances.get(&id).await.unwrap().status,
            InstanceStatus::Degraded
        );
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_reenters_recorded_phase() {
        let (cloud, orchestrator, id) = setup(StrategyKind::Snapshot).await;
        let instance = orchestrator.instances.get(&id).await.unwrap();
        orchestrator.snapshots.create(&instance.handle(), None).await.unwrap();

        // What a crash during searching_gpu leaves in the journal
        let event = FailoverEvent::open(id.clone(), TriggerReason::Preemption, Utc::now());
        let event_id = event.id;
        orchestrator.history.open_event(event).await.unwrap();
        orchestrator
            .history
            .enter_phase(event_id, FailoverPhase::GpuLost, Utc::now())
            .await
            .unwrap();
        orchestrator
            .history
            .enter_phase(event_id, FailoverPhase::SearchingGpu, Utc::now())
            .await
            .unwrap();
        cloud.preempt(&id).await;

        let handles = orchestrator.coordinator.resume_incomplete().await;
        assert_eq!(handles.len(), 1);
        let event = handles.into_iter().next().unwrap().unwrap().wait().await.unwrap();

        assert_eq!(event.id, event_id);
        assert_eq!(event.outcome, FailoverOutcome::Success);
        let searching = event
            .phases
            .iter()
            .filter(|p| p.phase == FailoverPhase::SearchingGpu)
            .count();
        assert_eq!(searching, 1);
        assert_eq!(event.bytes_restored, 7);
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_retire_does_not_undo_completed_failover() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_capacity(Backend::SpotGpu, "RTX_4090", "eu-west-1", 1.40, 1).await;
        let config = OrchestratorConfig::fast().with_overall_timeout(Duration::from_secs(2));
        let (orchestrator, id) = protect_on(&cloud, config, StrategyKind::Disabled, StrategyParams::default()).await;
        cloud.set_destroy_latency(Duration::from_secs(5)).await;

        let event = orchestrator
            .trigger(&id, TriggerReason::ManualTest)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(event.outcome, FailoverOutcome::Success);
        let replacement = event.replacement.unwrap().handle.id;
        assert!(cloud.is_alive(&replacement).await);
        assert_eq!(
            orchestrator.instances.get(&replacement).await.unwrap().status,
            InstanceStatus::Online
        );
        assert!(orchestrator.instances.get(&id).await.is_err());

        // the lost GPU is retired once the slow destroy returns
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cloud.destroyed().await, vec![id.clone()]);
        assert!(cloud.is_alive(&replacement).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout_aborts_and_destroys_replacement() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_capacity(Backend::SpotGpu, "RTX_4090", "eu-west-1", 1.40, 1).await;
        let config = OrchestratorConfig::fast()
            .with_overall_timeout(Duration::from_secs(2))
            .with_provisioning_timeout(Duration::from_secs(30));
        let (orchestrator, id) = protect_on(&cloud, config, StrategyKind::Disabled, StrategyParams::default()).await;
        cloud.set_never_online(true).await;

        let started = tokio::time::Instant::now();
        let event = orchestrator
            .trigger(&id, TriggerReason::ManualTest)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));

        assert_eq!(event.outcome, FailoverOutcome::Failed);
        let failure = event.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ProviderTimeout);
        assert_eq!(failure.failed_phase, FailoverPhase::Provisioning);
        let replacement = event.replacement.unwrap().handle.id;
        assert!(!cloud.is_alive(&replacement).await);
        assert_eq!(
            orchestrator.instances.get(&id).await.unwrap().status,
            InstanceStatus::Offline
        );
        assert!(!orchestrator.coordinator.is_active(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_answered_after_timeout_is_destroyed() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_capacity(Backend::SpotGpu, "RTX_4090", "eu-west-1", 1.40, 1).await;
        let config = OrchestratorConfig::fast().with_provisioning_timeout(Duration::from_secs(1));
        let (orchestrator, id) = protect_on(&cloud, config, StrategyKind::Disabled, StrategyParams::default()).await;
        cloud.set_provision_latency(Duration::from_secs(3)).await;

        let event = orchestrator
            .trigger(&id, TriggerReason::ManualTest)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(event.outcome, FailoverOutcome::Failed);
        assert_eq!(event.failure.unwrap().kind, FailureKind::ProviderTimeout);
        assert!(event.replacement.is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let running: Vec<InstanceId> = cloud.running(Backend::SpotGpu).await.into_iter().map(|h| h.id).collect();
        assert_eq!(running, vec![id.clone()]);
        assert_eq!(cloud.destroyed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_strategy_switch_refused_while_failover_holds_standby() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_capacity(Backend::ReliableCpu, "cpu-4", "eu-west-1", 0.08, 1).await;
        cloud.add_capacity(Backend::SpotGpu, "RTX_4090", "eu-west-1", 1.40, 1).await;
        let config = OrchestratorConfig::fast().with_provisioning_timeout(Duration::from_secs(1));
        let (orchestrator, id) = protect_on(&cloud, config, StrategyKind::CpuStandby, StrategyParams::default()).await;
        wait_standby_ready(&orchestrator, &id).await;
        cloud.set_never_online(true).await;

        let handle = orchestrator.trigger(&id, TriggerReason::ManualTest).await.unwrap();
        let mut phases = handle.watch_phase();
        phases
            .wait_for(|p| *p >= FailoverPhase::Provisioning)
            .await
            .unwrap();

        let err = orchestrator.strategies.disable(&id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
        let association = orchestrator.standbys.get(&id).await.unwrap();
        assert!(cloud.is_alive(&association.standby.id).await);
        assert_eq!(association.sync_state, SyncState::FailoverActive);

        let event = handle.wait().await.unwrap();
        assert_eq!(event.outcome, FailoverOutcome::Failed);
        assert_eq!(
            orchestrator.instances.get(&id).await.unwrap().status,
            InstanceStatus::Degraded
        );

        // once the run is over the switch goes through
        orchestrator.strategies.disable(&id).await.unwrap();
        assert!(!cloud.is_alive(&association.standby.id).await);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_standby_not_created_under_running_failover() {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.add_capacity(Backend::ReliableCpu, "cpu-4", "eu-west-1", 0.08, 1).await;
        cloud.add_capacity(Backend::SpotGpu, "RTX_4090", "eu-west-1", 1.40, 1).await;
        let config = OrchestratorConfig::fast().with_provisioning_timeout(Duration::from_secs(1));
        let (orchestrator, id) = protect_on(&cloud, config, StrategyKind::Disabled, StrategyParams::default()).await;
        cloud.set_never_online(true).await;

        let handle = orchestrator.trigger(&id, TriggerReason::ManualTest).await.unwrap();
        let mut phases = handle.watch_phase();
        phases
            .wait_for(|p| *p >= FailoverPhase::GpuLost)
            .await
            .unwrap();

        let err = orchestrator
            .strategies
            .apply(FailoverStrategyConfig::new(id.clone(), StrategyKind::CpuStandby))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
        assert!(cloud.running(Backend::ReliableCpu).await.is_empty());
        assert!(orchestrator.standbys.get(&id).await.is_none());

        assert_eq!(handle.wait().await.unwrap().outcome, FailoverOutcome::Failed);
        assert_eq!(orchestrator.strategies.current(&id).await.strategy, StrategyKind::Disabled);
    }

    #[tokio::test]
    async fn test_regional_volume_replacement_regions() {
        let (_cloud, orchestrator, _id) = setup(StrategyKind::Disabled).await;
        let config = OrchestratorConfig::fast().with_fallback_regions(vec!["eu-west-2".into(), "eu-central-1".into()]);
        let coordinator = FailoverCoordinator::new(orchestrator.failover_context(), config);
        let instance = ProtectedInstance::new("gpu-1", "RTX_4090", 1.50, "eu-west-1", "alice");

        let mut params = StrategyParams::default();
        params.target_zone = Some("eu-central-1a".into());
        let regional = FailoverStrategyConfig::new(instance.id.clone(), StrategyKind::RegionalVolume).with_params(params.clone());
        assert_eq!(coordinator.replacement_regions(&instance, &regional), vec!["eu-central-1".to_string()]);

        params.allow_cross_region = true;
        let regional = FailoverStrategyConfig::new(instance.id.clone(), StrategyKind::RegionalVolume).with_params(params);
        assert_eq!(
            coordinator.replacement_regions(&instance, &regional),
            vec!["eu-central-1".to_string(), "eu-west-2".to_string()]
        );

        let snapshot = FailoverStrategyConfig::new(instance.id.clone(), StrategyKind::Snapshot);
        assert_eq!(
            coordinator.replacement_regions(&instance, &snapshot),
            vec!["eu-west-1".to_string(), "eu-west-2".to_string(), "eu-central-1".to_string()]
        );
    }

    /// Fail over a regional_volume instance whose volume sits in eu-central-1
    async fn regional_failover(capacity: &[(&str, f64)], allow_cross_region: bool) -> (Arc<SimulatedCloud>, FailoverEvent) {
        let cloud = Arc::new(SimulatedCloud::new());
        for (region, price) in capacity {
            cloud.add_capacity(Backend::SpotGpu, "RTX_4090", region, *price, 1).await;
        }
        let config = OrchestratorConfig::fast().with_fallback_regions(vec!["eu-west-2".into()]);
        let mut params = StrategyParams::default();
        params.target_zone = Some("eu-central-1a".into());
        params.allow_cross_region = allow_cross_region;
        let (orchestrator, id) = protect_on(&cloud, config, StrategyKind::RegionalVolume, params).await;
        let instance = orchestrator.instances.get(&id).await.unwrap();
        orchestrator.snapshots.create(&instance.handle(), None).await.unwrap();

        let event = orchestrator
            .trigger(&id, TriggerReason::ManualTest)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        orchestrator.shutdown().await;
        (cloud, event)
    }

    #[tokio::test]
    async fn test_regional_volume_failover_stays_in_volume_region() {
        // cheaper capacity next to the lost GPU is outside the volume's region
        let (_cloud, event) = regional_failover(&[("eu-west-1", 1.10), ("eu-central-1", 1.30)], false).await;
        assert_eq!(event.outcome, FailoverOutcome::Success);
        assert_eq!(event.replacement.unwrap().handle.region, "eu-central-1");
        assert_eq!(event.bytes_restored, 7);
    }

    #[tokio::test]
    async fn test_regional_volume_cross_region_needs_opt_in() {
        let capacity = [("eu-west-1", 1.10), ("eu-west-2", 1.20)];

        let (cloud, event) = regional_failover(&capacity, false).await;
        assert_eq!(event.outcome, FailoverOutcome::Failed);
        let failure = event.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::NoCapacityAvailable);
        assert_eq!(failure.failed_phase, FailoverPhase::SearchingGpu);
        assert!(cloud.destroyed().await.is_empty());

        let (_cloud, event) = regional_failover(&capacity, true).await;
        assert_eq!(event.outcome, FailoverOutcome::Success);
        assert_eq!(event.replacement.unwrap().handle.region, "eu-west-2");
    }

    #[tokio::test]
    async fn test_warm_pool_prefers_reserved_replacement() {
        let cloud = Arc::new(SimulatedCloud::new());
        // one reserved GPU for the standby, one for the replacement
        cloud.add_capacity(Backend::ReservedGpu, "RTX_4090", "eu-west-1", 1.45, 2).await;
        cloud.add_capacity(Backend::SpotGpu, "RTX_4090", "eu-west-1", 0.90, 1).await;
        let (orchestrator, id) =
            protect_on(&cloud, OrchestratorConfig::fast(), StrategyKind::WarmPool, StrategyParams::default()).await;
        wait_standby_ready(&orchestrator, &id).await;
        let standby = orchestrator.standbys.get(&id).await.unwrap().standby;
        assert_eq!(standby.backend, Backend::ReservedGpu);

        let event = orchestrator
            .trigger(&id, TriggerReason::ManualTest)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(event.outcome, FailoverOutcome::Success);
        assert!(event.phases.iter().any(|p| p.phase == FailoverPhase::FailoverToCpu));
        let replacement = event.replacement.unwrap();
        assert_eq!(replacement.handle.backend, Backend::ReservedGpu);
        assert_eq!(replacement.hourly_price, 1.45);

        // the same standby now protects the replacement
        let association = orchestrator.standbys.get(&replacement.handle.id).await.unwrap();
        assert_eq!(association.standby.id, standby.id);
        orchestrator.shutdown().await;
    }
}
