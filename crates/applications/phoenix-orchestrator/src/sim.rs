//! Simulated compute provider
//!
//! An in-process cloud used by tests and the `phoenix simulate` command.
//! Capacity is declared as pools; every instance carries a
//! [`MemoryWorkspace`] as its data directory.
//!
//! Failure injection:
//! - `preempt` / `set_health`: an instance stops answering
//! - `set_provision_delay`: new instances stay unreachable for N health polls
//! - `set_search_blackout`: the next N searches find nothing
//! - `set_fail_provision`: provisioning requests are refused
//! - `set_provision_latency` / `set_destroy_latency`: slow provider calls
//!   (a provisioned host exists before the call returns)

use crate::workspace::MemoryWorkspace;
use async_trait::async_trait;
use phoenix_core::{
    Backend, Candidate, CapacityConstraints, ComputeProvider, HostHealth, InstanceHandle,
    InstanceId, PhoenixError, Result, Workspace,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Capacity offered by the simulated market
#[derive(Debug, Clone)]
struct CapacityPool {
    backend: Backend,
    /// GPU class, or machine class for CPU pools
    class: String,
    region: String,
    hourly_price: f64,
    available: u32,
}

impl CapacityPool {
    fn offer_id(&self, index: usize) -> String {
        format!("{}:{}:{}:{}", self.backend, self.region, self.class, index)
    }

    fn matches(&self, c: &CapacityConstraints) -> bool {
        if self.backend != c.backend || self.available == 0 {
            return false;
        }
        if let Some(max) = c.max_hourly_price {
            if self.hourly_price > max {
                return false;
            }
        }
        if !c.regions.is_empty() && !c.regions.iter().any(|r| r == &self.region) {
            return false;
        }
        let wanted = if self.backend.is_gpu() {
            c.gpu_class.as_deref()
        } else {
            c.machine_class.as_deref()
        };
        wanted.map(|w| w == self.class).unwrap_or(true)
    }
}

#[derive(Debug)]
struct SimInstance {
    handle: InstanceHandle,
    health: HostHealth,
    /// Health polls left before a fresh instance answers
    polls_until_online: u32,
    never_online: bool,
    workspace: Arc<MemoryWorkspace>,
}

#[derive(Debug, Default)]
struct SimState {
    instances: HashMap<InstanceId, SimInstance>,
    pools: Vec<CapacityPool>,
    destroyed: Vec<InstanceId>,
    next_id: u64,
    provision_delay_polls: u32,
    never_online: bool,
    search_blackout: u32,
    fail_provision: bool,
    provision_latency: Duration,
    destroy_latency: Duration,
    searches: u32,
}

/// In-process cloud implementing [`ComputeProvider`]
#[derive(Debug, Default)]
pub struct SimulatedCloud {
    state: Mutex<SimState>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `count` instances of `class` in `region`
    pub async fn add_capacity(
        &self,
        backend: Backend,
        class: &str,
        region: &str,
        hourly_price: f64,
        count: u32,
    ) {
        let mut state = self.state.lock().await;
        state.pools.push(CapacityPool {
            backend,
            class: class.to_string(),
            region: region.to_string(),
            hourly_price,
            available: count,
        });
    }

    /// Register an already running instance (e.g. the protected GPU)
    pub async fn launch_existing(&self, id: &str, backend: Backend, region: &str) -> InstanceHandle {
        let handle = InstanceHandle {
            id: InstanceId::new(id),
            backend,
            region: region.to_string(),
            address: Some(format!("10.0.0.{}", id.len())),
        };
        let mut state = self.state.lock().await;
        state.instances.insert(
            handle.id.clone(),
            SimInstance {
                handle: handle.clone(),
                health: HostHealth::Online,
                polls_until_online: 0,
                never_online: false,
                workspace: MemoryWorkspace::shared(),
            },
        );
        handle
    }

    /// The instance's workspace, for seeding and inspection
    pub async fn memory_workspace(&self, id: &InstanceId) -> Option<Arc<MemoryWorkspace>> {
        self.state
            .lock()
            .await
            .instances
            .get(id)
            .map(|i| Arc::clone(&i.workspace))
    }

    /// Simulate a spot reclaim: the instance stops answering
    pub async fn preempt(&self, id: &InstanceId) {
        info!(instance_id = %id, "Simulated preemption");
        self.set_health(id, HostHealth::Unreachable).await;
    }

    pub async fn set_health(&self, id: &InstanceId, health: HostHealth) {
        if let Some(instance) = self.state.lock().await.instances.get_mut(id) {
            instance.health = health;
        }
    }

    /// New instances answer health probes only after `polls` probes
    pub async fn set_provision_delay(&self, polls: u32) {
        self.state.lock().await.provision_delay_polls = polls;
    }

    /// New instances never become reachable
    pub async fn set_never_online(&self, never: bool) {
        self.state.lock().await.never_online = never;
    }

    /// The next `searches` capacity searches return nothing
    pub async fn set_search_blackout(&self, searches: u32) {
        self.state.lock().await.search_blackout = searches;
    }

    pub async fn set_fail_provision(&self, fail: bool) {
        self.state.lock().await.fail_provision = fail;
    }

    /// `provision` returns this long after the host was created
    pub async fn set_provision_latency(&self, latency: Duration) {
        self.state.lock().await.provision_latency = latency;
    }

    /// `destroy` takes this long before the host is gone
    pub async fn set_destroy_latency(&self, latency: Duration) {
        self.state.lock().await.destroy_latency = latency;
    }

    pub async fn is_alive(&self, id: &InstanceId) -> bool {
        self.state.lock().await.instances.contains_key(id)
    }

    /// Ids destroyed so far, in order
    pub async fn destroyed(&self) -> Vec<InstanceId> {
        self.state.lock().await.destroyed.clone()
    }

    pub async fn search_count(&self) -> u32 {
        self.state.lock().await.searches
    }

    /// Live instances on `backend`
    pub async fn running(&self, backend: Backend) -> Vec<InstanceHandle> {
        let mut handles: Vec<_> = self
            .state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| i.handle.backend == backend)
            .map(|i| i.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    /// Take one unit of capacity and create the host
    async fn create_instance(&self, candidate: &Candidate) -> Result<(InstanceHandle, Duration)> {
        let mut state = self.state.lock().await;
        if state.fail_provision {
            return Err(PhoenixError::provider("simulated provisioning failure"));
        }

        let index = state
            .pools
            .iter()
            .enumerate()
            .position(|(i, pool)| pool.offer_id(i) == candidate.offer_id)
            .ok_or_else(|| PhoenixError::NoCapacity(format!("offer {} withdrawn", candidate.offer_id)))?;
        if state.pools[index].available == 0 {
            return Err(PhoenixError::NoCapacity(format!(
                "offer {} exhausted",
                candidate.offer_id
            )));
        }
        state.pools[index].available -= 1;

        state.next_id += 1;
        let prefix = if candidate.backend.is_gpu() { "gpu" } else { "cpu" };
        let handle = InstanceHandle {
            id: InstanceId::new(format!("sim-{}-{}", prefix, state.next_id)),
            backend: candidate.backend,
            region: candidate.region.clone(),
            address: Some(format!("10.1.{}.{}", state.next_id / 256, state.next_id % 256)),
        };
        let instance = SimInstance {
            handle: handle.clone(),
            health: HostHealth::Online,
            polls_until_online: state.provision_delay_polls,
            never_online: state.never_online,
            workspace: MemoryWorkspace::shared(),
        };
        state.instances.insert(handle.id.clone(), instance);

        info!(
            instance_id = %handle.id,
            backend = %handle.backend,
            region = %handle.region,
            hourly_price = candidate.hourly_price,
            "Simulated instance provisioned"
        );
        Ok((handle, state.provision_latency))
    }
}

#[async_trait]
impl ComputeProvider for SimulatedCloud {
    async fn search(&self, constraints: &CapacityConstraints) -> Result<Vec<Candidate>> {
        let mut state = self.state.lock().await;
        state.searches += 1;
        if state.search_blackout > 0 {
            state.search_blackout -= 1;
            debug!(backend = %constraints.backend, "Simulated search blackout");
            return Ok(Vec::new());
        }

        let mut candidates: Vec<Candidate> = state
            .pools
            .iter()
            .enumerate()
            .filter(|(_, pool)| pool.matches(constraints))
            .map(|(index, pool)| Candidate {
                offer_id: pool.offer_id(index),
                backend: pool.backend,
                gpu_class: pool.backend.is_gpu().then(|| pool.class.clone()),
                region: pool.region.clone(),
                hourly_price: pool.hourly_price,
            })
            .collect();
        candidates.sort_by(|a, b| a.hourly_price.total_cmp(&b.hourly_price));
        Ok(candidates)
    }

    async fn provision(&self, candidate: &Candidate) -> Result<InstanceHandle> {
        let (handle, latency) = self.create_instance(candidate).await?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(handle)
    }

    async fn destroy(&self, handle: &InstanceHandle) -> Result<()> {
        let latency = self.state.lock().await.destroy_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock().await;
        if state.instances.remove(&handle.id).is_none() {
            return Err(PhoenixError::InstanceNotFound(handle.id.to_string()));
        }
        state.destroyed.push(handle.id.clone());
        info!(instance_id = %handle.id, "Simulated instance destroyed");
        Ok(())
    }

    async fn health(&self, handle: &InstanceHandle) -> Result<HostHealth> {
        let mut state = self.state.lock().await;
        let Some(instance) = state.instances.get_mut(&handle.id) else {
            return Ok(HostHealth::Unreachable);
        };
        if instance.never_online {
            return Ok(HostHealth::Unreachable);
        }
        if instance.polls_until_online > 0 {
            instance.polls_until_online -= 1;
            return Ok(HostHealth::Unreachable);
        }
        Ok(instance.health)
    }

    async fn workspace(&self, handle: &InstanceHandle) -> Result<Arc<dyn Workspace>> {
        let state = self.state.lock().await;
        let instance = state
            .instances
            .get(&handle.id)
            .ok_or_else(|| PhoenixError::InstanceNotFound(handle.id.to_string()))?;
        if instance.health == HostHealth::Unreachable {
            return Err(PhoenixError::provider(format!("{} is unreachable", handle.id)));
        }
        Ok(Arc::clone(&instance.workspace) as Arc<dyn Workspace>)
    }
}
