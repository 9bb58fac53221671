//! Health monitoring of protected instances
//!
//! Polls `ComputeProvider::health` for every `online` protected instance
//! and raises a [`LossSignal`] the first time a probe fails after a healthy
//! one. The signal only means "the GPU may be gone": the failover state
//! machine confirms loss itself in `detecting`.
//!
//! ```text
//! online ──probe fails──▶ suspected (signal) ──probe ok──▶ online
//!                              │
//!                              └── further failures: no new signal
//! ```

use crate::instance::InstanceRegistry;
use chrono::{DateTime, Utc};
use futures::Stream;
use phoenix_core::{ComputeProvider, HostHealth, InstanceId, InstanceStatus, ProtectedInstance};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

/// A protected instance stopped answering health probes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossSignal {
    pub instance_id: InstanceId,
    pub observed_at: DateTime<Utc>,
}

/// Health prober over the instance registry
#[derive(Clone)]
pub struct HealthMonitor {
    compute: Arc<dyn ComputeProvider>,
    instances: InstanceRegistry,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(compute: Arc<dyn ComputeProvider>, instances: InstanceRegistry) -> Self {
        Self::with_interval(compute, instances, Duration::from_secs(5))
    }

    pub fn with_interval(compute: Arc<dyn ComputeProvider>, instances: InstanceRegistry, interval: Duration) -> Self {
        Self {
            compute,
            instances,
            interval,
        }
    }

    /// Probe one instance; provider errors count as unreachable
    pub async fn check_once(&self, instance: &ProtectedInstance) -> HostHealth {
        match self.compute.health(&instance.handle()).await {
            Ok(health) => health,
            Err(e) => {
                debug!(instance_id = %instance.id, error = %e, "Health probe failed");
                HostHealth::Unreachable
            }
        }
    }

    /// Stream of loss signals, polling every interval
    pub fn loss_stream(&self) -> Pin<Box<dyn Stream<Item = LossSignal> + Send>> {
        let monitor = self.clone();

        Box::pin(async_stream::stream! {
            let mut ticker = interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut suspected: HashSet<InstanceId> = HashSet::new();

            loop {
                ticker.tick().await;

                let watched: Vec<ProtectedInstance> = monitor
                    .instances
                    .list()
                    .await
                    .into_iter()
                    .filter(|i| i.status == InstanceStatus::Online)
                    .collect();
                suspected.retain(|id| watched.iter().any(|i| &i.id == id));

                for instance in watched {
                    match monitor.check_once(&instance).await {
                        HostHealth::Online => {
                            if suspected.remove(&instance.id) {
                                debug!(instance_id = %instance.id, "Instance answering again");
                            }
                        }
                        HostHealth::Unreachable => {
                            if suspected.insert(instance.id.clone()) {
                                warn!(instance_id = %instance.id, "Health probe failed, loss suspected");
                                yield LossSignal {
                                    instance_id: instance.id.clone(),
                                    observed_at: Utc::now(),
                                };
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCloud;
    use futures::StreamExt;
    use phoenix_core::Backend;

    #[tokio::test]
    async fn test_signal_once_per_loss() {
        let cloud = Arc::new(SimulatedCloud::new());
        let handle = cloud.launch_existing("gpu-1", Backend::SpotGpu, "eu-west-1").await;
        cloud.launch_existing("gpu-2", Backend::SpotGpu, "eu-west-1").await;

        let instances = InstanceRegistry::new();
        instances
            .register(ProtectedInstance::new("gpu-1", "RTX_4090", 1.5, "eu-west-1", "alice"))
            .await;
        instances
            .register(ProtectedInstance::new("gpu-2", "RTX_4090", 1.5, "eu-west-1", "bob"))
            .await;

        let monitor = HealthMonitor::with_interval(cloud.clone(), instances.clone(), Duration::from_millis(10));
        let mut stream = monitor.loss_stream();

        cloud.preempt(&handle.id).await;
        let signal = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.instance_id, handle.id);

        // still down: no second signal
        let again = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(again.is_err());

        // back up, then down again: signalled again
        cloud.set_health(&handle.id, HostHealth::Online).await;
        let quiet = tokio::time::timeout(Duration::from_millis(60), stream.next()).await;
        assert!(quiet.is_err());
        cloud.preempt(&handle.id).await;
        let signal = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.instance_id, handle.id);
    }

    #[tokio::test]
    async fn test_instances_under_failover_are_skipped() {
        let cloud = Arc::new(SimulatedCloud::new());
        let handle = cloud.launch_existing("gpu-1", Backend::SpotGpu, "eu-west-1").await;
        let instances = InstanceRegistry::new();
        instances
            .register(ProtectedInstance::new("gpu-1", "RTX_4090", 1.5, "eu-west-1", "alice"))
            .await;
        instances
            .set_status(&handle.id, InstanceStatus::FailingOver)
            .await
            .unwrap();

        let monitor = HealthMonitor::with_interval(cloud.clone(), instances, Duration::from_millis(10));
        let mut stream = monitor.loss_stream();
        cloud.preempt(&handle.id).await;

        let next = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(next.is_err());
    }
}
