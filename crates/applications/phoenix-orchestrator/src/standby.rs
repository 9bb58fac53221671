//! Standby associations and their ownership
//!
//! An association's sync state is mutated by exactly one party at a time:
//!
//! ```text
//!   SyncEngine ──acquire_for_failover──▶ Failover(event)
//!        ▲                                    │
//!        └──────── release_after_failover ────┘
//! ```
//!
//! While a failover holds an association the sync engine's updates are
//! refused, and the association stays `failover_active` after a failed
//! recovery so the standby keeps serving.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use phoenix_core::{InstanceHandle, InstanceId, StandbyAssociation, SyncState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Who may currently mutate an association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    SyncEngine,
    Failover(Uuid),
}

/// How a failover ended, from the association's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Recovery completed; the association now protects `new_instance`
    Recovered { new_instance: InstanceId },
    /// Recovery failed; the standby keeps serving
    Failed,
}

#[derive(Debug, Clone)]
struct Entry {
    association: StandbyAssociation,
    controller: Controller,
}

/// Registry of standby associations, one per protected instance
#[derive(Debug, Clone, Default)]
pub struct StandbyRegistry {
    entries: Arc<RwLock<HashMap<InstanceId, Entry>>>,
}

impl StandbyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the association for `instance_id` in `provisioning`
    pub async fn create(
        &self,
        instance_id: &InstanceId,
        standby: InstanceHandle,
        hourly_price: f64,
    ) -> Result<StandbyAssociation> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(instance_id) {
            return Err(OrchestratorError::config(format!(
                "instance {} already has standby association {}",
                instance_id, existing.association.id
            )));
        }

        let association = StandbyAssociation {
            id: format!("assoc-{}", Uuid::new_v4().simple()),
            instance_id: instance_id.clone(),
            standby,
            sync_state: SyncState::Provisioning,
            last_sync_at: None,
            sync_count: 0,
            hourly_price,
            consecutive_failures: 0,
        };
        info!(
            instance_id = %instance_id,
            association = %association.id,
            standby = %association.standby.id,
            "Standby association created"
        );
        entries.insert(
            instance_id.clone(),
            Entry {
                association: association.clone(),
                controller: Controller::SyncEngine,
            },
        );
        Ok(association)
    }

    /// Insert a fully-formed association (restoring state, tests)
    pub async fn insert(&self, association: StandbyAssociation) {
        self.entries.write().await.insert(
            association.instance_id.clone(),
            Entry {
                association,
                controller: Controller::SyncEngine,
            },
        );
    }

    pub async fn get(&self, instance_id: &InstanceId) -> Option<StandbyAssociation> {
        self.entries
            .read()
            .await
            .get(instance_id)
            .map(|e| e.association.clone())
    }

    pub async fn controller(&self, instance_id: &InstanceId) -> Option<Controller> {
        self.entries.read().await.get(instance_id).map(|e| e.controller)
    }

    pub async fn list(&self) -> Vec<StandbyAssociation> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.association.clone())
            .collect()
    }

    /// Sync-engine state change; refused (`Ok(false)`) under failover control
    pub async fn set_state_by_sync(&self, instance_id: &InstanceId, state: SyncState) -> Result<bool> {
        if state == SyncState::FailoverActive {
            return Err(OrchestratorError::Internal(
                "sync engine cannot activate failover".into(),
            ));
        }
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(instance_id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.clone()))?;
        if entry.controller != Controller::SyncEngine
            || entry.association.sync_state == SyncState::FailoverActive
        {
            return Ok(false);
        }
        entry.association.sync_state = state;
        Ok(true)
    }

    /// Record a successful cycle; `syncing`/`degraded` become `ready`
    pub async fn record_sync_success(&self, instance_id: &InstanceId, at: DateTime<Utc>) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(instance_id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.clone()))?;
        if entry.controller != Controller::SyncEngine {
            return Ok(false);
        }
        let assoc = &mut entry.association;
        match assoc.sync_state {
            SyncState::Syncing | SyncState::Ready | SyncState::Degraded => {}
            _ => return Ok(false),
        }
        if assoc.sync_state != SyncState::Ready {
            info!(instance_id = %instance_id, from = %assoc.sync_state, "Standby is ready");
        }
        assoc.sync_state = SyncState::Ready;
        assoc.sync_count += 1;
        assoc.last_sync_at = Some(at);
        assoc.consecutive_failures = 0;
        Ok(true)
    }

    /// Record a failed cycle. Returns the failure count when this failure
    /// crossed `threshold` and the association was marked degraded.
    pub async fn record_sync_failure(&self, instance_id: &InstanceId, threshold: u32) -> Result<Option<u32>> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(instance_id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.clone()))?;
        if entry.controller != Controller::SyncEngine {
            return Ok(None);
        }
        let assoc = &mut entry.association;
        assoc.consecutive_failures += 1;
        if assoc.consecutive_failures >= threshold
            && matches!(assoc.sync_state, SyncState::Syncing | SyncState::Ready)
        {
            warn!(
                instance_id = %instance_id,
                failures = assoc.consecutive_failures,
                "Standby sync degraded"
            );
            assoc.sync_state = SyncState::Degraded;
            return Ok(Some(assoc.consecutive_failures));
        }
        Ok(None)
    }

    /// Take exclusive control for a failover and mark `failover_active`.
    ///
    /// Accepts `ready` associations, and `failover_active` ones left by an
    /// earlier failed attempt (the standby is still serving).
    pub async fn acquire_for_failover(&self, instance_id: &InstanceId, event_id: Uuid) -> Result<StandbyAssociation> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(instance_id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.clone()))?;

        match entry.controller {
            Controller::Failover(owner) if owner != event_id => {
                return Err(OrchestratorError::Internal(format!(
                    "association of {} held by failover {}",
                    instance_id, owner
                )));
            }
            _ => {}
        }
        if !matches!(
            entry.association.sync_state,
            SyncState::Ready | SyncState::FailoverActive
        ) {
            return Err(OrchestratorError::Internal(format!(
                "association of {} is {}, not ready",
                instance_id, entry.association.sync_state
            )));
        }

        entry.controller = Controller::Failover(event_id);
        entry.association.sync_state = SyncState::FailoverActive;
        info!(instance_id = %instance_id, event = %event_id, "Standby taken over by failover");
        Ok(entry.association.clone())
    }

    /// Hand control back to the sync engine
    pub async fn release_after_failover(
        &self,
        instance_id: &InstanceId,
        event_id: Uuid,
        release: Release,
    ) -> Result<Option<StandbyAssociation>> {
        let mut entries = self.entries.write().await;
        match entries.get(instance_id).map(|e| e.controller) {
            Some(Controller::Failover(owner)) if owner == event_id => {}
            Some(_) => return Ok(None),
            None => return Ok(None),
        }

        match release {
            Release::Failed => {
                let entry = entries
                    .get_mut(instance_id)
                    .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.clone()))?;
                entry.controller = Controller::SyncEngine;
                info!(instance_id = %instance_id, "Standby released after failed recovery; still serving");
                Ok(Some(entry.association.clone()))
            }
            Release::Recovered { new_instance } => {
                let mut entry = entries
                    .remove(instance_id)
                    .ok_or_else(|| OrchestratorError::InstanceNotFound(instance_id.clone()))?;
                entry.controller = Controller::SyncEngine;
                entry.association.instance_id = new_instance.clone();
                entry.association.sync_state = SyncState::Ready;
                entry.association.consecutive_failures = 0;
                let assoc = entry.association.clone();
                entries.insert(new_instance.clone(), entry);
                info!(old = %instance_id, new = %new_instance, "Standby re-associated with replacement");
                Ok(Some(assoc))
            }
        }
    }

    pub async fn remove(&self, instance_id: &InstanceId) -> Option<StandbyAssociation> {
        self.entries
            .write()
            .await
            .remove(instance_id)
            .map(|e| e.association)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_core::Backend;

    fn cpu_handle() -> InstanceHandle {
        InstanceHandle {
            id: InstanceId::new("cpu-1"),
            backend: Backend::ReliableCpu,
            region: "eu-west-1".into(),
            address: None,
        }
    }

    async fn ready_registry() -> (StandbyRegistry, InstanceId) {
        let registry = StandbyRegistry::new();
        let id = InstanceId::new("gpu-1");
        registry.create(&id, cpu_handle(), 0.08).await.unwrap();
        registry.set_state_by_sync(&id, SyncState::Syncing).await.unwrap();
        registry.record_sync_success(&id, Utc::now()).await.unwrap();
        (registry, id)
    }

    #[tokio::test]
    async fn test_first_sync_makes_ready() {
        let (registry, id) = ready_registry().await;
        let assoc = registry.get(&id).await.unwrap();
        assert_eq!(assoc.sync_state, SyncState::Ready);
        assert_eq!(assoc.sync_count, 1);
        assert!(assoc.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_only_one_association_per_instance() {
        let (registry, id) = ready_registry().await;
        assert!(registry.create(&id, cpu_handle(), 0.08).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_updates_refused_during_failover() {
        let (registry, id) = ready_registry().await;
        let event = Uuid::new_v4();
        registry.acquire_for_failover(&id, event).await.unwrap();

        assert!(!registry.record_sync_success(&id, Utc::now()).await.unwrap());
        assert!(!registry.set_state_by_sync(&id, SyncState::Syncing).await.unwrap());
        assert_eq!(registry.record_sync_failure(&id, 1).await.unwrap(), None);
        assert_eq!(registry.get(&id).await.unwrap().sync_count, 1);

        // a second failover cannot grab it
        assert!(registry.acquire_for_failover(&id, Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_release_keeps_failover_active() {
        let (registry, id) = ready_registry().await;
        let event = Uuid::new_v4();
        registry.acquire_for_failover(&id, event).await.unwrap();
        registry
            .release_after_failover(&id, event, Release::Failed)
            .await
            .unwrap();

        let assoc = registry.get(&id).await.unwrap();
        assert_eq!(assoc.sync_state, SyncState::FailoverActive);
        assert_eq!(registry.controller(&id).await, Some(Controller::SyncEngine));
        // the sync engine still leaves it alone
        assert!(!registry.record_sync_success(&id, Utc::now()).await.unwrap());
        // and a retry may take it again
        assert!(registry.acquire_for_failover(&id, Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_recovered_release_rekeys_to_replacement() {
        let (registry, id) = ready_registry().await;
        let event = Uuid::new_v4();
        registry.acquire_for_failover(&id, event).await.unwrap();
        let assoc = registry
            .release_after_failover(
                &id,
                event,
                Release::Recovered {
                    new_instance: InstanceId::new("gpu-2"),
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(assoc.sync_state, SyncState::Ready);
        assert!(registry.get(&id).await.is_none());
        assert_eq!(
            registry.get(&InstanceId::new("gpu-2")).await.unwrap().id,
            assoc.id
        );
    }

    #[tokio::test]
    async fn test_degraded_after_threshold() {
        let (registry, id) = ready_registry().await;
        assert_eq!(registry.record_sync_failure(&id, 3).await.unwrap(), None);
        assert_eq!(registry.record_sync_failure(&id, 3).await.unwrap(), None);
        assert_eq!(registry.record_sync_failure(&id, 3).await.unwrap(), Some(3));
        assert_eq!(registry.get(&id).await.unwrap().sync_state, SyncState::Degraded);
        // no repeated notification
        assert_eq!(registry.record_sync_failure(&id, 3).await.unwrap(), None);

        registry.record_sync_success(&id, Utc::now()).await.unwrap();
        let assoc = registry.get(&id).await.unwrap();
        assert_eq!(assoc.sync_state, SyncState::Ready);
        assert_eq!(assoc.consecutive_failures, 0);
    }
}
