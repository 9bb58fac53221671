//! Protected instance registry
//!
//! Tracks the GPU instances under failover protection. A recovery retires
//! the lost instance's id and registers the replacement under a new id.

use crate::error::{OrchestratorError, Result};
use phoenix_core::{InstanceHandle, InstanceId, InstanceStatus, ProtectedInstance};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Registry of protected instances
#[derive(Debug, Clone, Default)]
pub struct InstanceRegistry {
    instances: Arc<RwLock<HashMap<InstanceId, ProtectedInstance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) an instance
    pub async fn register(&self, instance: ProtectedInstance) {
        info!(
            instance_id = %instance.id,
            gpu_class = %instance.gpu_class,
            hourly_price = instance.hourly_price,
            region = %instance.region,
            "Registered protected instance"
        );
        self.instances.write().await.insert(instance.id.clone(), instance);
    }

    pub async fn get(&self, id: &InstanceId) -> Result<ProtectedInstance> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.clone()))
    }

    pub async fn list(&self) -> Vec<ProtectedInstance> {
        let mut all: Vec<_> = self.instances.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn set_status(&self, id: &InstanceId, status: InstanceStatus) -> Result<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.clone()))?;
        if instance.status != status {
            info!(instance_id = %id, from = %instance.status, to = %status, "Instance status changed");
            instance.status = status;
        }
        Ok(())
    }

    /// Retire `old` and register its replacement, keeping class, enrolled price and owner
    pub async fn replace(&self, old: &InstanceId, replacement: &InstanceHandle) -> Result<ProtectedInstance> {
        let mut instances = self.instances.write().await;
        let previous = instances
            .remove(old)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(old.clone()))?;

        let new_instance = ProtectedInstance {
            id: replacement.id.clone(),
            status: InstanceStatus::Online,
            gpu_class: previous.gpu_class,
            hourly_price: previous.hourly_price,
            region: replacement.region.clone(),
            owner: previous.owner,
            address: replacement.address.clone(),
            created_at: chrono::Utc::now(),
        };
        instances.insert(new_instance.id.clone(), new_instance.clone());

        info!(old = %old, new = %new_instance.id, "Retired instance and registered replacement");
        Ok(new_instance)
    }

    pub async fn remove(&self, id: &InstanceId) -> Result<ProtectedInstance> {
        self.instances
            .write()
            .await
            .remove(id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_core::Backend;

    #[tokio::test]
    async fn test_replace_retires_old_id() {
        let registry = InstanceRegistry::new();
        registry
            .register(ProtectedInstance::new("gpu-1", "RTX_4090", 1.50, "eu-west-1", "alice"))
            .await;

        let replacement = InstanceHandle {
            id: InstanceId::new("gpu-2"),
            backend: Backend::SpotGpu,
            region: "eu-west-2".into(),
            address: Some("10.0.0.7".into()),
        };
        let new = registry
            .replace(&InstanceId::new("gpu-1"), &replacement)
            .await
            .unwrap();

        assert_eq!(new.gpu_class, "RTX_4090");
        assert_eq!(new.hourly_price, 1.50);
        assert_eq!(new.owner, "alice");
        assert_eq!(new.region, "eu-west-2");
        assert_eq!(new.status, InstanceStatus::Online);
        assert!(registry.get(&InstanceId::new("gpu-1")).await.is_err());
        assert_eq!(registry.list().await.len(), 1);

        // A second replacement is still priced against the enrolled price
        let again = InstanceHandle {
            id: InstanceId::new("gpu-3"),
            ..replacement
        };
        let third = registry.replace(&InstanceId::new("gpu-2"), &again).await.unwrap();
        assert_eq!(third.hourly_price, 1.50);
    }

    #[test]
    fn test_set_status_unknown_instance() {
        let registry = InstanceRegistry::new();
        let err = tokio_test::block_on(registry.set_status(&InstanceId::new("nope"), InstanceStatus::Offline))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InstanceNotFound(_)));
    }
}
