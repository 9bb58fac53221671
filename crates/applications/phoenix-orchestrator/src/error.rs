//! Error types for the orchestrator

use phoenix_core::{FailoverPhase, FailureKind, InstanceId, PhoenixError};
use std::time::Duration;
use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur in the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Loss could not be confirmed (a probe succeeded again)
    #[error("Detection ambiguous for {0}: primary answered a health probe")]
    DetectionAmbiguous(InstanceId),

    /// No replacement capacity after the bounded search
    #[error("No capacity available: {0}")]
    NoCapacityAvailable(String),

    /// Provider did not answer (or the instance did not come up) in time
    #[error("Provider timed out after {0:?}: {1}")]
    ProviderTimeout(Duration, String),

    /// A synchronization cycle failed
    #[error("Sync transfer failed: {0}")]
    SyncTransferFailure(String),

    /// Snapshot could not be created
    #[error("Snapshot create failed: {0}")]
    SnapshotCreateFailure(String),

    /// Snapshot (or live copy) could not be restored
    #[error("Snapshot restore failed: {0}")]
    SnapshotRestoreFailure(String),

    /// A failover is already running for this instance; the trigger is not queued
    #[error("Failover already active for {instance_id} (phase {phase})")]
    ConcurrentFailoverRejected {
        instance_id: InstanceId,
        phase: FailoverPhase,
    },

    /// Phase timed out
    #[error("Phase {0} timed out after {1:?}")]
    PhaseTimeout(FailoverPhase, Duration),

    /// Failover cancelled before it started mutating state
    #[error("Failover cancelled for {0}")]
    Cancelled(InstanceId),

    /// Provider / storage boundary error
    #[error("Provider error: {0}")]
    Provider(#[from] PhoenixError),

    /// S3 error
    #[error("S3 error: {0}")]
    S3(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Instance not found
    #[error("Instance {0} not found")]
    InstanceNotFound(InstanceId),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invariant violation inside the orchestrator
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a sync transfer error
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::SyncTransferFailure(msg.into())
    }

    /// Create a snapshot creation error
    pub fn snapshot_create(msg: impl Into<String>) -> Self {
        Self::SnapshotCreateFailure(msg.into())
    }

    /// Create a snapshot restore error
    pub fn snapshot_restore(msg: impl Into<String>) -> Self {
        Self::SnapshotRestoreFailure(msg.into())
    }

    /// Convert from generic AWS SDK error
    pub fn from_aws<E>(err: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::S3(err.to_string())
    }

    /// Machine-readable kind, recorded on failed failover events
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DetectionAmbiguous(_) => FailureKind::DetectionAmbiguous,
            Self::NoCapacityAvailable(_) => FailureKind::NoCapacityAvailable,
            Self::ProviderTimeout(..) | Self::PhaseTimeout(..) => FailureKind::ProviderTimeout,
            Self::SyncTransferFailure(_) => FailureKind::SyncTransferFailure,
            Self::SnapshotCreateFailure(_) => FailureKind::SnapshotCreateFailure,
            Self::SnapshotRestoreFailure(_) => FailureKind::SnapshotRestoreFailure,
            Self::ConcurrentFailoverRejected { .. } => FailureKind::ConcurrentFailoverRejected,
            Self::Cancelled(_) => FailureKind::Cancelled,
            Self::Provider(PhoenixError::NoCapacity(_)) => FailureKind::NoCapacityAvailable,
            Self::Provider(PhoenixError::InstanceNotFound(_)) | Self::InstanceNotFound(_) => {
                FailureKind::NotFound
            }
            Self::Provider(PhoenixError::BlobNotFound(_) | PhoenixError::Storage(_)) | Self::S3(_) => {
                FailureKind::StorageError
            }
            Self::Provider(_) => FailureKind::ProviderError,
            Self::Io(_) => FailureKind::StorageError,
            Self::Json(_) | Self::Config(_) => FailureKind::InvalidConfiguration,
            Self::Internal(_) => FailureKind::Internal,
        }
    }

    /// "Try later" (true) versus "operator must intervene" (false)
    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = OrchestratorError::NoCapacityAvailable("RTX_4090 in eu-west".into());
        assert_eq!(err.kind(), FailureKind::NoCapacityAvailable);
        assert!(err.is_transient());

        let err = OrchestratorError::snapshot_restore("digest mismatch");
        assert_eq!(err.kind(), FailureKind::SnapshotRestoreFailure);
        assert!(!err.is_transient());

        let err = OrchestratorError::PhaseTimeout(FailoverPhase::Provisioning, Duration::from_secs(300));
        assert_eq!(err.kind(), FailureKind::ProviderTimeout);
    }

    #[test]
    fn test_provider_errors_are_classified() {
        let err: OrchestratorError = PhoenixError::NoCapacity("none".into()).into();
        assert_eq!(err.kind(), FailureKind::NoCapacityAvailable);

        let err: OrchestratorError = PhoenixError::provider("500 from API").into();
        assert_eq!(err.kind(), FailureKind::ProviderError);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_concurrent_rejection_message() {
        let err = OrchestratorError::ConcurrentFailoverRejected {
            instance_id: InstanceId::new("gpu-1"),
            phase: FailoverPhase::SearchingGpu,
        };
        assert_eq!(
            err.to_string(),
            "Failover already active for gpu-1 (phase searching_gpu)"
        );
    }
}
