//! Failover phases and the historical failover record

use crate::error::{PhoenixError, Result};
use crate::types::{InstanceHandle, InstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Phases of the failover state machine.
///
/// The success path is strictly ordered; `Failed` is reachable from any
/// non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPhase {
    Detecting,
    GpuLost,
    FailoverToCpu,
    SearchingGpu,
    Provisioning,
    Restoring,
    Complete,
    Failed,
}

impl FailoverPhase {
    /// Success path in order
    pub const SUCCESS_PATH: [FailoverPhase; 7] = [
        FailoverPhase::Detecting,
        FailoverPhase::GpuLost,
        FailoverPhase::FailoverToCpu,
        FailoverPhase::SearchingGpu,
        FailoverPhase::Provisioning,
        FailoverPhase::Restoring,
        FailoverPhase::Complete,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, FailoverPhase::Complete | FailoverPhase::Failed)
    }

    /// Whether the machine may move from `self` to `next`.
    ///
    /// `FailoverToCpu` is the only phase that may be skipped (no standby).
    pub fn can_transition_to(&self, next: FailoverPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, FailoverPhase::Failed) => true,
            (FailoverPhase::Detecting, FailoverPhase::GpuLost)
            | (FailoverPhase::GpuLost, FailoverPhase::FailoverToCpu)
            | (FailoverPhase::GpuLost, FailoverPhase::SearchingGpu)
            | (FailoverPhase::FailoverToCpu, FailoverPhase::SearchingGpu)
            | (FailoverPhase::SearchingGpu, FailoverPhase::Provisioning)
            | (FailoverPhase::Provisioning, FailoverPhase::Restoring)
            | (FailoverPhase::Restoring, FailoverPhase::Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FailoverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailoverPhase::Detecting => "detecting",
            FailoverPhase::GpuLost => "gpu_lost",
            FailoverPhase::FailoverToCpu => "failover_to_cpu",
            FailoverPhase::SearchingGpu => "searching_gpu",
            FailoverPhase::Provisioning => "provisioning",
            FailoverPhase::Restoring => "restoring",
            FailoverPhase::Complete => "complete",
            FailoverPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a failover was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    ManualTest,
    Preemption,
    HardwareFault,
}

impl TriggerReason {
    /// Manual triggers confirm loss immediately and take precedence over
    /// automatic detection that has not yet confirmed.
    pub fn is_manual(&self) -> bool {
        matches!(self, TriggerReason::ManualTest)
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerReason::ManualTest => "manual_test",
            TriggerReason::Preemption => "preemption",
            TriggerReason::HardwareFault => "hardware_fault",
        };
        f.write_str(s)
    }
}

/// Overall outcome of a failover event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverOutcome {
    Success,
    Failed,
    InProgress,
}

/// Machine-readable failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DetectionAmbiguous,
    NoCapacityAvailable,
    ProviderTimeout,
    SyncTransferFailure,
    SnapshotCreateFailure,
    SnapshotRestoreFailure,
    ConcurrentFailoverRejected,
    ProviderError,
    StorageError,
    InvalidConfiguration,
    NotFound,
    Cancelled,
    Internal,
}

impl FailureKind {
    /// Transient kinds mean "try later"; the rest need an operator
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::DetectionAmbiguous
                | FailureKind::NoCapacityAvailable
                | FailureKind::ProviderTimeout
                | FailureKind::SyncTransferFailure
                | FailureKind::ConcurrentFailoverRejected
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::DetectionAmbiguous => "detection_ambiguous",
            FailureKind::NoCapacityAvailable => "no_capacity_available",
            FailureKind::ProviderTimeout => "provider_timeout",
            FailureKind::SyncTransferFailure => "sync_transfer_failure",
            FailureKind::SnapshotCreateFailure => "snapshot_create_failure",
            FailureKind::SnapshotRestoreFailure => "snapshot_restore_failure",
            FailureKind::ConcurrentFailoverRejected => "concurrent_failover_rejected",
            FailureKind::ProviderError => "provider_error",
            FailureKind::StorageError => "storage_error",
            FailureKind::InvalidConfiguration => "invalid_configuration",
            FailureKind::NotFound => "not_found",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Details recorded on a failed event for manual follow-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub reason: String,
    /// Phase that was being attempted when the failure happened
    pub failed_phase: FailoverPhase,
    /// Last phase that was left successfully, if any
    pub last_successful_phase: Option<FailoverPhase>,
}

/// Replacement instance obtained during `provisioning`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replacement {
    pub handle: InstanceHandle,
    pub gpu_class: Option<String>,
    pub hourly_price: f64,
}

/// Entry timestamp of one phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: FailoverPhase,
    pub entered_at: DateTime<Utc>,
}

/// One historical record of a failover.
///
/// Phases are only ever appended; timestamps are non-decreasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub id: Uuid,
    pub instance_id: InstanceId,
    pub reason: TriggerReason,
    pub phases: Vec<PhaseRecord>,
    pub outcome: FailoverOutcome,
    pub replacement_instance_id: Option<InstanceId>,
    /// Set once, when the replacement has been requested from the provider
    #[serde(default)]
    pub replacement: Option<Replacement>,
    pub bytes_restored: u64,
    pub failure: Option<FailureDetail>,
}

impl FailoverEvent {
    /// Open a new event whose first phase is `Detecting` entered at `detected_at`
    pub fn open(instance_id: InstanceId, reason: TriggerReason, detected_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            reason,
            phases: vec![PhaseRecord {
                phase: FailoverPhase::Detecting,
                entered_at: detected_at,
            }],
            outcome: FailoverOutcome::InProgress,
            replacement_instance_id: None,
            replacement: None,
            bytes_restored: 0,
            failure: None,
        }
    }

    /// The most recently entered phase
    pub fn current_phase(&self) -> FailoverPhase {
        self.phases
            .last()
            .map(|p| p.phase)
            .unwrap_or(FailoverPhase::Detecting)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.phases.first().map(|p| p.entered_at)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.phases
            .last()
            .filter(|p| p.phase.is_terminal())
            .map(|p| p.entered_at)
    }

    pub fn is_finished(&self) -> bool {
        self.outcome != FailoverOutcome::InProgress
    }

    pub fn has_phase(&self, phase: FailoverPhase) -> bool {
        self.phases.iter().any(|p| p.phase == phase)
    }

    /// Record entry into `phase` at `at`
    pub fn enter_phase(&mut self, phase: FailoverPhase, at: DateTime<Utc>) -> Result<()> {
        let current = self.current_phase();
        if self.is_finished() || !current.can_transition_to(phase) {
            return Err(PhoenixError::InvalidTransition {
                from: current.to_string(),
                to: phase.to_string(),
            });
        }
        if let Some(last) = self.phases.last() {
            if at < last.entered_at {
                return Err(PhoenixError::InvalidTransition {
                    from: format!("{}@{}", current, last.entered_at.to_rfc3339()),
                    to: format!("{}@{}", phase, at.to_rfc3339()),
                });
            }
        }
        self.phases.push(PhaseRecord {
            phase,
            entered_at: at,
        });
        Ok(())
    }

    /// Remember the provisioned replacement (allowed once, while provisioning)
    pub fn record_replacement(&mut self, replacement: Replacement) -> Result<()> {
        if self.is_finished() || self.replacement.is_some() {
            return Err(PhoenixError::InvalidTransition {
                from: self.current_phase().to_string(),
                to: "replacement_provisioned".to_string(),
            });
        }
        self.replacement = Some(replacement);
        Ok(())
    }

    /// Close the event successfully
    pub fn complete(
        &mut self,
        replacement: InstanceId,
        bytes_restored: u64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.enter_phase(FailoverPhase::Complete, at)?;
        self.outcome = FailoverOutcome::Success;
        self.replacement_instance_id = Some(replacement);
        self.bytes_restored = bytes_restored;
        Ok(())
    }

    /// Close the event as failed, remembering what was being attempted
    pub fn fail(&mut self, kind: FailureKind, reason: impl Into<String>, at: DateTime<Utc>) -> Result<()> {
        let failed_phase = self.current_phase();
        let last_successful_phase = self
            .phases
            .len()
            .checked_sub(2)
            .map(|idx| self.phases[idx].phase);
        self.enter_phase(FailoverPhase::Failed, at)?;
        self.outcome = FailoverOutcome::Failed;
        self.failure = Some(FailureDetail {
            kind,
            reason: reason.into(),
            failed_phase,
            last_successful_phase,
        });
        Ok(())
    }

    /// Detection to terminal phase
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at()? - self.started_at()?)
    }

    /// Time spent in each phase that has been left
    pub fn phase_durations(&self) -> Vec<(FailoverPhase, chrono::Duration)> {
        self.phases
            .windows(2)
            .map(|w| (w[0].phase, w[1].entered_at - w[0].entered_at))
            .collect()
    }
}
