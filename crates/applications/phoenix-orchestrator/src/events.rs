//! Status feed
//!
//! One-way notifications for a reporting/UI layer. Built on a tokio
//! broadcast channel: publishing never blocks, and a subscriber that falls
//! behind loses the oldest events rather than slowing the engine down.

use chrono::{DateTime, Utc};
use phoenix_core::{FailoverOutcome, FailoverPhase, FailureKind, InstanceId, StrategyKind};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Default channel capacity
const DEFAULT_CAPACITY: usize = 1024;

/// Event published by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A failover entered a new phase
    PhaseChanged {
        event_id: Uuid,
        instance_id: InstanceId,
        phase: FailoverPhase,
        at: DateTime<Utc>,
    },

    /// A failover reached a terminal phase
    FailoverFinished {
        event_id: Uuid,
        instance_id: InstanceId,
        outcome: FailoverOutcome,
        failure_kind: Option<FailureKind>,
        at: DateTime<Utc>,
    },

    /// A standby association exceeded its sync failure threshold
    SyncDegraded {
        instance_id: InstanceId,
        consecutive_failures: u32,
        last_error: String,
        at: DateTime<Utc>,
    },

    /// The active protection strategy of an instance changed
    StrategyChanged {
        instance_id: InstanceId,
        from: StrategyKind,
        to: StrategyKind,
        at: DateTime<Utc>,
    },
}

/// Fan-out publisher for [`StatusEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; having none is fine
    pub fn publish(&self, event: StatusEvent) {
        if self.sender.send(event).is_err() {
            debug!("Status event dropped: no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
