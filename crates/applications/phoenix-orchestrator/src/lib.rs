//! # Phoenix Failover Orchestrator
//!
//! Keeps GPU workloads available when their spot GPU is lost.
//!
//! ## Architecture
//!
//! ```text
//!  HealthMonitor ──loss signal──▶ FailoverSupervisor
//!                                       │ trigger
//!                                       ▼
//!  StrategySelector            FailoverCoordinator ──▶ HistoryStore (journal)
//!  ├── StandbyRegistry ◀─────── acquire / release        │
//!  ├── SyncEngine (primary → standby, every interval)    └──▶ EventBus
//!  └── SnapshotManager (periodic, BlobStore-backed)
//! ```
//!
//! ## Failover
//!
//! 1. **Detecting**: confirm the loss with consecutive failed probes
//! 2. **GPU lost**: record the event, mark the instance failing over
//! 3. **Failover to CPU**: the standby keeps serving (standby strategies)
//! 4. **Searching**: replacement capacity under a price ceiling, with backoff
//! 5. **Provisioning**: request the replacement and wait until reachable
//! 6. **Restoring**: copy the live standby, or restore the latest snapshot
//! 7. **Complete**: the replacement takes over the instance's protection
//!
//! See [`failover`] for the state machine and [`strategy`] for the
//! protection strategies and their costs.

pub mod blob;
pub mod config;
pub mod error;
pub mod events;
pub mod failover;
pub mod history;
pub mod instance;
pub mod monitor;
pub mod orchestrator;
pub mod s3_store;
pub mod sim;
pub mod snapshot;
pub mod standby;
pub mod strategy;
pub mod supervisor;
pub mod sync;
pub mod workspace;

// Engine
pub use failover::{FailoverContext, FailoverCoordinator, FailoverHandle};
pub use orchestrator::Orchestrator;
pub use supervisor::FailoverSupervisor;

// Error handling and configuration
pub use config::{
    DetectionConfig, FailoverTimeouts, OrchestratorConfig, RecoveryConfig, SearchBackoff,
    SnapshotConfig, SyncConfig,
};
pub use error::{OrchestratorError, Result};

// Components
pub use events::{EventBus, StatusEvent};
pub use history::{FailoverMetrics, HistoryQuery, HistoryStore, compute_metrics};
pub use instance::InstanceRegistry;
pub use monitor::{HealthMonitor, LossSignal};
pub use snapshot::{RestoreReport, SnapshotManager};
pub use standby::{Controller, Release, StandbyRegistry};
pub use strategy::{CostModel, CostTier, StrategyEstimate, StrategySelector, StrategyStore};
pub use sync::{CycleOutcome, SyncEngine, SyncReport};

// Storage and providers
pub use blob::MemoryBlobStore;
pub use s3_store::{S3BlobStore, create_s3_client};
pub use sim::SimulatedCloud;
pub use workspace::{LocalWorkspace, MemoryWorkspace, RestoreMarker};
