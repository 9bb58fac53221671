//! Orchestrator configuration
//!
//! Every timeout and retry bound used by the engine lives here. Values are
//! plain seconds/milliseconds so a config file stays readable:
//!
//! ```json
//! {
//!   "failover": { "overall_timeout_secs": 180, "fallback_regions": ["eu-west-2"] },
//!   "search": { "max_attempts": 6 }
//! }
//! ```

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Loss detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Interval between health probes
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Consecutive failed probes that confirm loss
    #[serde(default = "default_failed_probes")]
    pub failed_probes_to_confirm: u32,
}

fn default_probe_interval_ms() -> u64 {
    5000
}

fn default_failed_probes() -> u32 {
    2
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            failed_probes_to_confirm: default_failed_probes(),
        }
    }
}

/// State machine timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverTimeouts {
    /// Bound on the whole failover, detection to terminal phase
    #[serde(default = "default_overall_timeout_secs")]
    pub overall_timeout_secs: u64,

    #[serde(default = "default_failover_to_cpu_timeout_secs")]
    pub failover_to_cpu_timeout_secs: u64,

    /// Bound on provisioning a replacement (request + reachability)
    #[serde(default = "default_provisioning_timeout_secs")]
    pub provisioning_timeout_secs: u64,

    #[serde(default = "default_restoring_timeout_secs")]
    pub restoring_timeout_secs: u64,

    /// Polling interval while waiting for a provisioned instance
    #[serde(default = "default_provision_poll_ms")]
    pub provision_poll_ms: u64,

    /// Replacement may cost up to this multiple of the lost instance's price
    #[serde(default = "default_price_ceiling_multiplier")]
    pub price_ceiling_multiplier: f64,

    /// Regions searched after the instance's own region
    #[serde(default)]
    pub fallback_regions: Vec<String>,
}

fn default_overall_timeout_secs() -> u64 {
    180
}

fn default_failover_to_cpu_timeout_secs() -> u64 {
    30
}

fn default_provisioning_timeout_secs() -> u64 {
    300
}

fn default_restoring_timeout_secs() -> u64 {
    600
}

fn default_provision_poll_ms() -> u64 {
    2000
}

fn default_price_ceiling_multiplier() -> f64 {
    1.25
}

impl Default for FailoverTimeouts {
    fn default() -> Self {
        Self {
            overall_timeout_secs: default_overall_timeout_secs(),
            failover_to_cpu_timeout_secs: default_failover_to_cpu_timeout_secs(),
            provisioning_timeout_secs: default_provisioning_timeout_secs(),
            restoring_timeout_secs: default_restoring_timeout_secs(),
            provision_poll_ms: default_provision_poll_ms(),
            price_ceiling_multiplier: default_price_ceiling_multiplier(),
            fallback_regions: Vec::new(),
        }
    }
}

/// Exponential backoff for the replacement search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchBackoff {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    6
}

impl Default for SearchBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl SearchBackoff {
    /// Delay before retry number `attempt` (1-based: the wait after the first failure)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Synchronization engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Default cycle interval when the strategy does not override it
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive failed cycles before the association is marked degraded
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_sync_interval_ms() -> u64 {
    1000
}

fn default_failure_threshold() -> u32 {
    5
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sync_interval_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Snapshot manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_poll_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_snapshot_timeout_secs")]
    pub create_timeout_secs: u64,
}

fn default_snapshot_poll_ms() -> u64 {
    500
}

fn default_snapshot_timeout_secs() -> u64 {
    600
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_snapshot_poll_ms(),
            create_timeout_secs: default_snapshot_timeout_secs(),
        }
    }
}

/// Automatic recovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Wait before retrying a failover that failed transiently
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Automatic retries per loss before giving up
    #[serde(default = "default_max_auto_retries")]
    pub max_auto_retries: u32,
}

fn default_retry_delay_secs() -> u64 {
    60
}

fn default_max_auto_retries() -> u32 {
    3
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay_secs(),
            max_auto_retries: default_max_auto_retries(),
        }
    }
}

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub failover: FailoverTimeouts,
    #[serde(default)]
    pub search: SearchBackoff,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl OrchestratorConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Short timings for tests and simulations
    pub fn fast() -> Self {
        Self {
            detection: DetectionConfig {
                probe_interval_ms: 20,
                failed_probes_to_confirm: 2,
            },
            failover: FailoverTimeouts {
                provision_poll_ms: 10,
                ..Default::default()
            },
            search: SearchBackoff {
                initial_delay_ms: 10,
                multiplier: 2.0,
                max_delay_ms: 50,
                max_attempts: 4,
            },
            sync: SyncConfig {
                interval_ms: 50,
                failure_threshold: 3,
            },
            snapshot: SnapshotConfig {
                poll_interval_ms: 10,
                create_timeout_secs: 5,
            },
            recovery: RecoveryConfig {
                retry_delay_secs: 1,
                max_auto_retries: 2,
            },
        }
    }

    /// Set the overall failover timeout
    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.failover.overall_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the provisioning timeout
    pub fn with_provisioning_timeout(mut self, timeout: Duration) -> Self {
        self.failover.provisioning_timeout_secs = timeout.as_secs();
        self
    }

    /// Set fallback regions for the replacement search
    pub fn with_fallback_regions(mut self, regions: Vec<String>) -> Self {
        self.failover.fallback_regions = regions;
        self
    }

    /// Set the search backoff
    pub fn with_search_backoff(mut self, backoff: SearchBackoff) -> Self {
        self.search = backoff;
        self
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.failover.overall_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.detection.probe_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync.interval_ms)
    }

    /// Reject configurations the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.detection.failed_probes_to_confirm == 0 {
            return Err(OrchestratorError::config(
                "detection.failed_probes_to_confirm must be at least 1",
            ));
        }
        if self.failover.overall_timeout_secs == 0 {
            return Err(OrchestratorError::config(
                "failover.overall_timeout_secs must be positive",
            ));
        }
        if self.failover.provisioning_timeout_secs == 0 || self.failover.restoring_timeout_secs == 0 {
            return Err(OrchestratorError::config("phase timeouts must be positive"));
        }
        if self.failover.price_ceiling_multiplier < 1.0 {
            return Err(OrchestratorError::config(
                "failover.price_ceiling_multiplier must be >= 1.0",
            ));
        }
        for region in &self.failover.fallback_regions {
            if !crate::strategy::is_valid_region(region) {
                return Err(OrchestratorError::config(format!(
                    "invalid fallback region: {}",
                    region
                )));
            }
        }
        if self.search.max_attempts == 0 || self.search.multiplier < 1.0 {
            return Err(OrchestratorError::config(
                "search.max_attempts must be >= 1 and search.multiplier >= 1.0",
            ));
        }
        if self.sync.interval_ms == 0 || self.sync.failure_threshold == 0 {
            return Err(OrchestratorError::config(
                "sync.interval_ms and sync.failure_threshold must be positive",
            ));
        }
        if self.snapshot.poll_interval_ms == 0 {
            return Err(OrchestratorError::config("snapshot.poll_interval_ms must be positive"));
        }
        Ok(())
    }
}
