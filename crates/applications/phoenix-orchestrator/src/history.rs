//! Failover history
//!
//! Every mutation of a [`FailoverEvent`] is appended to an optional JSON
//! lines journal *before* it is applied in memory, so the journal always
//! names the last phase that was attempted:
//!
//! ```text
//! {"record":"opened","event":{...}}
//! {"record":"phase_entered","event_id":"...","phase":"searching_gpu","at":"..."}
//! {"record":"replacement_provisioned","event_id":"...","replacement":{...}}
//! {"record":"completed","event_id":"...","replacement_instance_id":"gpu-7","bytes_restored":4096,"at":"..."}
//! ```
//!
//! Reopening the journal replays it; events still `in_progress` are the
//! ones a crashed process left behind.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use phoenix_core::{
    FailoverEvent, FailoverOutcome, FailoverPhase, FailureKind, InstanceId, Replacement,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One journal line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum JournalRecord {
    Opened {
        event: FailoverEvent,
    },
    PhaseEntered {
        event_id: Uuid,
        phase: FailoverPhase,
        at: DateTime<Utc>,
    },
    ReplacementProvisioned {
        event_id: Uuid,
        replacement: Replacement,
    },
    Completed {
        event_id: Uuid,
        replacement_instance_id: InstanceId,
        bytes_restored: u64,
        at: DateTime<Utc>,
    },
    Failed {
        event_id: Uuid,
        kind: FailureKind,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl JournalRecord {
    fn event_id(&self) -> Uuid {
        match self {
            JournalRecord::Opened { event } => event.id,
            JournalRecord::PhaseEntered { event_id, .. }
            | JournalRecord::ReplacementProvisioned { event_id, .. }
            | JournalRecord::Completed { event_id, .. }
            | JournalRecord::Failed { event_id, .. } => *event_id,
        }
    }

    /// Apply to the event it concerns (`Opened` is handled by the caller)
    fn apply(&self, event: &mut FailoverEvent) -> Result<()> {
        match self {
            JournalRecord::Opened { .. } => Err(OrchestratorError::Internal(format!(
                "event {} opened twice",
                event.id
            ))),
            JournalRecord::PhaseEntered { phase, at, .. } => Ok(event.enter_phase(*phase, *at)?),
            JournalRecord::ReplacementProvisioned { replacement, .. } => {
                Ok(event.record_replacement(replacement.clone())?)
            }
            JournalRecord::Completed {
                replacement_instance_id,
                bytes_restored,
                at,
                ..
            } => Ok(event.complete(replacement_instance_id.clone(), *bytes_restored, *at)?),
            JournalRecord::Failed { kind, reason, at, .. } => Ok(event.fail(*kind, reason.clone(), *at)?),
        }
    }
}

/// Filter for history queries
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub instance_id: Option<InstanceId>,
    /// Events that started at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Events that started before this time
    pub until: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    pub fn for_instance(instance_id: InstanceId) -> Self {
        Self {
            instance_id: Some(instance_id),
            ..Default::default()
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    fn matches(&self, event: &FailoverEvent) -> bool {
        if let Some(id) = &self.instance_id {
            let replaced_into = event.replacement_instance_id.as_ref() == Some(id);
            if &event.instance_id != id && !replaced_into {
                return false;
            }
        }
        let Some(started) = event.started_at() else {
            return false;
        };
        self.since.is_none_or(|since| started >= since) && self.until.is_none_or(|until| started < until)
    }
}

/// Aggregates over a set of events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailoverMetrics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub in_progress: usize,
    /// succeeded / (succeeded + failed)
    pub success_rate: Option<f64>,
    /// Mean detecting → complete time of successful events
    pub mean_time_to_recovery_secs: Option<f64>,
    /// Mean time spent in each phase that was left
    pub mean_phase_secs: BTreeMap<FailoverPhase, f64>,
    pub bytes_restored: u64,
    pub failures_by_kind: BTreeMap<String, usize>,
}

#[derive(Default)]
struct HistoryInner {
    events: Vec<FailoverEvent>,
    index: HashMap<Uuid, usize>,
    journal: Option<File>,
}

/// Store of failover events, optionally backed by a journal file
#[derive(Clone, Default)]
pub struct HistoryStore {
    inner: Arc<Mutex<HistoryInner>>,
    path: Option<PathBuf>,
}

impl HistoryStore {
    /// In-memory store (no journal)
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) a journal and replay it
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = HistoryInner::default();

        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let mut replayed = 0usize;
                for (line_no, line) in raw.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let record: JournalRecord = match serde_json::from_str(line) {
                        Ok(r) => r,
                        Err(e) => {
                            // A torn final line is what a crash mid-append leaves
                            warn!(line = line_no + 1, error = %e, "Skipping unreadable journal line");
                            continue;
                        }
                    };
                    if let Err(e) = inner.replay(record) {
                        warn!(line = line_no + 1, error = %e, "Skipping inconsistent journal record");
                        continue;
                    }
                    replayed += 1;
                }
                info!(path = %path.display(), records = replayed, events = inner.events.len(), "Journal replayed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Starting new journal");
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        inner.journal = Some(file);

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            path: Some(path),
        })
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a newly opened event
    pub async fn open_event(&self, event: FailoverEvent) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.index.contains_key(&event.id) {
            return Err(OrchestratorError::Internal(format!("event {} already recorded", event.id)));
        }
        let record = JournalRecord::Opened { event };
        inner.append(&record).await?;
        inner.replay(record)
    }

    pub async fn enter_phase(&self, event_id: Uuid, phase: FailoverPhase, at: DateTime<Utc>) -> Result<FailoverEvent> {
        self.mutate(JournalRecord::PhaseEntered { event_id, phase, at }).await
    }

    pub async fn record_replacement(&self, event_id: Uuid, replacement: Replacement) -> Result<FailoverEvent> {
        self.mutate(JournalRecord::ReplacementProvisioned { event_id, replacement })
            .await
    }

    pub async fn complete(
        &self,
        event_id: Uuid,
        replacement_instance_id: InstanceId,
        bytes_restored: u64,
        at: DateTime<Utc>,
    ) -> Result<FailoverEvent> {
        self.mutate(JournalRecord::Completed {
            event_id,
            replacement_instance_id,
            bytes_restored,
            at,
        })
        .await
    }

    pub async fn fail(&self, event_id: Uuid, kind: FailureKind, reason: impl Into<String>, at: DateTime<Utc>) -> Result<FailoverEvent> {
        self.mutate(JournalRecord::Failed {
            event_id,
            kind,
            reason: reason.into(),
            at,
        })
        .await
    }

    /// Validate against a copy, journal, then apply
    async fn mutate(&self, record: JournalRecord) -> Result<FailoverEvent> {
        let mut inner = self.inner.lock().await;
        let idx = *inner
            .index
            .get(&record.event_id())
            .ok_or_else(|| OrchestratorError::Internal(format!("unknown event {}", record.event_id())))?;

        let mut updated = inner.events[idx].clone();
        record.apply(&mut updated)?;
        inner.append(&record).await?;
        inner.events[idx] = updated.clone();
        Ok(updated)
    }

    pub async fn get(&self, event_id: Uuid) -> Option<FailoverEvent> {
        let inner = self.inner.lock().await;
        inner.index.get(&event_id).map(|&i| inner.events[i].clone())
    }

    /// Events matching `query`, oldest first
    pub async fn query(&self, query: &HistoryQuery) -> Vec<FailoverEvent> {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect()
    }

    /// Events a previous process left `in_progress`
    pub async fn incomplete(&self) -> Vec<FailoverEvent> {
        self.inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.outcome == FailoverOutcome::InProgress)
            .cloned()
            .collect()
    }

    pub async fn metrics(&self, query: &HistoryQuery) -> FailoverMetrics {
        compute_metrics(&self.query(query).await)
    }
}

impl HistoryInner {
    async fn append(&mut self, record: &JournalRecord) -> Result<()> {
        if let Some(file) = self.journal.as_mut() {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            file.write_all(&line).await?;
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }

    fn replay(&mut self, record: JournalRecord) -> Result<()> {
        match record {
            JournalRecord::Opened { event } => {
                if self.index.contains_key(&event.id) {
                    return Err(OrchestratorError::Internal(format!("event {} opened twice", event.id)));
                }
                self.index.insert(event.id, self.events.len());
                self.events.push(event);
                Ok(())
            }
            other => {
                let idx = *self
                    .index
                    .get(&other.event_id())
                    .ok_or_else(|| OrchestratorError::Internal(format!("unknown event {}", other.event_id())))?;
                other.apply(&mut self.events[idx])
            }
        }
    }
}

/// Success rate, MTTR, per-phase means and volume over `events`
pub fn compute_metrics(events: &[FailoverEvent]) -> FailoverMetrics {
    let mut metrics = FailoverMetrics {
        total: events.len(),
        ..Default::default()
    };

    let mut recovery_secs = Vec::new();
    let mut phase_totals: BTreeMap<FailoverPhase, (f64, usize)> = BTreeMap::new();

    for event in events {
        match event.outcome {
            FailoverOutcome::Success => {
                metrics.succeeded += 1;
                metrics.bytes_restored += event.bytes_restored;
                if let Some(d) = event.duration() {
                    recovery_secs.push(d.num_milliseconds() as f64 / 1000.0);
                }
            }
            FailoverOutcome::Failed => {
                metrics.failed += 1;
                if let Some(detail) = &event.failure {
                    *metrics.failures_by_kind.entry(detail.kind.to_string()).or_default() += 1;
                }
            }
            FailoverOutcome::InProgress => metrics.in_progress += 1,
        }
        for (phase, duration) in event.phase_durations() {
            let slot = phase_totals.entry(phase).or_default();
            slot.0 += duration.num_milliseconds() as f64 / 1000.0;
            slot.1 += 1;
        }
    }

    let finished = metrics.succeeded + metrics.failed;
    if finished > 0 {
        metrics.success_rate = Some(metrics.succeeded as f64 / finished as f64);
    }
    if !recovery_secs.is_empty() {
        metrics.mean_time_to_recovery_secs = Some(recovery_secs.iter().sum::<f64>() / recovery_secs.len() as f64);
    }
    metrics.mean_phase_secs = phase_totals
        .into_iter()
        .map(|(phase, (total, count))| (phase, total / count as f64))
        .collect();
    metrics
}
