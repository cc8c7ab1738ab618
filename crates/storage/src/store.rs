//! Concurrency-safe table of per-run status records.

use std::collections::HashMap;
use std::sync::Arc;

use testrig_core::{
    FailureKind, FailureReason, RunId, RunSummary, Stage, StatusRecord, StatusUpdate, UnitStatus,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::StatusSink;

/// Live status table shared by the scheduler, its workers and any reader.
///
/// Each run has exactly one writing worker; the scheduler writes on kill and
/// on admission. Every merge goes through [`StatusRecord::apply`], so failure
/// and kill statuses are never downgraded by a concurrent write. Merged
/// records are forwarded to the configured sink while the write lock is held,
/// which keeps the sink's last write equal to the in-memory record.
pub struct StatusStore {
    records: RwLock<HashMap<RunId, StatusRecord>>,
    sink: Option<Arc<dyn StatusSink>>,
}

impl StatusStore {
    /// Create an in-memory store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            sink: None,
        }
    }

    /// Create a store forwarding every merge to `sink`.
    pub fn with_sink(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            sink: Some(sink),
        }
    }

    /// Register a run as NOT_RUN unless a record already exists.
    pub async fn register(&self, run_id: &RunId, aliases: &[String]) -> StatusRecord {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(run_id) {
            return existing.clone();
        }
        let mut record = StatusRecord::new(run_id.clone());
        record.aliases = aliases.to_vec();
        records.insert(run_id.clone(), record.clone());
        self.persist(&record).await;
        record
    }

    /// Merge `update` into the run's record, creating it if absent.
    pub async fn upsert(&self, run_id: &RunId, update: StatusUpdate) -> StatusRecord {
        let mut records = self.records.write().await;
        let record = records
            .entry(run_id.clone())
            .or_insert_with(|| StatusRecord::new(run_id.clone()));
        let requested = update.status;
        if !record.apply(update) {
            debug!(
                run = %run_id,
                stored = %record.status,
                requested = ?requested,
                "stored status kept over requested one"
            );
        }
        let record = record.clone();
        self.persist(&record).await;
        record
    }

    /// Merge `update` only if `condition` holds for the current record.
    ///
    /// Returns the merged record, or `None` if the record is missing or the
    /// condition rejected it.
    pub async fn upsert_if(
        &self,
        run_id: &RunId,
        condition: impl FnOnce(&StatusRecord) -> bool + Send,
        update: StatusUpdate,
    ) -> Option<StatusRecord> {
        let mut records = self.records.write().await;
        let record = records.get_mut(run_id)?;
        if !condition(record) {
            return None;
        }
        record.apply(update);
        let record = record.clone();
        self.persist(&record).await;
        Some(record)
    }

    /// Mark a run KILLED if it has not settled yet.
    ///
    /// A run that already holds a terminal status is left untouched, so a
    /// terminal write racing the kill always wins.
    pub async fn mark_killed(&self, run_id: &RunId, reason: impl Into<String>) -> Option<StatusRecord> {
        self.mark_killed_with(run_id, FailureReason::new(FailureKind::Killed, None, reason))
            .await
    }

    /// Like [`mark_killed`](Self::mark_killed) with a caller-built reason.
    pub async fn mark_killed_with(&self, run_id: &RunId, reason: FailureReason) -> Option<StatusRecord> {
        let update = StatusUpdate::new()
            .stage(Stage::Done)
            .status(UnitStatus::Killed)
            .ended_at(chrono::Utc::now())
            .failure(reason);
        self.upsert_if(run_id, |record| !record.is_terminal(), update).await
    }

    /// Get one record.
    pub async fn get(&self, run_id: &RunId) -> Option<StatusRecord> {
        self.records.read().await.get(run_id).cloned()
    }

    /// Current status of a run.
    pub async fn status(&self, run_id: &RunId) -> Option<UnitStatus> {
        self.records.read().await.get(run_id).map(|r| r.status)
    }

    /// Point-in-time copy of every record, ordered by run id.
    pub async fn snapshot(&self) -> Vec<StatusRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        records
    }

    /// The most recent run of every template.
    pub async fn latest_runs(&self) -> Vec<StatusRecord> {
        let records = self.records.read().await;
        let mut latest: HashMap<&str, &StatusRecord> = HashMap::new();
        for record in records.values() {
            let entry = latest.entry(record.template()).or_insert(record);
            if record.run_id.run_number > entry.run_id.run_number {
                *entry = record;
            }
        }
        let mut out: Vec<_> = latest.into_values().cloned().collect();
        out.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        out
    }

    /// Counts per status over every run.
    pub async fn summary(&self) -> RunSummary {
        RunSummary::from_records(self.records.read().await.values())
    }

    async fn persist(&self, record: &StatusRecord) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.upsert(record).await {
                warn!(run = %record.run_id, error = %e, "failed to persist status record");
            }
        }
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
