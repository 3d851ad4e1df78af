//! Persistent record store: the durable work queue of migration candidates.
//!
//! Records move through a small status machine: ingestion creates them as
//! `new`; a worker's claim atomically moves a batch to `queued`; outcome
//! recording settles each claimed record into `synced`, `failed`, or
//! `job-failed`. The claim is the *only* synchronization point between
//! workers, so its atomicity contract lives here at the store level rather
//! than in any in-process lock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryRecordStore;
#[cfg(feature = "postgres")]
pub use postgres::PgRecordStore;

/// Status of a migration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    /// Ingested, waiting to be claimed.
    New,
    /// Claimed by a worker; exclusively owned until an outcome is recorded.
    Queued,
    /// Destination accepted the record; `destination_id` is set.
    Synced,
    /// Destination rejected this record individually; `destination_error`
    /// carries the supplied message.
    Failed,
    /// The whole batch failed before per-record outcomes could be
    /// determined (submission error or job failure). Distinct from `Failed`
    /// so systemic outages can be re-driven separately from data-quality
    /// rejections.
    JobFailed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::New => "new",
            RecordStatus::Queued => "queued",
            RecordStatus::Synced => "synced",
            RecordStatus::Failed => "failed",
            RecordStatus::JobFailed => "job-failed",
        }
    }

    /// Terminal statuses are never reopened automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordStatus::Synced | RecordStatus::Failed | RecordStatus::JobFailed
        )
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "new" => Ok(RecordStatus::New),
            "queued" => Ok(RecordStatus::Queued),
            "synced" => Ok(RecordStatus::Synced),
            "failed" => Ok(RecordStatus::Failed),
            "job-failed" => Ok(RecordStatus::JobFailed),
            other => Err(format!("unknown record status '{other}'")),
        }
    }
}

/// One persisted migration candidate.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    /// Store-assigned id; claims return records in ascending id order.
    pub id: i64,
    /// Entity family, e.g. "ticket" or "user".
    pub resource_type: String,
    /// The record's id in the source system. Unique per resource type.
    pub source_id: i64,
    /// Opaque source payload handed to the transform.
    pub payload: Value,
    pub status: RecordStatus,
    /// Destination-assigned id once synced.
    pub destination_id: Option<i64>,
    /// Destination-supplied error text for `failed` records.
    pub destination_error: Option<String>,
}

/// Per-record outcome applied after a bulk job settles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordOutcome {
    pub id: i64,
    pub status: RecordStatus,
    pub destination_id: Option<i64>,
    pub destination_error: Option<String>,
}

impl RecordOutcome {
    pub fn synced(id: i64, destination_id: i64) -> Self {
        Self {
            id,
            status: RecordStatus::Synced,
            destination_id: Some(destination_id),
            destination_error: None,
        }
    }

    pub fn failed(id: i64, error: impl Into<String>) -> Self {
        Self {
            id,
            status: RecordStatus::Failed,
            destination_id: None,
            destination_error: Some(error.into()),
        }
    }
}

/// Durable store of migration records.
///
/// `claim_batch` must be atomic with respect to all other concurrent
/// callers: two simultaneous claims never return overlapping records, even
/// across processes for implementations backed by shared storage.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Ingest one record as `new`. Returns `false` when a record with the
    /// same `(resource_type, source_id)` already exists; pagination
    /// rollover re-deliveries land here and are absorbed.
    async fn insert_new(&self, resource_type: &str, source_id: i64, payload: &Value)
        -> Result<bool>;

    /// Atomically claim up to `limit` `new` records of a type, transitioning
    /// them to `queued`. Returns them in ascending id order; an empty vector
    /// signals the queue is drained for that type.
    async fn claim_batch(&self, resource_type: &str, limit: usize) -> Result<Vec<Record>>;

    /// Record per-record outcomes by id. Idempotent: re-applying the same
    /// outcomes leaves the store unchanged.
    async fn record_outcomes(&self, outcomes: &[RecordOutcome]) -> Result<()>;

    /// Mark an entire batch `job-failed` when submission or completion could
    /// not be determined.
    async fn mark_job_failed(&self, ids: &[i64]) -> Result<()>;

    /// Return records stuck in `queued` longer than `lease` to `new` so a
    /// crashed worker's batch is reclaimed on the next run. Returns the
    /// number of released records.
    async fn release_stale_claims(&self, resource_type: &str, lease: Duration) -> Result<u64>;

    /// All records of a type with the given status, in id order.
    async fn records_by_status(
        &self,
        resource_type: &str,
        status: RecordStatus,
    ) -> Result<Vec<Record>>;

    /// All records of a type not yet `synced`, in id order.
    async fn records_not_synced(&self, resource_type: &str) -> Result<Vec<Record>>;

    /// Record counts per status for a type.
    async fn status_counts(&self, resource_type: &str) -> Result<HashMap<RecordStatus, u64>>;

    /// Explicit source-id → destination-id map for synced records of a type.
    async fn destination_id_map(&self, resource_type: &str) -> Result<HashMap<i64, i64>>;

    /// Operator re-drive: reset records in the given terminal statuses back
    /// to `new`, clearing any recorded error. Returns the number reset.
    async fn reset_for_redrive(
        &self,
        resource_type: &str,
        statuses: &[RecordStatus],
    ) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            RecordStatus::New,
            RecordStatus::Queued,
            RecordStatus::Synced,
            RecordStatus::Failed,
            RecordStatus::JobFailed,
        ] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert_eq!(RecordStatus::JobFailed.as_str(), "job-failed");
        assert!("bogus".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RecordStatus::New.is_terminal());
        assert!(!RecordStatus::Queued.is_terminal());
        assert!(RecordStatus::Synced.is_terminal());
        assert!(RecordStatus::Failed.is_terminal());
        assert!(RecordStatus::JobFailed.is_terminal());
    }
}
