//! In-process record store.
//!
//! Claim atomicity is provided by a single mutex-guarded critical section,
//! which satisfies the store contract as long as all workers share this
//! process. Multi-process deployments need [`super::postgres::PgRecordStore`].
//! Also the natural store for tests, playing the role the mock HTTP client
//! plays for transport.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use super::{Record, RecordOutcome, RecordStatus, RecordStore};
use crate::error::{CaravanError, Result};

#[derive(Debug, Clone)]
struct StoredRecord {
    record: Record,
    queued_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: BTreeMap<i64, StoredRecord>,
    keys: HashSet<(String, i64)>,
}

/// Mutex-guarded in-process implementation of [`RecordStore`].
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored records (all types and statuses).
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().rows.is_empty()
    }

    /// Fetch one record by id.
    pub fn get(&self, id: i64) -> Option<Record> {
        self.inner.lock().rows.get(&id).map(|r| r.record.clone())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert_new(
        &self,
        resource_type: &str,
        source_id: i64,
        payload: &Value,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.keys.insert((resource_type.to_string(), source_id)) {
            return Ok(false);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.insert(
            id,
            StoredRecord {
                record: Record {
                    id,
                    resource_type: resource_type.to_string(),
                    source_id,
                    payload: payload.clone(),
                    status: RecordStatus::New,
                    destination_id: None,
                    destination_error: None,
                },
                queued_at: None,
            },
        );
        Ok(true)
    }

    async fn claim_batch(&self, resource_type: &str, limit: usize) -> Result<Vec<Record>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut claimed = Vec::new();
        for stored in inner.rows.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if stored.record.resource_type == resource_type
                && stored.record.status == RecordStatus::New
            {
                stored.record.status = RecordStatus::Queued;
                stored.queued_at = Some(now);
                claimed.push(stored.record.clone());
            }
        }
        Ok(claimed)
    }

    async fn record_outcomes(&self, outcomes: &[RecordOutcome]) -> Result<()> {
        let mut inner = self.inner.lock();
        for outcome in outcomes {
            let stored = inner
                .rows
                .get_mut(&outcome.id)
                .ok_or(CaravanError::RecordNotFound(outcome.id))?;
            stored.record.status = outcome.status;
            stored.record.destination_id = outcome.destination_id;
            stored.record.destination_error = outcome.destination_error.clone();
            stored.queued_at = None;
        }
        Ok(())
    }

    async fn mark_job_failed(&self, ids: &[i64]) -> Result<()> {
        let mut inner = self.inner.lock();
        for id in ids {
            let stored = inner
                .rows
                .get_mut(id)
                .ok_or(CaravanError::RecordNotFound(*id))?;
            stored.record.status = RecordStatus::JobFailed;
            stored.queued_at = None;
        }
        Ok(())
    }

    async fn release_stale_claims(&self, resource_type: &str, lease: Duration) -> Result<u64> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| anyhow::anyhow!("lease out of range: {e}"))?;
        let cutoff = Utc::now() - lease;
        let mut inner = self.inner.lock();
        let mut released = 0;
        for stored in inner.rows.values_mut() {
            if stored.record.resource_type == resource_type
                && stored.record.status == RecordStatus::Queued
                && stored.queued_at.is_some_and(|at| at <= cutoff)
            {
                stored.record.status = RecordStatus::New;
                stored.queued_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn records_by_status(
        &self,
        resource_type: &str,
        status: RecordStatus,
    ) -> Result<Vec<Record>> {
        let inner = self.inner.lock();
        Ok(inner
            .rows
            .values()
            .filter(|s| s.record.resource_type == resource_type && s.record.status == status)
            .map(|s| s.record.clone())
            .collect())
    }

    async fn records_not_synced(&self, resource_type: &str) -> Result<Vec<Record>> {
        let inner = self.inner.lock();
        Ok(inner
            .rows
            .values()
            .filter(|s| {
                s.record.resource_type == resource_type
                    && s.record.status != RecordStatus::Synced
            })
            .map(|s| s.record.clone())
            .collect())
    }

    async fn status_counts(&self, resource_type: &str) -> Result<HashMap<RecordStatus, u64>> {
        let inner = self.inner.lock();
        let mut counts = HashMap::new();
        for stored in inner.rows.values() {
            if stored.record.resource_type == resource_type {
                *counts.entry(stored.record.status).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn destination_id_map(&self, resource_type: &str) -> Result<HashMap<i64, i64>> {
        let inner = self.inner.lock();
        Ok(inner
            .rows
            .values()
            .filter(|s| s.record.resource_type == resource_type)
            .filter_map(|s| s.record.destination_id.map(|dst| (s.record.source_id, dst)))
            .collect())
    }

    async fn reset_for_redrive(
        &self,
        resource_type: &str,
        statuses: &[RecordStatus],
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut reset = 0;
        for stored in inner.rows.values_mut() {
            if stored.record.resource_type == resource_type
                && statuses.contains(&stored.record.status)
            {
                stored.record.status = RecordStatus::New;
                stored.record.destination_error = None;
                stored.queued_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }
}
