//! Reconciliation of records that already exist in the destination.
//!
//! Some records are created in the destination ahead of the migration (for
//! users this happens whenever the destination auto-provisions identities).
//! Submitting them again would fail on uniqueness, so before importing, the
//! reconciler walks the destination listing and marks matching store records
//! `synced` with the pre-existing destination id. Matching is by lowercased
//! email.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;

use crate::dest;
use crate::error::Result;
use crate::http::HttpClient;
use crate::store::{RecordOutcome, RecordStore};

/// Marks store records already present in the destination as `synced`.
pub struct Reconciler<S: RecordStore, H: HttpClient> {
    dest: dest::Client<H>,
    store: Arc<S>,
    resource_type: String,
    listing_path: String,
    flush_threshold: usize,
}

impl<S, H> Reconciler<S, H>
where
    S: RecordStore,
    H: HttpClient + 'static,
{
    /// User preset: the only entity family the destination pre-creates.
    pub fn users(dest: dest::Client<H>, store: Arc<S>) -> Self {
        Self {
            dest,
            store,
            resource_type: "user".to_string(),
            listing_path: "users".to_string(),
            flush_threshold: 100,
        }
    }

    /// Walk the destination listing and settle matches. Returns the number
    /// of records marked `synced`.
    #[tracing::instrument(skip(self), fields(resource_type = %self.resource_type))]
    pub async fn run(&self) -> Result<u64> {
        let index = self.build_index().await?;
        if index.is_empty() {
            tracing::info!("nothing to reconcile");
            return Ok(0);
        }
        tracing::info!(candidates = index.len(), "reconciling against destination listing");

        let mut stream = self.dest.records(&self.listing_path, Vec::new());
        let mut pending: Vec<RecordOutcome> = Vec::new();
        let mut matched: u64 = 0;

        while let Some(record) = stream.next().await {
            let record = record?;
            let Some(email) = record.get("email").and_then(Value::as_str) else {
                continue;
            };
            let Some(destination_id) = record.get("id").and_then(Value::as_i64) else {
                continue;
            };
            if let Some(ids) = index.get(&email.to_lowercase()) {
                for id in ids {
                    pending.push(RecordOutcome::synced(*id, destination_id));
                }
            }
            if pending.len() >= self.flush_threshold {
                self.store.record_outcomes(&pending).await?;
                matched += pending.len() as u64;
                pending.clear();
            }
        }

        if !pending.is_empty() {
            matched += pending.len() as u64;
            self.store.record_outcomes(&pending).await?;
        }

        tracing::info!(matched, "reconciliation finished");
        Ok(matched)
    }

    /// Lowercased email → record ids, over records not yet synced. Emails
    /// live either at the top level of the payload or under `contact`.
    async fn build_index(&self) -> Result<HashMap<String, Vec<i64>>> {
        let records = self.store.records_not_synced(&self.resource_type).await?;
        let mut index: HashMap<String, Vec<i64>> = HashMap::new();
        for record in records {
            let email = record
                .payload
                .get("email")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .or_else(|| record.payload.pointer("/contact/email").and_then(Value::as_str));
            if let Some(email) = email {
                index.entry(email.to_lowercase()).or_default().push(record.id);
            }
        }
        Ok(index)
    }
}
