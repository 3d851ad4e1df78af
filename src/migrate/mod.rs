//! Worker pool and import orchestration.
//!
//! [`Ingestor`] drives the source pager into the record store (every record
//! lands as `new`). [`Importer`] then runs N concurrent workers, each
//! repeatedly claiming a batch, transforming it, submitting it as one bulk
//! job, polling the job to a terminal state, and recording per-record
//! outcomes. Workers terminate independently when a claim comes back empty;
//! `run` returns once all of them have.
//!
//! A shared cancellation token is checked before every claim and inside
//! every wait. A batch in flight when shutdown fires stays `queued` and is
//! reclaimed on the next run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dest;
use crate::error::{CaravanError, Result};
use crate::http::HttpClient;
use crate::source::{self, Enrich, RecordFilter};
use crate::store::{Record, RecordOutcome, RecordStatus, RecordStore};

pub mod reconcile;
pub mod strategy;

pub use reconcile::Reconciler;
pub use strategy::{EntityStrategy, Transform};

/// Configuration for the import worker pool.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,

    /// Lease after which records stuck in `queued` are returned to `new`.
    /// Applied once at startup, before the first claim, so a crashed run's
    /// orphans are re-driven.
    pub claim_lease: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            claim_lease: Duration::from_secs(15 * 60),
        }
    }
}

/// Aggregate result of one import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Batches submitted (successfully or not).
    pub batches: u64,
    pub synced: u64,
    pub failed: u64,
    pub job_failed: u64,
}

/// Multi-worker import orchestrator for one entity family.
pub struct Importer<S: RecordStore, H: HttpClient> {
    run_id: Uuid,
    store: Arc<S>,
    dest: dest::Client<H>,
    strategy: EntityStrategy,
    config: ImportConfig,
    shutdown: CancellationToken,
    batches: AtomicU64,
    synced: AtomicU64,
    failed: AtomicU64,
    job_failed: AtomicU64,
}

impl<S, H> Importer<S, H>
where
    S: RecordStore + 'static,
    H: HttpClient + 'static,
{
    pub fn new(
        store: Arc<S>,
        dest: dest::Client<H>,
        strategy: EntityStrategy,
        config: ImportConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            store,
            dest,
            strategy,
            config,
            shutdown,
            batches: AtomicU64::new(0),
            synced: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            job_failed: AtomicU64::new(0),
        }
    }

    /// Run the worker pool until the queue is drained for this entity family
    /// (or shutdown is requested).
    #[tracing::instrument(skip(self), fields(run_id = %self.run_id, resource_type = %self.strategy.resource_type))]
    pub async fn run(self: Arc<Self>) -> Result<ImportSummary> {
        let released = self
            .store
            .release_stale_claims(&self.strategy.resource_type, self.config.claim_lease)
            .await?;
        if released > 0 {
            tracing::warn!(released, "reclaimed records from a previous interrupted run");
        }

        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        for worker in 0..self.config.worker_count {
            let this = self.clone();
            workers.spawn(async move { this.worker_loop(worker).await });
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "worker failed");
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "worker panicked");
                    first_error
                        .get_or_insert_with(|| anyhow::anyhow!("worker panicked: {join_error}").into());
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let summary = ImportSummary {
            batches: self.batches.load(Ordering::Relaxed),
            synced: self.synced.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            job_failed: self.job_failed.load(Ordering::Relaxed),
        };
        tracing::info!(?summary, "import run finished");
        Ok(summary)
    }

    async fn worker_loop(&self, worker: usize) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!(worker, "shutdown requested, worker stopping");
                return Ok(());
            }

            let batch = self
                .store
                .claim_batch(&self.strategy.resource_type, self.strategy.batch_size)
                .await?;
            if batch.is_empty() {
                tracing::info!(worker, "queue drained, worker stopping");
                return Ok(());
            }

            tracing::info!(
                worker,
                count = batch.len(),
                source_ids = ?batch.iter().map(|r| r.source_id).collect::<Vec<_>>(),
                "claimed batch"
            );

            match self.process_batch(&batch).await {
                Ok(()) => {}
                Err(CaravanError::Shutdown) => {
                    // The in-flight batch stays queued and is reclaimed on
                    // the next run.
                    tracing::info!(worker, "shutdown during batch, leaving records queued");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(worker, error = %e, "batch processing failed");
                    self.fail_batch(&batch).await?;
                }
            }
        }
    }

    async fn process_batch(&self, batch: &[Record]) -> Result<()> {
        // Transform; a failing record is settled as `failed` immediately and
        // excluded from submission.
        let mut submitted: Vec<&Record> = Vec::with_capacity(batch.len());
        let mut converted: Vec<Value> = Vec::with_capacity(batch.len());
        let mut transform_failures: Vec<RecordOutcome> = Vec::new();
        for record in batch {
            match self.strategy.transform.convert(&record.payload) {
                Ok(payload) => {
                    converted.push(payload);
                    submitted.push(record);
                }
                Err(e) => {
                    tracing::warn!(source_id = record.source_id, error = %e, "transform failed");
                    transform_failures.push(RecordOutcome::failed(record.id, e.to_string()));
                }
            }
        }
        if !transform_failures.is_empty() {
            self.failed
                .fetch_add(transform_failures.len() as u64, Ordering::Relaxed);
            counter!("caravan_records_failed_total")
                .increment(transform_failures.len() as u64);
            self.store.record_outcomes(&transform_failures).await?;
        }
        if submitted.is_empty() {
            return Ok(());
        }

        let payload = self.strategy.build_payload(converted);
        let job = match self
            .dest
            .bulk_create(&self.strategy.resource_plural, &payload, &self.strategy.bulk_options)
            .await
        {
            Ok(job) => job,
            Err(CaravanError::Shutdown) => return Err(CaravanError::Shutdown),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    source_ids = ?submitted.iter().map(|r| r.source_id).collect::<Vec<_>>(),
                    "bulk submission failed"
                );
                return self.fail_submitted(&submitted).await;
            }
        };

        let job = match self.dest.wait_for_completion(job).await {
            Ok(job) => job,
            Err(CaravanError::Shutdown) => return Err(CaravanError::Shutdown),
            Err(e) => {
                // Job failed, or its completion could not be determined.
                tracing::error!(error = %e, "bulk job did not complete");
                return self.fail_submitted(&submitted).await;
            }
        };

        // Correlate results with the submitted batch: explicit index when
        // present, position otherwise.
        let mut outcomes = Vec::with_capacity(job.results.len());
        for (position, result) in job.results.iter().enumerate() {
            let index = result.index.unwrap_or(position);
            let Some(record) = submitted.get(index) else {
                tracing::warn!(job_id = %job.id, index, "job result index out of range");
                continue;
            };
            let outcome = match (result.error_message(), result.id) {
                (Some(message), _) => RecordOutcome::failed(record.id, message),
                (None, Some(destination_id)) => RecordOutcome::synced(record.id, destination_id),
                (None, None) => RecordOutcome::failed(record.id, "result carried no id"),
            };
            outcomes.push(outcome);
        }

        let synced = outcomes
            .iter()
            .filter(|o| o.status == RecordStatus::Synced)
            .count() as u64;
        let failed = outcomes.len() as u64 - synced;
        self.store.record_outcomes(&outcomes).await?;

        self.synced.fetch_add(synced, Ordering::Relaxed);
        self.failed.fetch_add(failed, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        counter!("caravan_records_synced_total").increment(synced);
        counter!("caravan_records_failed_total").increment(failed);
        Ok(())
    }

    async fn fail_submitted(&self, submitted: &[&Record]) -> Result<()> {
        let ids: Vec<i64> = submitted.iter().map(|r| r.id).collect();
        self.store.mark_job_failed(&ids).await?;
        self.job_failed.fetch_add(ids.len() as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        counter!("caravan_batches_job_failed_total").increment(1);
        Ok(())
    }

    async fn fail_batch(&self, batch: &[Record]) -> Result<()> {
        let refs: Vec<&Record> = batch.iter().collect();
        self.fail_submitted(&refs).await
    }
}

/// Aggregate result of one ingest run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Records created as `new`.
    pub inserted: u64,
    /// Records already present (unique key hit; includes rollover
    /// re-deliveries).
    pub duplicates: u64,
    /// Records skipped because their enrichment side-fetch failed.
    pub enrichment_failures: u64,
}

/// Extraction phase: drives the source pager into the record store.
pub struct Ingestor<S: RecordStore, H: HttpClient> {
    source: source::Client<H>,
    store: Arc<S>,
    resource_type: String,
    path: String,
    query: Vec<(String, String)>,
    filter: Option<RecordFilter>,
    enricher: Option<Arc<dyn Enrich<H>>>,
}

impl<S, H> Ingestor<S, H>
where
    S: RecordStore,
    H: HttpClient + 'static,
{
    pub fn new(
        source: source::Client<H>,
        store: Arc<S>,
        resource_type: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            resource_type: resource_type.into(),
            path: path.into(),
            query: Vec::new(),
            filter: None,
            enricher: None,
        }
    }

    /// Ticket preset: ordered by `updated_at` ascending, driven by the
    /// configured watermark.
    pub fn tickets(source: source::Client<H>, store: Arc<S>) -> Self {
        let query = source::ticket_query(source.config());
        Self::new(source, store, "ticket", "tickets").with_query(query)
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enrich<H>>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    #[tracing::instrument(skip(self), fields(resource_type = %self.resource_type, path = %self.path))]
    pub async fn run(&self) -> Result<IngestSummary> {
        let mut stream = self.source.import_stream(
            &self.path,
            self.query.clone(),
            self.filter.clone(),
            self.enricher.clone(),
        );

        let mut summary = IngestSummary::default();
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => {
                    let source_id =
                        record.get("id").and_then(Value::as_i64).ok_or_else(|| {
                            CaravanError::Validation("source record missing numeric id".into())
                        })?;
                    if self
                        .store
                        .insert_new(&self.resource_type, source_id, &record)
                        .await?
                    {
                        summary.inserted += 1;
                    } else {
                        summary.duplicates += 1;
                    }
                }
                Err(e @ CaravanError::Enrichment { .. }) => {
                    tracing::warn!(error = %e, "skipping record after enrichment failure");
                    summary.enrichment_failures += 1;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(?summary, "ingest finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dest::DestConfig;
    use crate::executor::{RequestExecutor, RetryPolicy};
    use crate::http::{HttpResponse, MockHttpClient};
    use crate::store::MemoryRecordStore;
    use serde_json::json;

    const DEST: &str = "https://dst.example.com/api/v2";

    fn dest_client(mock: &MockHttpClient) -> dest::Client<MockHttpClient> {
        let executor = Arc::new(RequestExecutor::new(
            Arc::new(mock.clone()),
            RetryPolicy::default(),
            CancellationToken::new(),
        ));
        dest::Client::new(DestConfig::new(DEST, "secret", "admin@example.com"), executor).unwrap()
    }

    fn passthrough() -> Arc<dyn Transform> {
        Arc::new(|payload: &Value| Ok(payload.clone()))
    }

    async fn seeded_store(resource_type: &str, count: i64) -> Arc<MemoryRecordStore> {
        let store = Arc::new(MemoryRecordStore::new());
        for source_id in 1..=count {
            store
                .insert_new(resource_type, source_id, &json!({ "id": source_id }))
                .await
                .unwrap();
        }
        store
    }

    fn importer(
        store: Arc<MemoryRecordStore>,
        mock: &MockHttpClient,
        strategy: EntityStrategy,
        worker_count: usize,
    ) -> Arc<Importer<MemoryRecordStore, MockHttpClient>> {
        Arc::new(Importer::new(
            store,
            dest_client(mock),
            strategy,
            ImportConfig {
                worker_count,
                claim_lease: Duration::from_secs(900),
            },
            CancellationToken::new(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn drains_queue_and_records_outcomes() {
        let store = seeded_store("user", 3).await;
        let mock = MockHttpClient::new();

        // First batch of two.
        mock.add_response(
            &format!("POST {DEST}/users/create_many"),
            Ok(HttpResponse::new(
                200,
                json!({ "job_status": { "id": "j1", "status": "queued" } }).to_string(),
            )),
        );
        mock.add_response(
            &format!("GET {DEST}/job_statuses/j1"),
            Ok(HttpResponse::new(
                200,
                json!({
                    "job_status": {
                        "id": "j1",
                        "status": "completed",
                        "results": [
                            { "index": 0, "id": 501 },
                            { "index": 1, "error": "RecordInvalid", "details": "bad email" },
                        ],
                    }
                })
                .to_string(),
            )),
        );
        // Second batch of one.
        mock.add_response(
            &format!("POST {DEST}/users/create_many"),
            Ok(HttpResponse::new(
                200,
                json!({ "job_status": { "id": "j2", "status": "queued" } }).to_string(),
            )),
        );
        mock.add_response(
            &format!("GET {DEST}/job_statuses/j2"),
            Ok(HttpResponse::new(
                200,
                json!({
                    "job_status": {
                        "id": "j2",
                        "status": "completed",
                        "results": [{ "id": 503 }],
                    }
                })
                .to_string(),
            )),
        );

        let strategy = EntityStrategy::new("user", "users", 2, passthrough());
        let summary = importer(store.clone(), &mock, strategy, 1)
            .run()
            .await
            .unwrap();

        assert_eq!(
            summary,
            ImportSummary {
                batches: 2,
                synced: 2,
                failed: 1,
                job_failed: 0,
            }
        );

        let counts = store.status_counts("user").await.unwrap();
        assert_eq!(counts.get(&RecordStatus::Synced), Some(&2));
        assert_eq!(counts.get(&RecordStatus::Failed), Some(&1));

        let failed = store
            .records_by_status("user", RecordStatus::Failed)
            .await
            .unwrap();
        assert_eq!(
            failed[0].destination_error.as_deref(),
            Some("RecordInvalid: bad email")
        );

        // Result without an explicit index correlated by position.
        let map = store.destination_id_map("user").await.unwrap();
        assert_eq!(map.get(&3), Some(&503));
    }

    #[tokio::test(start_paused = true)]
    async fn submission_failure_marks_batch_job_failed_and_continues() {
        let store = seeded_store("user", 3).await;
        let mock = MockHttpClient::new();

        // First batch: destination rejects the submission outright.
        mock.add_response(
            &format!("POST {DEST}/users/create_many"),
            Ok(HttpResponse::new(500, "boom")),
        );
        // Second batch still goes through.
        mock.add_response(
            &format!("POST {DEST}/users/create_many"),
            Ok(HttpResponse::new(
                200,
                json!({ "job_status": { "id": "j1", "status": "queued" } }).to_string(),
            )),
        );
        mock.add_response(
            &format!("GET {DEST}/job_statuses/j1"),
            Ok(HttpResponse::new(
                200,
                json!({
                    "job_status": {
                        "id": "j1",
                        "status": "completed",
                        "results": [{ "index": 0, "id": 600 }],
                    }
                })
                .to_string(),
            )),
        );

        let strategy = EntityStrategy::new("user", "users", 2, passthrough());
        let summary = importer(store.clone(), &mock, strategy, 1)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.job_failed, 2);
        assert_eq!(summary.synced, 1);

        let counts = store.status_counts("user").await.unwrap();
        assert_eq!(counts.get(&RecordStatus::JobFailed), Some(&2));
        assert_eq!(counts.get(&RecordStatus::Synced), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn job_failure_marks_batch_job_failed() {
        let store = seeded_store("user", 1).await;
        let mock = MockHttpClient::new();
        mock.add_response(
            &format!("POST {DEST}/users/create_many"),
            Ok(HttpResponse::new(
                200,
                json!({ "job_status": { "id": "j9", "status": "working" } }).to_string(),
            )),
        );
        mock.add_response(
            &format!("GET {DEST}/job_statuses/j9"),
            Ok(HttpResponse::new(
                200,
                json!({
                    "job_status": { "id": "j9", "status": "killed", "progress": 0, "total": 1 }
                })
                .to_string(),
            )),
        );

        let strategy = EntityStrategy::new("user", "users", 10, passthrough());
        let summary = importer(store.clone(), &mock, strategy, 1)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.job_failed, 1);
        let counts = store.status_counts("user").await.unwrap();
        assert_eq!(counts.get(&RecordStatus::JobFailed), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn transform_failures_are_settled_without_submission() {
        let store = seeded_store("user", 2).await;
        let mock = MockHttpClient::new();
        mock.add_response(
            &format!("POST {DEST}/users/create_many"),
            Ok(HttpResponse::new(
                200,
                json!({ "job_status": { "id": "j1", "status": "queued" } }).to_string(),
            )),
        );
        mock.add_response(
            &format!("GET {DEST}/job_statuses/j1"),
            Ok(HttpResponse::new(
                200,
                json!({
                    "job_status": {
                        "id": "j1",
                        "status": "completed",
                        "results": [{ "index": 0, "id": 700 }],
                    }
                })
                .to_string(),
            )),
        );

        // Record with source_id 1 cannot be converted.
        let transform: Arc<dyn Transform> = Arc::new(|payload: &Value| {
            if payload["id"] == json!(1) {
                Err(CaravanError::Validation("no email".into()))
            } else {
                Ok(payload.clone())
            }
        });

        let strategy = EntityStrategy::new("user", "users", 10, transform);
        let summary = importer(store.clone(), &mock, strategy, 1)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.synced, 1);

        // The surviving record correlates against the submitted subset, not
        // the claimed batch.
        let map = store.destination_id_map("user").await.unwrap();
        assert_eq!(map.get(&2), Some(&700));

        let calls = mock.get_calls();
        let submitted: Value =
            serde_json::from_str(calls[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(submitted["users"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_importer_leaves_records_untouched() {
        let store = seeded_store("user", 2).await;
        let mock = MockHttpClient::new();

        let token = CancellationToken::new();
        token.cancel();
        let importer = Arc::new(Importer::new(
            store.clone(),
            dest_client(&mock),
            EntityStrategy::new("user", "users", 10, passthrough()),
            ImportConfig::default(),
            token,
        ));

        let summary = importer.run().await.unwrap();
        assert_eq!(summary, ImportSummary::default());
        assert_eq!(mock.call_count(), 0);

        let counts = store.status_counts("user").await.unwrap();
        assert_eq!(counts.get(&RecordStatus::New), Some(&2));
    }
}
