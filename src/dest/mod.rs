//! Destination-system client: bulk submission, job polling, cursor
//! pagination, and bulk destruction.
//!
//! The destination exposes asynchronous bulk endpoints that return a
//! pollable [`Job`], plus paginated listings whose envelopes indicate the
//! next page in one of three shapes (checked in priority order): an explicit
//! `next_page` URL, a `links.next` field, or a `meta` block with `has_more`
//! and an opaque `after_cursor`.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::Stream;
use futures::StreamExt;
use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{CaravanError, Result};
use crate::executor::RequestExecutor;
use crate::http::HttpClient;
use crate::util::build_url;

pub mod job;

pub use job::{Job, JobResult, JobStatus};

/// Stream of raw listing pages from the destination.
pub type PageStream = Pin<Box<dyn Stream<Item = Result<Vec<Value>>> + Send>>;

/// Stream of individual destination records.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Static configuration for the destination system.
#[derive(Debug, Clone)]
pub struct DestConfig {
    /// API base URL, e.g. `https://acme.example.com/api/v2`
    pub base_url: String,
    /// Static API token.
    pub api_token: String,
    /// Admin identity the token belongs to.
    pub admin_email: String,
    /// Fixed interval between job status polls.
    pub poll_interval: Duration,
}

impl DestConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        admin_email: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            admin_email: admin_email.into(),
            poll_interval: Duration::from_secs(5),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(CaravanError::Validation(
                "destination base URL required".into(),
            ));
        }
        if self.api_token.is_empty() {
            return Err(CaravanError::Validation(
                "destination API token required".into(),
            ));
        }
        if self.admin_email.is_empty() {
            return Err(CaravanError::Validation(
                "destination admin email required".into(),
            ));
        }
        Ok(())
    }
}

/// Destination API client.
pub struct Client<H: HttpClient> {
    executor: Arc<RequestExecutor<H>>,
    config: DestConfig,
}

impl<H: HttpClient> Clone for Client<H> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            config: self.config.clone(),
        }
    }
}

impl<H: HttpClient + 'static> Client<H> {
    pub fn new(config: DestConfig, executor: Arc<RequestExecutor<H>>) -> Result<Self> {
        config.validate()?;
        Ok(Self { executor, config })
    }

    pub fn config(&self) -> &DestConfig {
        &self.config
    }

    fn authorization(&self) -> Vec<(String, String)> {
        let credentials = BASE64.encode(format!(
            "{}/token:{}",
            self.config.admin_email, self.config.api_token
        ));
        vec![("Authorization".to_string(), format!("Basic {credentials}"))]
    }

    fn url(&self, path: &str, query: &[(String, String)]) -> Result<String> {
        build_url(&self.config.base_url, path, query)
    }

    async fn get_url(&self, url: &str) -> Result<Value> {
        self.executor
            .execute("GET", url, &self.authorization(), None)
            .await
    }

    /// Single GET against a relative path.
    pub async fn get(&self, path: &str, query: &[(String, String)]) -> Result<Value> {
        let url = self.url(path, query)?;
        self.get_url(&url).await
    }

    /// Fetch a single resource by id.
    pub async fn find_resource(&self, path: &str, id: &str) -> Result<Value> {
        self.get(&format!("{path}/{id}"), &[]).await
    }

    /// Submit a bulk-create payload, returning the pollable job handle.
    ///
    /// Tickets go through the dedicated import endpoint; every other
    /// resource family uses its `create_many` endpoint.
    #[tracing::instrument(skip(self, payload), fields(resource = %resource_plural))]
    pub async fn bulk_create(
        &self,
        resource_plural: &str,
        payload: &Value,
        options: &[(String, String)],
    ) -> Result<Job> {
        let path = bulk_import_path(resource_plural);
        let url = self.url(&path, options)?;
        let response = self
            .executor
            .execute("POST", &url, &self.authorization(), Some(payload))
            .await?;
        Job::from_envelope(response)
    }

    /// Single job status fetch.
    pub async fn job_status(&self, id: &str) -> Result<Job> {
        let response = self.get(&format!("job_statuses/{id}"), &[]).await?;
        Job::from_envelope(response)
    }

    /// Poll a job to a terminal state.
    ///
    /// Sleeps the configured interval between polls (cancellable). Returns
    /// the completed job; any other terminal status fails with
    /// [`CaravanError::JobFailed`] carrying the last known progress.
    pub async fn wait_for_completion(&self, mut job: Job) -> Result<Job> {
        while job.status.is_open() {
            self.executor.wait(self.config.poll_interval).await?;
            job = self.job_status(&job.id).await?;
            tracing::info!(
                job_id = %job.id,
                status = %job.status,
                progress = ?job.progress,
                total = ?job.total,
                "job progress"
            );
        }

        if job.status != JobStatus::Completed {
            counter!("caravan_jobs_failed_total").increment(1);
            return Err(CaravanError::JobFailed {
                id: job.id,
                status: job.status.to_string(),
                progress: job.progress,
                total: job.total,
            });
        }
        counter!("caravan_jobs_completed_total").increment(1);
        Ok(job)
    }

    /// Lazy stream of pages from a cursor-paginated listing endpoint.
    pub fn pages(&self, path: &str, query: Vec<(String, String)>) -> PageStream {
        let client = self.clone();
        let path = path.to_string();
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            client.run_cursor_pager(path, query, tx).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }

    /// Lazy stream of individual records from a cursor-paginated listing.
    pub fn records(&self, path: &str, query: Vec<(String, String)>) -> RecordStream {
        let mut page_stream = self.pages(path, query);
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(page) = page_stream.next().await {
                match page {
                    Ok(records) => {
                        for record in records {
                            if tx.send(Ok(record)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn run_cursor_pager(
        &self,
        path: String,
        query: Vec<(String, String)>,
        tx: mpsc::Sender<Result<Vec<Value>>>,
    ) {
        let mut next_url = match self.url(&path, &query) {
            Ok(url) => Some(url),
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        while let Some(url) = next_url.take() {
            let response = match self.get_url(&url).await {
                Ok(response) => response,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let records = cursor_page_records(&response, &path);
            if records.is_empty() {
                break;
            }
            if tx.send(Ok(records)).await.is_err() {
                return;
            }

            next_url = match self.next_page_url(&response, &path, &query) {
                Ok(next) => next,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
        }

        tracing::debug!(path = %path, "all pages loaded");
    }

    /// Resolve the next-page indicator, checking the three envelope shapes
    /// in priority order.
    fn next_page_url(
        &self,
        response: &Value,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Option<String>> {
        // An explicit next_page key wins, even when null (null ends paging).
        if let Some(next) = response.get("next_page") {
            return Ok(next
                .as_str()
                .filter(|s| !s.is_empty())
                .map(str::to_owned));
        }

        if let Some(next) = response
            .pointer("/links/next")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            return Ok(Some(next.to_string()));
        }

        let meta = response.get("meta");
        let has_more = meta
            .and_then(|m| m.get("has_more"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let after_cursor = meta
            .and_then(|m| m.get("after_cursor"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());

        match (has_more, after_cursor) {
            (true, Some(cursor)) => {
                let mut next_query = query.to_vec();
                next_query.push(("page[after]".to_string(), cursor.to_string()));
                self.url(path, &next_query).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Soft-delete tickets in bulk; polls the resulting job and returns its
    /// per-item results.
    pub async fn bulk_soft_delete(&self, ids: &[i64]) -> Result<Vec<JobResult>> {
        self.bulk_destroy("tickets/destroy_many", ids).await
    }

    /// Permanently delete already soft-deleted tickets in bulk.
    pub async fn bulk_permanent_delete(&self, ids: &[i64]) -> Result<Vec<JobResult>> {
        self.bulk_destroy("deleted_tickets/destroy_many", ids).await
    }

    async fn bulk_destroy(&self, path: &str, ids: &[i64]) -> Result<Vec<JobResult>> {
        let joined = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let url = self.url(path, &[("ids".to_string(), joined)])?;
        let response = self
            .executor
            .execute("DELETE", &url, &self.authorization(), None)
            .await?;
        let job = Job::from_envelope(response)?;
        let job = self.wait_for_completion(job).await?;
        Ok(job.results)
    }
}

fn bulk_import_path(resource_plural: &str) -> String {
    match resource_plural {
        "tickets" => "imports/tickets/create_many".to_string(),
        other => format!("{other}/create_many"),
    }
}

/// Cursor listings put records under `results` or under the path-named key.
fn cursor_page_records(response: &Value, path: &str) -> Vec<Value> {
    let key = path.rsplit('/').next().unwrap_or(path);
    let records = if let Some(results) = response.get("results") {
        results
    } else if let Some(named) = response.get(key) {
        named
    } else {
        return Vec::new();
    };
    records.as_array().cloned().unwrap_or_default()
}
