//! Resumable batch migration engine for helpdesk records.
//!
//! This crate moves records from a source helpdesk system to a destination
//! helpdesk system through a repeatable, interruptible pipeline: extract
//! pages of records, persist them in a durable work queue with a status,
//! transform and submit them in bulk, and track per-record outcome. A
//! long-running migration can stop and resume without re-processing
//! completed work or losing failures.
//!
//! The pipeline is built from a few pieces:
//! - [`source::Client`] pages the source listing API (offset pagination with
//!   a watermark rollover at the source's page ceiling) and streams records
//!   through an optional filter and enrichment step.
//! - [`store::RecordStore`] is the durable work queue and the only
//!   synchronization point between workers; claiming a batch atomically
//!   moves records from `new` to `queued`.
//! - [`dest::Client`] submits batches to the destination's asynchronous bulk
//!   endpoints and polls the resulting job to a terminal state; it also
//!   pages destination listings (three cursor envelope shapes).
//! - [`executor::RequestExecutor`] issues every remote call, applying
//!   server-directed waits for rate limits and bounded exponential backoff
//!   for transient network failures.
//! - [`migrate::Importer`] runs the worker pool; [`migrate::Ingestor`] runs
//!   the extraction phase; [`migrate::Reconciler`] settles records the
//!   destination already holds.

pub mod dest;
pub mod error;
pub mod executor;
pub mod http;
pub mod migrate;
pub mod source;
pub mod store;
mod util;

// Re-export commonly used types
pub use dest::{DestConfig, Job, JobResult, JobStatus};
pub use error::{CaravanError, Result};
pub use executor::{RequestExecutor, RetryPolicy};
pub use http::{HttpClient, HttpRequest, HttpResponse, MockHttpClient, ReqwestHttpClient};
pub use migrate::{
    EntityStrategy, ImportConfig, ImportSummary, Importer, IngestSummary, Ingestor, Reconciler,
    Transform,
};
pub use source::{ConversationEnricher, Enrich, RecordFilter, SourceConfig};
#[cfg(feature = "postgres")]
pub use store::PgRecordStore;
pub use store::{MemoryRecordStore, Record, RecordOutcome, RecordStatus, RecordStore};
pub use util::utc_format;

/// Get the caravan database migrator.
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
