//! Destination bulk-job types.
//!
//! A bulk submission (or bulk destroy) returns a job handle wrapped in a
//! `{"job_status": {...}}` envelope. The job is destination-owned and
//! ephemeral: it is polled to a terminal state and never persisted locally.

use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct JobEnvelope {
    pub job_status: Job,
}

/// A pollable destination-side bulk operation.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    /// Ordered per-item results, reported once the job completes.
    #[serde(default)]
    pub results: Vec<JobResult>,
}

impl Job {
    pub(crate) fn from_envelope(value: Value) -> Result<Job> {
        let envelope: JobEnvelope = serde_json::from_value(value)?;
        Ok(envelope.job_status)
    }
}

/// Destination job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Working,
    Completed,
    Failed,
    Killed,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// Still making progress; keep polling.
    pub fn is_open(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Working)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Working => "working",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
            JobStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One item's outcome within a completed job.
///
/// The destination may report an explicit `index` into the submitted batch;
/// absent an index, callers correlate by position.
#[derive(Debug, Clone, Deserialize)]
pub struct JobResult {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

impl JobResult {
    /// Destination-supplied error text, `"{error}: {details}"` when details
    /// are present.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|error| match &self.details {
            Some(details) => format!("{error}: {details}"),
            None => error.clone(),
        })
    }
}
