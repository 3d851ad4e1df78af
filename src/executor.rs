//! Remote request executor with retry and backoff policy.
//!
//! Wraps an [`HttpClient`] and applies the retry rules the migration relies
//! on: server-directed waits for rate limits (capped attempts), bounded
//! exponential backoff for transient network failures, and immediate
//! propagation of other 4xx/5xx responses with the body captured for
//! diagnostics. Every wait is cancellable, so a shutdown signal interrupts a
//! backoff without corrupting the retry counters.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{CaravanError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};

/// Retry and backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after a 429 before giving up.
    pub rate_limit_max_retries: u32,

    /// Wait applied when a 429 carries no `retry-after` header.
    pub rate_limit_default_wait: Duration,

    /// Maximum number of attempts for timeouts and connection resets.
    pub transient_max_attempts: u32,

    /// First backoff after a transient failure (exponentially increased).
    pub transient_base_backoff: Duration,

    /// Factor by which the transient backoff grows with each attempt.
    pub transient_backoff_factor: u32,

    /// Ceiling for the transient backoff.
    pub transient_max_backoff: Duration,

    /// Timeout for each individual request attempt in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_max_retries: 6,
            rate_limit_default_wait: Duration::from_secs(10),
            transient_max_attempts: 5,
            transient_base_backoff: Duration::from_secs(30),
            transient_backoff_factor: 2,
            transient_max_backoff: Duration::from_secs(300),
            timeout_ms: 60_000,
        }
    }
}

/// Issues HTTP calls through an [`HttpClient`], applying [`RetryPolicy`].
///
/// One executor is shared by the source and destination clients; it holds the
/// cancellation token that every retry wait and poll interval observes.
pub struct RequestExecutor<H: HttpClient> {
    client: Arc<H>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl<H: HttpClient> RequestExecutor<H> {
    pub fn new(client: Arc<H>, policy: RetryPolicy, shutdown: CancellationToken) -> Self {
        Self {
            client,
            policy,
            shutdown,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Perform a request and parse the response body as JSON.
    ///
    /// An empty body parses as `Value::Null` (bulk-destroy endpoints return
    /// no content on some deployments).
    #[tracing::instrument(skip(self, headers, body))]
    pub async fn execute(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let request = HttpRequest {
            method: method.to_string(),
            url: url.to_string(),
            headers: headers.to_vec(),
            body: body.map(|b| b.to_string()),
        };

        let mut rate_limit_retries: u32 = 0;
        let mut transient_attempts: u32 = 0;

        loop {
            tracing::debug!(method, url, "STARTED {} '{}'", method, url);
            match self.client.execute(&request, self.policy.timeout_ms).await {
                Ok(response) if response.status == 429 => {
                    counter!("caravan_rate_limited_total").increment(1);
                    if rate_limit_retries >= self.policy.rate_limit_max_retries {
                        tracing::error!(
                            retries = rate_limit_retries,
                            "rate limit retry budget exhausted"
                        );
                        return Err(CaravanError::RateLimited {
                            attempts: rate_limit_retries + 1,
                            body: response.body,
                        });
                    }
                    let wait = response
                        .retry_after
                        .map(Duration::from_secs)
                        .unwrap_or(self.policy.rate_limit_default_wait);
                    tracing::warn!(
                        retry_after_secs = wait.as_secs(),
                        retries = rate_limit_retries,
                        max_retries = self.policy.rate_limit_max_retries,
                        "rate limited, retrying after server-directed wait"
                    );
                    self.wait(wait).await?;
                    rate_limit_retries += 1;
                }
                Ok(response) if (400..500).contains(&response.status) => {
                    tracing::error!(status = response.status, body = %response.body, "client error");
                    return Err(CaravanError::Client {
                        status: response.status,
                        body: response.body,
                    });
                }
                Ok(response) if response.status >= 500 => {
                    tracing::error!(status = response.status, body = %response.body, "server error");
                    return Err(CaravanError::Server {
                        status: response.status,
                        body: response.body,
                    });
                }
                Ok(response) => {
                    tracing::debug!(method, url, "COMPLETED {} '{}'", method, url);
                    return parse_body(&response);
                }
                Err(e) if e.is_transient() => {
                    transient_attempts += 1;
                    counter!("caravan_transient_retries_total").increment(1);
                    if transient_attempts >= self.policy.transient_max_attempts {
                        tracing::error!(
                            attempts = transient_attempts,
                            error = %e,
                            "transient failure persisted through backoff schedule"
                        );
                        return Err(CaravanError::Transient {
                            attempts: transient_attempts,
                            error: e.to_string(),
                        });
                    }
                    let backoff = self.transient_backoff(transient_attempts - 1);
                    tracing::warn!(
                        attempt = transient_attempts,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "transient network failure, backing off"
                    );
                    self.wait(backoff).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cancellable sleep. Returns `Shutdown` if the token fires first, or was
    /// already cancelled on entry.
    pub async fn wait(&self, duration: Duration) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(CaravanError::Shutdown);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.shutdown.cancelled() => Err(CaravanError::Shutdown),
        }
    }

    fn transient_backoff(&self, prior_attempts: u32) -> Duration {
        let base = self.policy.transient_base_backoff.as_millis() as u64;
        let factor = u64::from(self.policy.transient_backoff_factor);
        let exponential = base.saturating_mul(factor.saturating_pow(prior_attempts));
        Duration::from_millis(exponential).min(self.policy.transient_max_backoff)
    }
}

fn parse_body(response: &HttpResponse) -> Result<Value> {
    if response.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&response.body)?)
}
