//! HTTP client abstraction for making requests.
//!
//! This module defines the `HttpClient` trait to abstract HTTP request
//! execution, enabling testability with mock implementations. Retry and
//! backoff policy lives one level up in [`crate::executor`]; implementations
//! here perform exactly one attempt.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A single HTTP request to be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method (e.g., "GET", "POST", "DELETE")
    pub method: String,
    /// Full request URL including query string
    pub url: String,
    /// Headers to send (name, value) pairs
    pub headers: Vec<(String, String)>,
    /// Optional JSON body, already serialized
    pub body: Option<String>,
}

/// Response from an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Value of the `retry-after` header in seconds, when present
    pub retry_after: Option<u64>,
    /// Response body as a string
    pub body: String,
}

impl HttpResponse {
    /// Convenience constructor for responses without a `retry-after` header.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }
}

/// Trait for executing HTTP requests.
///
/// This abstraction allows for different implementations (production vs.
/// testing) and makes the executor and pagination logic testable without
/// making real HTTP calls.
#[async_trait]
pub trait HttpClient: Send + Sync + Clone {
    /// Execute a single HTTP request attempt.
    ///
    /// # Errors
    /// Returns an error if the request fails at the transport level (network
    /// issues, timeout, invalid URL). Non-2xx responses are *not* errors at
    /// this layer; the executor classifies them.
    async fn execute(&self, request: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production HTTP client using reqwest.
#[derive(Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse> {
        let method: reqwest::Method = request.method.parse().map_err(|e| {
            anyhow::anyhow!("invalid HTTP method '{}': {}", request.method, e)
        })?;

        let mut req = self
            .client
            .request(method, &request.url)
            .timeout(Duration::from_millis(timeout_ms));

        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            req = req
                .header("Content-Type", "application/json")
                .body(body.clone());
        }

        let response = req.send().await?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.text().await?;

        tracing::debug!(status, response_len = body.len(), "HTTP request completed");

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Mock HTTP client for testing.
///
/// Allows configuring predetermined responses for specific requests without
/// making actual HTTP calls. Responses are keyed by `"{method} {url}"` and
/// returned in FIFO order when multiple are queued for the same key.
///
/// # Example
/// ```ignore
/// let mock = MockHttpClient::new();
/// mock.add_response(
///     "GET https://api.example.com/tickets?page=1",
///     Ok(HttpResponse::new(200, "[]")),
/// );
/// ```
#[derive(Clone, Default)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<Result<HttpResponse>>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout_ms: u64,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a `"{method} {url}"` key.
    pub fn add_response(&self, key: &str, response: Result<HttpResponse>) {
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(response);
    }

    /// Get all calls that have been made to this mock client.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Clear all recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: &HttpRequest, timeout_ms: u64) -> Result<HttpResponse> {
        self.calls.lock().push(MockCall {
            method: request.method.clone(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            timeout_ms,
        });

        let key = format!("{} {}", request.method, request.url);
        let response = {
            let mut responses = self.responses.lock();
            match responses.get_mut(&key) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };

        response.unwrap_or_else(|| {
            Err(crate::error::CaravanError::Other(anyhow::anyhow!(
                "no mock response configured for {} {}",
                request.method,
                request.url
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: vec![],
            body: None,
        }
    }

    #[tokio::test]
    async fn mock_client_basic() {
        let mock = MockHttpClient::new();
        mock.add_response(
            "GET https://api.example.com/status",
            Ok(HttpResponse::new(200, "success")),
        );

        let response = mock
            .execute(&get("https://api.example.com/status"), 5000)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "success");

        let calls = mock.get_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "GET");
        assert_eq!(calls[0].url, "https://api.example.com/status");
    }

    #[tokio::test]
    async fn mock_client_fifo_responses() {
        let mock = MockHttpClient::new();
        mock.add_response(
            "GET https://api.example.com/status",
            Ok(HttpResponse::new(200, "first")),
        );
        mock.add_response(
            "GET https://api.example.com/status",
            Ok(HttpResponse::new(200, "second")),
        );

        let request = get("https://api.example.com/status");
        assert_eq!(mock.execute(&request, 5000).await.unwrap().body, "first");
        assert_eq!(mock.execute(&request, 5000).await.unwrap().body, "second");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_client_no_response_configured() {
        let mock = MockHttpClient::new();
        let result = mock.execute(&get("https://api.example.com/unknown"), 5000).await;
        assert!(result.is_err());
    }
}
