//! Source-system client: authenticated listing access with offset pagination.
//!
//! The source API lists resources page by page (`page`/`per_page` query
//! parameters) and supports an `updated_since` watermark for resumable
//! extraction. [`pager`] implements the page loop, the watermark rollover at
//! the page ceiling, and the record stream with filtering and enrichment.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::error::{CaravanError, Result};
use crate::executor::RequestExecutor;
use crate::http::HttpClient;
use crate::util::build_url;

pub mod pager;

pub use pager::{ConversationEnricher, Enrich, RecordFilter};

/// Static configuration for the source system.
///
/// Constructed once by the embedding application and passed by reference;
/// no process-global state.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// API base URL, e.g. `https://acme.example.com/api/v2`
    pub base_url: String,
    /// Static API token; sent as basic credentials.
    pub api_token: String,
    /// Initial `updated_since` watermark for ticket extraction.
    pub updated_since: Option<String>,
    /// Page size for listing endpoints.
    pub page_size: usize,
    /// Hard page-number ceiling imposed by the source API. When watermark
    /// paging reaches it, the pager rolls the watermark forward and resets
    /// the page counter.
    pub page_ceiling: u32,
}

impl SourceConfig {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            updated_since: None,
            page_size: 100,
            page_ceiling: 300,
        }
    }

    pub fn with_updated_since(mut self, watermark: impl Into<String>) -> Self {
        self.updated_since = Some(watermark.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(CaravanError::Validation("source base URL required".into()));
        }
        if self.api_token.is_empty() {
            return Err(CaravanError::Validation("source API token required".into()));
        }
        Ok(())
    }
}

/// Source API client.
pub struct Client<H: HttpClient> {
    executor: Arc<RequestExecutor<H>>,
    config: SourceConfig,
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
    pub fn new(config: SourceConfig, executor: Arc<RequestExecutor<H>>) -> Result<Self> {
        config.validate()?;
        Ok(Self { executor, config })
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub(crate) fn executor(&self) -> &RequestExecutor<H> {
        &self.executor
    }

    pub(crate) fn authorization(&self) -> Vec<(String, String)> {
        let credentials = BASE64.encode(format!("{}:X", self.config.api_token));
        vec![("Authorization".to_string(), format!("Basic {credentials}"))]
    }

    pub(crate) fn url(&self, path: &str, query: &[(String, String)]) -> Result<String> {
        build_url(&self.config.base_url, path, query)
    }

    /// Single GET against a relative path.
    pub async fn get(&self, path: &str, query: &[(String, String)]) -> Result<Value> {
        let url = self.url(path, query)?;
        self.executor
            .execute("GET", &url, &self.authorization(), None)
            .await
    }

    /// Fetch a single resource by id, failing on 404.
    pub async fn find_resource(&self, path: &str, id: i64) -> Result<Value> {
        self.get(&format!("{path}/{id}"), &[]).await
    }

    /// Fetch a single resource by id, mapping 404 to `None`.
    pub async fn find_resource_opt(&self, path: &str, id: i64) -> Result<Option<Value>> {
        match self.find_resource(path, id).await {
            Ok(value) => Ok(Some(value)),
            Err(CaravanError::Client { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lazy stream of pages from a listing endpoint.
    pub fn pages(&self, path: &str, query: Vec<(String, String)>) -> pager::PageStream {
        pager::pages(self.clone(), path.to_string(), query)
    }

    /// Collect every record from a listing endpoint.
    pub async fn all(&self, path: &str, query: Vec<(String, String)>) -> Result<Vec<Value>> {
        use futures::StreamExt;

        let mut stream = self.pages(path, query);
        let mut records = Vec::new();
        while let Some(page) = stream.next().await {
            records.extend(page?);
        }
        Ok(records)
    }

    /// Lazy stream of individual raw records from a listing endpoint.
    pub fn records(&self, path: &str, query: Vec<(String, String)>) -> pager::RecordStream {
        self.import_stream(path, query, None, None)
    }

    /// Lazy stream of records with an optional inclusion filter and optional
    /// per-record enrichment applied before emission.
    ///
    /// Records failing the filter are skipped. An enrichment failure is
    /// emitted as a [`CaravanError::Enrichment`] item for that record;
    /// pagination continues.
    pub fn import_stream(
        &self,
        path: &str,
        query: Vec<(String, String)>,
        filter: Option<RecordFilter>,
        enricher: Option<Arc<dyn Enrich<H>>>,
    ) -> pager::RecordStream {
        pager::records(self.clone(), path.to_string(), query, filter, enricher)
    }

    /// Ticket listing with the standard extraction parameters: ordered by
    /// `updated_at` ascending and driven by the configured watermark.
    pub fn tickets(
        &self,
        filter: Option<RecordFilter>,
        enricher: Option<Arc<dyn Enrich<H>>>,
    ) -> pager::RecordStream {
        self.import_stream("tickets", ticket_query(&self.config), filter, enricher)
    }
}

/// Standard ticket extraction parameters.
pub(crate) fn ticket_query(config: &SourceConfig) -> Vec<(String, String)> {
    let watermark = config
        .updated_since
        .clone()
        .unwrap_or_else(|| "2000-01-01".to_string());
    vec![
        ("include".to_string(), "description,requester".to_string()),
        ("order_type".to_string(), "asc".to_string()),
        ("order_by".to_string(), "updated_at".to_string()),
        ("updated_since".to_string(), watermark),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RetryPolicy;
    use crate::http::MockHttpClient;
    use tokio_util::sync::CancellationToken;

    fn client(mock: &MockHttpClient) -> Client<MockHttpClient> {
        let executor = Arc::new(RequestExecutor::new(
            Arc::new(mock.clone()),
            RetryPolicy::default(),
            CancellationToken::new(),
        ));
        Client::new(
            SourceConfig::new("https://src.example.com/api/v2", "token"),
            executor,
        )
        .unwrap()
    }

    #[test]
    fn missing_credentials_fail_validation() {
        let executor = Arc::new(RequestExecutor::new(
            Arc::new(MockHttpClient::new()),
            RetryPolicy::default(),
            CancellationToken::new(),
        ));
        let result = Client::new(SourceConfig::new("https://src.example.com", ""), executor);
        assert!(matches!(result, Err(CaravanError::Validation(_))));
    }

    #[test]
    fn authorization_is_basic_with_token() {
        let mock = MockHttpClient::new();
        let headers = client(&mock).authorization();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "Authorization");
        // base64("token:X")
        assert_eq!(headers[0].1, "Basic dG9rZW46WA==");
    }

    #[tokio::test]
    async fn find_resource_opt_maps_404_to_none() {
        let mock = MockHttpClient::new();
        mock.add_response(
            "GET https://src.example.com/api/v2/contacts/7",
            Ok(crate::http::HttpResponse::new(404, r#"{"message":"not found"}"#)),
        );

        let found = client(&mock).find_resource_opt("contacts", 7).await.unwrap();
        assert!(found.is_none());
    }
}
