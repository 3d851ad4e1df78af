//! Offset pagination over source listing endpoints.
//!
//! Pages are fetched lazily with `page`/`per_page` query parameters.
//! Iteration stops when a page comes back empty or shorter than the page
//! size. When paging is driven by an `updated_since` watermark and the page
//! counter reaches the source's hard ceiling, the watermark advances to the
//! last item's `updated_at` and the counter resets to 1. A bounded number of
//! records can be re-delivered; the store's unique key absorbs them.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::Stream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::Client;
use crate::error::{CaravanError, Result};
use crate::http::HttpClient;
use crate::util::utc_format;

/// Stream of raw listing pages.
pub type PageStream = Pin<Box<dyn Stream<Item = Result<Vec<Value>>> + Send>>;

/// Stream of individual raw records.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Client-side inclusion predicate; records failing it are skipped before
/// emission and never persisted.
pub type RecordFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Per-record side-fetch applied before emission (e.g. loading
/// sub-resources).
#[async_trait]
pub trait Enrich<H: HttpClient>: Send + Sync {
    async fn enrich(&self, client: &Client<H>, record: &mut Value) -> Result<()>;
}

/// Loads a ticket's conversations into the record under `"conversations"`.
pub struct ConversationEnricher;

#[async_trait]
impl<H: HttpClient + 'static> Enrich<H> for ConversationEnricher {
    async fn enrich(&self, client: &Client<H>, record: &mut Value) -> Result<()> {
        let id = record
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| CaravanError::Validation("ticket record missing id".into()))?;
        let conversations = client
            .all(&format!("tickets/{id}/conversations"), Vec::new())
            .await?;
        record["conversations"] = Value::Array(conversations);
        Ok(())
    }
}

pub(crate) fn pages<H: HttpClient + 'static>(
    client: Client<H>,
    path: String,
    query: Vec<(String, String)>,
) -> PageStream {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(run_pager(client, path, query, tx));
    Box::pin(ReceiverStream::new(rx))
}

async fn run_pager<H: HttpClient + 'static>(
    client: Client<H>,
    path: String,
    mut query: Vec<(String, String)>,
    tx: mpsc::Sender<Result<Vec<Value>>>,
) {
    let page_size = client.config().page_size;
    let ceiling = client.config().page_ceiling;
    let watermark_driven = query.iter().any(|(k, _)| k == "updated_since");
    let mut page: u32 = 1;

    loop {
        let mut page_query = query.clone();
        page_query.push(("per_page".to_string(), page_size.to_string()));
        page_query.push(("page".to_string(), page.to_string()));

        let url = match client.url(&path, &page_query) {
            Ok(url) => url,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        let response = match client
            .executor()
            .execute("GET", &url, &client.authorization(), None)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let records = page_records(response, &path);
        if records.is_empty() {
            break;
        }
        let count = records.len();
        let last_updated_at = records
            .last()
            .and_then(|r| r.get("updated_at"))
            .and_then(Value::as_str)
            .map(utc_format);

        if tx.send(Ok(records)).await.is_err() {
            return;
        }
        if count < page_size {
            break;
        }

        if watermark_driven && page == ceiling {
            match last_updated_at {
                Some(watermark) => {
                    tracing::info!(page, %watermark, "page ceiling reached, advancing watermark");
                    for (key, value) in query.iter_mut() {
                        if key == "updated_since" {
                            *value = watermark.clone();
                        }
                    }
                    page = 1;
                }
                None => {
                    tracing::warn!(page, "page ceiling reached but last record carries no updated_at");
                    page += 1;
                }
            }
        } else {
            page += 1;
        }
    }

    tracing::debug!(path = %path, "all pages loaded");
}

/// Listing responses are either a bare array or an envelope keyed by the
/// resource name (falling back to `results`).
fn page_records(response: Value, path: &str) -> Vec<Value> {
    match response {
        Value::Array(records) => records,
        Value::Object(mut map) => {
            let key = path.rsplit('/').next().unwrap_or(path);
            match map.remove(key).or_else(|| map.remove("results")) {
                Some(Value::Array(records)) => records,
                _ => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

pub(crate) fn records<H: HttpClient + 'static>(
    client: Client<H>,
    path: String,
    query: Vec<(String, String)>,
    filter: Option<RecordFilter>,
    enricher: Option<Arc<dyn Enrich<H>>>,
) -> RecordStream {
    let (tx, rx) = mpsc::channel(32);
    let mut page_stream = pages(client.clone(), path, query);

    tokio::spawn(async move {
        while let Some(page) = page_stream.next().await {
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            for mut record in page {
                if let Some(filter) = &filter {
                    if !filter(&record) {
                        continue;
                    }
                }
                if let Some(enricher) = &enricher {
                    if let Err(e) = enricher.enrich(&client, &mut record).await {
                        if matches!(e, CaravanError::Shutdown) {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                        let source_id = record.get("id").and_then(Value::as_i64).unwrap_or(-1);
                        let enrichment = CaravanError::Enrichment {
                            source_id,
                            source: Box::new(e),
                        };
                        tracing::warn!(source_id, error = %enrichment, "enrichment failed, skipping record");
                        if tx.send(Err(enrichment)).await.is_err() {
                            return;
                        }
                        continue;
                    }
                }
                if tx.send(Ok(record)).await.is_err() {
                    return;
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{RequestExecutor, RetryPolicy};
    use crate::http::{HttpResponse, MockHttpClient};
    use crate::source::SourceConfig;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    const BASE: &str = "https://src.example.com/api/v2";

    fn client(mock: &MockHttpClient, page_size: usize, page_ceiling: u32) -> Client<MockHttpClient> {
        let executor = Arc::new(RequestExecutor::new(
            Arc::new(mock.clone()),
            RetryPolicy::default(),
            CancellationToken::new(),
        ));
        let mut config = SourceConfig::new(BASE, "token");
        config.page_size = page_size;
        config.page_ceiling = page_ceiling;
        Client::new(config, executor).unwrap()
    }

    fn page_body(ids: &[i64]) -> String {
        let records: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
        Value::Array(records).to_string()
    }

    #[tokio::test]
    async fn stops_when_page_is_shorter_than_page_size() {
        let mock = MockHttpClient::new();
        mock.add_response(
            &format!("GET {BASE}/tickets?page=1&per_page=2"),
            Ok(HttpResponse::new(200, page_body(&[1, 2]))),
        );
        mock.add_response(
            &format!("GET {BASE}/tickets?page=2&per_page=2"),
            Ok(HttpResponse::new(200, page_body(&[3]))),
        );

        let client = client(&mock, 2, 300);
        let records = client.all("tickets", Vec::new()).await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn stops_on_empty_page() {
        let mock = MockHttpClient::new();
        mock.add_response(
            &format!("GET {BASE}/tickets?page=1&per_page=2"),
            Ok(HttpResponse::new(200, page_body(&[1, 2]))),
        );
        mock.add_response(
            &format!("GET {BASE}/tickets?page=2&per_page=2"),
            Ok(HttpResponse::new(200, "[]")),
        );

        let client = client(&mock, 2, 300);
        let records = client.all("tickets", Vec::new()).await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn unwraps_enveloped_pages() {
        let mock = MockHttpClient::new();
        mock.add_response(
            &format!("GET {BASE}/groups?page=1&per_page=2"),
            Ok(HttpResponse::new(
                200,
                json!({ "groups": [{ "id": 9 }] }).to_string(),
            )),
        );

        let client = client(&mock, 2, 300);
        let records = client.all("groups", Vec::new()).await.unwrap();

        assert_eq!(records, vec![json!({ "id": 9 })]);
    }

    #[tokio::test]
    async fn rolls_watermark_forward_at_page_ceiling() {
        let mock = MockHttpClient::new();
        mock.add_response(
            &format!("GET {BASE}/tickets?page=1&per_page=2&updated_since=2020-01-01"),
            Ok(HttpResponse::new(
                200,
                json!([
                    { "id": 1, "updated_at": "2020-02-01T00:00:00Z" },
                    { "id": 2, "updated_at": "2020-03-01T00:00:00Z" },
                ])
                .to_string(),
            )),
        );
        mock.add_response(
            &format!("GET {BASE}/tickets?page=2&per_page=2&updated_since=2020-01-01"),
            Ok(HttpResponse::new(
                200,
                json!([
                    { "id": 3, "updated_at": "2020-04-01T00:00:00Z" },
                    { "id": 4, "updated_at": "2020-06-01T12:00:00+00:00" },
                ])
                .to_string(),
            )),
        );
        // After the ceiling (2), the watermark advances to the last item's
        // normalized updated_at and the page counter resets.
        mock.add_response(
            &format!("GET {BASE}/tickets?page=1&per_page=2&updated_since=2020-06-01T12%3A00%3A00Z"),
            Ok(HttpResponse::new(
                200,
                json!([{ "id": 4, "updated_at": "2020-06-01T12:00:00Z" }]).to_string(),
            )),
        );

        let client = client(&mock, 2, 2);
        let query = vec![("updated_since".to_string(), "2020-01-01".to_string())];
        let records = client.all("tickets", query).await.unwrap();

        // Record 4 is re-delivered after the rollover; nothing is skipped.
        assert_eq!(records.len(), 5);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn filter_skips_records_before_emission() {
        let mock = MockHttpClient::new();
        mock.add_response(
            &format!("GET {BASE}/tickets?page=1&per_page=10"),
            Ok(HttpResponse::new(
                200,
                json!([
                    { "id": 1, "status": 4 },
                    { "id": 2, "status": 2 },
                    { "id": 3, "status": 5 },
                ])
                .to_string(),
            )),
        );

        let client = client(&mock, 10, 300);
        let filter: RecordFilter = Arc::new(|record| {
            matches!(record["status"].as_i64(), Some(4) | Some(5))
        });
        let mut stream = client.import_stream("tickets", Vec::new(), Some(filter), None);

        let mut ids = Vec::new();
        while let Some(record) = stream.next().await {
            ids.push(record.unwrap()["id"].as_i64().unwrap());
        }
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn enricher_attaches_conversations() {
        let mock = MockHttpClient::new();
        mock.add_response(
            &format!("GET {BASE}/tickets?page=1&per_page=10"),
            Ok(HttpResponse::new(200, json!([{ "id": 1 }]).to_string())),
        );
        mock.add_response(
            &format!("GET {BASE}/tickets/1/conversations?page=1&per_page=10"),
            Ok(HttpResponse::new(
                200,
                json!([{ "body": "hello" }]).to_string(),
            )),
        );

        let client = client(&mock, 10, 300);
        let mut stream =
            client.import_stream("tickets", Vec::new(), None, Some(Arc::new(ConversationEnricher)));

        let record = stream.next().await.unwrap().unwrap();
        assert_eq!(record["conversations"], json!([{ "body": "hello" }]));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn enrichment_failure_does_not_stop_pagination() {
        let mock = MockHttpClient::new();
        mock.add_response(
            &format!("GET {BASE}/tickets?page=1&per_page=10"),
            Ok(HttpResponse::new(
                200,
                json!([{ "id": 1 }, { "id": 2 }]).to_string(),
            )),
        );
        mock.add_response(
            &format!("GET {BASE}/tickets/1/conversations?page=1&per_page=10"),
            Ok(HttpResponse::new(200, "oops")),
        );
        mock.add_response(
            &format!("GET {BASE}/tickets/2/conversations?page=1&per_page=10"),
            Ok(HttpResponse::new(200, "[]")),
        );

        let client = client(&mock, 10, 300);
        let mut stream =
            client.import_stream("tickets", Vec::new(), None, Some(Arc::new(ConversationEnricher)));

        let first = stream.next().await.unwrap();
        match first {
            Err(CaravanError::Enrichment { source_id, .. }) => assert_eq!(source_id, 1),
            other => panic!("expected enrichment failure, got {:?}", other.map(|_| ())),
        }

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second["id"].as_i64(), Some(2));
        assert!(stream.next().await.is_none());
    }
}
