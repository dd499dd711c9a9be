use crate::document::RowDocument;
use crate::error::SearchError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Actions per `_bulk` request.
const BULK_BATCH_SIZE: usize = 500;
/// Hits per scroll page.
const SEARCH_PAGE_SIZE: usize = 100;
/// How long the server keeps a scroll context alive between pages.
const SCROLL_KEEP_ALIVE: &str = "1m";

/// Write side of the search backend, a seam so the indexer can be exercised
/// without a running cluster.
#[async_trait]
pub trait DocumentStore {
    async fn recreate_index(&self) -> Result<(), SearchError>;

    async fn put_table_mapping(&self, properties: &Value) -> Result<(), SearchError>;

    async fn bulk_index(&self, documents: &[RowDocument]) -> Result<u64, SearchError>;
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f64,
    pub filename: String,
    pub table: String,
    pub fields: Map<String, Value>,
}

pub struct ElasticsearchStore {
    client: Arc<Client>,
    endpoint: String,
    index_name: String,
}

impl ElasticsearchStore {
    pub fn new(endpoint: impl Into<String>, index_name: impl Into<String>) -> Self {
        Self {
            client: Arc::new(Client::new()),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            index_name: index_name.into(),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    async fn index_exists(&self) -> Result<bool, SearchError> {
        let response = self
            .client
            .head(format!("{}/{}", self.endpoint, self.index_name))
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(true);
        }
        if response.status().is_client_error() {
            return Ok(false);
        }
        Err(backend_error(response.status()))
    }

    async fn create_index(&self) -> Result<(), SearchError> {
        let response = self
            .client
            .put(format!("{}/{}", self.endpoint, self.index_name))
            .json(&json!({
                "settings": {
                    "number_of_shards": 1,
                    "number_of_replicas": 0,
                },
                "mappings": {
                    "properties": {
                        "_metadata": {
                            "type": "object",
                            "enabled": false,
                        }
                    }
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::Request(format!(
                "index setup failed with {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Free-text search over everything indexed, paginated with the scroll
    /// API. Returns a cursor holding the first page.
    pub async fn search(&self, query: &str) -> Result<ScrollCursor<'_>, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }

        let response = self
            .client
            .post(format!(
                "{}/{}/_search?scroll={}",
                self.endpoint, self.index_name, SCROLL_KEEP_ALIVE
            ))
            .json(&json!({
                "size": SEARCH_PAGE_SIZE,
                "query": {
                    "query_string": {
                        "query": query,
                    }
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let body: Value = response.json().await?;
        let scroll_id = body
            .pointer("/_scroll_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(ScrollCursor {
            store: self,
            scroll_id,
            first_page: Some(hits_from_response(&body)),
        })
    }

    pub async fn count(&self) -> Result<u64, SearchError> {
        let response = self
            .client
            .get(format!("{}/{}/_count", self.endpoint, self.index_name))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let body: Value = response.json().await?;
        Ok(body
            .pointer("/count")
            .and_then(Value::as_u64)
            .unwrap_or_default())
    }

    /// Delete every indexed document by dropping the index. A missing index
    /// already means clean.
    pub async fn delete_all(&self) -> Result<(), SearchError> {
        let response = self
            .client
            .delete(format!("{}/{}", self.endpoint, self.index_name))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(backend_error(response.status()))
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), SearchError> {
        let response = self
            .client
            .delete(format!("{}/_search/scroll", self.endpoint))
            .json(&json!({ "scroll_id": scroll_id }))
            .send()
            .await?;

        // Expired scroll contexts come back as 404, nothing left to release.
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(backend_error(response.status()))
    }
}

#[async_trait]
impl DocumentStore for ElasticsearchStore {
    async fn recreate_index(&self) -> Result<(), SearchError> {
        if self.index_exists().await? {
            debug!(index = %self.index_name, "deleting existing index");
            let response = self
                .client
                .delete(format!("{}/{}", self.endpoint, self.index_name))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(backend_error(response.status()));
            }
        }
        self.create_index().await
    }

    async fn put_table_mapping(&self, properties: &Value) -> Result<(), SearchError> {
        let response = self
            .client
            .put(format!("{}/{}/_mapping", self.endpoint, self.index_name))
            .json(&json!({ "properties": properties }))
            .send()
            .await?;

        // Tables from different databases may declare the same column with
        // conflicting types; the first mapping wins and later ones are
        // resolved dynamically per document.
        if response.status().is_client_error() {
            warn!(
                index = %self.index_name,
                status = %response.status(),
                "table mapping rejected, falling back to dynamic mapping"
            );
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }
        Ok(())
    }

    async fn bulk_index(&self, documents: &[RowDocument]) -> Result<u64, SearchError> {
        let mut indexed = 0u64;

        for batch in documents.chunks(BULK_BATCH_SIZE) {
            let payload = bulk_payload(&self.index_name, batch)?;
            let response = self
                .client
                .post(format!("{}/_bulk", self.endpoint))
                .header("Content-Type", "application/x-ndjson")
                .body(payload)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(backend_error(response.status()));
            }

            let body: Value = response.json().await?;
            let failures = bulk_failures(&body);
            for reason in &failures {
                warn!(index = %self.index_name, %reason, "document rejected");
            }
            indexed += (batch.len() - failures.len()) as u64;
        }

        Ok(indexed)
    }
}

/// Scroll-backed page iterator over search hits.
pub struct ScrollCursor<'a> {
    store: &'a ElasticsearchStore,
    scroll_id: Option<String>,
    first_page: Option<Vec<SearchHit>>,
}

impl ScrollCursor<'_> {
    /// Next page of hits, `None` once the scroll is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<SearchHit>>, SearchError> {
        if let Some(hits) = self.first_page.take() {
            if hits.is_empty() {
                self.finish().await?;
                return Ok(None);
            }
            return Ok(Some(hits));
        }

        let Some(scroll_id) = self.scroll_id.clone() else {
            return Ok(None);
        };

        let response = self
            .store
            .client
            .post(format!("{}/_search/scroll", self.store.endpoint))
            .json(&json!({
                "scroll": SCROLL_KEEP_ALIVE,
                "scroll_id": scroll_id,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let body: Value = response.json().await?;
        if let Some(next_id) = body.pointer("/_scroll_id").and_then(Value::as_str) {
            self.scroll_id = Some(next_id.to_string());
        }

        let hits = hits_from_response(&body);
        if hits.is_empty() {
            self.finish().await?;
            return Ok(None);
        }
        Ok(Some(hits))
    }

    async fn finish(&mut self) -> Result<(), SearchError> {
        if let Some(scroll_id) = self.scroll_id.take() {
            self.store.clear_scroll(&scroll_id).await?;
        }
        Ok(())
    }
}

fn backend_error(status: StatusCode) -> SearchError {
    SearchError::BackendResponse {
        backend: "elasticsearch".to_string(),
        details: status.to_string(),
    }
}

fn bulk_payload(index_name: &str, documents: &[RowDocument]) -> Result<String, SearchError> {
    let mut lines = Vec::with_capacity(documents.len() * 2);
    for document in documents {
        lines.push(serde_json::to_string(&json!({
            "index": {
                "_index": index_name,
                "_id": document.id,
            }
        }))?);
        lines.push(serde_json::to_string(&document.fields)?);
    }
    Ok(lines.join("\n") + "\n")
}

fn bulk_failures(response: &Value) -> Vec<String> {
    if !response
        .pointer("/errors")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Vec::new();
    }

    response
        .pointer("/items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.pointer("/index/error"))
                .filter(|error| !error.is_null())
                .map(Value::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn hits_from_response(response: &Value) -> Vec<SearchHit> {
    response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(|hits| hits.iter().map(hit_from_value).collect())
        .unwrap_or_default()
}

fn hit_from_value(raw: &Value) -> SearchHit {
    let score = raw
        .pointer("/_score")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let mut fields = raw
        .pointer("/_source")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let metadata = fields
        .remove(crate::document::METADATA_KEY)
        .unwrap_or(Value::Null);
    let field = |key: &str| {
        metadata
            .pointer(&format!("/{key}"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    SearchHit {
        score,
        filename: field("filename"),
        table: field("table"),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        bulk_failures, bulk_payload, hits_from_response, ElasticsearchStore, ScrollCursor,
        SearchHit,
    };
    use crate::document::RowDocument;
    use serde_json::{json, Map, Value};

    fn document(id: &str, text: &str) -> RowDocument {
        let mut fields = Map::new();
        fields.insert("text".to_string(), json!(text));
        fields.insert(
            "_metadata".to_string(),
            json!({"filename": "/data/test.db", "table": "messages"}),
        );
        RowDocument {
            id: id.to_string(),
            fields,
        }
    }

    #[test]
    fn bulk_payload_is_ndjson() -> Result<(), Box<dyn std::error::Error>> {
        let documents = vec![document("doc-1", "one message"), document("doc-2", "another")];
        let payload = bulk_payload("esis", &documents)?;

        assert!(payload.ends_with('\n'));
        let lines: Vec<&str> = payload.trim_end().lines().collect();
        assert_eq!(lines.len(), 4);

        let action: Value = serde_json::from_str(lines[0])?;
        assert_eq!(action, json!({"index": {"_index": "esis", "_id": "doc-1"}}));

        let source: Value = serde_json::from_str(lines[1])?;
        assert_eq!(source.pointer("/text"), Some(&json!("one message")));
        Ok(())
    }

    #[test]
    fn bulk_failures_are_extracted() {
        let response = json!({
            "errors": true,
            "items": [
                {"index": {"_id": "doc-1", "status": 201}},
                {"index": {"_id": "doc-2", "status": 400, "error": {"type": "mapper_parsing_exception"}}},
            ]
        });
        assert_eq!(bulk_failures(&response).len(), 1);

        let clean = json!({"errors": false, "items": [{"index": {"_id": "doc-1"}}]});
        assert!(bulk_failures(&clean).is_empty());
    }

    #[test]
    fn hits_carry_metadata_and_fields() {
        let response = json!({
            "_scroll_id": "abcd",
            "hits": {
                "total": {"value": 1},
                "hits": [
                    {
                        "_id": "doc-1",
                        "_score": 1.25,
                        "_source": {
                            "text": "some message",
                            "_metadata": {"filename": "/data/test.db", "table": "messages"},
                        }
                    }
                ]
            }
        });

        let hits = hits_from_response(&response);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 1.25);
        assert_eq!(hits[0].filename, "/data/test.db");
        assert_eq!(hits[0].table, "messages");
        assert_eq!(hits[0].fields.get("text"), Some(&json!("some message")));
        assert!(!hits[0].fields.contains_key("_metadata"));
    }

    #[test]
    fn empty_response_yields_no_hits() {
        assert!(hits_from_response(&json!({})).is_empty());
    }

    fn hit(filename: &str) -> SearchHit {
        SearchHit {
            score: 1.0,
            filename: filename.to_string(),
            table: "messages".to_string(),
            fields: Map::new(),
        }
    }

    #[tokio::test]
    async fn cursor_yields_first_page_then_stops() -> Result<(), Box<dyn std::error::Error>> {
        let store = ElasticsearchStore::new("http://localhost:9200", "esis");
        let mut cursor = ScrollCursor {
            store: &store,
            scroll_id: None,
            first_page: Some(vec![hit("/data/a.db"), hit("/data/b.db")]),
        };

        let page = cursor.next_page().await?.expect("first page should be returned");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].filename, "/data/a.db");

        // No scroll context left, so the cursor is exhausted.
        assert!(cursor.next_page().await?.is_none());
        assert!(cursor.next_page().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn cursor_with_empty_first_page_is_exhausted(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let store = ElasticsearchStore::new("http://localhost:9200", "esis");
        let mut cursor = ScrollCursor {
            store: &store,
            scroll_id: None,
            first_page: Some(Vec::new()),
        };

        assert!(cursor.next_page().await?.is_none());
        Ok(())
    }
}
