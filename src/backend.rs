//! HTTP client for the external AI backend. Crawling, chunking, embedding
//! and vector storage all happen there; this side only shapes requests
//! and interprets the `{success, data, error}` envelope.

use reqwest::{multipart, Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("AI backend unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Rejected(String),
}

/// A crawled chunk. Unknown fields are carried through untouched so
/// client-side edits round-trip to `save-chunks` intact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Chunk {
    pub fn new(text: &str) -> Self {
        Chunk {
            text: text.to_string(),
            source_url: None,
            source_title: None,
            quality_score: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlPreview {
    pub url: String,
    #[serde(alias = "total_pages", default)]
    pub total_pages: u64,
    #[serde(alias = "crawl_method", default)]
    pub crawl_method: String,
    #[serde(alias = "total_word_count", default)]
    pub total_word_count: u64,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlRequest {
    pub url: String,
    pub widget_id: String,
    pub title: String,
    pub max_pages: u32,
    pub max_depth: u32,
    pub is_sitemap: bool,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BatchInfo {
    pub batch_num: usize,
    pub total_batches: usize,
    pub is_first_batch: bool,
    pub is_last_batch: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveChunksRequest<'a> {
    pub widget_id: &'a str,
    pub title: &'a str,
    pub url: &'a str,
    pub crawl_method: &'a str,
    pub chunks: &'a [Chunk],
    pub batch_info: BatchInfo,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaqRequest {
    pub agent_id: String,
    pub title: String,
    pub question: String,
    pub answer: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub embedding_provider: String,
    pub embedding_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widget_id: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRequest {
    pub id: String,
    pub workspace_id: String,
    pub agent_id: String,
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotionImportRequest {
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_id: Option<String>,
    pub widget_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub agent_id: String,
    pub workspace_id: String,
    pub title: String,
    pub document_type: String,
    pub embedding_provider: String,
    pub embedding_model: String,
}

/// What the backend reports back after ingesting content.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub message: Option<String>,
    pub vector_id: Option<String>,
    pub chunks_created: Option<u64>,
    pub content: Option<String>,
    pub url: Option<String>,
    pub file_url: Option<String>,
}

impl IngestReceipt {
    fn from_body(body: &Value) -> Self {
        let null = Value::Null;
        let data = body.get("data").unwrap_or(&null);
        let pick = |key: &str| -> Option<&Value> {
            body.get(key)
                .filter(|v| !v.is_null())
                .or_else(|| data.get(key).filter(|v| !v.is_null()))
        };
        let text = |key: &str| pick(key).and_then(Value::as_str).map(str::to_string);

        IngestReceipt {
            message: text("message"),
            vector_id: text("qdrantId").or_else(|| text("id")),
            chunks_created: pick("chunks_created").and_then(Value::as_u64),
            content: text("content"),
            url: text("url"),
            file_url: text("fileUrl"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotionPage {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub last_edited_time: Option<String>,
}

#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Self {
        BackendClient {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends the request and unwraps the envelope. Non-2xx responses and
    /// `success: false` bodies both become [`BackendError::Rejected`].
    async fn send(&self, request: RequestBuilder) -> Result<Value, BackendError> {
        let response = request.send().await.map_err(|e| {
            error!("HTTP request error: {}", e);
            BackendError::Http(e)
        })?;

        let status = response.status();
        let text = response.text().await?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if !status.is_success() {
            let message = ["detail", "message", "error"]
                .iter()
                .find_map(|key| body.get(*key).and_then(Value::as_str))
                .map(str::to_string)
                .or_else(|| Some(text.trim().to_string()).filter(|t| !t.is_empty()))
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            error!("Error response from AI backend ({}): {}", status, message);
            return Err(BackendError::Rejected(message));
        }

        if body.get("success").and_then(Value::as_bool) == Some(false) {
            let message = body
                .get("error")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            error!("AI backend reported failure: {}", message);
            return Err(BackendError::Rejected(message));
        }

        Ok(body)
    }

    pub async fn store_document(
        &self,
        request: &StoreRequest,
        embedding_model: &str,
    ) -> Result<IngestReceipt, BackendError> {
        debug!("Storing document {} for agent {}", request.id, request.agent_id);
        let body = self
            .send(
                self.client
                    .post(self.url("/api/knowledge-base/store"))
                    .query(&[("embedding_model", embedding_model)])
                    .json(request),
            )
            .await?;
        let mut receipt = IngestReceipt::from_body(&body);
        if receipt.vector_id.is_none() {
            receipt.vector_id = Some(request.id.clone());
        }
        Ok(receipt)
    }

    pub async fn store_faq(&self, request: &FaqRequest) -> Result<IngestReceipt, BackendError> {
        debug!("Storing FAQ for agent {}", request.agent_id);
        let body = self
            .send(
                self.client
                    .post(self.url("/api/knowledge-base/store-faq"))
                    .json(request),
            )
            .await?;
        Ok(IngestReceipt::from_body(&body))
    }

    pub async fn upload_file(&self, upload: FileUpload) -> Result<IngestReceipt, BackendError> {
        info!(
            "Uploading {} ({} bytes) for agent {}",
            upload.file_name,
            upload.bytes.len(),
            upload.agent_id
        );
        let part = multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name)
            .mime_str(&upload.content_type)?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("agent_id", upload.agent_id)
            .text("title", upload.title)
            .text("document_type", upload.document_type)
            .text("embedding_provider", upload.embedding_provider)
            .text("embedding_model", upload.embedding_model)
            .text(
                "metadata",
                json!({ "workspace_id": upload.workspace_id }).to_string(),
            );

        let body = self
            .send(
                self.client
                    .post(self.url("/api/knowledge-base/upload"))
                    .multipart(form),
            )
            .await?;
        Ok(IngestReceipt::from_body(&body))
    }

    /// Deletes every vector chunk stored under `id`. Deleting an id the
    /// backend no longer knows is not an error.
    pub async fn delete_document(&self, id: &str) -> Result<u64, BackendError> {
        let body = self
            .send(
                self.client
                    .delete(self.url(&format!("/api/knowledge-base/delete/{}", id))),
            )
            .await?;
        let deleted = body
            .get("deleted_chunks")
            .or_else(|| body.get("data").and_then(|d| d.get("deleted_chunks")))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        info!("Deleted {} vector chunks for {}", deleted, id);
        Ok(deleted)
    }

    pub async fn delete_all(&self, business_id: &str, widget_id: &str) -> Result<(), BackendError> {
        self.send(
            self.client
                .delete(self.url("/api/knowledge-base/delete-all"))
                .json(&json!({ "businessId": business_id, "widgetId": widget_id })),
        )
        .await?;
        info!("Deleted all vectors for {}/{}", business_id, widget_id);
        Ok(())
    }

    pub async fn clean(&self) -> Result<(), BackendError> {
        self.send(self.client.delete(self.url("/api/knowledge-base/clean-qdrant")))
            .await?;
        info!("Cleaned vector collection");
        Ok(())
    }

    pub async fn crawl_preview(&self, request: &CrawlRequest) -> Result<CrawlPreview, BackendError> {
        info!("Crawling {} (sitemap: {})", request.url, request.is_sitemap);
        let body = self
            .send(
                self.client
                    .post(self.url("/api/crawler/crawl-website-preview"))
                    .json(request),
            )
            .await?;
        let data = body.get("data").cloned().unwrap_or(Value::Null);
        serde_json::from_value(data)
            .map_err(|e| BackendError::Rejected(format!("Malformed crawl preview: {}", e)))
    }

    /// Returns the number of chunks the backend stored for this batch.
    pub async fn save_chunks(&self, request: &SaveChunksRequest<'_>) -> Result<u64, BackendError> {
        debug!(
            "Saving batch {}/{} ({} chunks)",
            request.batch_info.batch_num,
            request.batch_info.total_batches,
            request.chunks.len()
        );
        let body = self
            .send(self.client.post(self.url("/api/crawler/save-chunks")).json(request))
            .await?;
        Ok(body
            .get("data")
            .and_then(|d| d.get("chunks_created"))
            .and_then(Value::as_u64)
            .unwrap_or(request.chunks.len() as u64))
    }

    pub async fn notion_test_connection(&self, api_key: &str) -> Result<Value, BackendError> {
        let body = self
            .send(
                self.client
                    .post(self.url("/api/notion/test-connection"))
                    .json(&json!({ "api_key": api_key })),
            )
            .await?;
        Ok(body.get("data").cloned().unwrap_or(body))
    }

    pub async fn notion_search_pages(
        &self,
        api_key: &str,
        query: &str,
    ) -> Result<Vec<NotionPage>, BackendError> {
        let body = self
            .send(
                self.client
                    .post(self.url("/api/notion/search-pages"))
                    .json(&json!({ "api_key": api_key, "query": query })),
            )
            .await?;
        let pages = body
            .get("pages")
            .or_else(|| body.get("data").and_then(|d| d.get("pages")))
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        serde_json::from_value(pages)
            .map_err(|e| BackendError::Rejected(format!("Malformed Notion page list: {}", e)))
    }

    pub async fn notion_import_page(
        &self,
        request: &NotionImportRequest,
    ) -> Result<IngestReceipt, BackendError> {
        let body = self
            .send(
                self.client
                    .post(self.url("/api/notion/import-page"))
                    .json(request),
            )
            .await?;
        Ok(IngestReceipt::from_body(&body))
    }

    pub async fn notion_import_database(
        &self,
        request: &NotionImportRequest,
    ) -> Result<IngestReceipt, BackendError> {
        let body = self
            .send(
                self.client
                    .post(self.url("/api/notion/import-database"))
                    .json(request),
            )
            .await?;
        Ok(IngestReceipt::from_body(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn store_document_passes_embedding_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/knowledge-base/store"))
            .and(query_param("embedding_model", "voyage-3"))
            .and(body_partial_json(json!({"id": "kb1", "type": "text"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"success": true, "qdrantId": "vec-9"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = BackendClient::new(&server.uri());
        let receipt = client
            .store_document(
                &StoreRequest {
                    id: "kb1".into(),
                    workspace_id: "w1".into(),
                    agent_id: "a1".into(),
                    title: "Notes".into(),
                    content: "hello".into(),
                    kind: "text".into(),
                    website_url: None,
                },
                "voyage-3",
            )
            .await
            .unwrap();
        assert_eq!(receipt.vector_id.as_deref(), Some("vec-9"));
    }

    #[tokio::test]
    async fn non_success_status_surfaces_detail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/knowledge-base/store-faq"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"detail": "agent_id required"})))
            .mount(&server)
            .await;

        let client = BackendClient::new(&server.uri());
        let err = client
            .store_faq(&FaqRequest {
                agent_id: String::new(),
                title: "t".into(),
                question: "q".into(),
                answer: "a".into(),
                kind: "faq".into(),
                embedding_provider: "voyage".into(),
                embedding_model: "voyage-3".into(),
                widget_id: None,
                metadata: json!({}),
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "agent_id required");
    }

    #[tokio::test]
    async fn success_false_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/crawler/crawl-website-preview"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"success": false, "error": "blocked by robots.txt"})),
            )
            .mount(&server)
            .await;

        let client = BackendClient::new(&server.uri());
        let err = client
            .crawl_preview(&CrawlRequest {
                url: "https://example.com".into(),
                widget_id: "a1".into(),
                title: String::new(),
                max_pages: 100,
                max_depth: 3,
                is_sitemap: false,
                metadata: json!({}),
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "blocked by robots.txt");
    }

    #[tokio::test]
    async fn crawl_preview_reads_snake_case_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/crawler/crawl-website-preview"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "url": "https://example.com",
                    "total_pages": 3,
                    "crawl_method": "sitemap",
                    "total_word_count": 1200,
                    "chunks": [{"text": "a", "source_url": "https://example.com/a", "page": 1}]
                }
            })))
            .mount(&server)
            .await;

        let client = BackendClient::new(&server.uri());
        let preview = client
            .crawl_preview(&CrawlRequest {
                url: "https://example.com".into(),
                widget_id: "a1".into(),
                title: String::new(),
                max_pages: 100,
                max_depth: 3,
                is_sitemap: true,
                metadata: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(preview.total_pages, 3);
        assert_eq!(preview.crawl_method, "sitemap");
        assert_eq!(preview.chunks[0].extra["page"], 1);
    }
}
