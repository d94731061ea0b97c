//! Batch inference provider client.
//!
//! The provider exposes an OpenAI-style batch API: upload a JSONL file,
//! create a batch over it, poll batch status, download the output and error
//! files. The trait keeps the station testable; `OpenAiBatchApi` is the
//! production implementation and `MockProvider` the scripted one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};
use crate::model::{Batch, BatchRequestCounts, BatchStatus, BatchTimestamps};

/// Connection establishment budget.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
/// Whole-request budget; sized for 200 MB uploads and downloads.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Provider-wire request counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

/// A batch object as the provider returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderBatch {
    pub id: String,
    pub status: BatchStatus,
    pub input_file_id: String,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    /// Unix seconds
    pub created_at: i64,
    #[serde(default)]
    pub in_progress_at: Option<i64>,
    #[serde(default)]
    pub finalizing_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub failed_at: Option<i64>,
    #[serde(default)]
    pub expired_at: Option<i64>,
    #[serde(default)]
    pub cancelling_at: Option<i64>,
    #[serde(default)]
    pub cancelled_at: Option<i64>,
    #[serde(default)]
    pub request_counts: Option<ProviderRequestCounts>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

fn unix_to_utc(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_default()
}

impl ProviderBatch {
    fn timestamps(&self) -> BatchTimestamps {
        BatchTimestamps {
            in_progress_at: self.in_progress_at.map(unix_to_utc),
            finalizing_at: self.finalizing_at.map(unix_to_utc),
            completed_at: self.completed_at.map(unix_to_utc),
            failed_at: self.failed_at.map(unix_to_utc),
            expired_at: self.expired_at.map(unix_to_utc),
            cancelling_at: self.cancelling_at.map(unix_to_utc),
            cancelled_at: self.cancelled_at.map(unix_to_utc),
        }
    }

    fn request_counts(&self) -> BatchRequestCounts {
        let counts = self.request_counts.unwrap_or_default();
        BatchRequestCounts {
            total: counts.total,
            completed: counts.completed,
            failed: counts.failed,
        }
    }

    /// Build our record of a freshly created batch.
    pub fn into_new_record(self, api_key_label: &str, total_tokens: u64) -> Batch {
        let timestamps = self.timestamps();
        let request_counts = self.request_counts();
        Batch {
            external_batch_id: self.id,
            api_key_label: api_key_label.to_string(),
            input_file_id: self.input_file_id,
            output_file_id: self.output_file_id,
            error_file_id: self.error_file_id,
            status: self.status,
            total_tokens,
            request_counts,
            created_at: unix_to_utc(self.created_at),
            timestamps,
            processing_completed_at: None,
        }
    }

    /// Fold provider-side state into an existing record. Leaves our own
    /// fields (`api_key_label`, `total_tokens`, `processing_completed_at`)
    /// alone.
    pub fn reconcile_into(&self, batch: &mut Batch) {
        batch.status = self.status;
        batch.output_file_id = self.output_file_id.clone();
        batch.error_file_id = self.error_file_id.clone();
        batch.request_counts = self.request_counts();
        batch.timestamps = self.timestamps();
    }
}

/// One line of a batch output or error file:
/// `{custom_id, response: {...}}` or `{custom_id, error: {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputLine {
    pub custom_id: String,
    #[serde(default)]
    pub response: Option<OutputResponse>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputResponse {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl OutputLine {
    /// The completion text, dug out of the chat-completions body.
    pub fn completion_text(&self) -> Option<String> {
        self.response
            .as_ref()?
            .body
            .as_ref()?
            .get("choices")?
            .get(0)?
            .get("message")?
            .get("content")?
            .as_str()
            .map(|s| s.to_string())
    }
}

/// Operations the station needs against the provider.
#[async_trait]
pub trait BatchProvider: Send + Sync {
    /// Upload a JSONL batch input file; returns the provider file id.
    async fn upload_batch_file(
        &self,
        api_key: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<String>;

    /// Create a batch over an uploaded file (24 h completion window).
    async fn create_batch(
        &self,
        api_key: &str,
        input_file_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ProviderBatch>;

    /// Enumerate batches visible to this key.
    async fn list_batches(&self, api_key: &str) -> Result<Vec<ProviderBatch>>;

    /// Download a file's raw JSONL content.
    async fn download_file(&self, api_key: &str, file_id: &str) -> Result<String>;

    /// Delete a file provider-side (input hygiene after reconciliation).
    async fn delete_file(&self, api_key: &str, file_id: &str) -> Result<()>;
}

// ============================================================================
// Production implementation
// ============================================================================

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchList {
    data: Vec<ProviderBatch>,
}

/// Reqwest-backed client for an OpenAI-style batch endpoint.
pub struct OpenAiBatchApi {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiBatchApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self { client, base_url })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        let mut message = message.trim().to_string();
        message.truncate(500);
        Err(KilnError::Provider {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl BatchProvider for OpenAiBatchApi {
    #[tracing::instrument(skip(self, api_key, content), fields(bytes = content.len()))]
    async fn upload_batch_file(
        &self,
        api_key: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(file_name.to_string())
            .mime_str("application/jsonl")?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/v1/files", self.base_url))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;
        let file: FileObject = Self::check(response).await?.json().await?;
        tracing::info!(file_id = %file.id, "uploaded batch input file");
        Ok(file.id)
    }

    #[tracing::instrument(skip(self, api_key, metadata))]
    async fn create_batch(
        &self,
        api_key: &str,
        input_file_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ProviderBatch> {
        let body = serde_json::json!({
            "input_file_id": input_file_id,
            "endpoint": "/v1/chat/completions",
            "completion_window": "24h",
            "metadata": metadata,
        });
        let response = self
            .client
            .post(format!("{}/v1/batches", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        let batch: ProviderBatch = Self::check(response).await?.json().await?;
        tracing::info!(batch_id = %batch.id, status = %batch.status, "created batch");
        Ok(batch)
    }

    async fn list_batches(&self, api_key: &str) -> Result<Vec<ProviderBatch>> {
        let response = self
            .client
            .get(format!("{}/v1/batches?limit=100", self.base_url))
            .bearer_auth(api_key)
            .send()
            .await?;
        let list: BatchList = Self::check(response).await?.json().await?;
        Ok(list.data)
    }

    async fn download_file(&self, api_key: &str, file_id: &str) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/v1/files/{file_id}/content", self.base_url))
            .bearer_auth(api_key)
            .send()
            .await?;
        Ok(Self::check(response).await?.text().await?)
    }

    async fn delete_file(&self, api_key: &str, file_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/v1/files/{file_id}", self.base_url))
            .bearer_auth(api_key)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

// ============================================================================
// Scripted implementation for tests
// ============================================================================

/// Scripted provider: uploads are retained, batch statuses are driven by
/// the test, file contents are injectable.
#[derive(Default)]
pub struct MockProvider {
    files: Mutex<HashMap<String, String>>,
    batches: Mutex<Vec<ProviderBatch>>,
    counter: AtomicUsize,
    /// When set, the next `create_batch` fails with this provider status
    fail_next_create: Mutex<Option<u16>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_content(&self, file_id: &str) -> Option<String> {
        self.files.lock().get(file_id).cloned()
    }

    pub fn put_file(&self, file_id: &str, content: &str) {
        self.files.lock().insert(file_id.to_string(), content.to_string());
    }

    pub fn file_exists(&self, file_id: &str) -> bool {
        self.files.lock().contains_key(file_id)
    }

    pub fn batches(&self) -> Vec<ProviderBatch> {
        self.batches.lock().clone()
    }

    /// Drive a batch to a new status, optionally attaching output / error
    /// file ids.
    pub fn set_batch_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        output_file_id: Option<&str>,
        error_file_id: Option<&str>,
    ) {
        let mut batches = self.batches.lock();
        if let Some(batch) = batches.iter_mut().find(|b| b.id == batch_id) {
            batch.status = status;
            batch.output_file_id = output_file_id.map(|s| s.to_string());
            batch.error_file_id = error_file_id.map(|s| s.to_string());
        }
    }

    pub fn fail_next_create(&self, status: u16) {
        *self.fail_next_create.lock() = Some(status);
    }

    /// Seed a pre-existing batch, as if created by an earlier run.
    pub fn seed_batch(&self, batch: ProviderBatch) {
        self.batches.lock().push(batch);
    }
}

#[async_trait]
impl BatchProvider for MockProvider {
    async fn upload_batch_file(
        &self,
        _api_key: &str,
        _file_name: &str,
        content: Vec<u8>,
    ) -> Result<String> {
        let id = format!("file-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let text = String::from_utf8(content)
            .map_err(|e| KilnError::Internal(format!("non-utf8 upload: {e}")))?;
        self.files.lock().insert(id.clone(), text);
        Ok(id)
    }

    async fn create_batch(
        &self,
        _api_key: &str,
        input_file_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ProviderBatch> {
        if let Some(status) = self.fail_next_create.lock().take() {
            return Err(KilnError::Provider {
                status,
                message: "scripted create failure".to_string(),
            });
        }
        let batch = ProviderBatch {
            id: format!("batch-{}", self.counter.fetch_add(1, Ordering::SeqCst)),
            status: BatchStatus::Validating,
            input_file_id: input_file_id.to_string(),
            output_file_id: None,
            error_file_id: None,
            created_at: Utc::now().timestamp(),
            in_progress_at: None,
            finalizing_at: None,
            completed_at: None,
            failed_at: None,
            expired_at: None,
            cancelling_at: None,
            cancelled_at: None,
            request_counts: None,
            metadata: Some(metadata),
        };
        self.batches.lock().push(batch.clone());
        Ok(batch)
    }

    async fn list_batches(&self, _api_key: &str) -> Result<Vec<ProviderBatch>> {
        Ok(self.batches.lock().clone())
    }

    async fn download_file(&self, _api_key: &str, file_id: &str) -> Result<String> {
        self.files
            .lock()
            .get(file_id)
            .cloned()
            .ok_or_else(|| KilnError::Provider {
                status: 404,
                message: format!("no such file: {file_id}"),
            })
    }

    async fn delete_file(&self, _api_key: &str, file_id: &str) -> Result<()> {
        self.files.lock().remove(file_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn batch_json(id: &str, status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "object": "batch",
            "status": status,
            "input_file_id": "file-in",
            "created_at": 1_700_000_000,
            "request_counts": {"total": 3, "completed": 3, "failed": 0},
        })
    }

    #[tokio::test]
    async fn upload_posts_multipart_and_returns_file_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/files"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "file-123", "object": "file"})),
            )
            .mount(&server)
            .await;

        let api = OpenAiBatchApi::new(server.uri()).unwrap();
        let id = api
            .upload_batch_file("sk-test", "batch_1.jsonl", b"{}\n".to_vec())
            .await
            .unwrap();
        assert_eq!(id, "file-123");
    }

    #[tokio::test]
    async fn create_batch_parses_provider_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/batches"))
            .respond_with(ResponseTemplate::new(200).set_body_json(batch_json("batch_abc", "validating")))
            .mount(&server)
            .await;

        let api = OpenAiBatchApi::new(server.uri()).unwrap();
        let batch = api
            .create_batch("sk-test", "file-in", HashMap::new())
            .await
            .unwrap();
        assert_eq!(batch.id, "batch_abc");
        assert_eq!(batch.status, BatchStatus::Validating);
        assert_eq!(batch.input_file_id, "file-in");
    }

    #[tokio::test]
    async fn list_batches_unwraps_the_data_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/batches"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": "list",
                "data": [batch_json("batch_1", "in_progress"), batch_json("batch_2", "completed")],
            })))
            .mount(&server)
            .await;

        let api = OpenAiBatchApi::new(server.uri()).unwrap();
        let batches = api.list_batches("sk-test").await.unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn download_returns_raw_text_and_errors_surface_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/v1/files/file-out/content$"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"custom_id\":\"x\"}\n"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/v1/files/missing/content$"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such file"))
            .mount(&server)
            .await;

        let api = OpenAiBatchApi::new(server.uri()).unwrap();
        let content = api.download_file("sk-test", "file-out").await.unwrap();
        assert!(content.contains("custom_id"));

        match api.download_file("sk-test", "missing").await {
            Err(KilnError::Provider { status, message }) => {
                assert_eq!(status, 404);
                assert_eq!(message, "no such file");
            }
            other => panic!("expected provider error, got {other:?}"),
        }
    }

    #[test]
    fn output_line_digs_out_the_completion_text() {
        let line: OutputLine = serde_json::from_str(
            r#"{
                "custom_id": "acme.example>products>chunk>0:100",
                "response": {
                    "status_code": 200,
                    "body": {"choices": [{"message": {"content": "[\"widgets\"]"}}]}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(line.completion_text().as_deref(), Some("[\"widgets\"]"));
        assert!(line.error.is_none());

        let error_line: OutputLine =
            serde_json::from_str(r#"{"custom_id": "x", "error": {"code": "rate_limited"}}"#)
                .unwrap();
        assert!(error_line.completion_text().is_none());
        assert!(error_line.error.is_some());
    }

    #[test]
    fn reconcile_preserves_our_bookkeeping() {
        let provider_batch = ProviderBatch {
            id: "batch_1".to_string(),
            status: BatchStatus::Completed,
            input_file_id: "file-in".to_string(),
            output_file_id: Some("file-out".to_string()),
            error_file_id: None,
            created_at: 1_700_000_000,
            in_progress_at: Some(1_700_000_100),
            finalizing_at: None,
            completed_at: Some(1_700_003_600),
            failed_at: None,
            expired_at: None,
            cancelling_at: None,
            cancelled_at: None,
            request_counts: Some(ProviderRequestCounts {
                total: 10,
                completed: 10,
                failed: 0,
            }),
            metadata: None,
        };

        let mut record = provider_batch.clone().into_new_record("k1", 123_456);
        record.status = BatchStatus::InProgress;
        provider_batch.reconcile_into(&mut record);

        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.api_key_label, "k1");
        assert_eq!(record.total_tokens, 123_456);
        assert_eq!(record.output_file_id.as_deref(), Some("file-out"));
        assert!(record.processing_completed_at.is_none());
    }
}
