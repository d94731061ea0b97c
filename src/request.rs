//! Request-store row types and the provider wire shapes they carry.
//!
//! A row is keyed by its custom id and moves through three states, implied
//! by which of `batch_id` / `response_blob` are set: pending (neither),
//! in flight (batch only), resolved (both). A response without a batch id
//! is illegal and never produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::TokenCounter;
use crate::custom_id::CustomId;
use crate::error::Result;
use crate::model::GptModel;
use crate::prompt::Prompt;

/// One chat message in a request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// The model-call portion of a request. `input_tokens` is bookkeeping for
/// quota accounting and is stripped before upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub input_tokens: u64,
}

/// A full provider request line: `{custom_id, method, url, body}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBlob {
    pub custom_id: CustomId,
    pub method: String,
    pub url: String,
    pub body: RequestBody,
}

impl RequestBlob {
    /// Serialize for the upload file: compact separators, one object per
    /// line, token-count bookkeeping removed from the body.
    pub fn to_jsonl_line(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(body) = value.get_mut("body").and_then(|b| b.as_object_mut()) {
            body.remove("input_tokens");
        }
        Ok(serde_json::to_string(&value)?)
    }
}

/// The stored completion for a resolved request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBlob {
    /// Batch that produced this response
    pub batch_id: String,
    pub status_code: Option<u16>,
    /// Raw completion text; parsed by the orchestrator's materializers
    pub content: String,
    pub received_at: DateTime<Utc>,
}

/// A request-store row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRow {
    pub created_at: DateTime<Utc>,
    pub request: RequestBlob,
    pub batch_id: Option<String>,
    pub response_blob: Option<ResponseBlob>,
}

impl RequestRow {
    pub fn custom_id(&self) -> &CustomId {
        &self.request.custom_id
    }

    /// Eligible for packing: not bound to a batch and not yet answered.
    pub fn is_pending(&self) -> bool {
        self.batch_id.is_none() && self.response_blob.is_none()
    }

    /// Awaiting a batch's completion.
    pub fn is_in_flight(&self) -> bool {
        self.batch_id.is_some() && self.response_blob.is_none()
    }

    pub fn is_resolved(&self) -> bool {
        self.response_blob.is_some()
    }
}

/// Build a fresh pending row for one prompt + context pair.
pub fn build_request(
    created_at: DateTime<Utc>,
    custom_id: CustomId,
    context: &str,
    prompt: &Prompt,
    model: &GptModel,
    counter: &dyn TokenCounter,
) -> RequestRow {
    let input_tokens = (prompt.num_tokens + counter.count(context)) as u64;
    RequestRow {
        created_at,
        request: RequestBlob {
            custom_id,
            method: "POST".to_string(),
            url: "/v1/chat/completions".to_string(),
            body: RequestBody {
                model: model.name.clone(),
                messages: vec![ChatMessage::system(&prompt.text), ChatMessage::user(context)],
                input_tokens,
            },
        },
        batch_id: None,
        response_blob: None,
    }
}

/// One idempotent point update against the request store, keyed by custom
/// id. Applied in bulk through the sharded writer; never an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestUpdate {
    /// Bind a packed request to its batch
    PairBatch {
        custom_id: CustomId,
        batch_id: String,
    },
    /// Record a completion (reaffirming the batch binding)
    SetResponse {
        custom_id: CustomId,
        batch_id: String,
        response: ResponseBlob,
    },
    /// Return a request to the pending pool
    Unpair { custom_id: CustomId },
}

impl RequestUpdate {
    pub fn custom_id(&self) -> &CustomId {
        match self {
            RequestUpdate::PairBatch { custom_id, .. }
            | RequestUpdate::SetResponse { custom_id, .. }
            | RequestUpdate::Unpair { custom_id } => custom_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::HeuristicTokenCounter;
    use crate::custom_id::{ChunkBounds, FieldName, RequestKind};

    fn sample_row() -> RequestRow {
        let prompt = Prompt::new("classify this", "v1", &HeuristicTokenCounter);
        build_request(
            Utc::now(),
            CustomId::new(
                "acme.example",
                FieldName::IsManufacturer,
                RequestKind::Chunk,
                ChunkBounds::new(0, 100),
            ),
            "some scraped text",
            &prompt,
            &GptModel::default_batch_model(),
            &HeuristicTokenCounter,
        )
    }

    #[test]
    fn fresh_rows_are_pending() {
        let row = sample_row();
        assert!(row.is_pending());
        assert!(!row.is_in_flight());
        assert!(!row.is_resolved());
        assert!(row.request.body.input_tokens > 0);
    }

    #[test]
    fn jsonl_line_is_single_line_and_strips_token_counts() {
        let row = sample_row();
        let line = row.request.to_jsonl_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(!line.contains("input_tokens"));

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value["custom_id"].as_str(),
            Some("acme.example>is_manufacturer>chunk>0:100")
        );
        assert_eq!(value["method"].as_str(), Some("POST"));
        assert_eq!(value["url"].as_str(), Some("/v1/chat/completions"));
        assert_eq!(value["body"]["messages"].as_array().map(|m| m.len()), Some(2));
    }

    #[test]
    fn state_transitions_follow_field_combinations() {
        let mut row = sample_row();
        row.batch_id = Some("batch_1".to_string());
        assert!(row.is_in_flight());

        row.response_blob = Some(ResponseBlob {
            batch_id: "batch_1".to_string(),
            status_code: Some(200),
            content: "{}".to_string(),
            received_at: Utc::now(),
        });
        assert!(row.is_resolved());
        assert!(!row.is_pending());
    }
}
