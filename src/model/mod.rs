//! Persistent data model: manufacturers and their result fields, provider
//! batches, and API key quota bundles.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::custom_id::{FieldFamily, FieldName};
use crate::error::{KilnError, Result};

pub mod deferred;

pub use deferred::{
    ConceptSearchBundle, DeferredBasic, DeferredBinary, DeferredConcept, DeferredField,
    DeferredKeyword, DeferredManufacturer,
};

/// The model every batch request targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptModel {
    pub name: String,
    pub max_context_tokens: usize,
}

impl GptModel {
    pub fn default_batch_model() -> Self {
        Self {
            name: "gpt-4o-mini".to_string(),
            max_context_tokens: 128_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Result field types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryStats {
    pub prompt_version_id: String,
    /// Which chunk the classification consulted
    pub chunk_key: String,
}

/// A resolved yes/no classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryOutcome {
    pub answer: bool,
    pub confidence: f64,
    pub reason: String,
    pub stats: BinaryStats,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicStats {
    pub prompt_version_id: String,
    pub chunk_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostalAddress {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl PostalAddress {
    /// Required fields present and coordinates inside valid ranges.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.street.trim().is_empty() {
            return Err("missing street".to_string());
        }
        if self.city.trim().is_empty() {
            return Err("missing city".to_string());
        }
        if self.country.trim().is_empty() {
            return Err("missing country".to_string());
        }
        if let Some(lat) = self.latitude {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(format!("latitude out of range: {lat}"));
            }
        }
        if let Some(lon) = self.longitude {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(format!("longitude out of range: {lon}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressExtraction {
    pub results: Vec<PostalAddress>,
    /// How many candidate records failed validation and were dropped
    pub dropped: u64,
    pub stats: BasicStats,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessDescExtraction {
    pub name: String,
    pub description: String,
    pub stats: BasicStats,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordStats {
    pub prompt_version_id: String,
    /// chunk key -> number of keywords that chunk contributed
    pub per_chunk: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordExtraction {
    pub results: BTreeSet<String>,
    pub stats: KeywordStats,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConceptChunkStats {
    /// Known concept names this chunk contributed
    pub results: BTreeSet<String>,
    /// Names found by the literal scan
    pub brute: BTreeSet<String>,
    /// Labels the LLM search returned
    pub llm: BTreeSet<String>,
    /// known name -> the unknown labels of this chunk mapped onto it
    pub mapping: BTreeMap<String, Vec<String>>,
    pub unmapped_llm: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptStats {
    pub extract_prompt_version_id: String,
    pub map_prompt_version_id: String,
    pub ontology_version_id: String,
    pub chunked: BTreeMap<String, ConceptChunkStats>,
    /// known name -> unknown labels mapped onto it, across all chunks
    pub mapping: BTreeMap<String, Vec<String>>,
    pub unmapped_llm: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptExtraction {
    pub results: BTreeSet<String>,
    pub stats: ConceptStats,
    pub extracted_at: DateTime<Utc>,
}

/// A materialized value for one field, produced by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Binary(BinaryOutcome),
    Addresses(AddressExtraction),
    BusinessDesc(BusinessDescExtraction),
    Keyword(KeywordExtraction),
    Concept(ConceptExtraction),
}

// ---------------------------------------------------------------------------
// Manufacturer
// ---------------------------------------------------------------------------

/// A manufacturer record. Result fields start null and are written exactly
/// once per text version by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manufacturer {
    pub etld1: String,
    /// Version id of the immutable scraped-text snapshot
    pub text_version_id: Option<String>,
    /// Token count of that snapshot; the packer's upstream size filter
    pub text_num_tokens: Option<u64>,
    pub updated_at: DateTime<Utc>,

    pub is_manufacturer: Option<BinaryOutcome>,
    pub is_contract_manufacturer: Option<BinaryOutcome>,
    pub is_product_manufacturer: Option<BinaryOutcome>,
    pub addresses: Option<AddressExtraction>,
    pub business_desc: Option<BusinessDescExtraction>,
    pub products: Option<KeywordExtraction>,
    pub certificates: Option<ConceptExtraction>,
    pub industries: Option<ConceptExtraction>,
    pub process_caps: Option<ConceptExtraction>,
    pub material_caps: Option<ConceptExtraction>,
}

impl Manufacturer {
    pub fn new(etld1: impl Into<String>, text_version_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            etld1: etld1.into(),
            text_version_id,
            text_num_tokens: None,
            updated_at: now,
            is_manufacturer: None,
            is_contract_manufacturer: None,
            is_product_manufacturer: None,
            addresses: None,
            business_desc: None,
            products: None,
            certificates: None,
            industries: None,
            process_caps: None,
            material_caps: None,
        }
    }

    /// Whether a result field has been materialized.
    pub fn field_is_resolved(&self, field: FieldName) -> bool {
        match field {
            FieldName::IsManufacturer => self.is_manufacturer.is_some(),
            FieldName::IsContractManufacturer => self.is_contract_manufacturer.is_some(),
            FieldName::IsProductManufacturer => self.is_product_manufacturer.is_some(),
            FieldName::Addresses => self.addresses.is_some(),
            FieldName::BusinessDesc => self.business_desc.is_some(),
            FieldName::Products => self.products.is_some(),
            FieldName::Certificates => self.certificates.is_some(),
            FieldName::Industries => self.industries.is_some(),
            FieldName::ProcessCaps => self.process_caps.is_some(),
            FieldName::MaterialCaps => self.material_caps.is_some(),
        }
    }

    /// The fields still awaiting materialization, in pipeline order.
    pub fn unresolved_fields(&self) -> Vec<FieldName> {
        FieldName::ORDERED
            .into_iter()
            .filter(|f| !self.field_is_resolved(*f))
            .collect()
    }

    /// Write a materialized value onto its field. The value's shape must
    /// match the field's family.
    pub fn apply(&mut self, field: FieldName, value: FieldValue) -> Result<()> {
        let mismatch = || {
            KilnError::Internal(format!(
                "field value shape does not match {field} ({:?})",
                field.family()
            ))
        };

        match (field.family(), value) {
            (FieldFamily::Binary, FieldValue::Binary(outcome)) => match field {
                FieldName::IsManufacturer => self.is_manufacturer = Some(outcome),
                FieldName::IsContractManufacturer => self.is_contract_manufacturer = Some(outcome),
                FieldName::IsProductManufacturer => self.is_product_manufacturer = Some(outcome),
                _ => unreachable!("binary family"),
            },
            (FieldFamily::Basic, FieldValue::Addresses(v)) if field == FieldName::Addresses => {
                self.addresses = Some(v)
            }
            (FieldFamily::Basic, FieldValue::BusinessDesc(v))
                if field == FieldName::BusinessDesc =>
            {
                self.business_desc = Some(v)
            }
            (FieldFamily::Keyword, FieldValue::Keyword(v)) => self.products = Some(v),
            (FieldFamily::Concept, FieldValue::Concept(v)) => match field {
                FieldName::Certificates => self.certificates = Some(v),
                FieldName::Industries => self.industries = Some(v),
                FieldName::ProcessCaps => self.process_caps = Some(v),
                FieldName::MaterialCaps => self.material_caps = Some(v),
                _ => unreachable!("concept family"),
            },
            _ => return Err(mismatch()),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// Provider-side batch status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
}

impl BatchStatus {
    /// Completed and expired batches both get their output ingested;
    /// whatever the provider managed to produce is reconciled.
    pub fn needs_ingestion(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Expired)
    }

    /// Statuses whose requests are recycled back into the pending pool.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            BatchStatus::Failed | BatchStatus::Cancelling | BatchStatus::Cancelled
        )
    }

    /// Still being worked on provider-side.
    pub fn in_flight(&self) -> bool {
        !self.needs_ingestion() && !self.is_failed()
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStatus::Validating => "validating",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Finalizing => "finalizing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Expired => "expired",
            BatchStatus::Cancelling => "cancelling",
            BatchStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchRequestCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Per-status provider timestamps, carried through from batch retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchTimestamps {
    pub in_progress_at: Option<DateTime<Utc>>,
    pub finalizing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub cancelling_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Our record of a provider batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub external_batch_id: String,
    /// Which API key owns this batch
    pub api_key_label: String,
    pub input_file_id: String,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub status: BatchStatus,
    /// Sum of input tokens of the requests packed into this batch
    pub total_tokens: u64,
    pub request_counts: BatchRequestCounts,
    pub created_at: DateTime<Utc>,
    pub timestamps: BatchTimestamps,
    /// Set once the station has fully reconciled this batch's results
    pub processing_completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn is_our_processing_complete(&self) -> bool {
        self.processing_completed_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

/// One provider API key and its quota accounting.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyBundle {
    pub label: String,
    pub key: String,
    /// Provider-imposed max tokens enqueued concurrently on this key
    pub batch_queue_limit: u64,
    /// Sum of total_tokens over this key's non-finalized batches
    pub tokens_in_use: u64,
    /// The key is quarantined until this instant
    pub available_at: DateTime<Utc>,
}

impl ApiKeyBundle {
    pub fn new(label: impl Into<String>, key: impl Into<String>, batch_queue_limit: u64) -> Self {
        Self {
            label: label.into(),
            key: key.into(),
            batch_queue_limit,
            tokens_in_use: 0,
            available_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        now >= self.available_at
    }

    pub fn apply_cooldown(&mut self, now: DateTime<Utc>, cooldown: Duration) {
        self.available_at = now + cooldown;
    }

    pub fn add_tokens_in_use(&mut self, tokens: u64) {
        self.tokens_in_use += tokens;
    }

    pub fn remove_tokens_in_use(&mut self, tokens: u64) {
        self.tokens_in_use = self.tokens_in_use.saturating_sub(tokens);
    }
}

// The secret never appears in logs; Debug shows the label only.
impl std::fmt::Debug for ApiKeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyBundle")
            .field("label", &self.label)
            .field("key", &"<redacted>")
            .field("batch_queue_limit", &self.batch_queue_limit)
            .field("tokens_in_use", &self.tokens_in_use)
            .field("available_at", &self.available_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Extraction errors
// ---------------------------------------------------------------------------

/// Operational log record for a failed extraction step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionError {
    pub created_at: DateTime<Utc>,
    pub etld1: String,
    /// Field name, or a step tag like "general_processing"
    pub field: String,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_rejects_mismatched_shapes() {
        let now = Utc::now();
        let mut mfg = Manufacturer::new("acme.example", Some("v1".to_string()), now);
        let keyword = FieldValue::Keyword(KeywordExtraction {
            results: BTreeSet::new(),
            stats: KeywordStats {
                prompt_version_id: "p1".to_string(),
                per_chunk: BTreeMap::new(),
            },
            extracted_at: now,
        });
        assert!(mfg.apply(FieldName::IsManufacturer, keyword).is_err());
        assert!(!mfg.field_is_resolved(FieldName::IsManufacturer));
    }

    #[test]
    fn apply_resolves_the_field() {
        let now = Utc::now();
        let mut mfg = Manufacturer::new("acme.example", Some("v1".to_string()), now);
        assert_eq!(mfg.unresolved_fields().len(), 10);

        mfg.apply(
            FieldName::IsManufacturer,
            FieldValue::Binary(BinaryOutcome {
                answer: true,
                confidence: 0.9,
                reason: "makes widgets".to_string(),
                stats: BinaryStats {
                    prompt_version_id: "p1".to_string(),
                    chunk_key: "0:100".to_string(),
                },
                extracted_at: now,
            }),
        )
        .unwrap();

        assert!(mfg.field_is_resolved(FieldName::IsManufacturer));
        assert_eq!(mfg.unresolved_fields().len(), 9);
    }

    #[test]
    fn address_validation_checks_required_fields_and_ranges() {
        let mut addr = PostalAddress {
            street: "1 Main St".to_string(),
            city: "Springfield".to_string(),
            region: None,
            postal_code: None,
            country: "US".to_string(),
            latitude: Some(40.0),
            longitude: Some(-75.0),
        };
        assert!(addr.validate().is_ok());

        addr.latitude = Some(91.0);
        assert!(addr.validate().is_err());

        addr.latitude = Some(40.0);
        addr.city = String::new();
        assert!(addr.validate().is_err());
    }

    #[test]
    fn batch_status_classification() {
        assert!(BatchStatus::Completed.needs_ingestion());
        assert!(BatchStatus::Expired.needs_ingestion());
        assert!(BatchStatus::Failed.is_failed());
        assert!(BatchStatus::Cancelling.is_failed());
        assert!(BatchStatus::Validating.in_flight());
        assert!(BatchStatus::InProgress.in_flight());
        assert!(BatchStatus::Finalizing.in_flight());
    }

    #[test]
    fn key_cooldown_gates_availability() {
        let now = Utc::now();
        let mut key = ApiKeyBundle::new("k1", "sk-secret", 1_000_000);
        assert!(key.is_available(now));

        key.apply_cooldown(now, Duration::minutes(10));
        assert!(!key.is_available(now));
        assert!(key.is_available(now + Duration::minutes(11)));

        let shown = format!("{key:?}");
        assert!(!shown.contains("sk-secret"));
    }

    #[test]
    fn tokens_in_use_never_underflows() {
        let mut key = ApiKeyBundle::new("k1", "sk", 100);
        key.add_tokens_in_use(40);
        key.remove_tokens_in_use(100);
        assert_eq!(key.tokens_in_use, 0);
    }
}
