//! Per-manufacturer pipeline advance.
//!
//! Given a manufacturer and its deferred document, the orchestrator walks
//! the fields in pipeline order and moves each one forward exactly one
//! step: build the missing sub-document and its requests, re-create request
//! rows the deferred state references but the store lost, emit the concept
//! mapping request once every search response is in, or parse the resolved
//! responses and materialize the field. Every write is an idempotent point
//! replace, so re-running on identical state is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::blob::BlobFetcher;
use crate::chunk::TokenCounter;
use crate::custom_id::{CustomId, FieldFamily, FieldName};
use crate::error::{KilnError, Result};
use crate::model::{
    DeferredField, DeferredManufacturer, ExtractionError, FieldValue, GptModel, Manufacturer,
};
use crate::ontology::Ontology;
use crate::prompt::PromptCatalog;
use crate::request::RequestRow;
use crate::store::{DeferredStore, ErrorLog, ManufacturerStore, RequestStore};

mod basic;
mod binary;
mod concept;
mod keyword;

/// What one `advance` call did.
#[derive(Debug, Default)]
pub struct AdvanceOutcome {
    pub fields_materialized: Vec<FieldName>,
    pub requests_created: usize,
    /// The deferred document was deleted (all fields resolved)
    pub finalized: bool,
    /// `is_manufacturer` resolved false; remaining fields were dropped
    pub short_circuited: bool,
}

/// Shared context handed to the per-family steps.
pub(crate) struct StepContext<'a> {
    pub now: DateTime<Utc>,
    pub etld1: &'a str,
    pub text: &'a str,
    pub counter: Arc<dyn TokenCounter>,
    pub model: &'a GptModel,
    pub prompts: &'a PromptCatalog,
    pub ontology: &'a Ontology,
    pub requests: &'a dyn RequestStore,
}

/// Result of stepping one field.
pub(crate) enum StepOutcome {
    /// The field still waits on requests. `state` is the (possibly
    /// repaired) sub-document to keep in the deferred document.
    InFlight {
        state: DeferredField,
        changed: bool,
        requests_created: usize,
    },
    /// Every request resolved and parsed; the field can be written.
    Materialized(FieldValue),
}

/// Drives manufacturers through the extraction pipeline.
pub struct Orchestrator {
    requests: Arc<dyn RequestStore>,
    deferred: Arc<dyn DeferredStore>,
    manufacturers: Arc<dyn ManufacturerStore>,
    errors: Arc<dyn ErrorLog>,
    blobs: Arc<dyn BlobFetcher>,
    counter: Arc<dyn TokenCounter>,
    ontology: Arc<Ontology>,
    prompts: Arc<PromptCatalog>,
    model: GptModel,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        requests: Arc<dyn RequestStore>,
        deferred: Arc<dyn DeferredStore>,
        manufacturers: Arc<dyn ManufacturerStore>,
        errors: Arc<dyn ErrorLog>,
        blobs: Arc<dyn BlobFetcher>,
        counter: Arc<dyn TokenCounter>,
        ontology: Arc<Ontology>,
        prompts: Arc<PromptCatalog>,
        model: GptModel,
    ) -> Self {
        Self {
            requests,
            deferred,
            manufacturers,
            errors,
            blobs,
            counter,
            ontology,
            prompts,
            model,
        }
    }

    async fn log_error(&self, now: DateTime<Utc>, etld1: &str, field: &str, error: &KilnError) {
        let record = ExtractionError {
            created_at: now,
            etld1: etld1.to_string(),
            field: field.to_string(),
            error: error.to_string(),
        };
        if let Err(log_error) = self.errors.record(record).await {
            tracing::error!(etld1, field, error = %log_error, "failed to record extraction error");
        }
    }

    /// Advance one manufacturer by one step per field.
    #[tracing::instrument(skip(self), fields(etld1))]
    pub async fn advance(&self, now: DateTime<Utc>, etld1: &str) -> Result<AdvanceOutcome> {
        let mut outcome = AdvanceOutcome::default();

        let Some(mut manufacturer) = self.manufacturers.find_by_etld1(etld1).await? else {
            let error = KilnError::ManufacturerNotFound(etld1.to_string());
            self.log_error(now, etld1, "manufacturer", &error).await;
            return Err(error);
        };

        let Some(version_id) = manufacturer.text_version_id.clone() else {
            let error = KilnError::Internal("manufacturer has no text version".to_string());
            self.log_error(now, etld1, "text_version_id", &error).await;
            return Ok(outcome);
        };

        let text = match self.blobs.fetch(etld1, &version_id).await {
            Ok(text) => text,
            Err(error) => {
                self.log_error(now, etld1, "scraped_text", &error).await;
                return Ok(outcome);
            }
        };

        let mut doc = match self.deferred.find(etld1, &version_id).await? {
            Some(doc) => doc,
            None => DeferredManufacturer::new(etld1, &version_id, now),
        };
        let mut doc_changed = false;

        let ctx = StepContext {
            now,
            etld1,
            text: &text,
            counter: self.counter.clone(),
            model: &self.model,
            prompts: &self.prompts,
            ontology: &self.ontology,
            requests: self.requests.as_ref(),
        };

        for field in FieldName::ORDERED {
            if manufacturer.field_is_resolved(field) {
                // Invariant: a sub-document exists iff the field is null.
                if doc.fields.remove(&field).is_some() {
                    doc_changed = true;
                }
                continue;
            }

            let current = doc.fields.get(&field).cloned();
            match self.step_field(&ctx, field, current).await {
                Ok(StepOutcome::InFlight {
                    state,
                    changed,
                    requests_created,
                }) => {
                    let replaced = doc.fields.insert(field, state);
                    doc_changed |= changed || replaced.is_none();
                    outcome.requests_created += requests_created;
                }
                Ok(StepOutcome::Materialized(value)) => {
                    let is_manufacturer_no = matches!(
                        (&field, &value),
                        (FieldName::IsManufacturer, FieldValue::Binary(b)) if !b.answer
                    );

                    manufacturer.apply(field, value)?;
                    manufacturer.updated_at = now;
                    self.manufacturers.upsert(&manufacturer).await?;
                    doc.fields.remove(&field);
                    doc_changed = true;
                    outcome.fields_materialized.push(field);
                    tracing::info!(etld1, %field, "field materialized");

                    if is_manufacturer_no {
                        // Not a manufacturer: the remaining fields are
                        // meaningless. Drop their deferred state and collect
                        // the request rows.
                        tracing::info!(etld1, "not a manufacturer, finalizing early");
                        doc.fields.clear();
                        self.finalize(etld1, &version_id, &doc).await?;
                        outcome.short_circuited = true;
                        outcome.finalized = true;
                        return Ok(outcome);
                    }
                }
                Err(error) => {
                    // Leave the field deferred; the next tick retries the
                    // parse against the same stored response.
                    tracing::warn!(etld1, %field, error = %error, "field step failed");
                    self.log_error(now, etld1, field.as_str(), &error).await;
                }
            }
        }

        if doc.is_finalized() {
            self.finalize(etld1, &version_id, &doc).await?;
            outcome.finalized = true;
        } else if doc_changed {
            self.deferred.upsert(&doc).await?;
        }

        Ok(outcome)
    }

    async fn step_field(
        &self,
        ctx: &StepContext<'_>,
        field: FieldName,
        current: Option<DeferredField>,
    ) -> Result<StepOutcome> {
        match field.family() {
            FieldFamily::Binary => binary::step(ctx, field, unpack_binary(current)?).await,
            FieldFamily::Basic => basic::step(ctx, field, unpack_basic(current)?).await,
            FieldFamily::Keyword => keyword::step(ctx, field, unpack_keyword(current)?).await,
            FieldFamily::Concept => concept::step(ctx, field, unpack_concept(current)?).await,
        }
    }

    /// Delete the deferred document and garbage-collect every request row
    /// still keyed under this manufacturer's fields.
    async fn finalize(
        &self,
        etld1: &str,
        version_id: &str,
        _doc: &DeferredManufacturer,
    ) -> Result<()> {
        let mut deleted = 0;
        for field in FieldName::ORDERED {
            deleted += self.requests.delete_by_prefix(etld1, field).await?;
        }
        self.deferred.delete(etld1, version_id).await?;
        tracing::info!(etld1, deleted, "deferred document finalized, requests collected");
        Ok(())
    }
}

fn unpack_binary(current: Option<DeferredField>) -> Result<Option<crate::model::DeferredBinary>> {
    match current {
        None => Ok(None),
        Some(DeferredField::Binary(b)) => Ok(Some(b)),
        Some(other) => Err(shape_mismatch("binary", &other)),
    }
}

fn unpack_basic(current: Option<DeferredField>) -> Result<Option<crate::model::DeferredBasic>> {
    match current {
        None => Ok(None),
        Some(DeferredField::Basic(b)) => Ok(Some(b)),
        Some(other) => Err(shape_mismatch("basic", &other)),
    }
}

fn unpack_keyword(current: Option<DeferredField>) -> Result<Option<crate::model::DeferredKeyword>> {
    match current {
        None => Ok(None),
        Some(DeferredField::Keyword(k)) => Ok(Some(k)),
        Some(other) => Err(shape_mismatch("keyword", &other)),
    }
}

fn unpack_concept(current: Option<DeferredField>) -> Result<Option<crate::model::DeferredConcept>> {
    match current {
        None => Ok(None),
        Some(DeferredField::Concept(c)) => Ok(Some(c)),
        Some(other) => Err(shape_mismatch("concept", &other)),
    }
}

fn shape_mismatch(expected: &str, found: &DeferredField) -> KilnError {
    let found = match found {
        DeferredField::Binary(_) => "binary",
        DeferredField::Basic(_) => "basic",
        DeferredField::Keyword(_) => "keyword",
        DeferredField::Concept(_) => "concept",
    };
    KilnError::Internal(format!(
        "deferred sub-document shape mismatch: expected {expected}, found {found}"
    ))
}

// ---------------------------------------------------------------------------
// Shared helpers for the per-family steps
// ---------------------------------------------------------------------------

/// Which of the referenced ids have no row in the request store. Uses the
/// ids-only projection, which is cheaper than a full fetch.
pub(crate) async fn missing_ids(
    requests: &dyn RequestStore,
    ids: &[CustomId],
) -> Result<Vec<CustomId>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let existing = requests.find_ids_only(ids).await?;
    Ok(ids
        .iter()
        .filter(|id| !existing.contains(*id))
        .cloned()
        .collect())
}

/// Fetch rows for the referenced ids; callers split them into missing /
/// pending / resolved.
pub(crate) async fn load_rows(
    requests: &dyn RequestStore,
    ids: &[CustomId],
) -> Result<HashMap<CustomId, RequestRow>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    requests.find_by_custom_ids(ids).await
}

/// The resolved completion text for a row, if it has one.
pub(crate) fn resolved_content<'r>(
    rows: &'r HashMap<CustomId, RequestRow>,
    id: &CustomId,
) -> Option<&'r str> {
    rows.get(id)
        .and_then(|row| row.response_blob.as_ref())
        .map(|blob| blob.content.as_str())
}

/// Parse a completion body as JSON, tolerating markdown code fences.
pub(crate) fn parse_json_completion<T: DeserializeOwned>(
    custom_id: &CustomId,
    content: &str,
) -> Result<T> {
    let cleaned = content.replace("```json", "").replace("```", "");
    serde_json::from_str(cleaned.trim()).map_err(|e| KilnError::MalformedCompletion {
        custom_id: custom_id.clone(),
        message: e.to_string(),
    })
}

/// Ensure the prompt version pinned in a sub-document matches the catalog.
pub(crate) fn check_prompt_version(
    field: FieldName,
    deferred_version: &str,
    catalog_version: &str,
) -> Result<()> {
    if deferred_version != catalog_version {
        return Err(KilnError::PromptVersionMismatch {
            field: field.as_str().to_string(),
            deferred: deferred_version.to_string(),
            catalog: catalog_version.to_string(),
        });
    }
    Ok(())
}

/// Rebuild a request row from a chunk-addressed custom id. Used on the
/// replay path when the deferred state references a row the store lost.
pub(crate) fn rebuild_chunk_request(
    ctx: &StepContext<'_>,
    custom_id: &CustomId,
    prompt: &crate::prompt::Prompt,
) -> Result<RequestRow> {
    let decoded = custom_id.decode()?;
    let chunk = decoded.bounds.slice(ctx.text).ok_or_else(|| {
        KilnError::Internal(format!(
            "chunk bounds {} out of range for {} (text len {})",
            decoded.bounds,
            custom_id,
            ctx.text.len()
        ))
    })?;
    Ok(crate::request::build_request(
        ctx.now,
        custom_id.clone(),
        chunk,
        prompt,
        ctx.model,
        ctx.counter.as_ref(),
    ))
}
