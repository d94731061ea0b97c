//! Store traits for the persistent state.
//!
//! Every writer of the request store goes through the sharded bulk writer
//! (see [`bulk`]); no field-level locking is needed because every write is
//! keyed by a unique custom id and is idempotent.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::custom_id::{CustomId, FieldName};
use crate::error::Result;
use crate::model::{ApiKeyBundle, Batch, DeferredManufacturer, ExtractionError, Manufacturer};
use crate::request::{RequestRow, RequestUpdate};

pub mod bulk;
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use bulk::{BulkWriteSummary, DEFAULT_CHUNK_SIZE};

/// The request store: prompt requests keyed by their deterministic custom
/// id, each optionally bound to a batch and optionally resolved.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Bulk point-lookup by custom id.
    async fn find_by_custom_ids(&self, ids: &[CustomId]) -> Result<HashMap<CustomId, RequestRow>>;

    /// Projection form of the above: which of `ids` exist at all. Cheaper
    /// than a full fetch; used to detect missing rows.
    async fn find_ids_only(&self, ids: &[CustomId]) -> Result<HashSet<CustomId>>;

    /// Apply idempotent updates through the sharded writer: sequential
    /// chunks, unordered within a chunk, counts summed. Data-level write
    /// errors surface as an aggregated [`KilnError::BulkWrite`]; a chunk
    /// failing outright surfaces as [`KilnError::BulkChunks`].
    ///
    /// [`KilnError::BulkWrite`]: crate::error::KilnError::BulkWrite
    /// [`KilnError::BulkChunks`]: crate::error::KilnError::BulkChunks
    async fn bulk_update(&self, ops: Vec<RequestUpdate>, log_id: &str) -> Result<BulkWriteSummary>;

    /// Upsert rows by custom id. On conflict only the request body is
    /// replaced; `created_at`, `batch_id`, and `response_blob` keep their
    /// stored values. This is the idempotent replay path.
    async fn bulk_upsert_bodies(
        &self,
        rows: Vec<RequestRow>,
        log_id: &str,
    ) -> Result<BulkWriteSummary>;

    /// All custom ids currently bound to a batch.
    async fn custom_ids_for_batch(&self, batch_id: &str) -> Result<HashSet<CustomId>>;

    /// Delete every row whose custom id starts with `etld1>field>`, via an
    /// indexed range scan on the id.
    async fn delete_by_prefix(&self, etld1: &str, field: FieldName) -> Result<u64>;

    /// Bind packed requests to their new batch. Never upserts.
    async fn pair_with_batch(&self, ids: &HashSet<CustomId>, batch_id: &str) -> Result<u64> {
        if ids.is_empty() {
            tracing::warn!(batch_id, "no custom ids to pair with batch");
            return Ok(0);
        }
        let ops: Vec<RequestUpdate> = ids
            .iter()
            .map(|custom_id| RequestUpdate::PairBatch {
                custom_id: custom_id.clone(),
                batch_id: batch_id.to_string(),
            })
            .collect();
        let summary = self.bulk_update(ops, &format!("pair_with_{batch_id}")).await?;
        Ok(summary.modified)
    }

    /// Return requests to the pending pool by id.
    async fn unpair_by_ids(&self, ids: &HashSet<CustomId>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ops: Vec<RequestUpdate> = ids
            .iter()
            .map(|custom_id| RequestUpdate::Unpair {
                custom_id: custom_id.clone(),
            })
            .collect();
        let summary = self.bulk_update(ops, "unpair_by_ids").await?;
        Ok(summary.modified)
    }

    /// Return every request of a batch to the pending pool. Used when a
    /// batch fails and its work must be recycled.
    async fn unpair_from_batch(&self, batch_id: &str) -> Result<u64> {
        let ids = self.custom_ids_for_batch(batch_id).await?;
        if ids.is_empty() {
            tracing::info!(batch_id, "no requests to unpair from batch");
            return Ok(0);
        }
        self.unpair_by_ids(&ids).await
    }
}

/// Deferred-manufacturer documents, keyed by `(etld1, text_version_id)`.
#[async_trait]
pub trait DeferredStore: Send + Sync {
    async fn find(
        &self,
        etld1: &str,
        text_version_id: &str,
    ) -> Result<Option<DeferredManufacturer>>;

    /// Point replace keyed on the composite primary key.
    async fn upsert(&self, doc: &DeferredManufacturer) -> Result<()>;

    /// Remove a finalized document.
    async fn delete(&self, etld1: &str, text_version_id: &str) -> Result<()>;
}

/// Manufacturer records. Created upstream; this crate only reads them and
/// writes result fields.
#[async_trait]
pub trait ManufacturerStore: Send + Sync {
    async fn find_by_etld1(&self, etld1: &str) -> Result<Option<Manufacturer>>;

    async fn find_by_etld1s(&self, etld1s: &[String]) -> Result<Vec<Manufacturer>>;

    /// Manufacturers eligible for packing: text token count known and under
    /// the cap, ordered by ascending text size (smallest first).
    async fn list_for_packing(&self, max_text_tokens: u64) -> Result<Vec<Manufacturer>>;

    /// Point replace keyed on etld1.
    async fn upsert(&self, manufacturer: &Manufacturer) -> Result<()>;
}

/// Our records of provider batches.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn find(&self, external_batch_id: &str) -> Result<Option<Batch>>;

    /// Point replace keyed on the external batch id.
    async fn upsert(&self, batch: &Batch) -> Result<()>;

    async fn list_for_key(&self, api_key_label: &str) -> Result<Vec<Batch>>;
}

/// API key bundles and their quota accounting.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn list(&self) -> Result<Vec<ApiKeyBundle>>;

    async fn find(&self, label: &str) -> Result<Option<ApiKeyBundle>>;

    /// Point replace keyed on label.
    async fn save(&self, key: &ApiKeyBundle) -> Result<()>;
}

/// Operational log of failed extraction steps.
#[async_trait]
pub trait ErrorLog: Send + Sync {
    async fn record(&self, error: ExtractionError) -> Result<()>;
}
