//! In-memory backend for every store trait.
//!
//! Suitable for tests and single-process runs; state is lost on restart.
//! Request rows live in an ordered map keyed by custom id so prefix
//! deletion is a range scan, the same access path the indexed backends use.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::custom_id::{storage_prefix, CustomId, FieldName};
use crate::error::Result;
use crate::model::{ApiKeyBundle, Batch, DeferredManufacturer, ExtractionError, Manufacturer};
use crate::request::{RequestRow, RequestUpdate};
use crate::store::bulk::{chunked, BulkAccumulator, BulkWriteSummary, ChunkOutcome, DEFAULT_CHUNK_SIZE};
use crate::store::{BatchStore, DeferredStore, ErrorLog, KeyStore, ManufacturerStore, RequestStore};

/// In-memory implementation of all kiln stores.
#[derive(Clone, Default)]
pub struct MemoryStore {
    requests: Arc<RwLock<BTreeMap<String, RequestRow>>>,
    deferred: Arc<RwLock<HashMap<(String, String), DeferredManufacturer>>>,
    manufacturers: Arc<RwLock<HashMap<String, Manufacturer>>>,
    batches: Arc<RwLock<HashMap<String, Batch>>>,
    keys: Arc<RwLock<BTreeMap<String, ApiKeyBundle>>>,
    errors: Arc<RwLock<Vec<ExtractionError>>>,
    chunk_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ..Default::default()
        }
    }

    /// Override the bulk-write chunk size (tests use small chunks).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Snapshot of the recorded extraction errors.
    pub fn extraction_errors(&self) -> Vec<ExtractionError> {
        self.errors.read().clone()
    }

    /// Snapshot of a request row.
    pub fn request(&self, custom_id: &CustomId) -> Option<RequestRow> {
        self.requests.read().get(custom_id.as_str()).cloned()
    }

    /// Total request rows stored.
    pub fn request_count(&self) -> usize {
        self.requests.read().len()
    }

    fn apply_update(rows: &mut BTreeMap<String, RequestRow>, op: &RequestUpdate) -> u64 {
        let Some(row) = rows.get_mut(op.custom_id().as_str()) else {
            // No upsert: an update against a missing row matches nothing.
            return 0;
        };

        match op {
            RequestUpdate::PairBatch { batch_id, .. } => {
                if row.batch_id.as_deref() == Some(batch_id.as_str()) {
                    0
                } else {
                    row.batch_id = Some(batch_id.clone());
                    1
                }
            }
            RequestUpdate::SetResponse {
                batch_id, response, ..
            } => {
                let changed = row.batch_id.as_deref() != Some(batch_id.as_str())
                    || row.response_blob.as_ref() != Some(response);
                row.batch_id = Some(batch_id.clone());
                row.response_blob = Some(response.clone());
                changed as u64
            }
            RequestUpdate::Unpair { .. } => {
                let changed = row.batch_id.is_some() || row.response_blob.is_some();
                row.batch_id = None;
                row.response_blob = None;
                changed as u64
            }
        }
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn find_by_custom_ids(&self, ids: &[CustomId]) -> Result<HashMap<CustomId, RequestRow>> {
        let rows = self.requests.read();
        Ok(ids
            .iter()
            .filter_map(|id| rows.get(id.as_str()).map(|row| (id.clone(), row.clone())))
            .collect())
    }

    async fn find_ids_only(&self, ids: &[CustomId]) -> Result<HashSet<CustomId>> {
        let rows = self.requests.read();
        Ok(ids
            .iter()
            .filter(|id| rows.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn bulk_update(&self, ops: Vec<RequestUpdate>, log_id: &str) -> Result<BulkWriteSummary> {
        if ops.is_empty() {
            return Ok(BulkWriteSummary::default());
        }

        let chunks = chunked(ops, self.chunk_size);
        let mut acc = BulkAccumulator::new(log_id, chunks.len());
        // Chunks are applied strictly one at a time.
        for (idx, chunk) in chunks.into_iter().enumerate() {
            let mut outcome = ChunkOutcome::default();
            {
                let mut rows = self.requests.write();
                for op in &chunk {
                    outcome.modified += Self::apply_update(&mut rows, op);
                }
            }
            acc.absorb(idx + 1, outcome);
            tokio::task::yield_now().await;
        }
        acc.finish()
    }

    async fn bulk_upsert_bodies(
        &self,
        rows: Vec<RequestRow>,
        log_id: &str,
    ) -> Result<BulkWriteSummary> {
        if rows.is_empty() {
            return Ok(BulkWriteSummary::default());
        }

        let chunks = chunked(rows, self.chunk_size);
        let mut acc = BulkAccumulator::new(log_id, chunks.len());
        for (idx, chunk) in chunks.into_iter().enumerate() {
            let mut outcome = ChunkOutcome::default();
            {
                let mut stored = self.requests.write();
                for row in chunk {
                    match stored.get_mut(row.custom_id().as_str()) {
                        Some(existing) => {
                            // Only the body moves; lifecycle fields stay.
                            if existing.request.body != row.request.body {
                                existing.request.body = row.request.body;
                                outcome.modified += 1;
                            }
                        }
                        None => {
                            stored.insert(row.custom_id().as_str().to_string(), row);
                            outcome.upserted += 1;
                        }
                    }
                }
            }
            acc.absorb(idx + 1, outcome);
            tokio::task::yield_now().await;
        }
        acc.finish()
    }

    async fn custom_ids_for_batch(&self, batch_id: &str) -> Result<HashSet<CustomId>> {
        let rows = self.requests.read();
        Ok(rows
            .values()
            .filter(|row| row.batch_id.as_deref() == Some(batch_id))
            .map(|row| row.custom_id().clone())
            .collect())
    }

    async fn delete_by_prefix(&self, etld1: &str, field: FieldName) -> Result<u64> {
        let prefix = storage_prefix(etld1, field);
        let upper = format!("{prefix}\u{10FFFF}");

        let mut rows = self.requests.write();
        let doomed: Vec<String> = rows
            .range::<String, _>((Bound::Included(&prefix), Bound::Excluded(&upper)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            rows.remove(key);
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl DeferredStore for MemoryStore {
    async fn find(
        &self,
        etld1: &str,
        text_version_id: &str,
    ) -> Result<Option<DeferredManufacturer>> {
        Ok(self
            .deferred
            .read()
            .get(&(etld1.to_string(), text_version_id.to_string()))
            .cloned())
    }

    async fn upsert(&self, doc: &DeferredManufacturer) -> Result<()> {
        self.deferred.write().insert(
            (doc.etld1.clone(), doc.text_version_id.clone()),
            doc.clone(),
        );
        Ok(())
    }

    async fn delete(&self, etld1: &str, text_version_id: &str) -> Result<()> {
        self.deferred
            .write()
            .remove(&(etld1.to_string(), text_version_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ManufacturerStore for MemoryStore {
    async fn find_by_etld1(&self, etld1: &str) -> Result<Option<Manufacturer>> {
        Ok(self.manufacturers.read().get(etld1).cloned())
    }

    async fn find_by_etld1s(&self, etld1s: &[String]) -> Result<Vec<Manufacturer>> {
        let stored = self.manufacturers.read();
        Ok(etld1s.iter().filter_map(|e| stored.get(e).cloned()).collect())
    }

    async fn list_for_packing(&self, max_text_tokens: u64) -> Result<Vec<Manufacturer>> {
        let mut eligible: Vec<Manufacturer> = self
            .manufacturers
            .read()
            .values()
            .filter(|m| m.text_num_tokens.is_some_and(|t| t < max_text_tokens))
            .cloned()
            .collect();
        eligible.sort_by_key(|m| (m.text_num_tokens.unwrap_or(u64::MAX), m.etld1.clone()));
        Ok(eligible)
    }

    async fn upsert(&self, manufacturer: &Manufacturer) -> Result<()> {
        self.manufacturers
            .write()
            .insert(manufacturer.etld1.clone(), manufacturer.clone());
        Ok(())
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn find(&self, external_batch_id: &str) -> Result<Option<Batch>> {
        Ok(self.batches.read().get(external_batch_id).cloned())
    }

    async fn upsert(&self, batch: &Batch) -> Result<()> {
        self.batches
            .write()
            .insert(batch.external_batch_id.clone(), batch.clone());
        Ok(())
    }

    async fn list_for_key(&self, api_key_label: &str) -> Result<Vec<Batch>> {
        let mut batches: Vec<Batch> = self
            .batches
            .read()
            .values()
            .filter(|b| b.api_key_label == api_key_label)
            .cloned()
            .collect();
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(batches)
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn list(&self) -> Result<Vec<ApiKeyBundle>> {
        Ok(self.keys.read().values().cloned().collect())
    }

    async fn find(&self, label: &str) -> Result<Option<ApiKeyBundle>> {
        Ok(self.keys.read().get(label).cloned())
    }

    async fn save(&self, key: &ApiKeyBundle) -> Result<()> {
        self.keys.write().insert(key.label.clone(), key.clone());
        Ok(())
    }
}

#[async_trait]
impl ErrorLog for MemoryStore {
    async fn record(&self, error: ExtractionError) -> Result<()> {
        tracing::warn!(
            etld1 = %error.etld1,
            field = %error.field,
            error = %error.error,
            "extraction error recorded"
        );
        self.errors.write().push(error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::HeuristicTokenCounter;
    use crate::custom_id::{ChunkBounds, RequestKind};
    use crate::model::GptModel;
    use crate::prompt::Prompt;
    use crate::request::{build_request, ResponseBlob};
    use chrono::Utc;

    fn row(etld1: &str, field: FieldName, start: usize) -> RequestRow {
        let prompt = Prompt::new("prompt", "v1", &HeuristicTokenCounter);
        build_request(
            Utc::now(),
            CustomId::new(etld1, field, RequestKind::Chunk, ChunkBounds::new(start, start + 100)),
            "context text",
            &prompt,
            &GptModel::default_batch_model(),
            &HeuristicTokenCounter,
        )
    }

    fn response(batch_id: &str) -> ResponseBlob {
        ResponseBlob {
            batch_id: batch_id.to_string(),
            status_code: Some(200),
            content: "{}".to_string(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_bodies_is_idempotent_and_preserves_lifecycle_fields() {
        let store = MemoryStore::new();
        let first = row("acme.example", FieldName::Products, 0);
        let id = first.custom_id().clone();

        let summary = store
            .bulk_upsert_bodies(vec![first.clone()], "test")
            .await
            .unwrap();
        assert_eq!(summary.upserted, 1);

        // Bind and resolve the row.
        store
            .bulk_update(
                vec![RequestUpdate::SetResponse {
                    custom_id: id.clone(),
                    batch_id: "b1".to_string(),
                    response: response("b1"),
                }],
                "test",
            )
            .await
            .unwrap();

        // Replaying the same body must not disturb batch_id or response.
        let summary = store
            .bulk_upsert_bodies(vec![first], "test")
            .await
            .unwrap();
        assert_eq!(summary.upserted, 0);
        assert_eq!(summary.modified, 0);

        let stored = store.request(&id).unwrap();
        assert_eq!(stored.batch_id.as_deref(), Some("b1"));
        assert!(stored.response_blob.is_some());
    }

    #[tokio::test]
    async fn updates_against_missing_rows_match_nothing() {
        let store = MemoryStore::new();
        let summary = store
            .bulk_update(
                vec![RequestUpdate::PairBatch {
                    custom_id: CustomId::from("ghost.example>products>chunk>0:1"),
                    batch_id: "b1".to_string(),
                }],
                "test",
            )
            .await
            .unwrap();
        assert_eq!(summary.modified, 0);
        assert_eq!(store.request_count(), 0);
    }

    #[tokio::test]
    async fn bulk_update_processes_chunks_sequentially(){
        // A chunk size of 1 forces one chunk per op; counts must still sum.
        let store = MemoryStore::new().with_chunk_size(1);
        let rows: Vec<RequestRow> = (0..7)
            .map(|i| row("acme.example", FieldName::Products, i * 200))
            .collect();
        let ids: Vec<CustomId> = rows.iter().map(|r| r.custom_id().clone()).collect();
        store.bulk_upsert_bodies(rows, "seed").await.unwrap();

        let ops = ids
            .iter()
            .map(|id| RequestUpdate::PairBatch {
                custom_id: id.clone(),
                batch_id: "b9".to_string(),
            })
            .collect();
        let summary = store.bulk_update(ops, "pair").await.unwrap();
        assert_eq!(summary.modified, 7);
    }

    #[tokio::test]
    async fn pair_and_unpair_round_trip() {
        let store = MemoryStore::new();
        let rows: Vec<RequestRow> = (0..3)
            .map(|i| row("acme.example", FieldName::Certificates, i * 300))
            .collect();
        let ids: HashSet<CustomId> = rows.iter().map(|r| r.custom_id().clone()).collect();
        store.bulk_upsert_bodies(rows, "seed").await.unwrap();

        let paired = store.pair_with_batch(&ids, "b1").await.unwrap();
        assert_eq!(paired, 3);
        assert_eq!(store.custom_ids_for_batch("b1").await.unwrap(), ids);

        let unpaired = store.unpair_from_batch("b1").await.unwrap();
        assert_eq!(unpaired, 3);
        assert!(store.custom_ids_for_batch("b1").await.unwrap().is_empty());
        for id in &ids {
            assert!(store.request(id).unwrap().is_pending());
        }
    }

    #[tokio::test]
    async fn unpair_clears_responses_too() {
        let store = MemoryStore::new();
        let r = row("acme.example", FieldName::Products, 0);
        let id = r.custom_id().clone();
        store.bulk_upsert_bodies(vec![r], "seed").await.unwrap();
        store
            .bulk_update(
                vec![RequestUpdate::SetResponse {
                    custom_id: id.clone(),
                    batch_id: "b1".to_string(),
                    response: response("b1"),
                }],
                "resolve",
            )
            .await
            .unwrap();

        store
            .unpair_by_ids(&HashSet::from([id.clone()]))
            .await
            .unwrap();
        let stored = store.request(&id).unwrap();
        assert!(stored.batch_id.is_none());
        assert!(stored.response_blob.is_none());
    }

    #[tokio::test]
    async fn delete_by_prefix_only_touches_the_field() {
        let store = MemoryStore::new();
        store
            .bulk_upsert_bodies(
                vec![
                    row("acme.example", FieldName::Products, 0),
                    row("acme.example", FieldName::Products, 200),
                    row("acme.example", FieldName::Certificates, 0),
                    row("acme.example.co", FieldName::Products, 0),
                ],
                "seed",
            )
            .await
            .unwrap();

        let deleted = store
            .delete_by_prefix("acme.example", FieldName::Products)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.request_count(), 2);

        // Other fields and other manufacturers survive.
        let remaining = store
            .find_ids_only(&[
                CustomId::new(
                    "acme.example",
                    FieldName::Certificates,
                    RequestKind::Chunk,
                    ChunkBounds::new(0, 100),
                ),
                CustomId::new(
                    "acme.example.co",
                    FieldName::Products,
                    RequestKind::Chunk,
                    ChunkBounds::new(0, 100),
                ),
            ])
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn packing_list_is_sorted_ascending_and_capped() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (etld1, tokens) in [("big.example", 150_000), ("small.example", 500), ("mid.example", 5_000)] {
            let mut mfg = Manufacturer::new(etld1, Some("v1".to_string()), now);
            mfg.text_num_tokens = Some(tokens);
            ManufacturerStore::upsert(&store, &mfg).await.unwrap();
        }
        let mut no_tokens = Manufacturer::new("unknown.example", Some("v1".to_string()), now);
        no_tokens.text_num_tokens = None;
        ManufacturerStore::upsert(&store, &no_tokens).await.unwrap();

        let listed = store.list_for_packing(100_000).await.unwrap();
        let etld1s: Vec<&str> = listed.iter().map(|m| m.etld1.as_str()).collect();
        assert_eq!(etld1s, vec!["small.example", "mid.example"]);
    }
}
