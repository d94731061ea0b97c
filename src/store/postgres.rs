//! Postgres backend for every store trait.
//!
//! Documents are stored as JSONB with their natural keys (custom id, etld1,
//! external batch id, key label) extracted into indexed columns, mirroring
//! the document-store contract: point replace by primary key, unordered
//! bulk updates, and a lexicographic range scan on the custom id.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::custom_id::{storage_prefix, CustomId, FieldName};
use crate::error::{Result, WriteError};
use crate::model::{ApiKeyBundle, Batch, DeferredManufacturer, ExtractionError, Manufacturer};
use crate::request::{RequestRow, RequestUpdate};
use crate::store::bulk::{chunked, BulkAccumulator, BulkWriteSummary, ChunkOutcome, DEFAULT_CHUNK_SIZE};
use crate::store::{BatchStore, DeferredStore, ErrorLog, KeyStore, ManufacturerStore, RequestStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kiln_requests (
    custom_id     TEXT PRIMARY KEY,
    created_at    TIMESTAMPTZ NOT NULL,
    request       JSONB NOT NULL,
    batch_id      TEXT,
    response_blob JSONB
);
CREATE INDEX IF NOT EXISTS kiln_requests_batch_id_idx ON kiln_requests (batch_id);

CREATE TABLE IF NOT EXISTS kiln_deferred_manufacturers (
    etld1           TEXT NOT NULL,
    text_version_id TEXT NOT NULL,
    document        JSONB NOT NULL,
    PRIMARY KEY (etld1, text_version_id)
);

CREATE TABLE IF NOT EXISTS kiln_manufacturers (
    etld1           TEXT PRIMARY KEY,
    text_num_tokens BIGINT,
    document        JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS kiln_manufacturers_tokens_idx ON kiln_manufacturers (text_num_tokens);

CREATE TABLE IF NOT EXISTS kiln_batches (
    external_batch_id TEXT PRIMARY KEY,
    api_key_label     TEXT NOT NULL,
    status            TEXT NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL,
    document          JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS kiln_batches_key_idx ON kiln_batches (api_key_label);
CREATE INDEX IF NOT EXISTS kiln_batches_status_idx ON kiln_batches (status);

CREATE TABLE IF NOT EXISTS kiln_api_keys (
    label    TEXT PRIMARY KEY,
    document JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS kiln_extraction_errors (
    id         BIGSERIAL PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL,
    etld1      TEXT NOT NULL,
    field      TEXT NOT NULL,
    error      TEXT NOT NULL
);
"#;

/// Postgres implementation of all kiln stores.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    chunk_size: usize,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Connect and bootstrap the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    fn row_to_request(row: &sqlx::postgres::PgRow) -> Result<RequestRow> {
        let request: serde_json::Value = row.try_get("request")?;
        let response_blob: Option<serde_json::Value> = row.try_get("response_blob")?;
        Ok(RequestRow {
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            request: serde_json::from_value(request)?,
            batch_id: row.try_get("batch_id")?,
            response_blob: response_blob.map(serde_json::from_value).transpose()?,
        })
    }

    /// Classify a per-row failure: constraint violations are data-level
    /// write errors; anything else fails the chunk.
    fn classify(index: usize, error: sqlx::Error) -> std::result::Result<WriteError, String> {
        match &error {
            sqlx::Error::Database(db) => Ok(WriteError {
                index,
                code: db.code().map(|c| c.to_string()),
                message: db.message().to_string(),
            }),
            _ => Err(error.to_string()),
        }
    }

    async fn apply_update_chunk(&self, chunk: &[RequestUpdate]) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();
        for (index, op) in chunk.iter().enumerate() {
            let result = match op {
                RequestUpdate::PairBatch {
                    custom_id,
                    batch_id,
                } => {
                    sqlx::query("UPDATE kiln_requests SET batch_id = $2 WHERE custom_id = $1")
                        .bind(custom_id.as_str())
                        .bind(batch_id)
                        .execute(&self.pool)
                        .await
                }
                RequestUpdate::SetResponse {
                    custom_id,
                    batch_id,
                    response,
                } => {
                    let blob = match serde_json::to_value(response) {
                        Ok(blob) => blob,
                        Err(e) => {
                            outcome.write_errors.push(WriteError {
                                index,
                                code: None,
                                message: e.to_string(),
                            });
                            continue;
                        }
                    };
                    sqlx::query(
                        "UPDATE kiln_requests SET batch_id = $2, response_blob = $3 \
                         WHERE custom_id = $1",
                    )
                    .bind(custom_id.as_str())
                    .bind(batch_id)
                    .bind(blob)
                    .execute(&self.pool)
                    .await
                }
                RequestUpdate::Unpair { custom_id } => {
                    sqlx::query(
                        "UPDATE kiln_requests SET batch_id = NULL, response_blob = NULL \
                         WHERE custom_id = $1",
                    )
                    .bind(custom_id.as_str())
                    .execute(&self.pool)
                    .await
                }
            };

            match result {
                Ok(done) => outcome.modified += done.rows_affected(),
                Err(error) => match Self::classify(index, error) {
                    Ok(write_error) => outcome.write_errors.push(write_error),
                    Err(message) => {
                        outcome.unexpected_error = Some(message);
                        return outcome;
                    }
                },
            }
        }
        outcome
    }

    async fn apply_upsert_chunk(&self, chunk: &[RequestRow]) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();
        for (index, request_row) in chunk.iter().enumerate() {
            let request = match serde_json::to_value(&request_row.request) {
                Ok(value) => value,
                Err(e) => {
                    outcome.write_errors.push(WriteError {
                        index,
                        code: None,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            // On conflict only the body moves; lifecycle columns stay.
            let result = sqlx::query(
                "INSERT INTO kiln_requests (custom_id, created_at, request, batch_id, response_blob) \
                 VALUES ($1, $2, $3, NULL, NULL) \
                 ON CONFLICT (custom_id) DO UPDATE \
                 SET request = jsonb_set(kiln_requests.request, '{body}', EXCLUDED.request->'body') \
                 RETURNING (xmax = 0) AS inserted",
            )
            .bind(request_row.custom_id().as_str())
            .bind(request_row.created_at)
            .bind(request)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => {
                    let inserted: bool = row.try_get("inserted").unwrap_or(false);
                    if inserted {
                        outcome.upserted += 1;
                    } else {
                        outcome.modified += 1;
                    }
                }
                Err(error) => match Self::classify(index, error) {
                    Ok(write_error) => outcome.write_errors.push(write_error),
                    Err(message) => {
                        outcome.unexpected_error = Some(message);
                        return outcome;
                    }
                },
            }
        }
        outcome
    }
}

#[async_trait]
impl RequestStore for PostgresStore {
    async fn find_by_custom_ids(&self, ids: &[CustomId]) -> Result<HashMap<CustomId, RequestRow>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let id_strings: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let rows = sqlx::query(
            "SELECT custom_id, created_at, request, batch_id, response_blob \
             FROM kiln_requests WHERE custom_id = ANY($1)",
        )
        .bind(&id_strings)
        .fetch_all(&self.pool)
        .await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in &rows {
            let custom_id: String = row.try_get("custom_id")?;
            found.insert(CustomId::from(custom_id), Self::row_to_request(row)?);
        }
        Ok(found)
    }

    async fn find_ids_only(&self, ids: &[CustomId]) -> Result<HashSet<CustomId>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let id_strings: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let rows = sqlx::query("SELECT custom_id FROM kiln_requests WHERE custom_id = ANY($1)")
            .bind(&id_strings)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok(CustomId::from(row.try_get::<String, _>("custom_id")?)))
            .collect()
    }

    async fn bulk_update(&self, ops: Vec<RequestUpdate>, log_id: &str) -> Result<BulkWriteSummary> {
        if ops.is_empty() {
            return Ok(BulkWriteSummary::default());
        }
        let chunks = chunked(ops, self.chunk_size);
        let mut acc = BulkAccumulator::new(log_id, chunks.len());
        // Chunks are applied strictly one at a time.
        for (idx, chunk) in chunks.iter().enumerate() {
            let outcome = self.apply_update_chunk(chunk).await;
            acc.absorb(idx + 1, outcome);
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
        for (idx, chunk) in chunks.iter().enumerate() {
            let outcome = self.apply_upsert_chunk(chunk).await;
            acc.absorb(idx + 1, outcome);
        }
        acc.finish()
    }

    async fn custom_ids_for_batch(&self, batch_id: &str) -> Result<HashSet<CustomId>> {
        let rows = sqlx::query("SELECT custom_id FROM kiln_requests WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok(CustomId::from(row.try_get::<String, _>("custom_id")?)))
            .collect()
    }

    async fn delete_by_prefix(&self, etld1: &str, field: FieldName) -> Result<u64> {
        let prefix = storage_prefix(etld1, field);
        let upper = format!("{prefix}\u{10FFFF}");
        let done = sqlx::query("DELETE FROM kiln_requests WHERE custom_id >= $1 AND custom_id < $2")
            .bind(&prefix)
            .bind(&upper)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl DeferredStore for PostgresStore {
    async fn find(
        &self,
        etld1: &str,
        text_version_id: &str,
    ) -> Result<Option<DeferredManufacturer>> {
        let row = sqlx::query(
            "SELECT document FROM kiln_deferred_manufacturers \
             WHERE etld1 = $1 AND text_version_id = $2",
        )
        .bind(etld1)
        .bind(text_version_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            let document: serde_json::Value = r.try_get("document")?;
            Ok(serde_json::from_value(document)?)
        })
        .transpose()
    }

    async fn upsert(&self, doc: &DeferredManufacturer) -> Result<()> {
        sqlx::query(
            "INSERT INTO kiln_deferred_manufacturers (etld1, text_version_id, document) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (etld1, text_version_id) DO UPDATE SET document = EXCLUDED.document",
        )
        .bind(&doc.etld1)
        .bind(&doc.text_version_id)
        .bind(serde_json::to_value(doc)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, etld1: &str, text_version_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM kiln_deferred_manufacturers WHERE etld1 = $1 AND text_version_id = $2",
        )
        .bind(etld1)
        .bind(text_version_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ManufacturerStore for PostgresStore {
    async fn find_by_etld1(&self, etld1: &str) -> Result<Option<Manufacturer>> {
        let row = sqlx::query("SELECT document FROM kiln_manufacturers WHERE etld1 = $1")
            .bind(etld1)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let document: serde_json::Value = r.try_get("document")?;
            Ok(serde_json::from_value(document)?)
        })
        .transpose()
    }

    async fn find_by_etld1s(&self, etld1s: &[String]) -> Result<Vec<Manufacturer>> {
        if etld1s.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT document FROM kiln_manufacturers WHERE etld1 = ANY($1)")
            .bind(etld1s)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let document: serde_json::Value = r.try_get("document")?;
                Ok(serde_json::from_value(document)?)
            })
            .collect()
    }

    async fn list_for_packing(&self, max_text_tokens: u64) -> Result<Vec<Manufacturer>> {
        let rows = sqlx::query(
            "SELECT document FROM kiln_manufacturers \
             WHERE text_num_tokens IS NOT NULL AND text_num_tokens < $1 \
             ORDER BY text_num_tokens ASC, etld1 ASC",
        )
        .bind(max_text_tokens as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let document: serde_json::Value = r.try_get("document")?;
                Ok(serde_json::from_value(document)?)
            })
            .collect()
    }

    async fn upsert(&self, manufacturer: &Manufacturer) -> Result<()> {
        sqlx::query(
            "INSERT INTO kiln_manufacturers (etld1, text_num_tokens, document) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (etld1) DO UPDATE \
             SET text_num_tokens = EXCLUDED.text_num_tokens, document = EXCLUDED.document",
        )
        .bind(&manufacturer.etld1)
        .bind(manufacturer.text_num_tokens.map(|t| t as i64))
        .bind(serde_json::to_value(manufacturer)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BatchStore for PostgresStore {
    async fn find(&self, external_batch_id: &str) -> Result<Option<Batch>> {
        let row = sqlx::query("SELECT document FROM kiln_batches WHERE external_batch_id = $1")
            .bind(external_batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let document: serde_json::Value = r.try_get("document")?;
            Ok(serde_json::from_value(document)?)
        })
        .transpose()
    }

    async fn upsert(&self, batch: &Batch) -> Result<()> {
        sqlx::query(
            "INSERT INTO kiln_batches (external_batch_id, api_key_label, status, created_at, document) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (external_batch_id) DO UPDATE \
             SET status = EXCLUDED.status, document = EXCLUDED.document",
        )
        .bind(&batch.external_batch_id)
        .bind(&batch.api_key_label)
        .bind(batch.status.to_string())
        .bind(batch.created_at)
        .bind(serde_json::to_value(batch)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_key(&self, api_key_label: &str) -> Result<Vec<Batch>> {
        let rows = sqlx::query(
            "SELECT document FROM kiln_batches WHERE api_key_label = $1 ORDER BY created_at ASC",
        )
        .bind(api_key_label)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let document: serde_json::Value = r.try_get("document")?;
                Ok(serde_json::from_value(document)?)
            })
            .collect()
    }
}

#[async_trait]
impl KeyStore for PostgresStore {
    async fn list(&self) -> Result<Vec<ApiKeyBundle>> {
        let rows = sqlx::query("SELECT document FROM kiln_api_keys ORDER BY label ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let document: serde_json::Value = r.try_get("document")?;
                Ok(serde_json::from_value(document)?)
            })
            .collect()
    }

    async fn find(&self, label: &str) -> Result<Option<ApiKeyBundle>> {
        let row = sqlx::query("SELECT document FROM kiln_api_keys WHERE label = $1")
            .bind(label)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let document: serde_json::Value = r.try_get("document")?;
            Ok(serde_json::from_value(document)?)
        })
        .transpose()
    }

    async fn save(&self, key: &ApiKeyBundle) -> Result<()> {
        sqlx::query(
            "INSERT INTO kiln_api_keys (label, document) VALUES ($1, $2) \
             ON CONFLICT (label) DO UPDATE SET document = EXCLUDED.document",
        )
        .bind(&key.label)
        .bind(serde_json::to_value(key)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ErrorLog for PostgresStore {
    async fn record(&self, error: ExtractionError) -> Result<()> {
        sqlx::query(
            "INSERT INTO kiln_extraction_errors (created_at, etld1, field, error) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(error.created_at)
        .bind(&error.etld1)
        .bind(&error.field)
        .bind(&error.error)
        .execute(&self.pool)
        .await?;
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
    use crate::request::build_request;

    fn sample_row(start: usize) -> RequestRow {
        let prompt = Prompt::new("prompt", "v1", &HeuristicTokenCounter);
        build_request(
            Utc::now(),
            CustomId::new(
                "acme.example",
                FieldName::Products,
                RequestKind::Chunk,
                ChunkBounds::new(start, start + 100),
            ),
            "context",
            &prompt,
            &GptModel::default_batch_model(),
            &HeuristicTokenCounter,
        )
    }

    #[sqlx::test]
    async fn upsert_pair_and_prefix_delete_round_trip(pool: PgPool) {
        let store = PostgresStore::new(pool);
        store.ensure_schema().await.unwrap();

        let rows: Vec<RequestRow> = (0..3).map(|i| sample_row(i * 200)).collect();
        let ids: HashSet<CustomId> = rows.iter().map(|r| r.custom_id().clone()).collect();

        let summary = store.bulk_upsert_bodies(rows.clone(), "test").await.unwrap();
        assert_eq!(summary.upserted, 3);

        // Re-upserting touches only bodies.
        let summary = store.bulk_upsert_bodies(rows, "test").await.unwrap();
        assert_eq!(summary.upserted, 0);
        assert_eq!(summary.modified, 3);

        let paired = store.pair_with_batch(&ids, "b1").await.unwrap();
        assert_eq!(paired, 3);
        assert_eq!(store.custom_ids_for_batch("b1").await.unwrap().len(), 3);

        let found = store
            .find_by_custom_ids(&ids.iter().cloned().collect::<Vec<_>>())
            .await
            .unwrap();
        assert!(found.values().all(|r| r.is_in_flight()));

        let deleted = store
            .delete_by_prefix("acme.example", FieldName::Products)
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert!(store
            .find_ids_only(&ids.into_iter().collect::<Vec<_>>())
            .await
            .unwrap()
            .is_empty());
    }

    #[sqlx::test]
    async fn manufacturer_packing_order_follows_token_counts(pool: PgPool) {
        let store = PostgresStore::new(pool);
        store.ensure_schema().await.unwrap();

        for (etld1, tokens) in [("big.example", 90_000u64), ("small.example", 100)] {
            let mut mfg = Manufacturer::new(etld1, Some("v1".to_string()), Utc::now());
            mfg.text_num_tokens = Some(tokens);
            ManufacturerStore::upsert(&store, &mfg).await.unwrap();
        }

        let listed = store.list_for_packing(200_000).await.unwrap();
        let order: Vec<&str> = listed.iter().map(|m| m.etld1.as_str()).collect();
        assert_eq!(order, vec!["small.example", "big.example"]);
    }
}
