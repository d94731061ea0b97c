//! Sharded bulk-write discipline.
//!
//! Large update sets are split into fixed-size chunks applied strictly one
//! at a time; concurrent chunks were observed to degrade throughput and
//! exhaust the connection pool under write-lock contention. Within a chunk
//! the backend uses unordered semantics: one row's failure does not abort
//! its siblings. Counts and data-level errors are aggregated across all
//! chunks before anything is raised.

use crate::error::{BulkWriteFailure, KilnError, Result, WriteError};

/// Default number of operations per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 5_000;

/// Successful-side totals of a bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteSummary {
    pub upserted: u64,
    pub modified: u64,
}

/// What one chunk reported back.
#[derive(Debug, Default)]
pub struct ChunkOutcome {
    pub upserted: u64,
    pub modified: u64,
    pub write_errors: Vec<WriteError>,
    /// Set when the whole chunk failed (infrastructure-level)
    pub unexpected_error: Option<String>,
}

/// Accumulates chunk outcomes and decides what the bulk call returns:
/// counts on success, an aggregated `BulkWrite` error when any data-level
/// write errors occurred, or `BulkChunks` when any chunk failed outright.
/// Unexpected failures take precedence over write errors.
pub struct BulkAccumulator {
    log_id: String,
    total_chunks: usize,
    upserted: u64,
    modified: u64,
    write_errors: Vec<WriteError>,
    unexpected: Vec<String>,
}

impl BulkAccumulator {
    pub fn new(log_id: &str, total_chunks: usize) -> Self {
        Self {
            log_id: log_id.to_string(),
            total_chunks,
            upserted: 0,
            modified: 0,
            write_errors: Vec::new(),
            unexpected: Vec::new(),
        }
    }

    pub fn absorb(&mut self, chunk_num: usize, outcome: ChunkOutcome) {
        if let Some(error) = &outcome.unexpected_error {
            tracing::error!(
                log_id = %self.log_id,
                chunk = chunk_num,
                total_chunks = self.total_chunks,
                error = %error,
                "bulk write chunk failed"
            );
            self.unexpected.push(format!("chunk {chunk_num}: {error}"));
            return;
        }

        tracing::debug!(
            log_id = %self.log_id,
            chunk = chunk_num,
            total_chunks = self.total_chunks,
            upserted = outcome.upserted,
            modified = outcome.modified,
            write_errors = outcome.write_errors.len(),
            "bulk write chunk applied"
        );
        self.upserted += outcome.upserted;
        self.modified += outcome.modified;
        self.write_errors.extend(outcome.write_errors);
    }

    pub fn finish(self) -> Result<BulkWriteSummary> {
        tracing::info!(
            log_id = %self.log_id,
            upserted = self.upserted,
            modified = self.modified,
            write_errors = self.write_errors.len(),
            unexpected_errors = self.unexpected.len(),
            "bulk write completed"
        );

        if !self.unexpected.is_empty() {
            return Err(KilnError::BulkChunks {
                failures: self.unexpected,
            });
        }

        if !self.write_errors.is_empty() {
            return Err(KilnError::BulkWrite(BulkWriteFailure {
                upserted: self.upserted,
                modified: self.modified,
                write_errors: self.write_errors,
            }));
        }

        Ok(BulkWriteSummary {
            upserted: self.upserted,
            modified: self.modified,
        })
    }
}

/// Split `items` into chunks of `chunk_size`, preserving order.
pub fn chunked<T>(items: Vec<T>, chunk_size: usize) -> Vec<Vec<T>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(chunk_size));
    let mut current = Vec::with_capacity(chunk_size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == chunk_size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(chunk_size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
