use thiserror::Error;

use crate::custom_id::CustomId;

/// Result type for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// A single data-level failure inside a bulk write chunk (e.g. a duplicate
/// key). These are aggregated across chunks, never raised per row.
#[derive(Debug, Clone)]
pub struct WriteError {
    /// Index of the offending operation within its chunk
    pub index: usize,
    /// Backend error code, where the backend provides one
    pub code: Option<String>,
    pub message: String,
}

/// Aggregate outcome of a failed bulk write: counts of the work that did
/// succeed plus every data-level error collected across all chunks.
#[derive(Debug, Clone)]
pub struct BulkWriteFailure {
    pub upserted: u64,
    pub modified: u64,
    pub write_errors: Vec<WriteError>,
}

impl std::fmt::Display for BulkWriteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} write errors ({} upserted, {} modified)",
            self.write_errors.len(),
            self.upserted,
            self.modified
        )
    }
}

/// Errors that can occur in the kiln system.
#[derive(Debug, Error)]
pub enum KilnError {
    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The batch provider rejected a call
    #[error("Provider error ({status}): {message}")]
    Provider { status: u16, message: String },

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A custom id did not match the grammar
    #[error("Invalid custom id: {0}")]
    InvalidCustomId(String),

    /// Manufacturer not found
    #[error("Manufacturer not found: {0}")]
    ManufacturerNotFound(String),

    /// Request row not found
    #[error("Request not found: {0}")]
    RequestNotFound(CustomId),

    /// Text blob not found for a manufacturer / version pair
    #[error("Blob not found: {etld1} version {version_id}")]
    BlobNotFound { etld1: String, version_id: String },

    /// A deferred sub-document was built against a different prompt version
    /// than the catalog currently carries
    #[error("Prompt version mismatch for {field}: deferred={deferred}, catalog={catalog}")]
    PromptVersionMismatch {
        field: String,
        deferred: String,
        catalog: String,
    },

    /// Data-level bulk write errors, aggregated across chunks. Callers may
    /// classify and continue; the successful counts are preserved.
    #[error("Bulk write completed with errors: {0}")]
    BulkWrite(BulkWriteFailure),

    /// One or more chunks of a bulk write failed outright. Fatal to the
    /// current step.
    #[error("Bulk write chunk failures: {}", failures.join("; "))]
    BulkChunks { failures: Vec<String> },

    /// A completion body could not be parsed into the expected shape
    #[error("Malformed completion for {custom_id}: {message}")]
    MalformedCompletion { custom_id: CustomId, message: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Catch-all for errors from other libraries
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// Data-level bulk write errors are survivable: the caller logs and
    /// carries on with the successful portion. Everything else aborts the
    /// current step.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, KilnError::BulkWrite(_))
    }
}
