//! Versioned scraped-text blobs.
//!
//! Scraped text is immutable and addressed by `(etld1, version_id)`; the
//! version id also lives in the deferred-manufacturer key, so derived work
//! is never mixed across text revisions. The real object store sits behind
//! this seam.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{KilnError, Result};

#[async_trait]
pub trait BlobFetcher: Send + Sync {
    /// Fetch the text snapshot for a manufacturer / version pair.
    async fn fetch(&self, etld1: &str, version_id: &str) -> Result<String>;
}

/// Filesystem-backed blobs at `<root>/<etld1>/<version_id>.txt`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, etld1: &str, version_id: &str) -> PathBuf {
        self.root.join(etld1).join(format!("{version_id}.txt"))
    }
}

#[async_trait]
impl BlobFetcher for FsBlobStore {
    async fn fetch(&self, etld1: &str, version_id: &str) -> Result<String> {
        let path = self.path_for(etld1, version_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(KilnError::BlobNotFound {
                etld1: etld1.to_string(),
                version_id: version_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory blobs for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<(String, String), Arc<str>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, etld1: &str, version_id: &str, text: &str) {
        self.blobs
            .write()
            .insert((etld1.to_string(), version_id.to_string()), Arc::from(text));
    }
}

#[async_trait]
impl BlobFetcher for MemoryBlobStore {
    async fn fetch(&self, etld1: &str, version_id: &str) -> Result<String> {
        self.blobs
            .read()
            .get(&(etld1.to_string(), version_id.to_string()))
            .map(|text| text.to_string())
            .ok_or_else(|| KilnError::BlobNotFound {
                etld1: etld1.to_string(),
                version_id: version_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_round_trips_and_reports_missing_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        tokio::fs::create_dir_all(dir.path().join("acme.example"))
            .await
            .unwrap();
        tokio::fs::write(
            dir.path().join("acme.example").join("v1.txt"),
            "scraped text",
        )
        .await
        .unwrap();

        assert_eq!(store.fetch("acme.example", "v1").await.unwrap(), "scraped text");
        assert!(matches!(
            store.fetch("acme.example", "v2").await,
            Err(KilnError::BlobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryBlobStore::new();
        store.insert("acme.example", "v1", "text body");
        assert_eq!(store.fetch("acme.example", "v1").await.unwrap(), "text body");
        assert!(store.fetch("other.example", "v1").await.is_err());
    }
}
