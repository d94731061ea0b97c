//! Batch-inference enrichment of manufacturer records.
//!
//! `kiln` drives a corpus of manufacturer records through a multi-phase
//! extraction pipeline on top of an OpenAI-style batch API. Per-manufacturer
//! deferred state records which prompt requests each unresolved field still
//! needs; the packer groups pending requests into JSONL upload files under
//! request/token/byte caps without ever splitting a manufacturer across
//! files; and the batch station runs one quota-aware scheduler worker per
//! API key, uploading batches, polling them, reconciling their results, and
//! advancing every touched manufacturer until all of its fields resolve.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use kiln::{
//!     BatchStation, HeuristicTokenCounter, GptModel, MemoryStore, OpenAiBatchApi,
//!     Ontology, Orchestrator, PromptCatalog, StationConfig, TokenCounter,
//! };
//! use kiln::blob::FsBlobStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let counter: Arc<dyn TokenCounter> = Arc::new(HeuristicTokenCounter);
//!     let ontology = Arc::new(Ontology::new("onto-1", vec![], vec![], vec![], vec![]));
//!     let prompts = PromptCatalog::builtin(&HeuristicTokenCounter);
//!     let blobs = Arc::new(FsBlobStore::new("./blobs"));
//!
//!     let orchestrator = Arc::new(Orchestrator::new(
//!         store.clone(),
//!         store.clone(),
//!         store.clone(),
//!         store.clone(),
//!         blobs,
//!         counter,
//!         ontology,
//!         prompts,
//!         GptModel::default_batch_model(),
//!     ));
//!
//!     let provider = Arc::new(OpenAiBatchApi::new("https://api.openai.com")?);
//!     let station = Arc::new(BatchStation::new(
//!         store.clone(),
//!         store.clone(),
//!         store.clone(),
//!         store.clone(),
//!         store.clone(),
//!         provider,
//!         orchestrator,
//!         StationConfig::new("./batch_data"),
//!     ));
//!
//!     let shutdown = station.shutdown_token();
//!     let handle = station.run();
//!     tokio::signal::ctrl_c().await?;
//!     shutdown.cancel();
//!     handle.await??;
//!     Ok(())
//! }
//! ```

pub mod blob;
pub mod chunk;
pub mod custom_id;
pub mod error;
pub mod model;
pub mod ontology;
pub mod orchestrator;
pub mod packer;
pub mod prompt;
pub mod provider;
pub mod request;
pub mod station;
pub mod store;

// Re-export the types most users touch, so `use kiln::BatchStation` works
// without spelling out the module tree.
pub use chunk::{chunk_text, ChunkingStrategy, HeuristicTokenCounter, TokenCounter};
pub use custom_id::{ChunkBounds, CustomId, FieldFamily, FieldName, RequestKind};
pub use error::{KilnError, Result};
pub use model::{ApiKeyBundle, Batch, BatchStatus, GptModel, Manufacturer};
pub use ontology::{Concept, Ontology};
pub use orchestrator::Orchestrator;
pub use packer::{pack_pending_requests, PackerConfig};
pub use prompt::{Prompt, PromptCatalog};
pub use provider::{BatchProvider, MockProvider, OpenAiBatchApi};
pub use station::{BatchStation, StationConfig, StationEvent, StationStats};
pub use store::memory::MemoryStore;
pub use store::{
    BatchStore, DeferredStore, ErrorLog, KeyStore, ManufacturerStore, RequestStore,
};

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStore;
