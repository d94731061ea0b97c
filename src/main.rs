use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use kiln::blob::FsBlobStore;
use kiln::{
    ApiKeyBundle, BatchStation, GptModel, HeuristicTokenCounter, KeyStore, MemoryStore,
    Ontology, OpenAiBatchApi, Orchestrator, PromptCatalog, StationConfig, TokenCounter,
};

/// Batch-inference enrichment daemon for manufacturer records.
#[derive(Debug, Parser)]
#[command(name = "kiln", version, about)]
struct Args {
    /// JSON catalog of API keys: [{"label", "key", "batch_queue_limit"}]
    #[arg(long, env = "KILN_KEYS_FILE")]
    keys_file: PathBuf,

    /// Directory holding scraped text blobs (<etld1>/<version_id>.txt)
    #[arg(long, env = "KILN_BLOB_DIR", default_value = "./blobs")]
    blob_dir: PathBuf,

    /// Directory for batch files and archived outputs
    #[arg(long, env = "KILN_OUTPUT_DIR", default_value = "./batch_data")]
    output_dir: PathBuf,

    /// Batch provider base URL
    #[arg(long, env = "KILN_BASE_URL", default_value = "https://api.openai.com")]
    base_url: String,

    /// How often each key worker polls, e.g. "5m" or "30s"
    #[arg(long, env = "KILN_POLL_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    poll_interval: Duration,

    /// Ontology catalog JSON; omit to run with an empty catalog
    #[arg(long, env = "KILN_ONTOLOGY_FILE")]
    ontology_file: Option<PathBuf>,

    /// Prompt catalog JSON; omit to use the built-in prompts
    #[arg(long, env = "KILN_PROMPTS_FILE")]
    prompts_file: Option<PathBuf>,

    /// Model requests are issued against
    #[arg(long, env = "KILN_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// Postgres connection string (requires the "postgres" build)
    #[cfg(feature = "postgres")]
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyFileEntry {
    label: String,
    key: String,
    batch_queue_limit: u64,
}

async fn load_keys(path: &PathBuf, store: &dyn KeyStore) -> anyhow::Result<usize> {
    let raw = tokio::fs::read_to_string(path).await?;
    let entries: Vec<KeyFileEntry> = serde_json::from_str(&raw)?;
    let count = entries.len();
    for entry in entries {
        // Quota accounting survives restarts when the store already has
        // the key; only genuinely new labels are inserted.
        if store.find(&entry.label).await?.is_none() {
            store
                .save(&ApiKeyBundle::new(
                    entry.label,
                    entry.key,
                    entry.batch_queue_limit,
                ))
                .await?;
        }
    }
    Ok(count)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "kiln=info".into()))
        .init();

    let args = Args::parse();

    let counter: Arc<dyn TokenCounter> = Arc::new(HeuristicTokenCounter);
    let prompts = match &args.prompts_file {
        Some(path) => PromptCatalog::load(path, &HeuristicTokenCounter).await?,
        None => PromptCatalog::builtin(&HeuristicTokenCounter),
    };
    let ontology = match &args.ontology_file {
        Some(path) => Ontology::load(path).await?,
        None => {
            tracing::warn!("no ontology file given, concept fields will map everything as unknown");
            Arc::new(Ontology::new("empty", vec![], vec![], vec![], vec![]))
        }
    };

    #[cfg(feature = "postgres")]
    if let Some(database_url) = &args.database_url {
        let store = Arc::new(kiln::PostgresStore::connect(database_url).await?);
        tracing::info!("using postgres backend");
        return run(args, store, counter, ontology, prompts).await;
    }

    let store = Arc::new(MemoryStore::new());
    tracing::warn!("using in-memory backend; state will not survive a restart");
    run(args, store, counter, ontology, prompts).await
}

trait Backend:
    kiln::RequestStore
    + kiln::DeferredStore
    + kiln::ManufacturerStore
    + kiln::BatchStore
    + kiln::KeyStore
    + kiln::ErrorLog
    + Send
    + Sync
    + 'static
{
}

impl<T> Backend for T where
    T: kiln::RequestStore
        + kiln::DeferredStore
        + kiln::ManufacturerStore
        + kiln::BatchStore
        + kiln::KeyStore
        + kiln::ErrorLog
        + Send
        + Sync
        + 'static
{
}

async fn run<S: Backend>(
    args: Args,
    store: Arc<S>,
    counter: Arc<dyn TokenCounter>,
    ontology: Arc<Ontology>,
    prompts: Arc<PromptCatalog>,
) -> anyhow::Result<()> {
    let loaded = load_keys(&args.keys_file, store.as_ref()).await?;
    tracing::info!(keys = loaded, "key catalog loaded");

    let blobs = Arc::new(FsBlobStore::new(&args.blob_dir));
    let model = GptModel {
        name: args.model.clone(),
        max_context_tokens: GptModel::default_batch_model().max_context_tokens,
    };

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        blobs,
        counter,
        ontology,
        prompts,
        model,
    ));

    let provider = Arc::new(OpenAiBatchApi::new(&args.base_url)?);
    let mut config = StationConfig::new(&args.output_dir);
    config.poll_interval = args.poll_interval;

    let station = Arc::new(BatchStation::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store,
        provider,
        orchestrator,
        config,
    ));

    let shutdown = station.shutdown_token();
    let handle = station.run();
    tracing::info!("station running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, waiting for key workers");
    shutdown.cancel();
    handle.await??;
    Ok(())
}
