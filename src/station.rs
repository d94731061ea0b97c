//! The batch station: one scheduler worker per API key.
//!
//! Each worker ticks through a strict sequence: availability gate, provider
//! sync with quota recount, ingestion of completed or expired batches
//! (responses reconciled, missing requests recycled, touched manufacturers
//! advanced under a bounded fan-out), recycling of failed batches, and,
//! only when the key is idle, packing and uploading exactly one new batch.
//! Workers run in parallel across keys; within a key everything is serial,
//! which is what makes the single-writer-per-key quota accounting sound.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::custom_id::CustomId;
use crate::error::{KilnError, Result};
use crate::model::{ApiKeyBundle, Batch};
use crate::orchestrator::Orchestrator;
use crate::packer::{
    pack_pending_requests, PackedFile, PackerConfig, DEFAULT_MANUFACTURER_TOKEN_CAP,
    DEFAULT_MAX_FILE_SIZE_BYTES, DEFAULT_MAX_REQUESTS_PER_FILE,
};
use crate::provider::{BatchProvider, OutputLine};
use crate::request::{RequestUpdate, ResponseBlob};
use crate::store::{BatchStore, DeferredStore, KeyStore, ManufacturerStore, RequestStore};

const PROVIDER_RETRY_ATTEMPTS: u32 = 2;
const PROVIDER_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// A unique identifier for a station instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StationId(Uuid);

impl StationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn to_short_string(&self) -> String {
        let hex = format!("{:x}", self.0.as_u128());
        format!("station_{}", &hex[..8])
    }
}

impl Default for StationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// Configuration for the station.
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// How long each key worker sleeps between ticks
    pub poll_interval: Duration,
    /// Key quarantine after a batch completes
    pub completion_cooldown: Duration,
    /// Key quarantine after a batch fails
    pub failure_cooldown: Duration,
    /// Bound on concurrent per-manufacturer advances during ingestion
    pub orchestrator_concurrency: usize,
    /// Where pack runs are written
    pub output_dir: PathBuf,
    /// Where downloaded batch outputs are archived
    pub finished_dir: PathBuf,
    pub max_requests_per_file: usize,
    pub max_file_size_bytes: u64,
    pub manufacturer_token_cap: u64,
}

impl StationConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        let finished_dir = output_dir.join("finished_batches");
        Self {
            poll_interval: Duration::from_secs(5 * 60),
            completion_cooldown: Duration::from_secs(10 * 60),
            failure_cooldown: Duration::from_secs(30 * 60),
            orchestrator_concurrency: 100,
            output_dir,
            finished_dir,
            max_requests_per_file: DEFAULT_MAX_REQUESTS_PER_FILE,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            manufacturer_token_cap: DEFAULT_MANUFACTURER_TOKEN_CAP,
        }
    }
}

/// Running totals, logged after every batch resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct StationStats {
    pub batches_created: u64,
    pub batches_uploaded: u64,
    pub batches_downloaded: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub batches_expired: u64,
    pub manufacturers_advanced: u64,
    pub manufacturer_failures: u64,
}

/// Per-batch ingestion counters.
#[derive(Debug, Default)]
struct IngestStats {
    output_lines: u64,
    failed_parses: u64,
    responses_recorded: u64,
    unpaired: u64,
}

/// Events emitted as batches move through the station.
#[derive(Debug, Clone)]
pub enum StationEvent {
    BatchCreated {
        key_label: String,
        batch_id: String,
        requests: usize,
        tokens: u64,
    },
    BatchIngested {
        key_label: String,
        batch_id: String,
        expired: bool,
        manufacturers: usize,
    },
    BatchFailed {
        key_label: String,
        batch_id: String,
    },
}

impl StationEvent {
    pub fn key_label(&self) -> &str {
        match self {
            StationEvent::BatchCreated { key_label, .. }
            | StationEvent::BatchIngested { key_label, .. }
            | StationEvent::BatchFailed { key_label, .. } => key_label,
        }
    }
}

fn is_transient(error: &KilnError) -> bool {
    match error {
        KilnError::Http(_) => true,
        KilnError::Provider { status, .. } => *status >= 500 || *status == 429 || *status == 408,
        _ => false,
    }
}

/// Retry a provider call a couple of times on transient failures before
/// giving up on the key for this tick.
async fn with_provider_retry<T, F, Fut>(op: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) && attempt < PROVIDER_RETRY_ATTEMPTS => {
                attempt += 1;
                tracing::warn!(op, attempt, error = %error, "transient provider error, retrying");
                tokio::time::sleep(PROVIDER_RETRY_BACKOFF * attempt).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// The batch station scheduler.
pub struct BatchStation {
    id: StationId,
    requests: Arc<dyn RequestStore>,
    deferred: Arc<dyn DeferredStore>,
    manufacturers: Arc<dyn ManufacturerStore>,
    batches: Arc<dyn BatchStore>,
    keys: Arc<dyn KeyStore>,
    provider: Arc<dyn BatchProvider>,
    orchestrator: Arc<Orchestrator>,
    config: StationConfig,
    stats: Mutex<StationStats>,
    /// key label -> manufacturers currently being advanced for that key
    advancing: Arc<DashMap<String, usize>>,
    /// Serializes the pack -> pair critical section so two keys cannot
    /// pack the same pending requests into two batches
    pack_lock: tokio::sync::Mutex<()>,
    events_tx: broadcast::Sender<StationEvent>,
    shutdown: CancellationToken,
}

impl BatchStation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        requests: Arc<dyn RequestStore>,
        deferred: Arc<dyn DeferredStore>,
        manufacturers: Arc<dyn ManufacturerStore>,
        batches: Arc<dyn BatchStore>,
        keys: Arc<dyn KeyStore>,
        provider: Arc<dyn BatchProvider>,
        orchestrator: Arc<Orchestrator>,
        config: StationConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            id: StationId::new(),
            requests,
            deferred,
            manufacturers,
            batches,
            keys,
            provider,
            orchestrator,
            config,
            stats: Mutex::new(StationStats::default()),
            advancing: Arc::new(DashMap::new()),
            pack_lock: tokio::sync::Mutex::new(()),
            events_tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the station at the next step boundary.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> StationStats {
        *self.stats.lock()
    }

    /// Subscribe to station events, optionally for one key only.
    pub fn subscribe(
        &self,
        key_label: Option<String>,
    ) -> Pin<Box<dyn Stream<Item = StationEvent> + Send>> {
        let rx = self.events_tx.subscribe();
        match key_label {
            Some(label) => Box::pin(BroadcastStream::new(rx).filter_map(move |event| match event {
                Ok(event) if event.key_label() == label => Some(event),
                _ => None,
            })),
            None => Box::pin(BroadcastStream::new(rx).filter_map(|event| event.ok())),
        }
    }

    fn emit(&self, event: StationEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Spawn one worker per API key and run until shutdown.
    pub fn run(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let key_bundles = self.keys.list().await?;
            tracing::info!(
                station_id = %self.id,
                keys = key_bundles.len(),
                "station starting key workers"
            );

            let mut workers: JoinSet<()> = JoinSet::new();
            for bundle in key_bundles {
                let station = self.clone();
                let label = bundle.label.clone();
                workers.spawn(async move {
                    station.run_key_worker(label).await;
                });
            }

            while let Some(result) = workers.join_next().await {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "key worker panicked");
                }
            }
            tracing::info!(station_id = %self.id, "station stopped");
            Ok(())
        })
    }

    /// Per-key loop: tick, then sleep until the next tick or shutdown.
    #[tracing::instrument(skip(self), fields(station_id = %self.id))]
    async fn run_key_worker(&self, label: String) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Err(error) = self.tick_key(&label).await {
                // Errors are isolated per key; the worker retries next tick.
                tracing::error!(key = %label, error = %error, "key tick failed");
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::info!(key = %label, "key worker exiting");
    }

    /// One tick of one key: gate, sync, process, maybe create.
    async fn tick_key(&self, label: &str) -> Result<()> {
        let now = Utc::now();
        let Some(mut key) = self.keys.find(label).await? else {
            tracing::warn!(key = label, "key bundle disappeared from the store");
            return Ok(());
        };

        // 1. Availability gate.
        if !key.is_available(now) {
            let wait = (key.available_at - now).num_seconds();
            tracing::info!(key = label, seconds_left = wait, "key cooling down, skipping tick");
            return Ok(());
        }

        // 2. Sync provider-side batches and recount quota usage.
        let provider_batches =
            with_provider_retry("list_batches", || self.provider.list_batches(&key.key)).await?;

        let mut open_batches: Vec<Batch> = Vec::new();
        for provider_batch in provider_batches {
            let mut record = match self.batches.find(&provider_batch.id).await? {
                Some(record) => record,
                None => {
                    // A batch we have no record of (e.g. a previous run died
                    // between create and persist). Adopt it; the token total
                    // rides in the metadata we attach at creation.
                    let total_tokens = provider_batch
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get("total_tokens"))
                        .and_then(|t| t.parse().ok())
                        .unwrap_or(0);
                    tracing::warn!(
                        key = label,
                        batch_id = %provider_batch.id,
                        total_tokens,
                        "adopting provider batch with no local record"
                    );
                    provider_batch.clone().into_new_record(label, total_tokens)
                }
            };
            provider_batch.reconcile_into(&mut record);
            self.batches.upsert(&record).await?;
            if !record.is_our_processing_complete() {
                open_batches.push(record);
            }
        }

        // Reset before recounting: the store is the derived view, the
        // provider listing is the truth.
        key.tokens_in_use = 0;
        let mut had_open_batch = false;
        for mut batch in open_batches {
            key.tokens_in_use += batch.total_tokens;
            had_open_batch = true;
            self.process_batch(&mut key, &mut batch, now).await?;
            if self.shutdown.is_cancelled() {
                self.keys.save(&key).await?;
                return Ok(());
            }
        }
        self.keys.save(&key).await?;

        if had_open_batch {
            tracing::info!(
                key = label,
                tokens_in_use = key.tokens_in_use,
                "processed open batches, deferring new work to next tick"
            );
            return Ok(());
        }
        if key.tokens_in_use > 0 {
            tracing::info!(
                key = label,
                tokens_in_use = key.tokens_in_use,
                "key has tokens in flight, not creating a batch"
            );
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        // 4. Pack and upload exactly one new batch.
        self.create_new_batch(&mut key, now).await
    }

    async fn process_batch(
        &self,
        key: &mut ApiKeyBundle,
        batch: &mut Batch,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if batch.status.is_failed() {
            tracing::info!(
                key = %key.label,
                batch_id = %batch.external_batch_id,
                status = %batch.status,
                "batch failed, recycling its requests"
            );
            self.handle_failed(key, batch, now).await
        } else if batch.status.needs_ingestion() {
            tracing::info!(
                key = %key.label,
                batch_id = %batch.external_batch_id,
                status = %batch.status,
                "batch finished, ingesting results"
            );
            self.handle_completed_or_expired(key, batch, now).await
        } else {
            tracing::info!(
                key = %key.label,
                batch_id = %batch.external_batch_id,
                status = %batch.status,
                "batch still in flight"
            );
            Ok(())
        }
    }

    /// Failed / cancelled: everything bound to the batch goes back to the
    /// pending pool and the key gets the long cooldown.
    async fn handle_failed(
        &self,
        key: &mut ApiKeyBundle,
        batch: &mut Batch,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self.requests.unpair_from_batch(&batch.external_batch_id).await {
            Ok(unpaired) => {
                tracing::info!(batch_id = %batch.external_batch_id, unpaired, "requests recycled");
            }
            Err(error) if error.is_write_conflict() => {
                tracing::warn!(batch_id = %batch.external_batch_id, error = %error, "partial unpair");
            }
            Err(error) => return Err(error),
        }

        self.stats.lock().batches_failed += 1;
        self.finish_batch_processing(key, batch, now).await?;
        key.apply_cooldown(now, chrono_duration(self.config.failure_cooldown));
        self.emit(StationEvent::BatchFailed {
            key_label: key.label.clone(),
            batch_id: batch.external_batch_id.clone(),
        });
        self.log_stats();
        Ok(())
    }

    /// Completed / expired: record every response the provider produced,
    /// recycle what it did not, then advance the touched manufacturers.
    async fn handle_completed_or_expired(
        &self,
        key: &mut ApiKeyBundle,
        batch: &mut Batch,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let batch_id = batch.external_batch_id.clone();
        let expired = batch.status == crate::model::BatchStatus::Expired;
        let log_id = format!("{}-{batch_id}", key.label);
        self.stats.lock().batches_downloaded += 1;

        let mut expected = self.requests.custom_ids_for_batch(&batch_id).await?;
        tracing::info!(
            %log_id,
            expected = expected.len(),
            "expecting custom ids in output/error files"
        );

        let mut ingest = IngestStats::default();
        let mut updates: Vec<RequestUpdate> = Vec::new();
        let mut touched_etld1s: HashSet<String> = HashSet::new();

        let mut archive: Vec<(String, String)> = Vec::new();
        for file_id in [batch.output_file_id.clone(), batch.error_file_id.clone()]
            .into_iter()
            .flatten()
        {
            let content = with_provider_retry("download_file", || {
                self.provider.download_file(&key.key, &file_id)
            })
            .await?;
            self.parse_result_lines(
                &content,
                &batch_id,
                now,
                &mut expected,
                &mut updates,
                &mut touched_etld1s,
                &mut ingest,
            );
            archive.push((file_id, content));
        }

        // Whatever the provider never answered goes back to the pool.
        if !expected.is_empty() {
            tracing::warn!(
                %log_id,
                missing = expected.len(),
                "expected custom ids absent from output, unpairing"
            );
            ingest.unpaired += expected.len() as u64;
            updates.extend(expected.drain().map(|custom_id| RequestUpdate::Unpair { custom_id }));
        }

        if !updates.is_empty() {
            match self.requests.bulk_update(updates, &log_id).await {
                Ok(_) => {}
                Err(error) if error.is_write_conflict() => {
                    tracing::warn!(%log_id, error = %error, "ingestion applied with write conflicts");
                }
                Err(error) => return Err(error),
            }
        }
        tracing::info!(%log_id, ?ingest, "batch results reconciled");

        // Bounded orchestrator fan-out over the touched manufacturers.
        let advanced = self.advance_manufacturers(&key.label, now, touched_etld1s).await;

        self.finish_batch_processing(key, batch, now).await?;

        // Provider hygiene: drop the input file, archive the outputs.
        if let Err(error) = self.provider.delete_file(&key.key, &batch.input_file_id).await {
            tracing::warn!(%log_id, error = %error, "failed to delete input file provider-side");
        }
        if let Err(error) = self.archive_outputs(&batch_id, &archive).await {
            tracing::warn!(%log_id, error = %error, "failed to archive batch output");
        }

        {
            let mut stats = self.stats.lock();
            if expired {
                stats.batches_expired += 1;
            } else {
                stats.batches_succeeded += 1;
            }
        }
        key.apply_cooldown(now, chrono_duration(self.config.completion_cooldown));
        self.emit(StationEvent::BatchIngested {
            key_label: key.label.clone(),
            batch_id,
            expired,
            manufacturers: advanced,
        });
        self.log_stats();
        Ok(())
    }

    /// Turn one downloaded JSONL body into request updates. Lines carrying
    /// a completion become responses; error lines and unparseable lines
    /// leave their ids in `expected`, which the caller unpairs.
    #[allow(clippy::too_many_arguments)]
    fn parse_result_lines(
        &self,
        content: &str,
        batch_id: &str,
        now: DateTime<Utc>,
        expected: &mut HashSet<CustomId>,
        updates: &mut Vec<RequestUpdate>,
        touched_etld1s: &mut HashSet<String>,
        ingest: &mut IngestStats,
    ) {
        for (line_number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            ingest.output_lines += 1;
            let parsed: OutputLine = match serde_json::from_str(line) {
                Ok(parsed) => parsed,
                Err(error) => {
                    ingest.failed_parses += 1;
                    tracing::error!(batch_id, line_number, error = %error, "unparseable result line");
                    continue;
                }
            };
            let custom_id = CustomId::from(parsed.custom_id.clone());

            let Some(content) = parsed.completion_text() else {
                // Error line (or a response with no completion): leave the
                // id in `expected` so it gets unpaired and repacked.
                continue;
            };

            expected.remove(&custom_id);
            touched_etld1s.insert(custom_id.etld1().to_string());
            ingest.responses_recorded += 1;
            updates.push(RequestUpdate::SetResponse {
                custom_id: custom_id.clone(),
                batch_id: batch_id.to_string(),
                response: ResponseBlob {
                    batch_id: batch_id.to_string(),
                    status_code: parsed.response.as_ref().and_then(|r| r.status_code),
                    content,
                    received_at: now,
                },
            });
        }
    }

    /// Advance each touched manufacturer once, at most
    /// `orchestrator_concurrency` at a time. Failures are isolated per
    /// manufacturer.
    async fn advance_manufacturers(
        &self,
        key_label: &str,
        now: DateTime<Utc>,
        etld1s: HashSet<String>,
    ) -> usize {
        if etld1s.is_empty() {
            return 0;
        }
        let total = etld1s.len();
        tracing::info!(key = key_label, manufacturers = total, "advancing manufacturers");

        let semaphore = Arc::new(Semaphore::new(self.config.orchestrator_concurrency));
        let mut tasks: JoinSet<std::result::Result<(), String>> = JoinSet::new();

        for etld1 in etld1s {
            let semaphore = semaphore.clone();
            let orchestrator = self.orchestrator.clone();
            let advancing = self.advancing.clone();
            let key_label = key_label.to_string();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                *advancing.entry(key_label.clone()).or_insert(0) += 1;
                let _gauge = scopeguard::guard((advancing, key_label), |(advancing, key_label)| {
                    if let Some(mut count) = advancing.get_mut(&key_label) {
                        *count = count.saturating_sub(1);
                    }
                });

                orchestrator
                    .advance(now, &etld1)
                    .await
                    .map(|_| ())
                    .map_err(|e| format!("{etld1}: {e}"))
            });
        }

        let mut advanced = 0usize;
        let mut failures = 0usize;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => advanced += 1,
                Ok(Err(error)) => {
                    failures += 1;
                    tracing::warn!(key = key_label, error = %error, "manufacturer advance failed");
                }
                Err(join_error) => {
                    failures += 1;
                    tracing::error!(key = key_label, error = %join_error, "advance task panicked");
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.manufacturers_advanced += advanced as u64;
        stats.manufacturer_failures += failures as u64;
        tracing::info!(key = key_label, advanced, failures, "manufacturer wave complete");
        advanced
    }

    /// Common tail of batch resolution: mark reconciled, release quota.
    async fn finish_batch_processing(
        &self,
        key: &mut ApiKeyBundle,
        batch: &mut Batch,
        now: DateTime<Utc>,
    ) -> Result<()> {
        batch.processing_completed_at = Some(now);
        self.batches.upsert(batch).await?;
        key.remove_tokens_in_use(batch.total_tokens);
        self.keys.save(key).await?;
        Ok(())
    }

    async fn archive_outputs(&self, batch_id: &str, files: &[(String, String)]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.config.finished_dir).await?;
        for (file_id, content) in files {
            let path = self
                .config
                .finished_dir
                .join(format!("{batch_id}_{file_id}.jsonl"));
            tokio::fs::write(path, content).await?;
        }
        Ok(())
    }

    /// Pack one file for this key and push it through upload, create,
    /// persist, pair.
    async fn create_new_batch(&self, key: &mut ApiKeyBundle, now: DateTime<Utc>) -> Result<()> {
        let _packing = self.pack_lock.lock().await;
        let packer_config = PackerConfig {
            output_dir: self.config.output_dir.clone(),
            prefix: format!("{}_batch", key.label),
            max_requests_per_file: self.config.max_requests_per_file,
            max_tokens_per_file: key.batch_queue_limit,
            max_file_size_bytes: self.config.max_file_size_bytes,
            max_files: Some(1),
            manufacturer_token_cap: self.config.manufacturer_token_cap,
        };
        let run = pack_pending_requests(
            self.manufacturers.as_ref(),
            self.deferred.as_ref(),
            self.requests.as_ref(),
            &packer_config,
            now,
        )
        .await?;

        let Some(file) = run.files.first() else {
            tracing::info!(key = %key.label, "no pending work to pack");
            return Ok(());
        };
        self.stats.lock().batches_created += 1;

        let result = self.upload_and_pair(key, file, now).await;
        // The local file is spent either way; a failed upload repacks fresh
        // next tick.
        if let Err(error) = tokio::fs::remove_file(&file.path).await {
            tracing::warn!(path = %file.path.display(), error = %error, "failed to delete packed file");
        }
        result
    }

    async fn upload_and_pair(
        &self,
        key: &mut ApiKeyBundle,
        file: &PackedFile,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let file_name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "batch.jsonl".to_string());
        let content = tokio::fs::read(&file.path).await?;

        let input_file_id = match with_provider_retry("upload_batch_file", || {
            self.provider.upload_batch_file(&key.key, &file_name, content.clone())
        })
        .await
        {
            Ok(id) => id,
            Err(KilnError::Provider { status, message }) if status == 413 || status == 429 => {
                // Quota-style rejection: cool the key down and let the
                // packer produce a fresh (possibly smaller) file next tick.
                tracing::warn!(key = %key.label, status, message = %message, "upload rejected, cooling down");
                key.apply_cooldown(now, chrono_duration(self.config.completion_cooldown));
                self.keys.save(key).await?;
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let metadata = HashMap::from([
            ("total_tokens".to_string(), file.tokens.to_string()),
            ("station_id".to_string(), self.id.to_short_string()),
        ]);
        let provider_batch = match self
            .provider
            .create_batch(&key.key, &input_file_id, metadata)
            .await
        {
            Ok(batch) => batch,
            Err(error) => {
                // Leave nothing dangling provider-side.
                let _ = self.provider.delete_file(&key.key, &input_file_id).await;
                return Err(error);
            }
        };
        let batch_id = provider_batch.id.clone();

        let record = provider_batch.into_new_record(&key.label, file.tokens);
        self.batches.upsert(&record).await?;

        // If pairing is lost these requests get re-packed into a later
        // batch and duplicated provider-side, so try twice.
        let mut paired = 0u64;
        for attempt in 0..2 {
            match self.requests.pair_with_batch(&file.custom_ids, &batch_id).await {
                Ok(count) => {
                    paired = count;
                    break;
                }
                Err(error) if error.is_write_conflict() => {
                    tracing::warn!(%batch_id, error = %error, "pairing hit write conflicts");
                    break;
                }
                Err(error) if attempt == 0 => {
                    tracing::error!(%batch_id, error = %error, "pairing failed, retrying once");
                }
                Err(error) => return Err(error),
            }
        }

        key.add_tokens_in_use(file.tokens);
        self.keys.save(key).await?;

        {
            let mut stats = self.stats.lock();
            stats.batches_uploaded += 1;
        }
        tracing::info!(
            key = %key.label,
            %batch_id,
            requests = file.requests,
            tokens = file.tokens,
            paired,
            "batch created and paired"
        );
        self.emit(StationEvent::BatchCreated {
            key_label: key.label.clone(),
            batch_id,
            requests: file.requests,
            tokens: file.tokens,
        });
        Ok(())
    }

    fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(?stats, "station stats");
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::chunk::{HeuristicTokenCounter, TokenCounter};
    use crate::custom_id::FieldFamily;
    use crate::model::{BatchStatus, GptModel, Manufacturer};
    use crate::ontology::{Concept, Ontology};
    use crate::prompt::PromptCatalog;
    use crate::provider::MockProvider;
    use crate::store::memory::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        blobs: Arc<MemoryBlobStore>,
        provider: Arc<MockProvider>,
        station: Arc<BatchStation>,
        _output: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let provider = Arc::new(MockProvider::new());
        let counter: Arc<dyn TokenCounter> = Arc::new(HeuristicTokenCounter);
        let ontology = Arc::new(Ontology::new(
            "onto-1",
            vec![Concept {
                name: "ISO 9001".to_string(),
                alt_labels: vec![],
            }],
            vec![],
            vec![],
            vec![],
        ));
        let prompts = PromptCatalog::builtin(&HeuristicTokenCounter);
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            blobs.clone(),
            counter,
            ontology,
            prompts,
            GptModel::default_batch_model(),
        ));

        let output = tempfile::tempdir().unwrap();
        let mut config = StationConfig::new(output.path());
        config.poll_interval = Duration::from_millis(10);
        let station = Arc::new(BatchStation::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            provider.clone(),
            orchestrator,
            config,
        ));

        Fixture {
            store,
            blobs,
            provider,
            station,
            _output: output,
        }
    }

    async fn seed_key(fixture: &Fixture, label: &str, limit: u64) {
        fixture
            .store
            .save(&ApiKeyBundle::new(label, format!("sk-{label}"), limit))
            .await
            .unwrap();
    }

    /// Seed a manufacturer and let the orchestrator emit its requests, so
    /// the pending pool looks exactly like a real first tick.
    async fn seed_pending_manufacturer(fixture: &Fixture, etld1: &str) {
        let text = "Acme Corp makes precision widgets.\nCertified to ISO 9001 standards.\n";
        fixture.blobs.insert(etld1, "v1", text);
        let mut mfg = Manufacturer::new(etld1, Some("v1".to_string()), Utc::now());
        mfg.text_num_tokens = Some(HeuristicTokenCounter.count(text) as u64);
        ManufacturerStore::upsert(fixture.store.as_ref(), &mfg)
            .await
            .unwrap();
        fixture
            .station
            .orchestrator
            .advance(Utc::now(), etld1)
            .await
            .unwrap();
    }

    async fn key(fixture: &Fixture, label: &str) -> ApiKeyBundle {
        KeyStore::find(fixture.store.as_ref(), label)
            .await
            .unwrap()
            .unwrap()
    }

    /// Build an output file answering every request in the uploaded input,
    /// except the ids in `omit`, with a shape each field's parser accepts.
    fn output_for_input(input: &str, omit: &HashSet<String>) -> String {
        let mut lines = Vec::new();
        for line in input.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            let custom_id = value["custom_id"].as_str().unwrap().to_string();
            if omit.contains(&custom_id) {
                continue;
            }
            let custom_id_parsed = CustomId::from(custom_id.as_str());
            let decoded = custom_id_parsed.decode().unwrap();
            let content = match decoded.field.family() {
                FieldFamily::Binary => r#"{"answer": true, "confidence": 0.9, "reason": "ok"}"#,
                FieldFamily::Basic => {
                    if decoded.field == crate::custom_id::FieldName::Addresses {
                        r#"[{"street": "1 Main St", "city": "Springfield", "country": "US"}]"#
                    } else {
                        r#"{"name": "Acme", "description": "widgets"}"#
                    }
                }
                FieldFamily::Keyword | FieldFamily::Concept => r#"["ISO 9001"]"#,
            };
            lines.push(
                serde_json::json!({
                    "custom_id": custom_id,
                    "response": {
                        "status_code": 200,
                        "body": {"choices": [{"message": {"content": content}}]}
                    }
                })
                .to_string(),
            );
        }
        lines.join("\n") + "\n"
    }

    #[tokio::test]
    async fn cooling_key_skips_the_tick_entirely() {
        let fixture = fixture();
        seed_key(&fixture, "k1", 1_000_000).await;
        seed_pending_manufacturer(&fixture, "acme.example").await;

        let mut bundle = key(&fixture, "k1").await;
        bundle.apply_cooldown(Utc::now(), chrono::Duration::minutes(5));
        fixture.store.save(&bundle).await.unwrap();

        fixture.station.tick_key("k1").await.unwrap();

        assert!(fixture.provider.batches().is_empty());
        assert_eq!(fixture.station.stats().batches_created, 0);
    }

    #[tokio::test]
    async fn idle_key_packs_uploads_and_pairs_one_batch() {
        let fixture = fixture();
        seed_key(&fixture, "k1", 1_000_000).await;
        seed_pending_manufacturer(&fixture, "acme.example").await;
        let pending_before = fixture.store.request_count();
        assert!(pending_before > 0);

        fixture.station.tick_key("k1").await.unwrap();

        // One provider batch over one uploaded file.
        let batches = fixture.provider.batches();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.status, BatchStatus::Validating);
        let input = fixture.provider.file_content(&batch.input_file_id).unwrap();
        assert_eq!(input.lines().count(), pending_before);

        // Every row is now in flight, bound to the new batch.
        let bound = fixture
            .store
            .custom_ids_for_batch(&batch.id)
            .await
            .unwrap();
        assert_eq!(bound.len(), pending_before);

        // Our record carries the owning key and the token total.
        let record = BatchStore::find(fixture.store.as_ref(), &batch.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.api_key_label, "k1");
        assert!(record.total_tokens > 0);

        let bundle = key(&fixture, "k1").await;
        assert_eq!(bundle.tokens_in_use, record.total_tokens);
        assert_eq!(fixture.station.stats().batches_uploaded, 1);

        // The packed file was deleted locally.
        let leftover_jsonl = walk_files(fixture._output.path())
            .into_iter()
            .filter(|p| p.extension().is_some_and(|e| e == "jsonl"))
            .count();
        assert_eq!(leftover_jsonl, 0);
    }

    fn walk_files(dir: &std::path::Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        files
    }

    #[tokio::test]
    async fn in_flight_batch_blocks_new_batch_creation() {
        let fixture = fixture();
        seed_key(&fixture, "k1", 1_000_000).await;
        seed_pending_manufacturer(&fixture, "acme.example").await;

        fixture.station.tick_key("k1").await.unwrap();
        let tokens_after_create = key(&fixture, "k1").await.tokens_in_use;

        // The batch is still validating provider-side; another tick must
        // not create more work, and the recount must match the invariant.
        fixture.station.tick_key("k1").await.unwrap();
        assert_eq!(fixture.provider.batches().len(), 1);

        let bundle = key(&fixture, "k1").await;
        assert_eq!(bundle.tokens_in_use, tokens_after_create);
        let open_total: u64 = fixture
            .store
            .list_for_key("k1")
            .await
            .unwrap()
            .iter()
            .filter(|b| !b.is_our_processing_complete())
            .map(|b| b.total_tokens)
            .sum();
        assert_eq!(bundle.tokens_in_use, open_total);
    }

    #[tokio::test]
    async fn completed_batch_is_ingested_and_manufacturers_advanced() {
        let fixture = fixture();
        seed_key(&fixture, "k1", 1_000_000).await;
        seed_pending_manufacturer(&fixture, "acme.example").await;
        fixture.station.tick_key("k1").await.unwrap();

        let batch = fixture.provider.batches().remove(0);
        let input = fixture.provider.file_content(&batch.input_file_id).unwrap();

        // Answer everything except one products request, which must be
        // recycled into the pending pool.
        let omitted: String = input
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
            .find_map(|v| {
                let id = v["custom_id"].as_str().unwrap().to_string();
                id.contains(">products>").then_some(id)
            })
            .expect("a products request was packed");
        let omit = HashSet::from([omitted.clone()]);
        fixture
            .provider
            .put_file("file-out", &output_for_input(&input, &omit));
        fixture
            .provider
            .set_batch_status(&batch.id, BatchStatus::Completed, Some("file-out"), None);

        let before = Utc::now();
        fixture.station.tick_key("k1").await.unwrap();

        // Answered rows are resolved; the omitted one is pending again.
        let total_lines = input.lines().count();
        let answered = fixture
            .store
            .custom_ids_for_batch(&batch.id)
            .await
            .unwrap();
        assert_eq!(answered.len(), total_lines - 1);
        let omitted_row = fixture.store.request(&CustomId::from(omitted.as_str())).unwrap();
        assert!(omitted_row.is_pending());

        // Quota freed, cooldown applied, record closed out.
        let bundle = key(&fixture, "k1").await;
        assert_eq!(bundle.tokens_in_use, 0);
        assert!(bundle.available_at >= before + chrono::Duration::minutes(9));
        let record = BatchStore::find(fixture.store.as_ref(), &batch.id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_our_processing_complete());

        // The touched manufacturer was advanced exactly once; its binary
        // fields materialized from the ingested responses.
        let stats = fixture.station.stats();
        assert_eq!(stats.manufacturers_advanced, 1);
        assert_eq!(stats.batches_succeeded, 1);
        let mfg = fixture
            .store
            .find_by_etld1("acme.example")
            .await
            .unwrap()
            .unwrap();
        assert!(mfg.is_manufacturer.unwrap().answer);
        assert!(mfg.business_desc.is_some());

        // Provider hygiene: input gone, output archived.
        assert!(!fixture.provider.file_exists(&batch.input_file_id));
        let archived = walk_files(&fixture.station.config.finished_dir);
        assert_eq!(archived.len(), 1);
    }

    #[tokio::test]
    async fn failed_batch_recycles_requests_without_advancing_anyone() {
        let fixture = fixture();
        seed_key(&fixture, "k2", 1_000_000).await;
        seed_pending_manufacturer(&fixture, "acme.example").await;
        fixture.station.tick_key("k2").await.unwrap();

        let batch = fixture.provider.batches().remove(0);
        let bound_before = fixture
            .store
            .custom_ids_for_batch(&batch.id)
            .await
            .unwrap();
        assert!(!bound_before.is_empty());
        fixture
            .provider
            .set_batch_status(&batch.id, BatchStatus::Failed, None, None);

        let before = Utc::now();
        fixture.station.tick_key("k2").await.unwrap();

        // Everything back in the pending pool, nothing resolved.
        assert!(fixture
            .store
            .custom_ids_for_batch(&batch.id)
            .await
            .unwrap()
            .is_empty());
        for id in &bound_before {
            assert!(fixture.store.request(id).unwrap().is_pending());
        }

        let bundle = key(&fixture, "k2").await;
        assert_eq!(bundle.tokens_in_use, 0);
        assert!(bundle.available_at >= before + chrono::Duration::minutes(29));

        let record = BatchStore::find(fixture.store.as_ref(), &batch.id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_our_processing_complete());

        let stats = fixture.station.stats();
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.manufacturers_advanced, 0);
    }

    #[tokio::test]
    async fn station_events_track_the_batch_lifecycle() {
        let fixture = fixture();
        seed_key(&fixture, "k1", 1_000_000).await;
        seed_pending_manufacturer(&fixture, "acme.example").await;

        let mut events = fixture.station.subscribe(Some("k1".to_string()));

        fixture.station.tick_key("k1").await.unwrap();
        let batch = fixture.provider.batches().remove(0);
        let input = fixture.provider.file_content(&batch.input_file_id).unwrap();
        fixture
            .provider
            .put_file("file-out", &output_for_input(&input, &HashSet::new()));
        fixture
            .provider
            .set_batch_status(&batch.id, BatchStatus::Completed, Some("file-out"), None);
        fixture.station.tick_key("k1").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, StationEvent::BatchCreated { ref batch_id, .. } if *batch_id == batch.id));

        let second = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            second,
            StationEvent::BatchIngested {
                expired: false,
                manufacturers: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn graceful_shutdown_stops_the_worker_loop() {
        let fixture = fixture();
        seed_key(&fixture, "k1", 1_000_000).await;

        let token = fixture.station.shutdown_token();
        let handle = fixture.station.clone().run();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("station should stop after cancellation")
            .unwrap()
            .unwrap();
    }
}
