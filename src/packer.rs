//! Packing pending requests into batch upload files.
//!
//! The packer walks deferred manufacturers smallest-text-first, harvests
//! their pending request rows, and writes them into JSONL files under three
//! simultaneous caps: request count, input tokens, and exact encoded bytes.
//! A manufacturer's requests are never split across files: if the next
//! manufacturer does not fit, the current file is closed and a new one
//! started. Inconsistencies (referenced requests missing from the store,
//! fields null on both sides) are reported to sidecar files and the
//! manufacturer is skipped, never silently healed.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::custom_id::{CustomId, FieldName};
use crate::error::Result;
use crate::model::{DeferredManufacturer, Manufacturer};
use crate::store::{DeferredStore, ManufacturerStore, RequestStore};

/// Provider-imposed hard ceiling is 200 MB; stay under it.
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 190 * 1024 * 1024;
pub const DEFAULT_MAX_REQUESTS_PER_FILE: usize = 50_000;
/// Manufacturers with more text than this never enter a pack run.
pub const DEFAULT_MANUFACTURER_TOKEN_CAP: u64 = 200_000;

/// Limits and placement for one pack run.
#[derive(Debug, Clone)]
pub struct PackerConfig {
    pub output_dir: PathBuf,
    pub prefix: String,
    pub max_requests_per_file: usize,
    pub max_tokens_per_file: u64,
    pub max_file_size_bytes: u64,
    /// Stop after creating this many files (the station packs one per tick)
    pub max_files: Option<usize>,
    pub manufacturer_token_cap: u64,
}

impl PackerConfig {
    pub fn new(output_dir: impl Into<PathBuf>, max_tokens_per_file: u64) -> Self {
        Self {
            output_dir: output_dir.into(),
            prefix: "batch".to_string(),
            max_requests_per_file: DEFAULT_MAX_REQUESTS_PER_FILE,
            max_tokens_per_file,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            max_files: None,
            manufacturer_token_cap: DEFAULT_MANUFACTURER_TOKEN_CAP,
        }
    }
}

/// One serialized request ready to be written.
struct PackedLine {
    custom_id: CustomId,
    tokens: u64,
    /// Compact JSON, no trailing newline
    line: String,
}

/// A finished batch file.
#[derive(Debug, Clone)]
pub struct PackedFile {
    pub path: PathBuf,
    pub custom_ids: HashSet<CustomId>,
    pub manufacturers: usize,
    pub requests: usize,
    pub tokens: u64,
    pub bytes: u64,
}

/// Outcome of a pack run.
#[derive(Debug, Clone)]
pub struct PackRun {
    /// Timestamped run directory; `None` when nothing was written
    pub run_dir: Option<PathBuf>,
    pub files: Vec<PackedFile>,
    pub manufacturers_scanned: usize,
    pub manufacturers_packed: usize,
    pub manufacturers_missing_requests: usize,
    pub manufacturers_with_validation_errors: usize,
    pub manufacturers_skipped_no_deferred: usize,
    pub manufacturers_too_large: usize,
}

impl PackRun {
    pub fn total_requests(&self) -> usize {
        self.files.iter().map(|f| f.requests).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.files.iter().map(|f| f.tokens).sum()
    }
}

#[derive(Serialize)]
struct FileMetadata {
    manufacturers: usize,
    requests: usize,
    tokens: u64,
}

#[derive(Serialize)]
struct MissingRecord<'a> {
    etld1: &'a str,
    missing_custom_ids: Vec<&'a str>,
}

#[derive(Serialize)]
struct ValidationRecord<'a> {
    etld1: &'a str,
    missing_fields: Vec<&'a str>,
}

enum WriteOutcome {
    Written,
    /// The manufacturer alone exceeds a per-file cap; skipped
    TooLarge,
    /// `max_files` reached; the run is over
    FilesExhausted,
}

/// Writes batch files under the caps, keeping each manufacturer whole.
/// Files, sidecars, and the run directory itself are created lazily so an
/// empty run leaves nothing behind.
struct BatchFileWriter {
    config: PackerConfig,
    run_timestamp: String,
    run_dir: PathBuf,
    run_dir_created: bool,

    file_index: usize,
    current: Option<BufWriter<File>>,
    current_path: Option<PathBuf>,
    current_ids: HashSet<CustomId>,
    current_requests: usize,
    current_tokens: u64,
    current_bytes: u64,
    current_manufacturers: usize,

    files: Vec<PackedFile>,
    missing_sidecar: Option<BufWriter<File>>,
    validation_sidecar: Option<BufWriter<File>>,
    skipped_sidecar: Option<BufWriter<File>>,
}

impl BatchFileWriter {
    fn new(config: PackerConfig, run_timestamp: String) -> Self {
        let run_dir = config.output_dir.join(&run_timestamp);
        Self {
            config,
            run_timestamp,
            run_dir,
            run_dir_created: false,
            file_index: 0,
            current: None,
            current_path: None,
            current_ids: HashSet::new(),
            current_requests: 0,
            current_tokens: 0,
            current_bytes: 0,
            current_manufacturers: 0,
            files: Vec::new(),
            missing_sidecar: None,
            validation_sidecar: None,
            skipped_sidecar: None,
        }
    }

    fn ensure_run_dir(&mut self) -> Result<&Path> {
        if !self.run_dir_created {
            fs::create_dir_all(&self.run_dir)?;
            self.run_dir_created = true;
        }
        Ok(&self.run_dir)
    }

    fn fits(&self, requests: usize, tokens: u64, bytes: u64) -> bool {
        self.current_requests + requests <= self.config.max_requests_per_file
            && self.current_tokens + tokens <= self.config.max_tokens_per_file
            && self.current_bytes + bytes <= self.config.max_file_size_bytes
    }

    fn open_next_file(&mut self) -> Result<bool> {
        if let Some(max) = self.config.max_files {
            if self.file_index >= max {
                return Ok(false);
            }
        }
        self.ensure_run_dir()?;
        self.file_index += 1;
        let name = format!(
            "{}_{}_{}.jsonl",
            self.run_timestamp, self.config.prefix, self.file_index
        );
        let path = self.run_dir.join(name);
        tracing::info!(path = %path.display(), "started new batch file");
        self.current = Some(BufWriter::new(File::create(&path)?));
        self.current_path = Some(path);
        Ok(true)
    }

    fn close_current_file(&mut self) -> Result<()> {
        let Some(mut writer) = self.current.take() else {
            return Ok(());
        };
        writer.flush()?;
        let path = self.current_path.take().expect("open file has a path");
        tracing::info!(
            path = %path.display(),
            requests = self.current_requests,
            tokens = self.current_tokens,
            manufacturers = self.current_manufacturers,
            bytes = self.current_bytes,
            "closed batch file"
        );
        self.files.push(PackedFile {
            path,
            custom_ids: std::mem::take(&mut self.current_ids),
            manufacturers: self.current_manufacturers,
            requests: self.current_requests,
            tokens: self.current_tokens,
            bytes: self.current_bytes,
        });
        self.current_requests = 0;
        self.current_tokens = 0;
        self.current_bytes = 0;
        self.current_manufacturers = 0;
        Ok(())
    }

    /// Write one manufacturer's full request set, rolling to a new file if
    /// it does not fit alongside the current contents.
    fn write_manufacturer(&mut self, etld1: &str, lines: &[PackedLine]) -> Result<WriteOutcome> {
        if lines.is_empty() {
            return Ok(WriteOutcome::Written);
        }

        let requests = lines.len();
        let tokens: u64 = lines.iter().map(|l| l.tokens).sum();
        let bytes: u64 = lines.iter().map(|l| l.line.len() as u64 + 1).sum();

        // A manufacturer that cannot fit even in an empty file is reported
        // and skipped, never truncated.
        if requests > self.config.max_requests_per_file
            || tokens > self.config.max_tokens_per_file
            || bytes > self.config.max_file_size_bytes
        {
            tracing::warn!(
                etld1,
                requests,
                tokens,
                bytes,
                "manufacturer exceeds per-file limits on its own, skipping"
            );
            return Ok(WriteOutcome::TooLarge);
        }

        if self.current.is_some() && !self.fits(requests, tokens, bytes) {
            self.close_current_file()?;
        }
        if self.current.is_none() && !self.open_next_file()? {
            return Ok(WriteOutcome::FilesExhausted);
        }

        let writer = self.current.as_mut().expect("file open");
        for line in lines {
            writer.write_all(line.line.as_bytes())?;
            writer.write_all(b"\n")?;
            self.current_ids.insert(line.custom_id.clone());
        }
        self.current_requests += requests;
        self.current_tokens += tokens;
        self.current_bytes += bytes;
        self.current_manufacturers += 1;
        Ok(WriteOutcome::Written)
    }

    fn sidecar(&mut self, which: Sidecar) -> Result<&mut BufWriter<File>> {
        let run_timestamp = self.run_timestamp.clone();
        self.ensure_run_dir()?;
        let (slot, name) = match which {
            Sidecar::Missing => (
                &mut self.missing_sidecar,
                format!("{run_timestamp}_missing_batch_requests.ndjson"),
            ),
            Sidecar::Validation => (
                &mut self.validation_sidecar,
                format!("{run_timestamp}_validation_errors.ndjson"),
            ),
            Sidecar::Skipped => (
                &mut self.skipped_sidecar,
                format!("{run_timestamp}_skipped_manufacturers.csv"),
            ),
        };
        if slot.is_none() {
            let mut writer = BufWriter::new(File::create(self.run_dir.join(name))?);
            if matches!(which, Sidecar::Skipped) {
                writeln!(writer, "etld1")?;
            }
            *slot = Some(writer);
        }
        Ok(slot.as_mut().expect("sidecar open"))
    }

    fn record_missing(&mut self, etld1: &str, missing: &[CustomId]) -> Result<()> {
        let record = MissingRecord {
            etld1,
            missing_custom_ids: missing.iter().map(|id| id.as_str()).collect(),
        };
        let line = serde_json::to_string(&record)?;
        writeln!(self.sidecar(Sidecar::Missing)?, "{line}")?;
        Ok(())
    }

    fn record_validation_errors(&mut self, etld1: &str, fields: &[FieldName]) -> Result<()> {
        let record = ValidationRecord {
            etld1,
            missing_fields: fields.iter().map(|f| f.as_str()).collect(),
        };
        let line = serde_json::to_string(&record)?;
        writeln!(self.sidecar(Sidecar::Validation)?, "{line}")?;
        Ok(())
    }

    fn record_skipped(&mut self, etld1: &str) -> Result<()> {
        writeln!(self.sidecar(Sidecar::Skipped)?, "{etld1}")?;
        Ok(())
    }

    fn finish(mut self) -> Result<(Option<PathBuf>, Vec<PackedFile>)> {
        self.close_current_file()?;

        for sidecar in [
            self.missing_sidecar.as_mut(),
            self.validation_sidecar.as_mut(),
            self.skipped_sidecar.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            sidecar.flush()?;
        }

        if !self.run_dir_created {
            return Ok((None, self.files));
        }

        if !self.files.is_empty() {
            let metadata: std::collections::BTreeMap<String, FileMetadata> = self
                .files
                .iter()
                .map(|f| {
                    (
                        f.path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        FileMetadata {
                            manufacturers: f.manufacturers,
                            requests: f.requests,
                            tokens: f.tokens,
                        },
                    )
                })
                .collect();
            let metadata_path = self.run_dir.join("batch_metadata.json");
            fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;
            tracing::info!(path = %metadata_path.display(), "wrote batch metadata");
        }

        Ok((Some(self.run_dir), self.files))
    }
}

enum Sidecar {
    Missing,
    Validation,
    Skipped,
}

/// Walk every field of a deferred manufacturer and classify it: collect the
/// referenced request ids, and flag fields that are null on the
/// manufacturer while also absent from the deferred document.
fn harvest_referenced_ids(
    manufacturer: &Manufacturer,
    deferred: &DeferredManufacturer,
) -> (Vec<CustomId>, Vec<FieldName>) {
    let mut referenced = Vec::new();
    let mut validation_errors = Vec::new();

    for field in FieldName::ORDERED {
        match deferred.fields.get(&field) {
            Some(sub_document) => referenced.extend(sub_document.referenced_custom_ids()),
            None => {
                if !manufacturer.field_is_resolved(field) {
                    validation_errors.push(field);
                }
            }
        }
    }

    (referenced, validation_errors)
}

/// Run the packer: harvest pending requests of deferred manufacturers in
/// ascending text size and write them into batch files under the caps.
#[tracing::instrument(skip_all, fields(output_dir = %config.output_dir.display()))]
pub async fn pack_pending_requests(
    manufacturers: &dyn ManufacturerStore,
    deferred: &dyn DeferredStore,
    requests: &dyn RequestStore,
    config: &PackerConfig,
    now: DateTime<Utc>,
) -> Result<PackRun> {
    let run_timestamp = now.format("%Y%m%d_%H%M%S").to_string();
    let mut writer = BatchFileWriter::new(config.clone(), run_timestamp);

    let candidates = manufacturers
        .list_for_packing(config.manufacturer_token_cap)
        .await?;
    tracing::info!(candidates = candidates.len(), "starting pack run");

    let mut run = PackRun {
        run_dir: None,
        files: Vec::new(),
        manufacturers_scanned: 0,
        manufacturers_packed: 0,
        manufacturers_missing_requests: 0,
        manufacturers_with_validation_errors: 0,
        manufacturers_skipped_no_deferred: 0,
        manufacturers_too_large: 0,
    };

    'manufacturers: for manufacturer in candidates {
        run.manufacturers_scanned += 1;

        let Some(version_id) = manufacturer.text_version_id.as_deref() else {
            run.manufacturers_skipped_no_deferred += 1;
            writer.record_skipped(&manufacturer.etld1)?;
            continue;
        };
        let Some(deferred_doc) = deferred.find(&manufacturer.etld1, version_id).await? else {
            run.manufacturers_skipped_no_deferred += 1;
            writer.record_skipped(&manufacturer.etld1)?;
            continue;
        };

        let (referenced, validation_errors) = harvest_referenced_ids(&manufacturer, &deferred_doc);

        if !validation_errors.is_empty() {
            run.manufacturers_with_validation_errors += 1;
            writer.record_validation_errors(&manufacturer.etld1, &validation_errors)?;
            tracing::warn!(
                etld1 = %manufacturer.etld1,
                fields = ?validation_errors,
                "fields null on both manufacturer and deferred document"
            );
            continue;
        }
        if referenced.is_empty() {
            continue;
        }

        let found = requests.find_by_custom_ids(&referenced).await?;
        let mut missing: Vec<CustomId> = referenced
            .iter()
            .filter(|id| !found.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            missing.sort();
            run.manufacturers_missing_requests += 1;
            writer.record_missing(&manufacturer.etld1, &missing)?;
            tracing::warn!(
                etld1 = %manufacturer.etld1,
                missing = missing.len(),
                "referenced requests absent from the request store, skipping manufacturer"
            );
            continue;
        }

        // Only rows that are neither bound to a batch nor answered.
        let mut lines = Vec::new();
        let mut sorted_ids: Vec<&CustomId> = found.keys().collect();
        sorted_ids.sort();
        for id in sorted_ids {
            let row = &found[id];
            if row.is_pending() {
                lines.push(PackedLine {
                    custom_id: id.clone(),
                    tokens: row.request.body.input_tokens,
                    line: row.request.to_jsonl_line()?,
                });
            }
        }
        if lines.is_empty() {
            continue;
        }

        match writer.write_manufacturer(&manufacturer.etld1, &lines)? {
            WriteOutcome::Written => run.manufacturers_packed += 1,
            WriteOutcome::TooLarge => run.manufacturers_too_large += 1,
            WriteOutcome::FilesExhausted => break 'manufacturers,
        }
    }

    let (run_dir, files) = writer.finish()?;
    run.run_dir = run_dir;
    run.files = files;

    tracing::info!(
        files = run.files.len(),
        requests = run.total_requests(),
        tokens = run.total_tokens(),
        scanned = run.manufacturers_scanned,
        packed = run.manufacturers_packed,
        missing = run.manufacturers_missing_requests,
        validation_errors = run.manufacturers_with_validation_errors,
        "pack run finished"
    );
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::HeuristicTokenCounter;
    use crate::custom_id::{ChunkBounds, RequestKind};
    use crate::model::{DeferredField, DeferredKeyword, GptModel};
    use crate::prompt::Prompt;
    use crate::request::build_request;
    use crate::store::memory::MemoryStore;
    use std::collections::BTreeMap;

    /// Seed one manufacturer with `n` pending keyword requests of
    /// `tokens_each` tokens apiece.
    async fn seed_manufacturer(store: &MemoryStore, etld1: &str, n: usize, tokens_each: u64) {
        let now = Utc::now();
        let mut mfg = Manufacturer::new(etld1, Some("v1".to_string()), now);
        mfg.text_num_tokens = Some(n as u64 * tokens_each);
        ManufacturerStore::upsert(store, &mfg).await.unwrap();

        let mut doc = DeferredManufacturer::new(etld1, "v1", now);
        let mut chunk_request_ids = BTreeMap::new();
        let mut rows = Vec::new();
        let prompt = Prompt::new("list products", "p1", &HeuristicTokenCounter);
        for i in 0..n {
            let bounds = ChunkBounds::new(i * 100, (i + 1) * 100);
            let id = CustomId::new(etld1, FieldName::Products, RequestKind::Chunk, bounds);
            chunk_request_ids.insert(bounds.to_string(), id.clone());
            let mut row = build_request(
                now,
                id,
                "chunk text",
                &prompt,
                &GptModel::default_batch_model(),
                &HeuristicTokenCounter,
            );
            row.request.body.input_tokens = tokens_each;
            rows.push(row);
        }
        doc.fields.insert(
            FieldName::Products,
            DeferredField::Keyword(DeferredKeyword {
                extract_prompt_version_id: "p1".to_string(),
                chunk_request_ids,
            }),
        );
        // Remaining nine fields would be validation errors; resolve them.
        resolve_all_but_products(&mut mfg);
        ManufacturerStore::upsert(store, &mfg).await.unwrap();
        DeferredStore::upsert(store, &doc).await.unwrap();
        store.bulk_upsert_bodies(rows, etld1).await.unwrap();
    }

    fn resolve_all_but_products(mfg: &mut Manufacturer) {
        use crate::model::*;
        let now = Utc::now();
        let binary = |key: &str| BinaryOutcome {
            answer: true,
            confidence: 1.0,
            reason: "seeded".to_string(),
            stats: BinaryStats {
                prompt_version_id: "p".to_string(),
                chunk_key: key.to_string(),
            },
            extracted_at: now,
        };
        mfg.is_manufacturer = Some(binary("0:1"));
        mfg.is_contract_manufacturer = Some(binary("0:1"));
        mfg.is_product_manufacturer = Some(binary("0:1"));
        mfg.addresses = Some(AddressExtraction {
            results: vec![],
            dropped: 0,
            stats: BasicStats {
                prompt_version_id: "p".to_string(),
                chunk_key: "0:1".to_string(),
            },
            extracted_at: now,
        });
        mfg.business_desc = Some(BusinessDescExtraction {
            name: "Acme".to_string(),
            description: "seeded".to_string(),
            stats: BasicStats {
                prompt_version_id: "p".to_string(),
                chunk_key: "0:1".to_string(),
            },
            extracted_at: now,
        });
        let concept = ConceptExtraction {
            results: Default::default(),
            stats: ConceptStats {
                extract_prompt_version_id: "p".to_string(),
                map_prompt_version_id: "m".to_string(),
                ontology_version_id: "o".to_string(),
                chunked: Default::default(),
                mapping: Default::default(),
                unmapped_llm: vec![],
            },
            extracted_at: now,
        };
        mfg.certificates = Some(concept.clone());
        mfg.industries = Some(concept.clone());
        mfg.process_caps = Some(concept.clone());
        mfg.material_caps = Some(concept);
    }

    fn config(dir: &Path, max_requests: usize) -> PackerConfig {
        PackerConfig {
            output_dir: dir.to_path_buf(),
            prefix: "batch".to_string(),
            max_requests_per_file: max_requests,
            max_tokens_per_file: u64::MAX,
            max_file_size_bytes: u64::MAX,
            max_files: None,
            manufacturer_token_cap: DEFAULT_MANUFACTURER_TOKEN_CAP,
        }
    }

    #[tokio::test]
    async fn zero_manufacturers_produce_no_files() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let run = pack_pending_requests(
            &store,
            &store,
            &store,
            &config(dir.path(), 100),
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(run.files.is_empty());
        assert!(run.run_dir.is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn request_cap_splits_files_without_splitting_manufacturers() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        // 10 manufacturers x 6 requests = 60; cap 25 -> 4 per file.
        for i in 0..10 {
            seed_manufacturer(&store, &format!("m{i:02}.example"), 6, 10).await;
        }

        let run = pack_pending_requests(
            &store,
            &store,
            &store,
            &config(dir.path(), 25),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(run.files.len(), 3);
        assert_eq!(run.files[0].requests, 24);
        assert_eq!(run.files[0].manufacturers, 4);
        assert_eq!(run.files[1].requests, 24);
        assert_eq!(run.files[2].requests, 12);
        assert_eq!(run.total_requests(), 60);

        // No manufacturer's ids appear in two files.
        let mut seen_prefixes: HashSet<String> = HashSet::new();
        for file in &run.files {
            let prefixes: HashSet<String> = file
                .custom_ids
                .iter()
                .map(|id| id.etld1().to_string())
                .collect();
            for p in prefixes {
                assert!(seen_prefixes.insert(p), "manufacturer split across files");
            }
        }
    }

    #[tokio::test]
    async fn byte_and_token_caps_are_enforced() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            seed_manufacturer(&store, &format!("m{i}.example"), 2, 500).await;
        }

        let mut cfg = config(dir.path(), 1_000);
        cfg.max_tokens_per_file = 2_000; // two manufacturers' worth
        let run = pack_pending_requests(&store, &store, &store, &cfg, Utc::now())
            .await
            .unwrap();
        assert_eq!(run.files.len(), 2);
        for file in &run.files {
            assert!(file.tokens <= 2_000);
            let written = fs::metadata(&file.path).unwrap().len();
            assert_eq!(written, file.bytes);
        }
    }

    #[tokio::test]
    async fn oversized_manufacturer_is_skipped_and_run_continues() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        seed_manufacturer(&store, "aa-small.example", 2, 10).await;
        seed_manufacturer(&store, "bb-huge.example", 2, 50_000).await;
        seed_manufacturer(&store, "cc-small.example", 2, 10).await;

        let mut cfg = config(dir.path(), 1_000);
        cfg.max_tokens_per_file = 1_000;
        let run = pack_pending_requests(&store, &store, &store, &cfg, Utc::now())
            .await
            .unwrap();

        assert_eq!(run.manufacturers_too_large, 1);
        assert_eq!(run.manufacturers_packed, 2);
        let packed: HashSet<String> = run
            .files
            .iter()
            .flat_map(|f| f.custom_ids.iter().map(|id| id.etld1().to_string()))
            .collect();
        assert!(!packed.contains("bb-huge.example"));
    }

    #[tokio::test]
    async fn missing_requests_skip_the_manufacturer_and_hit_the_sidecar() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        seed_manufacturer(&store, "ok.example", 3, 10).await;
        seed_manufacturer(&store, "broken.example", 3, 10).await;

        // Delete one of broken.example's rows out from under its deferred doc.
        store
            .delete_by_prefix("broken.example", FieldName::Products)
            .await
            .unwrap();

        let run = pack_pending_requests(
            &store,
            &store,
            &store,
            &config(dir.path(), 100),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(run.manufacturers_missing_requests, 1);
        assert_eq!(run.manufacturers_packed, 1);

        let run_dir = run.run_dir.unwrap();
        let sidecar = fs::read_dir(&run_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().ends_with("missing_batch_requests.ndjson"))
            .expect("missing-requests sidecar");
        let content = fs::read_to_string(sidecar.path()).unwrap();
        assert!(content.contains("broken.example"));
        assert!(content.contains("missing_custom_ids"));
    }

    #[tokio::test]
    async fn validation_errors_skip_the_manufacturer() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        seed_manufacturer(&store, "valid.example", 2, 10).await;

        // A manufacturer whose products field is null on both sides.
        let now = Utc::now();
        let mut mfg = Manufacturer::new("invalid.example", Some("v1".to_string()), now);
        mfg.text_num_tokens = Some(100);
        resolve_all_but_products(&mut mfg);
        ManufacturerStore::upsert(&store, &mfg).await.unwrap();
        DeferredStore::upsert(&store, &DeferredManufacturer::new("invalid.example", "v1", now))
            .await
            .unwrap();

        let run = pack_pending_requests(
            &store,
            &store,
            &store,
            &config(dir.path(), 100),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(run.manufacturers_with_validation_errors, 1);
        assert_eq!(run.manufacturers_packed, 1);

        let run_dir = run.run_dir.unwrap();
        let sidecar_path = fs::read_dir(&run_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().ends_with("validation_errors.ndjson"))
            .expect("validation sidecar")
            .path();
        let content = fs::read_to_string(sidecar_path).unwrap();
        assert!(content.contains("invalid.example"));
        assert!(content.contains("products"));
    }

    #[tokio::test]
    async fn max_files_stops_the_run_early() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6 {
            seed_manufacturer(&store, &format!("m{i}.example"), 4, 10).await;
        }

        let mut cfg = config(dir.path(), 8); // two manufacturers per file
        cfg.max_files = Some(1);
        let run = pack_pending_requests(&store, &store, &store, &cfg, Utc::now())
            .await
            .unwrap();

        assert_eq!(run.files.len(), 1);
        assert_eq!(run.files[0].requests, 8);
        assert_eq!(run.manufacturers_packed, 2);
    }

    #[tokio::test]
    async fn metadata_records_per_file_totals_and_lines_are_loadable() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        seed_manufacturer(&store, "acme.example", 3, 25).await;

        let run = pack_pending_requests(
            &store,
            &store,
            &store,
            &config(dir.path(), 100),
            Utc::now(),
        )
        .await
        .unwrap();

        let run_dir = run.run_dir.clone().unwrap();
        let metadata: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(run_dir.join("batch_metadata.json")).unwrap())
                .unwrap();
        let file_name = run.files[0].path.file_name().unwrap().to_string_lossy();
        assert_eq!(metadata[file_name.as_ref()]["requests"], 3);
        assert_eq!(metadata[file_name.as_ref()]["tokens"], 75);
        assert_eq!(metadata[file_name.as_ref()]["manufacturers"], 1);

        // Each line is standalone JSON with no token bookkeeping.
        let content = fs::read_to_string(&run.files[0].path).unwrap();
        assert_eq!(content.lines().count(), 3);
        for line in content.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value["custom_id"].is_string());
            assert!(value["body"].get("input_tokens").is_none());
        }
    }

    #[tokio::test]
    async fn repeated_runs_pack_the_same_custom_ids() {
        let store = MemoryStore::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        for i in 0..3 {
            seed_manufacturer(&store, &format!("m{i}.example"), 4, 10).await;
        }

        let run_a = pack_pending_requests(
            &store,
            &store,
            &store,
            &config(dir_a.path(), 100),
            Utc::now(),
        )
        .await
        .unwrap();
        let run_b = pack_pending_requests(
            &store,
            &store,
            &store,
            &config(dir_b.path(), 100),
            Utc::now(),
        )
        .await
        .unwrap();

        let ids = |run: &PackRun| {
            let mut ids: Vec<CustomId> = run
                .files
                .iter()
                .flat_map(|f| f.custom_ids.iter().cloned())
                .collect();
            ids.sort();
            ids
        };
        assert_eq!(ids(&run_a), ids(&run_b));
    }
}
