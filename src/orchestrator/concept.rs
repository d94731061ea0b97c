//! Concept extraction fields: two stages.
//!
//! Phase 1 sends one LLM-search request per chunk and records, per chunk,
//! the concept names a literal scan found. Once every search response is
//! in, the labels the LLM and the scan mutually agree on go straight into
//! the results; the remaining LLM labels become the *unknowns* of a single
//! phase-2 mapping request carrying the known-concept catalog. Mapped
//! unknowns augment the results; the rest are recorded as unmapped.

use std::collections::{BTreeMap, BTreeSet};

use crate::custom_id::{ChunkBounds, CustomId, FieldName, RequestKind};
use crate::chunk::{chunk_text_offloaded, ChunkingStrategy};
use crate::error::{KilnError, Result};
use crate::model::{
    ConceptChunkStats, ConceptExtraction, ConceptSearchBundle, ConceptStats, DeferredConcept,
    DeferredField, FieldValue,
};
use crate::ontology::{brute_search, ConceptCatalog};
use crate::prompt::Prompt;
use crate::request::{build_request, RequestRow};

use super::{
    check_prompt_version, load_rows, missing_ids, parse_json_completion, rebuild_chunk_request,
    resolved_content, StepContext, StepOutcome,
};

/// Parsed phase-1 state of one chunk.
struct ChunkSearch {
    key: String,
    brute: BTreeSet<String>,
    llm: BTreeSet<String>,
    /// Known concept names the scan and the LLM agree on
    agreed: BTreeSet<String>,
    /// LLM labels left for the mapping stage
    leftovers: BTreeSet<String>,
}

pub(crate) async fn step(
    ctx: &StepContext<'_>,
    field: FieldName,
    current: Option<DeferredConcept>,
) -> Result<StepOutcome> {
    let search_prompt = ctx.prompts.extraction(field);
    let map_prompt = ctx
        .prompts
        .mapping(field)
        .ok_or_else(|| KilnError::Internal(format!("{field} has no mapping prompt")))?;
    let catalog = ctx
        .ontology
        .catalog_for(field)
        .ok_or_else(|| KilnError::Internal(format!("{field} has no concept catalog")))?;

    let mut state = match current {
        Some(state) => {
            check_prompt_version(field, &state.extract_prompt_version_id, &search_prompt.version_id)?;
            check_prompt_version(field, &state.map_prompt_version_id, &map_prompt.version_id)?;
            if state.ontology_version_id != ctx.ontology.version_id {
                return Err(KilnError::Internal(format!(
                    "ontology version mismatch for {field}: deferred={}, loaded={}",
                    state.ontology_version_id, ctx.ontology.version_id
                )));
            }
            state
        }
        None => {
            return start_search_phase(ctx, field, search_prompt, map_prompt, catalog).await;
        }
    };

    let search_ids: Vec<CustomId> = state
        .chunks
        .values()
        .map(|bundle| bundle.search_request_id.clone())
        .collect();
    let mut all_ids = search_ids.clone();
    if let Some(mapping_id) = &state.mapping_request_id {
        all_ids.push(mapping_id.clone());
    }
    let missing = missing_ids(ctx.requests, &all_ids).await?;

    // Replay path: re-create search rows the store lost.
    let missing_searches: Vec<CustomId> = missing
        .iter()
        .filter(|id| search_ids.contains(id))
        .cloned()
        .collect();
    if !missing_searches.is_empty() {
        let rebuilt = missing_searches
            .iter()
            .map(|id| rebuild_chunk_request(ctx, id, search_prompt))
            .collect::<Result<Vec<_>>>()?;
        let requests_created = rebuilt.len();
        ctx.requests.bulk_upsert_bodies(rebuilt, ctx.etld1).await?;
        return Ok(StepOutcome::InFlight {
            state: DeferredField::Concept(state),
            changed: false,
            requests_created,
        });
    }

    let rows = load_rows(ctx.requests, &all_ids).await?;
    if search_ids
        .iter()
        .any(|id| resolved_content(&rows, id).is_none())
    {
        // Phase 1 still in flight.
        return Ok(StepOutcome::InFlight {
            state: DeferredField::Concept(state),
            changed: false,
            requests_created: 0,
        });
    }

    // Phase 1 complete: compute per-chunk agreement and the mapping input.
    let mut chunk_searches = Vec::with_capacity(state.chunks.len());
    for (chunk_key, bundle) in &state.chunks {
        let content = resolved_content(&rows, &bundle.search_request_id)
            .expect("checked resolved above");
        let labels: Vec<String> = parse_json_completion(&bundle.search_request_id, content)?;
        chunk_searches.push(split_agreed(chunk_key, bundle, labels, catalog));
    }
    let unknowns: BTreeSet<String> = chunk_searches
        .iter()
        .flat_map(|c| c.leftovers.iter().cloned())
        .collect();

    match state.mapping_request_id.clone() {
        None => {
            let (mapping_id, row) =
                build_mapping_request(ctx, field, map_prompt, &unknowns, catalog);
            ctx.requests
                .bulk_upsert_bodies(vec![row], ctx.etld1)
                .await?;
            state.mapping_request_id = Some(mapping_id);
            Ok(StepOutcome::InFlight {
                state: DeferredField::Concept(state),
                changed: true,
                requests_created: 1,
            })
        }
        Some(mapping_id) if !rows.contains_key(&mapping_id) => {
            // The deferred state references a mapping row the store lost.
            let (_, row) = build_mapping_request(ctx, field, map_prompt, &unknowns, catalog);
            ctx.requests
                .bulk_upsert_bodies(vec![row], ctx.etld1)
                .await?;
            Ok(StepOutcome::InFlight {
                state: DeferredField::Concept(state),
                changed: false,
                requests_created: 1,
            })
        }
        Some(mapping_id) => match resolved_content(&rows, &mapping_id) {
            Some(content) => materialize(ctx, &state, &mapping_id, content, chunk_searches, unknowns, catalog),
            None => Ok(StepOutcome::InFlight {
                state: DeferredField::Concept(state),
                changed: false,
                requests_created: 0,
            }),
        },
    }
}

async fn start_search_phase(
    ctx: &StepContext<'_>,
    field: FieldName,
    search_prompt: &Prompt,
    map_prompt: &Prompt,
    catalog: &ConceptCatalog,
) -> Result<StepOutcome> {
    let strategy = ChunkingStrategy::for_field(
        field,
        ctx.model.max_context_tokens,
        search_prompt.num_tokens,
    );
    let chunks = chunk_text_offloaded(ctx.text.to_string(), ctx.counter.clone(), strategy).await?;
    if chunks.is_empty() {
        return Err(KilnError::Internal(format!(
            "no text to search concepts in for {}",
            ctx.etld1
        )));
    }

    let mut bundles = BTreeMap::new();
    let mut rows = Vec::with_capacity(chunks.len());
    for (bounds, chunk) in &chunks {
        let custom_id = CustomId::new(ctx.etld1, field, RequestKind::LlmSearch, *bounds);
        bundles.insert(
            bounds.to_string(),
            ConceptSearchBundle {
                search_request_id: custom_id.clone(),
                brute: brute_search(chunk, catalog),
            },
        );
        rows.push(build_request(
            ctx.now,
            custom_id,
            chunk,
            search_prompt,
            ctx.model,
            ctx.counter.as_ref(),
        ));
    }
    let requests_created = rows.len();
    ctx.requests.bulk_upsert_bodies(rows, ctx.etld1).await?;

    let state = DeferredConcept {
        extract_prompt_version_id: search_prompt.version_id.clone(),
        map_prompt_version_id: map_prompt.version_id.clone(),
        ontology_version_id: ctx.ontology.version_id.clone(),
        chunks: bundles,
        mapping_request_id: None,
    };
    Ok(StepOutcome::InFlight {
        state: DeferredField::Concept(state),
        changed: true,
        requests_created,
    })
}

/// Partition one chunk's LLM labels: labels naming a concept the literal
/// scan also found are agreed; everything else goes to the mapping stage.
fn split_agreed(
    chunk_key: &str,
    bundle: &ConceptSearchBundle,
    labels: Vec<String>,
    catalog: &ConceptCatalog,
) -> ChunkSearch {
    let llm: BTreeSet<String> = labels
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    let mut agreed = BTreeSet::new();
    let mut leftovers = BTreeSet::new();
    for label in &llm {
        match catalog.concept_for_label(label) {
            Some(concept) if bundle.brute.contains(&concept.name) => {
                agreed.insert(concept.name.clone());
            }
            _ => {
                leftovers.insert(label.clone());
            }
        }
    }

    ChunkSearch {
        key: chunk_key.to_string(),
        brute: bundle.brute.clone(),
        llm,
        agreed,
        leftovers,
    }
}

/// The single phase-2 request: unknowns plus the known catalog, addressed
/// by the full-text bounds so the id stays inside the grammar.
fn build_mapping_request(
    ctx: &StepContext<'_>,
    field: FieldName,
    map_prompt: &Prompt,
    unknowns: &BTreeSet<String>,
    catalog: &ConceptCatalog,
) -> (CustomId, RequestRow) {
    let bounds = ChunkBounds::new(0, ctx.text.len());
    let custom_id = CustomId::new(ctx.etld1, field, RequestKind::Mapping, bounds);
    let context = serde_json::json!({
        "unknowns": unknowns.iter().collect::<Vec<_>>(),
        "knowns": catalog.known_names(),
    })
    .to_string();
    let row = build_request(
        ctx.now,
        custom_id.clone(),
        &context,
        map_prompt,
        ctx.model,
        ctx.counter.as_ref(),
    );
    (custom_id, row)
}

fn materialize(
    ctx: &StepContext<'_>,
    state: &DeferredConcept,
    mapping_id: &CustomId,
    mapping_content: &str,
    chunk_searches: Vec<ChunkSearch>,
    unknowns: BTreeSet<String>,
    catalog: &ConceptCatalog,
) -> Result<StepOutcome> {
    let raw_mapping: BTreeMap<String, Option<String>> =
        parse_json_completion(mapping_id, mapping_content)?;

    // Validate both sides; anything off-catalog is discarded with a warning.
    let mut mapping: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut mapped_unknowns: BTreeSet<String> = BTreeSet::new();
    for (unknown, maybe_known) in raw_mapping {
        if !unknowns.contains(&unknown) {
            tracing::warn!(
                etld1 = ctx.etld1,
                unknown = %unknown,
                "mapping response names a label that was never asked about, discarding"
            );
            continue;
        }
        let Some(known) = maybe_known else {
            continue; // explicitly unmapped
        };
        let Some(concept) = catalog.concept_for_label(&known) else {
            tracing::warn!(
                etld1 = ctx.etld1,
                known = %known,
                "mapping response names an unknown concept, discarding"
            );
            continue;
        };
        mapping
            .entry(concept.name.clone())
            .or_default()
            .push(unknown.clone());
        mapped_unknowns.insert(unknown);
    }

    let unmapped: BTreeSet<String> = unknowns.difference(&mapped_unknowns).cloned().collect();

    let mut results: BTreeSet<String> = BTreeSet::new();
    let mut chunked: BTreeMap<String, ConceptChunkStats> = BTreeMap::new();
    for chunk in chunk_searches {
        let mut stats = ConceptChunkStats {
            results: chunk.agreed.clone(),
            brute: chunk.brute,
            llm: chunk.llm.clone(),
            mapping: BTreeMap::new(),
            unmapped_llm: unmapped.intersection(&chunk.llm).cloned().collect(),
        };
        for (known_name, unknowns_for_known) in &mapping {
            let in_chunk: Vec<String> = unknowns_for_known
                .iter()
                .filter(|u| chunk.llm.contains(*u))
                .cloned()
                .collect();
            if !in_chunk.is_empty() {
                stats.results.insert(known_name.clone());
                stats.mapping.insert(known_name.clone(), in_chunk);
            }
        }
        results.extend(chunk.agreed);
        chunked.insert(chunk.key, stats);
    }
    results.extend(mapping.keys().cloned());

    Ok(StepOutcome::Materialized(FieldValue::Concept(
        ConceptExtraction {
            results,
            stats: ConceptStats {
                extract_prompt_version_id: state.extract_prompt_version_id.clone(),
                map_prompt_version_id: state.map_prompt_version_id.clone(),
                ontology_version_id: state.ontology_version_id.clone(),
                chunked,
                mapping,
                unmapped_llm: unmapped.into_iter().collect(),
            },
            extracted_at: ctx.now,
        },
    )))
}
