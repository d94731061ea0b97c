//! Keyword extraction fields (products): one request per chunk, results
//! unioned across chunks.

use std::collections::{BTreeMap, BTreeSet};

use crate::chunk::{chunk_text_offloaded, ChunkingStrategy};
use crate::custom_id::{CustomId, FieldName, RequestKind};
use crate::error::{KilnError, Result};
use crate::model::{DeferredField, DeferredKeyword, FieldValue, KeywordExtraction, KeywordStats};
use crate::request::build_request;

use super::{
    check_prompt_version, load_rows, missing_ids, parse_json_completion, rebuild_chunk_request,
    resolved_content, StepContext, StepOutcome,
};

pub(crate) async fn step(
    ctx: &StepContext<'_>,
    field: FieldName,
    current: Option<DeferredKeyword>,
) -> Result<StepOutcome> {
    let prompt = ctx.prompts.extraction(field);

    let state = match current {
        Some(state) => {
            check_prompt_version(field, &state.extract_prompt_version_id, &prompt.version_id)?;
            state
        }
        None => {
            let strategy =
                ChunkingStrategy::for_field(field, ctx.model.max_context_tokens, prompt.num_tokens);
            let chunks =
                chunk_text_offloaded(ctx.text.to_string(), ctx.counter.clone(), strategy).await?;
            if chunks.is_empty() {
                return Err(KilnError::Internal(format!(
                    "no text to extract keywords from for {}",
                    ctx.etld1
                )));
            }

            let mut chunk_request_ids = BTreeMap::new();
            let mut rows = Vec::with_capacity(chunks.len());
            for (bounds, chunk) in &chunks {
                let custom_id = CustomId::new(ctx.etld1, field, RequestKind::Chunk, *bounds);
                chunk_request_ids.insert(bounds.to_string(), custom_id.clone());
                rows.push(build_request(
                    ctx.now,
                    custom_id,
                    chunk,
                    prompt,
                    ctx.model,
                    ctx.counter.as_ref(),
                ));
            }
            let requests_created = rows.len();
            ctx.requests.bulk_upsert_bodies(rows, ctx.etld1).await?;

            let state = DeferredKeyword {
                extract_prompt_version_id: prompt.version_id.clone(),
                chunk_request_ids,
            };
            return Ok(StepOutcome::InFlight {
                state: DeferredField::Keyword(state),
                changed: true,
                requests_created,
            });
        }
    };

    let ids: Vec<CustomId> = state.chunk_request_ids.values().cloned().collect();

    let missing = missing_ids(ctx.requests, &ids).await?;
    if !missing.is_empty() {
        let rebuilt = missing
            .iter()
            .map(|id| rebuild_chunk_request(ctx, id, prompt))
            .collect::<Result<Vec<_>>>()?;
        let requests_created = rebuilt.len();
        ctx.requests.bulk_upsert_bodies(rebuilt, ctx.etld1).await?;
        return Ok(StepOutcome::InFlight {
            state: DeferredField::Keyword(state),
            changed: false,
            requests_created,
        });
    }

    let rows = load_rows(ctx.requests, &ids).await?;
    if ids.iter().any(|id| resolved_content(&rows, id).is_none()) {
        return Ok(StepOutcome::InFlight {
            state: DeferredField::Keyword(state),
            changed: false,
            requests_created: 0,
        });
    }

    // Every chunk answered: union the keyword lists.
    let mut results: BTreeSet<String> = BTreeSet::new();
    let mut per_chunk: BTreeMap<String, usize> = BTreeMap::new();
    for (chunk_key, id) in &state.chunk_request_ids {
        let content = resolved_content(&rows, id).expect("checked resolved above");
        let keywords: Vec<String> = parse_json_completion(id, content)?;
        let cleaned: Vec<String> = keywords
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        per_chunk.insert(chunk_key.clone(), cleaned.len());
        results.extend(cleaned);
    }

    Ok(StepOutcome::Materialized(FieldValue::Keyword(
        KeywordExtraction {
            results,
            stats: KeywordStats {
                prompt_version_id: state.extract_prompt_version_id.clone(),
                per_chunk,
            },
            extracted_at: ctx.now,
        },
    )))
}
