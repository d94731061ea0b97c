//! Binary classification fields: one request against the first chunk.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::chunk::{chunk_text_offloaded, ChunkingStrategy};
use crate::custom_id::{CustomId, FieldName, RequestKind};
use crate::error::{KilnError, Result};
use crate::model::{BinaryOutcome, BinaryStats, DeferredBinary, DeferredField, FieldValue};
use crate::request::build_request;

use super::{
    check_prompt_version, load_rows, missing_ids, parse_json_completion, rebuild_chunk_request,
    resolved_content, StepContext, StepOutcome,
};

#[derive(Debug, Deserialize)]
struct BinaryCompletion {
    answer: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: String,
}

pub(crate) async fn step(
    ctx: &StepContext<'_>,
    field: FieldName,
    current: Option<DeferredBinary>,
) -> Result<StepOutcome> {
    let prompt = ctx.prompts.extraction(field);

    let state = match current {
        Some(state) => {
            check_prompt_version(field, &state.prompt_version_id, &prompt.version_id)?;
            state
        }
        None => {
            let strategy =
                ChunkingStrategy::for_field(field, ctx.model.max_context_tokens, prompt.num_tokens);
            let chunks =
                chunk_text_offloaded(ctx.text.to_string(), ctx.counter.clone(), strategy).await?;
            let Some((bounds, chunk)) = chunks.into_iter().next() else {
                return Err(KilnError::Internal(format!(
                    "no text to classify for {}",
                    ctx.etld1
                )));
            };

            let custom_id = CustomId::new(ctx.etld1, field, RequestKind::Chunk, bounds);
            let row = build_request(
                ctx.now,
                custom_id.clone(),
                &chunk,
                prompt,
                ctx.model,
                ctx.counter.as_ref(),
            );
            ctx.requests
                .bulk_upsert_bodies(vec![row], ctx.etld1)
                .await?;

            let chunk_key = bounds.to_string();
            let state = DeferredBinary {
                prompt_version_id: prompt.version_id.clone(),
                final_chunk_key: chunk_key.clone(),
                chunk_request_ids: BTreeMap::from([(chunk_key, custom_id)]),
            };
            return Ok(StepOutcome::InFlight {
                state: DeferredField::Binary(state),
                changed: true,
                requests_created: 1,
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
            state: DeferredField::Binary(state),
            changed: false,
            requests_created,
        });
    }

    let rows = load_rows(ctx.requests, &ids).await?;
    let final_id = state
        .chunk_request_ids
        .get(&state.final_chunk_key)
        .ok_or_else(|| {
            KilnError::Internal(format!(
                "final chunk key {} has no request id",
                state.final_chunk_key
            ))
        })?;
    let Some(content) = resolved_content(&rows, final_id) else {
        return Ok(StepOutcome::InFlight {
            state: DeferredField::Binary(state),
            changed: false,
            requests_created: 0,
        });
    };

    let completion: BinaryCompletion = parse_json_completion(final_id, content)?;
    Ok(StepOutcome::Materialized(FieldValue::Binary(BinaryOutcome {
        answer: completion.answer,
        confidence: completion.confidence,
        reason: completion.reason,
        stats: BinaryStats {
            prompt_version_id: state.prompt_version_id.clone(),
            chunk_key: state.final_chunk_key.clone(),
        },
        extracted_at: ctx.now,
    })))
}
