//! Basic extraction fields (addresses, business description): one request
//! against the first chunk, free-form JSON back.

use serde::Deserialize;

use crate::chunk::{chunk_text_offloaded, ChunkingStrategy};
use crate::custom_id::{CustomId, FieldName, RequestKind};
use crate::error::{KilnError, Result};
use crate::model::{
    AddressExtraction, BasicStats, BusinessDescExtraction, DeferredBasic, DeferredField,
    FieldValue, PostalAddress,
};
use crate::request::build_request;

use super::{
    check_prompt_version, load_rows, missing_ids, parse_json_completion, rebuild_chunk_request,
    resolved_content, StepContext, StepOutcome,
};

#[derive(Debug, Deserialize)]
struct BusinessDescCompletion {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
}

pub(crate) async fn step(
    ctx: &StepContext<'_>,
    field: FieldName,
    current: Option<DeferredBasic>,
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
                    "no text to extract from for {}",
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

            let state = DeferredBasic {
                prompt_version_id: prompt.version_id.clone(),
                request_id: custom_id,
            };
            return Ok(StepOutcome::InFlight {
                state: DeferredField::Basic(state),
                changed: true,
                requests_created: 1,
            });
        }
    };

    let ids = [state.request_id.clone()];

    if !missing_ids(ctx.requests, &ids).await?.is_empty() {
        let rebuilt = rebuild_chunk_request(ctx, &state.request_id, prompt)?;
        ctx.requests
            .bulk_upsert_bodies(vec![rebuilt], ctx.etld1)
            .await?;
        return Ok(StepOutcome::InFlight {
            state: DeferredField::Basic(state),
            changed: false,
            requests_created: 1,
        });
    }

    let rows = load_rows(ctx.requests, &ids).await?;
    let Some(content) = resolved_content(&rows, &state.request_id) else {
        return Ok(StepOutcome::InFlight {
            state: DeferredField::Basic(state),
            changed: false,
            requests_created: 0,
        });
    };

    let chunk_key = state.request_id.decode()?.bounds.to_string();
    let stats = BasicStats {
        prompt_version_id: state.prompt_version_id.clone(),
        chunk_key,
    };

    match field {
        FieldName::Addresses => {
            let candidates: Vec<PostalAddress> =
                parse_json_completion(&state.request_id, content)?;
            materialize_addresses(ctx, candidates, stats)
        }
        FieldName::BusinessDesc => {
            let completion: BusinessDescCompletion =
                parse_json_completion(&state.request_id, content)?;
            Ok(StepOutcome::Materialized(FieldValue::BusinessDesc(
                BusinessDescExtraction {
                    name: completion.name,
                    description: completion.description,
                    stats,
                    extracted_at: ctx.now,
                },
            )))
        }
        other => Err(KilnError::Internal(format!(
            "{other} is not a basic extraction field"
        ))),
    }
}

/// Keep only addresses that validate; dropped records are logged, not fatal.
fn materialize_addresses(
    ctx: &StepContext<'_>,
    candidates: Vec<PostalAddress>,
    stats: BasicStats,
) -> Result<StepOutcome> {
    let mut results = Vec::new();
    let mut dropped = 0u64;
    for address in candidates {
        match address.validate() {
            Ok(()) => results.push(address),
            Err(reason) => {
                dropped += 1;
                tracing::warn!(etld1 = ctx.etld1, reason = %reason, "dropping invalid address");
            }
        }
    }

    Ok(StepOutcome::Materialized(FieldValue::Addresses(
        AddressExtraction {
            results,
            dropped,
            stats,
            extracted_at: ctx.now,
        },
    )))
}
