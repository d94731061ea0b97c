//! Line-respecting text chunking.
//!
//! The chunker splits a manufacturer's scraped text into chunks whose token
//! counts stay under a soft limit, never splitting a line. Each chunk is
//! addressed by its `start:end` byte offsets in the original text, so the
//! deferred state only ever records offsets and the chunk body can be
//! reconstructed by slicing. The function is deterministic: identical
//! inputs always produce identical offsets and substrings.

use std::sync::Arc;

use crate::custom_id::{ChunkBounds, FieldFamily, FieldName};
use crate::error::{KilnError, Result};

/// Texts at or above this size are chunked on the blocking pool.
pub const OFFLOAD_THRESHOLD_BYTES: usize = 100 * 1024;

/// Counts tokens in a piece of text. The real tokenizer lives outside this
/// crate; implementations must be pure so chunk offsets stay reproducible.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Default counter: roughly four bytes per token, rounded up. Close enough
/// for packing budgets, and stable across runs, which is what matters here.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}

/// How a field's text gets chunked. Fixed per field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkingStrategy {
    pub soft_limit_tokens: usize,
    pub overlap_ratio: f64,
    pub max_chunks: Option<usize>,
}

/// Context headroom subtracted for single-chunk binary classification, so
/// prompt + chunk + completion fit the model window.
const BINARY_CONTEXT_MARGIN: usize = 10_000;
/// Same headroom for the single-chunk basic extractions.
const BASIC_CONTEXT_MARGIN: usize = 5_000;

impl ChunkingStrategy {
    pub fn new(soft_limit_tokens: usize, overlap_ratio: f64) -> Result<Self> {
        if soft_limit_tokens < 1 {
            return Err(KilnError::Internal(
                "soft_limit_tokens must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&overlap_ratio) {
            return Err(KilnError::Internal(format!(
                "overlap_ratio must be in [0, 1), got {overlap_ratio}"
            )));
        }
        Ok(Self {
            soft_limit_tokens,
            overlap_ratio,
            max_chunks: None,
        })
    }

    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = Some(max_chunks);
        self
    }

    /// The fixed strategy for a field. Single-chunk fields size their one
    /// chunk to the model window minus the prompt; multi-chunk fields use
    /// per-field limits tuned for their prompts.
    pub fn for_field(
        field: FieldName,
        model_context_tokens: usize,
        prompt_tokens: usize,
    ) -> ChunkingStrategy {
        let first_chunk = |margin: usize| ChunkingStrategy {
            soft_limit_tokens: model_context_tokens
                .saturating_sub(prompt_tokens + margin)
                .max(1),
            overlap_ratio: 0.0,
            max_chunks: Some(1),
        };

        match field.family() {
            FieldFamily::Binary => first_chunk(BINARY_CONTEXT_MARGIN),
            FieldFamily::Basic => first_chunk(BASIC_CONTEXT_MARGIN),
            FieldFamily::Keyword => ChunkingStrategy {
                soft_limit_tokens: 5_000,
                overlap_ratio: 0.15,
                max_chunks: None,
            },
            FieldFamily::Concept => match field {
                FieldName::Certificates => ChunkingStrategy {
                    soft_limit_tokens: 7_500,
                    overlap_ratio: 0.0,
                    max_chunks: None,
                },
                FieldName::ProcessCaps => ChunkingStrategy {
                    soft_limit_tokens: 2_500,
                    overlap_ratio: 0.15,
                    max_chunks: None,
                },
                _ => ChunkingStrategy {
                    soft_limit_tokens: 5_000,
                    overlap_ratio: 0.15,
                    max_chunks: None,
                },
            },
        }
    }
}

/// An ordered list of `(bounds, substring)` pairs. Starts are strictly
/// increasing; with a zero overlap ratio the substrings tile the input.
pub type Chunks = Vec<(ChunkBounds, String)>;

struct Line<'t> {
    text: &'t str,
    tokens: usize,
    start: usize,
    end: usize,
}

/// Split `text` into line-aligned chunks under `strategy`.
///
/// The next chunk begins by replaying whole lines from the tail of the
/// previous chunk until their combined token count reaches
/// `overlap_ratio × previous_chunk_tokens`.
pub fn chunk_text(text: &str, counter: &dyn TokenCounter, strategy: &ChunkingStrategy) -> Chunks {
    let mut chunks: Chunks = Vec::new();
    if text.is_empty() {
        return chunks;
    }
    if let Some(0) = strategy.max_chunks {
        return chunks;
    }

    let mut lines: Vec<Line<'_>> = Vec::new();
    let mut offset = 0usize;
    for raw in text.split_inclusive('\n') {
        let start = offset;
        let end = offset + raw.len();
        lines.push(Line {
            text: raw,
            tokens: counter.count(raw),
            start,
            end,
        });
        offset = end;
    }

    let mut current: Vec<usize> = Vec::new(); // indexes into `lines`
    let mut current_tokens = 0usize;

    let finalize = |chunks: &mut Chunks, members: &[usize], lines: &[Line<'_>]| {
        let start = lines[members[0]].start;
        let end = lines[*members.last().expect("non-empty chunk")].end;
        let body: String = members.iter().map(|&i| lines[i].text).collect();
        chunks.push((ChunkBounds::new(start, end), body));
    };

    for idx in 0..lines.len() {
        let line_tokens = lines[idx].tokens;

        if !current.is_empty() && current_tokens + line_tokens > strategy.soft_limit_tokens {
            finalize(&mut chunks, &current, &lines);
            if let Some(max) = strategy.max_chunks {
                if chunks.len() >= max {
                    return chunks;
                }
            }

            // Replay whole tail lines until the overlap budget is met.
            let target_overlap = (current_tokens as f64 * strategy.overlap_ratio) as usize;
            let mut overlap: Vec<usize> = Vec::new();
            let mut overlap_tokens = 0usize;
            if target_overlap > 0 {
                for &prev in current.iter().rev() {
                    overlap.push(prev);
                    overlap_tokens += lines[prev].tokens;
                    if overlap_tokens >= target_overlap {
                        break;
                    }
                }
                overlap.reverse();
            }

            current = overlap;
            current_tokens = overlap_tokens;
        }

        current.push(idx);
        current_tokens += line_tokens;
    }

    if !current.is_empty() {
        finalize(&mut chunks, &current, &lines);
    }

    chunks
}

/// Chunk on the blocking pool when the text is large enough for the
/// CPU-bound scan to matter; inline otherwise.
pub async fn chunk_text_offloaded(
    text: String,
    counter: Arc<dyn TokenCounter>,
    strategy: ChunkingStrategy,
) -> Result<Chunks> {
    if text.len() < OFFLOAD_THRESHOLD_BYTES {
        return Ok(chunk_text(&text, counter.as_ref(), &strategy));
    }

    tokio::task::spawn_blocking(move || chunk_text(&text, counter.as_ref(), &strategy))
        .await
        .map_err(|e| KilnError::Internal(format!("chunking task failed: {e}")))
}
