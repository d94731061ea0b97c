//! Deferred per-manufacturer extraction state.
//!
//! A deferred manufacturer exists while any result field is unresolved. It
//! is keyed by `(etld1, text_version_id)`, binding all derived work to one
//! immutable text snapshot. Each unresolved field carries a sub-document
//! describing the requests that must complete before the field can be
//! materialized; a sub-document exists iff the manufacturer's field is null.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::custom_id::{CustomId, FieldName};

/// Per-field deferred state. The discriminator dispatches to the field
/// family's materializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferredField {
    Binary(DeferredBinary),
    Basic(DeferredBasic),
    Keyword(DeferredKeyword),
    Concept(DeferredConcept),
}

/// Binary classification: exactly one chunk request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredBinary {
    pub prompt_version_id: String,
    /// Which chunk was consulted
    pub final_chunk_key: String,
    /// chunk key -> request id (a single entry for binary fields)
    pub chunk_request_ids: BTreeMap<String, CustomId>,
}

/// Basic extraction: one request against the first chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredBasic {
    pub prompt_version_id: String,
    pub request_id: CustomId,
}

/// Keyword extraction: one request per chunk, no mapping stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredKeyword {
    pub extract_prompt_version_id: String,
    pub chunk_request_ids: BTreeMap<String, CustomId>,
}

/// Phase-1 state for one chunk of a concept field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptSearchBundle {
    pub search_request_id: CustomId,
    /// Concept names found in this chunk by the literal scan, captured at
    /// request-creation time so agreement can be computed later without the
    /// catalog walking the text again
    pub brute: BTreeSet<String>,
}

/// Two-stage concept extraction: per-chunk search bundles, then a single
/// mapping request created only after every search response is in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredConcept {
    pub extract_prompt_version_id: String,
    pub map_prompt_version_id: String,
    pub ontology_version_id: String,
    /// chunk key -> phase-1 bundle
    pub chunks: BTreeMap<String, ConceptSearchBundle>,
    pub mapping_request_id: Option<CustomId>,
}

impl DeferredField {
    /// Every request id this sub-document references. Packing and replay
    /// both operate on this set.
    pub fn referenced_custom_ids(&self) -> Vec<CustomId> {
        match self {
            DeferredField::Binary(b) => b.chunk_request_ids.values().cloned().collect(),
            DeferredField::Basic(b) => vec![b.request_id.clone()],
            DeferredField::Keyword(k) => k.chunk_request_ids.values().cloned().collect(),
            DeferredField::Concept(c) => {
                let mut ids: Vec<CustomId> = c
                    .chunks
                    .values()
                    .map(|bundle| bundle.search_request_id.clone())
                    .collect();
                if let Some(mapping) = &c.mapping_request_id {
                    ids.push(mapping.clone());
                }
                ids
            }
        }
    }
}

/// The deferred document for one `(etld1, text_version_id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredManufacturer {
    pub etld1: String,
    pub text_version_id: String,
    pub created_at: DateTime<Utc>,
    /// Sub-documents for the fields still unresolved on the manufacturer
    pub fields: BTreeMap<FieldName, DeferredField>,
}

impl DeferredManufacturer {
    pub fn new(
        etld1: impl Into<String>,
        text_version_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            etld1: etld1.into(),
            text_version_id: text_version_id.into(),
            created_at,
            fields: BTreeMap::new(),
        }
    }

    /// All request ids referenced across every sub-document.
    pub fn referenced_custom_ids(&self) -> Vec<CustomId> {
        self.fields
            .values()
            .flat_map(|f| f.referenced_custom_ids())
            .collect()
    }

    /// No unresolved fields remain; the document can be deleted.
    pub fn is_finalized(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_id::{ChunkBounds, RequestKind};

    fn cid(field: FieldName, kind: RequestKind, start: usize, end: usize) -> CustomId {
        CustomId::new("acme.example", field, kind, ChunkBounds::new(start, end))
    }

    #[test]
    fn referenced_ids_cover_both_concept_stages() {
        let mut chunks = BTreeMap::new();
        chunks.insert(
            "0:100".to_string(),
            ConceptSearchBundle {
                search_request_id: cid(FieldName::Certificates, RequestKind::LlmSearch, 0, 100),
                brute: BTreeSet::from(["ISO 9001".to_string()]),
            },
        );
        chunks.insert(
            "100:200".to_string(),
            ConceptSearchBundle {
                search_request_id: cid(FieldName::Certificates, RequestKind::LlmSearch, 100, 200),
                brute: BTreeSet::new(),
            },
        );

        let mut concept = DeferredConcept {
            extract_prompt_version_id: "p1".to_string(),
            map_prompt_version_id: "m1".to_string(),
            ontology_version_id: "o1".to_string(),
            chunks,
            mapping_request_id: None,
        };

        let field = DeferredField::Concept(concept.clone());
        assert_eq!(field.referenced_custom_ids().len(), 2);

        concept.mapping_request_id =
            Some(cid(FieldName::Certificates, RequestKind::Mapping, 0, 200));
        let field = DeferredField::Concept(concept);
        assert_eq!(field.referenced_custom_ids().len(), 3);
    }

    #[test]
    fn document_aggregates_ids_across_fields() {
        let mut doc = DeferredManufacturer::new("acme.example", "v1", Utc::now());
        doc.fields.insert(
            FieldName::IsManufacturer,
            DeferredField::Binary(DeferredBinary {
                prompt_version_id: "p1".to_string(),
                final_chunk_key: "0:100".to_string(),
                chunk_request_ids: BTreeMap::from([(
                    "0:100".to_string(),
                    cid(FieldName::IsManufacturer, RequestKind::Chunk, 0, 100),
                )]),
            }),
        );
        doc.fields.insert(
            FieldName::Addresses,
            DeferredField::Basic(DeferredBasic {
                prompt_version_id: "p2".to_string(),
                request_id: cid(FieldName::Addresses, RequestKind::Chunk, 0, 100),
            }),
        );

        assert_eq!(doc.referenced_custom_ids().len(), 2);
        assert!(!doc.is_finalized());

        doc.fields.clear();
        assert!(doc.is_finalized());
    }

    #[test]
    fn deferred_field_serializes_with_kind_discriminator() {
        let field = DeferredField::Basic(DeferredBasic {
            prompt_version_id: "p1".to_string(),
            request_id: cid(FieldName::BusinessDesc, RequestKind::Chunk, 0, 50),
        });
        let value = serde_json::to_value(&field).unwrap();
        assert_eq!(value["kind"].as_str(), Some("basic"));

        let back: DeferredField = serde_json::from_value(value).unwrap();
        assert_eq!(back, field);
    }
}
