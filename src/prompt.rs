//! Read-only versioned prompt catalog.
//!
//! Prompts are versioned strings: a deferred sub-document pins the version
//! it was built with, and the replay path refuses to mix versions. The
//! catalog is loaded once and shared by reference.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chunk::TokenCounter;
use crate::custom_id::FieldName;
use crate::error::{KilnError, Result};

/// One versioned prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,
    pub version_id: String,
    /// Token count of `text`, consulted when sizing single-chunk requests.
    pub num_tokens: usize,
}

impl Prompt {
    pub fn new(text: impl Into<String>, version_id: impl Into<String>, counter: &dyn TokenCounter) -> Self {
        let text = text.into();
        let num_tokens = counter.count(&text);
        Self {
            text,
            version_id: version_id.into(),
            num_tokens,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PromptFileEntry {
    text: String,
    version_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PromptFile {
    extraction: HashMap<String, PromptFileEntry>,
    mapping: HashMap<String, PromptFileEntry>,
}

/// The full prompt catalog: one extraction prompt per field, plus one
/// mapping prompt per concept field.
#[derive(Debug, Clone)]
pub struct PromptCatalog {
    extraction: HashMap<FieldName, Prompt>,
    mapping: HashMap<FieldName, Prompt>,
}

impl PromptCatalog {
    /// Built-in prompts. Production runs load the curated catalog with
    /// [`PromptCatalog::load`]; these keep tests and local runs hermetic.
    pub fn builtin(counter: &dyn TokenCounter) -> Arc<Self> {
        let mut extraction = HashMap::new();
        let mut mapping = HashMap::new();

        let texts: [(FieldName, &str); 10] = [
            (
                FieldName::IsManufacturer,
                "Decide whether the company behind this website text is a manufacturer. \
                 Respond with JSON: {\"answer\": bool, \"confidence\": 0..1, \"reason\": string}.",
            ),
            (
                FieldName::IsContractManufacturer,
                "Decide whether this company manufactures goods under contract for other firms. \
                 Respond with JSON: {\"answer\": bool, \"confidence\": 0..1, \"reason\": string}.",
            ),
            (
                FieldName::IsProductManufacturer,
                "Decide whether this company manufactures and sells its own products. \
                 Respond with JSON: {\"answer\": bool, \"confidence\": 0..1, \"reason\": string}.",
            ),
            (
                FieldName::Addresses,
                "Extract every postal address of this company from the text. Respond with a JSON \
                 array of {\"street\", \"city\", \"region\", \"postal_code\", \"country\", \
                 \"latitude\", \"longitude\"} records.",
            ),
            (
                FieldName::BusinessDesc,
                "Summarise this company. Respond with JSON: {\"name\": string, \"description\": string}.",
            ),
            (
                FieldName::Products,
                "List the products this company makes, as a JSON array of short strings.",
            ),
            (
                FieldName::Certificates,
                "List every certification or standard this text claims compliance with, as a JSON \
                 array of strings.",
            ),
            (
                FieldName::Industries,
                "List the industries this company serves, as a JSON array of strings.",
            ),
            (
                FieldName::ProcessCaps,
                "List the manufacturing processes this company can perform, as a JSON array of strings.",
            ),
            (
                FieldName::MaterialCaps,
                "List the materials this company can work with, as a JSON array of strings.",
            ),
        ];
        for (field, text) in texts {
            extraction.insert(
                field,
                Prompt::new(text, format!("builtin-{}-1", field.as_str()), counter),
            );
        }

        let map_text = "Map each unknown label to the closest known label, or null when none \
                        applies. Respond with a JSON object {unknown_label: known_label_or_null}.";
        for field in [
            FieldName::Certificates,
            FieldName::Industries,
            FieldName::ProcessCaps,
            FieldName::MaterialCaps,
        ] {
            mapping.insert(
                field,
                Prompt::new(
                    map_text,
                    format!("builtin-{}-map-1", field.as_str()),
                    counter,
                ),
            );
        }

        Arc::new(Self {
            extraction,
            mapping,
        })
    }

    /// Load a curated catalog from its JSON export.
    pub async fn load(path: &Path, counter: &dyn TokenCounter) -> Result<Arc<Self>> {
        let raw = tokio::fs::read_to_string(path).await?;
        let file: PromptFile = serde_json::from_str(&raw)?;

        let mut extraction = HashMap::new();
        let mut mapping = HashMap::new();
        for field in FieldName::ORDERED {
            let entry = file.extraction.get(field.as_str()).ok_or_else(|| {
                KilnError::Internal(format!("prompt catalog missing extraction prompt: {field}"))
            })?;
            extraction.insert(field, Prompt::new(&entry.text, &entry.version_id, counter));

            if field.family() == crate::custom_id::FieldFamily::Concept {
                let entry = file.mapping.get(field.as_str()).ok_or_else(|| {
                    KilnError::Internal(format!("prompt catalog missing mapping prompt: {field}"))
                })?;
                mapping.insert(field, Prompt::new(&entry.text, &entry.version_id, counter));
            }
        }

        Ok(Arc::new(Self {
            extraction,
            mapping,
        }))
    }

    /// The extraction (or phase-1 search) prompt for a field.
    pub fn extraction(&self, field: FieldName) -> &Prompt {
        &self.extraction[&field]
    }

    /// The phase-2 mapping prompt; `None` for non-concept fields.
    pub fn mapping(&self, field: FieldName) -> Option<&Prompt> {
        self.mapping.get(&field)
    }
}
