//! Read-only concept catalogs.
//!
//! The ontology is loaded once at startup and shared by reference. Each
//! concept field (certificates, industries, process capabilities, material
//! capabilities) has its own catalog of known concepts; a concept matches on
//! its preferred label or any alternative label, case-insensitively on the
//! normalized form.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::custom_id::FieldName;
use crate::error::Result;

/// A known concept: a preferred label plus alternative labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    #[serde(default)]
    pub alt_labels: Vec<String>,
}

impl Concept {
    /// Every label this concept matches on, preferred label first.
    pub fn match_labels(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.alt_labels.iter().map(|s| s.as_str()))
    }
}

/// Lowercased, whitespace-collapsed form used for all label comparison.
pub fn normalize_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// The catalog of known concepts for one concept field.
#[derive(Debug, Clone)]
pub struct ConceptCatalog {
    concepts: Vec<Concept>,
    /// normalized label (preferred or alternative) -> index into `concepts`
    label_index: HashMap<String, usize>,
}

impl ConceptCatalog {
    pub fn new(concepts: Vec<Concept>) -> Self {
        let mut label_index = HashMap::new();
        for (idx, concept) in concepts.iter().enumerate() {
            for label in concept.match_labels() {
                // First concept wins on label collisions.
                label_index.entry(normalize_label(label)).or_insert(idx);
            }
        }
        Self {
            concepts,
            label_index,
        }
    }

    pub fn concepts(&self) -> &[Concept] {
        &self.concepts
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }

    /// Resolve a label (preferred or alternative, any casing) to its concept.
    pub fn concept_for_label(&self, label: &str) -> Option<&Concept> {
        self.label_index
            .get(&normalize_label(label))
            .map(|&idx| &self.concepts[idx])
    }

    /// Whether `name` is the preferred label of a known concept.
    pub fn contains_name(&self, name: &str) -> bool {
        self.concept_for_label(name)
            .is_some_and(|c| normalize_label(&c.name) == normalize_label(name))
    }

    /// Preferred labels of all known concepts, for the mapping prompt context.
    pub fn known_names(&self) -> Vec<&str> {
        self.concepts.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Literal occurrence scan: the names of every concept with at least one
/// label appearing in `text` as a whole word, case-insensitively.
pub fn brute_search(text: &str, catalog: &ConceptCatalog) -> BTreeSet<String> {
    let haystack = text.to_lowercase();
    let mut found = BTreeSet::new();

    for concept in catalog.concepts() {
        let hit = concept.match_labels().any(|label| {
            let needle = normalize_label(label);
            !needle.is_empty() && contains_word(&haystack, &needle)
        });
        if hit {
            found.insert(concept.name.clone());
        }
    }

    found
}

/// Whole-word containment: an occurrence whose neighbors are not
/// alphanumeric. `haystack` must already be lowercased.
fn contains_word(haystack: &str, needle: &str) -> bool {
    let mut search_from = 0;
    while let Some(pos) = haystack[search_from..].find(needle) {
        let start = search_from + pos;
        let end = start + needle.len();

        let ok_before = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let ok_after = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if ok_before && ok_after {
            return true;
        }

        search_from = start + needle.len().max(1);
        if search_from >= haystack.len() {
            break;
        }
    }
    false
}

/// All four concept catalogs under one version id.
#[derive(Debug, Clone)]
pub struct Ontology {
    pub version_id: String,
    pub certificates: ConceptCatalog,
    pub industries: ConceptCatalog,
    pub process_caps: ConceptCatalog,
    pub material_caps: ConceptCatalog,
}

#[derive(Debug, Serialize, Deserialize)]
struct OntologyFile {
    version_id: String,
    #[serde(default)]
    certificates: Vec<Concept>,
    #[serde(default)]
    industries: Vec<Concept>,
    #[serde(default)]
    process_caps: Vec<Concept>,
    #[serde(default)]
    material_caps: Vec<Concept>,
}

impl Ontology {
    pub fn new(
        version_id: impl Into<String>,
        certificates: Vec<Concept>,
        industries: Vec<Concept>,
        process_caps: Vec<Concept>,
        material_caps: Vec<Concept>,
    ) -> Self {
        Self {
            version_id: version_id.into(),
            certificates: ConceptCatalog::new(certificates),
            industries: ConceptCatalog::new(industries),
            process_caps: ConceptCatalog::new(process_caps),
            material_caps: ConceptCatalog::new(material_caps),
        }
    }

    /// Load from the JSON form produced by the ontology export.
    pub async fn load(path: &Path) -> Result<Arc<Self>> {
        let raw = tokio::fs::read_to_string(path).await?;
        let file: OntologyFile = serde_json::from_str(&raw)?;
        Ok(Arc::new(Self::new(
            file.version_id,
            file.certificates,
            file.industries,
            file.process_caps,
            file.material_caps,
        )))
    }

    /// The catalog backing a concept field; `None` for non-concept fields.
    pub fn catalog_for(&self, field: FieldName) -> Option<&ConceptCatalog> {
        match field {
            FieldName::Certificates => Some(&self.certificates),
            FieldName::Industries => Some(&self.industries),
            FieldName::ProcessCaps => Some(&self.process_caps),
            FieldName::MaterialCaps => Some(&self.material_caps),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ConceptCatalog {
        ConceptCatalog::new(vec![
            Concept {
                name: "CNC Machining".to_string(),
                alt_labels: vec!["cnc milling".to_string()],
            },
            Concept {
                name: "ISO 9001".to_string(),
                alt_labels: vec![],
            },
            Concept {
                name: "Welding".to_string(),
                alt_labels: vec!["MIG welding".to_string(), "TIG welding".to_string()],
            },
        ])
    }

    #[test]
    fn brute_search_matches_whole_words_case_insensitively() {
        let text = "We offer CNC machining and tig WELDING services.\nCertified to ISO 9001.";
        let found = brute_search(text, &catalog());
        assert_eq!(
            found,
            BTreeSet::from([
                "CNC Machining".to_string(),
                "ISO 9001".to_string(),
                "Welding".to_string(),
            ])
        );
    }

    #[test]
    fn brute_search_rejects_partial_word_hits() {
        let cat = ConceptCatalog::new(vec![Concept {
            name: "weld".to_string(),
            alt_labels: vec![],
        }]);
        assert!(brute_search("we provide welding", &cat).is_empty());
        assert!(!brute_search("we weld steel", &cat).is_empty());
    }

    #[test]
    fn labels_resolve_to_their_concept() {
        let cat = catalog();
        assert_eq!(
            cat.concept_for_label("mig welding").map(|c| c.name.as_str()),
            Some("Welding")
        );
        assert_eq!(
            cat.concept_for_label("CNC   Milling").map(|c| c.name.as_str()),
            Some("CNC Machining")
        );
        assert!(cat.concept_for_label("forging").is_none());
    }

    #[test]
    fn contains_name_only_accepts_preferred_labels() {
        let cat = catalog();
        assert!(cat.contains_name("Welding"));
        assert!(cat.contains_name("iso 9001"));
        assert!(!cat.contains_name("MIG welding"));
    }

    #[test]
    fn catalog_for_covers_exactly_the_concept_fields() {
        let ontology = Ontology::new("v1", vec![], vec![], vec![], vec![]);
        for field in FieldName::ORDERED {
            let expected = matches!(
                field,
                FieldName::Certificates
                    | FieldName::Industries
                    | FieldName::ProcessCaps
                    | FieldName::MaterialCaps
            );
            assert_eq!(ontology.catalog_for(field).is_some(), expected);
        }
    }
}
