//! Deterministic request naming.
//!
//! Every prompt request in the system is globally named by a custom id of
//! the form `etld1>field[>kind]>chunk>start:end`, where `start:end` are byte
//! offsets into the manufacturer's immutable scraped text. The id is the
//! sole cross-reference key between the deferred store, the request store,
//! and provider output files, and its lexicographic shape is what makes
//! prefix-ranged garbage collection possible.

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

/// The ten extraction fields, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    IsManufacturer,
    IsContractManufacturer,
    IsProductManufacturer,
    Addresses,
    BusinessDesc,
    Products,
    Certificates,
    Industries,
    ProcessCaps,
    MaterialCaps,
}

/// Which family of extraction a field belongs to. The family decides the
/// shape of the deferred sub-document and the materialization function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFamily {
    /// Single yes/no classification against the first chunk
    Binary,
    /// Single free-form extraction against the first chunk
    Basic,
    /// One extraction request per chunk, results unioned
    Keyword,
    /// Two stages: per-chunk LLM search, then one mapping request
    Concept,
}

impl FieldName {
    /// All fields in the order the orchestrator visits them.
    pub const ORDERED: [FieldName; 10] = [
        FieldName::IsManufacturer,
        FieldName::IsContractManufacturer,
        FieldName::IsProductManufacturer,
        FieldName::Addresses,
        FieldName::BusinessDesc,
        FieldName::Products,
        FieldName::Certificates,
        FieldName::Industries,
        FieldName::ProcessCaps,
        FieldName::MaterialCaps,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::IsManufacturer => "is_manufacturer",
            FieldName::IsContractManufacturer => "is_contract_manufacturer",
            FieldName::IsProductManufacturer => "is_product_manufacturer",
            FieldName::Addresses => "addresses",
            FieldName::BusinessDesc => "business_desc",
            FieldName::Products => "products",
            FieldName::Certificates => "certificates",
            FieldName::Industries => "industries",
            FieldName::ProcessCaps => "process_caps",
            FieldName::MaterialCaps => "material_caps",
        }
    }

    pub fn parse(s: &str) -> Option<FieldName> {
        Some(match s {
            "is_manufacturer" => FieldName::IsManufacturer,
            "is_contract_manufacturer" => FieldName::IsContractManufacturer,
            "is_product_manufacturer" => FieldName::IsProductManufacturer,
            "addresses" => FieldName::Addresses,
            "business_desc" => FieldName::BusinessDesc,
            "products" => FieldName::Products,
            "certificates" => FieldName::Certificates,
            "industries" => FieldName::Industries,
            "process_caps" => FieldName::ProcessCaps,
            "material_caps" => FieldName::MaterialCaps,
            _ => return None,
        })
    }

    pub fn family(&self) -> FieldFamily {
        match self {
            FieldName::IsManufacturer
            | FieldName::IsContractManufacturer
            | FieldName::IsProductManufacturer => FieldFamily::Binary,
            FieldName::Addresses | FieldName::BusinessDesc => FieldFamily::Basic,
            FieldName::Products => FieldFamily::Keyword,
            FieldName::Certificates
            | FieldName::Industries
            | FieldName::ProcessCaps
            | FieldName::MaterialCaps => FieldFamily::Concept,
        }
    }
}

impl std::fmt::Display for FieldName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a request does for its field. Plain chunk requests carry no marker
/// segment; the two concept stages are tagged explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Chunk,
    LlmSearch,
    Mapping,
}

/// Byte-offset bounds of a chunk within the scraped text, the `start:end`
/// tail of every custom id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkBounds {
    pub start: usize,
    pub end: usize,
}

impl ChunkBounds {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once(':')
            .ok_or_else(|| KilnError::InvalidCustomId(format!("bad chunk bounds: {s}")))?;
        let start = start
            .parse::<usize>()
            .map_err(|_| KilnError::InvalidCustomId(format!("bad chunk start: {s}")))?;
        let end = end
            .parse::<usize>()
            .map_err(|_| KilnError::InvalidCustomId(format!("bad chunk end: {s}")))?;
        Ok(Self { start, end })
    }

    /// Recover the chunk substring from the original text.
    pub fn slice<'t>(&self, text: &'t str) -> Option<&'t str> {
        text.get(self.start..self.end)
    }
}

impl std::fmt::Display for ChunkBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

/// A fully formed custom id. Stored and transmitted as its string form; the
/// parsed form exists so callers can recover the field and chunk without
/// string surgery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomId(String);

impl CustomId {
    pub fn new(etld1: &str, field: FieldName, kind: RequestKind, bounds: ChunkBounds) -> Self {
        let id = match kind {
            RequestKind::Chunk => format!("{etld1}>{field}>chunk>{bounds}"),
            RequestKind::LlmSearch => format!("{etld1}>{field}>llm_search>chunk>{bounds}"),
            RequestKind::Mapping => format!("{etld1}>{field}>mapping>chunk>{bounds}"),
        };
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The etld1 segment, available without a full parse. Ingestion uses
    /// this to group output lines by manufacturer.
    pub fn etld1(&self) -> &str {
        self.0.split('>').next().unwrap_or(&self.0)
    }

    /// Decode back into `(etld1, field, kind, bounds)`. Total over every id
    /// this crate produces.
    pub fn decode(&self) -> Result<DecodedId<'_>> {
        let parts: Vec<&str> = self.0.split('>').collect();
        let bad = || KilnError::InvalidCustomId(self.0.clone());

        let (etld1, field_str, kind, bounds_str) = match parts.as_slice() {
            [etld1, field, "chunk", bounds] => (*etld1, *field, RequestKind::Chunk, *bounds),
            [etld1, field, "llm_search", "chunk", bounds] => {
                (*etld1, *field, RequestKind::LlmSearch, *bounds)
            }
            [etld1, field, "mapping", "chunk", bounds] => {
                (*etld1, *field, RequestKind::Mapping, *bounds)
            }
            _ => return Err(bad()),
        };

        let field = FieldName::parse(field_str).ok_or_else(bad)?;
        let bounds = ChunkBounds::parse(bounds_str)?;
        Ok(DecodedId {
            etld1,
            field,
            kind,
            bounds,
        })
    }
}

impl std::fmt::Display for CustomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CustomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CustomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Borrowed view of a decoded custom id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedId<'a> {
    pub etld1: &'a str,
    pub field: FieldName,
    pub kind: RequestKind,
    pub bounds: ChunkBounds,
}

/// The lexicographic prefix covering every request of one field of one
/// manufacturer. `delete_by_prefix` range-scans `[prefix, prefix + MAX)`.
pub fn storage_prefix(etld1: &str, field: FieldName) -> String {
    format!("{etld1}>{field}>")
}
