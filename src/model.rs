use rust_decimal::Decimal;
use serde::Serialize;

/// One unit of raw markup believed to describe a single catalog item.
#[derive(Debug, Clone)]
pub struct RawFragment {
    pub markup: String,
    pub batch: String,
}

impl RawFragment {
    pub fn new(markup: impl Into<String>, batch: impl Into<String>) -> Self {
        Self {
            markup: markup.into(),
            batch: batch.into(),
        }
    }
}

/// Fragments sharing one source tag, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub tag: String,
    pub fragments: Vec<RawFragment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRecord {
    pub identifier: Option<String>,
    pub name: Option<String>,
    pub image_ref: Option<String>,
    pub source_batch: String,
}

/// A candidate whose identifier and name are both non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedRecord {
    pub identifier: String,
    pub name: String,
    pub image_ref: String,
    pub source_batch: String,
}

impl AdmittedRecord {
    pub fn composite(&self) -> String {
        composite_key(&self.identifier, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub identifier: String,
    pub name: String,
    pub image_ref: String,
    pub enriched_image_url: Option<String>,
    pub price_estimate: Option<Decimal>,
}

impl CanonicalRecord {
    pub fn composite(&self) -> String {
        composite_key(&self.identifier, &self.name)
    }

    pub fn is_enriched(&self) -> bool {
        self.enriched_image_url.is_some() || self.price_estimate.is_some()
    }
}

impl From<AdmittedRecord> for CanonicalRecord {
    fn from(r: AdmittedRecord) -> Self {
        Self {
            identifier: r.identifier,
            name: r.name,
            image_ref: r.image_ref,
            enriched_image_url: None,
            price_estimate: None,
        }
    }
}

/// Outcome of resolving two admitted records that share an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    KeepFirst,
    KeepSecond,
    KeepBothRenamed(String),
    Skip,
}

impl ConflictDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KeepFirst => "keep_first",
            Self::KeepSecond => "keep_second",
            Self::KeepBothRenamed(_) => "keep_both_renamed",
            Self::Skip => "skip",
        }
    }
}

pub fn composite_key(identifier: &str, name: &str) -> String {
    format!("{} {}", identifier, name)
}
