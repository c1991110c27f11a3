pub mod fragment;
pub mod index;
pub mod title;

use anyhow::Result;

use crate::config::ExtractSettings;
use fragment::RecordExtractor;
use title::TitleGrammar;

/// Extractor wired with the configured title grammar and image base URL.
pub fn build_extractor(settings: &ExtractSettings) -> Result<RecordExtractor> {
    let grammar = TitleGrammar::new(settings)?;
    RecordExtractor::new(grammar, settings.image_base_url.as_deref())
}
