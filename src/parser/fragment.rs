use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;
use url::Url;

use super::title::TitleGrammar;
use crate::model::{CandidateRecord, RawFragment};

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"title="([^"]+)""#).unwrap());
static SRC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"src="([^"]+)""#).unwrap());

/// Turns one raw fragment into a candidate record.
pub struct RecordExtractor {
    grammar: TitleGrammar,
    image_base: Option<Url>,
}

impl RecordExtractor {
    pub fn new(grammar: TitleGrammar, image_base: Option<&str>) -> Result<Self> {
        let image_base = image_base
            .map(|b| Url::parse(b).with_context(|| format!("invalid image base URL {}", b)))
            .transpose()?;
        Ok(Self {
            grammar,
            image_base,
        })
    }

    /// `None` when the fragment carries neither a title nor an image reference.
    pub fn extract(&self, fragment: &RawFragment) -> Option<CandidateRecord> {
        let title = attribute(&TITLE_RE, &fragment.markup).map(|t| decode_entities(&t));
        let image_ref = attribute(&SRC_RE, &fragment.markup).map(|s| self.resolve_image(&s));

        if title.is_none() && image_ref.is_none() {
            debug!("Unextractable fragment in {}: {:.80}", fragment.batch, fragment.markup);
            return None;
        }

        let (identifier, name) = match title {
            Some(t) => {
                let parsed = self.grammar.parse(&t);
                (non_empty(parsed.identifier), non_empty(parsed.name))
            }
            None => (None, None),
        };

        Some(CandidateRecord {
            identifier,
            name,
            image_ref,
            source_batch: fragment.batch.clone(),
        })
    }

    fn resolve_image(&self, src: &str) -> String {
        if Url::parse(src).is_ok() {
            return src.to_string();
        }
        self.image_base
            .as_ref()
            .and_then(|base| base.join(src).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| src.to_string())
    }
}

fn attribute(re: &Regex, markup: &str) -> Option<String> {
    re.captures(markup)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Decode the HTML entities that show up in attribute values.
pub fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractSettings;

    fn extractor() -> RecordExtractor {
        let settings = ExtractSettings::default();
        let grammar = TitleGrammar::new(&settings).unwrap();
        RecordExtractor::new(grammar, settings.image_base_url.as_deref()).unwrap()
    }

    fn frag(markup: &str) -> RawFragment {
        RawFragment::new(markup, "pass-1")
    }

    #[test]
    fn full_fragment() {
        let c = extractor()
            .extract(&frag(r#"<img src="pictures/773_ident.jpg" title="No. 773 Hudson Steam Locomotive">"#))
            .unwrap();
        assert_eq!(c.identifier.as_deref(), Some("773"));
        assert_eq!(c.name.as_deref(), Some("Hudson Steam Locomotive"));
        assert_eq!(
            c.image_ref.as_deref(),
            Some("https://www.tandem-associates.com/lionel/pictures/773_ident.jpg")
        );
        assert_eq!(c.source_batch, "pass-1");
    }

    #[test]
    fn absolute_src_untouched() {
        let c = extractor()
            .extract(&frag(r#"<img src="https://cdn.example.com/a.gif" title="Hudson No. 773">"#))
            .unwrap();
        assert_eq!(c.image_ref.as_deref(), Some("https://cdn.example.com/a.gif"));
    }

    #[test]
    fn image_only_fragment_has_no_identity() {
        let c = extractor().extract(&frag(r#"<img src="pictures/x_ident.gif">"#)).unwrap();
        assert!(c.identifier.is_none());
        assert!(c.name.is_none());
        assert!(c.image_ref.is_some());
    }

    #[test]
    fn nothing_to_extract() {
        assert!(extractor().extract(&frag("<img alt=\"spacer\">")).is_none());
        assert!(extractor().extract(&frag("")).is_none());
    }

    #[test]
    fn title_without_marker() {
        let c = extractor()
            .extract(&frag(r#"<img src="a.gif" title="Operating Milk Car">"#))
            .unwrap();
        assert!(c.identifier.is_none());
        assert_eq!(c.name.as_deref(), Some("Operating Milk Car"));
    }

    #[test]
    fn unparsable_image_base_is_an_error() {
        let settings = ExtractSettings {
            image_base_url: Some("tandem-associates.com/lionel/".into()),
            ..ExtractSettings::default()
        };
        let grammar = TitleGrammar::new(&settings).unwrap();
        assert!(RecordExtractor::new(grammar, settings.image_base_url.as_deref()).is_err());
        assert!(crate::parser::build_extractor(&settings).is_err());
    }

    #[test]
    fn entities_decoded() {
        let c = extractor()
            .extract(&frag(r#"<img src="a.gif" title="No. 2343 Santa Fe F3 A&amp;B">"#))
            .unwrap();
        assert_eq!(c.name.as_deref(), Some("Santa Fe F3 A&B"));
    }
}
