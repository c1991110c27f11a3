use anyhow::Result;
use regex::Regex;

use crate::config::ExtractSettings;

/// Title split into its catalog identifier and display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTitle {
    pub identifier: String,
    pub name: String,
}

/// Splits titles of the form `No. 773 Hudson` or `Hudson No. 773`.
#[derive(Debug, Clone)]
pub struct TitleGrammar {
    marker_re: Regex,
    boilerplate: Vec<String>,
}

impl TitleGrammar {
    pub fn new(settings: &ExtractSettings) -> Result<Self> {
        let marker_re = Regex::new(&format!(r"{}\s+(\S+)", regex::escape(&settings.marker)))?;
        Ok(Self {
            marker_re,
            boilerplate: settings.boilerplate.clone(),
        })
    }

    pub fn parse(&self, title: &str) -> ParsedTitle {
        let title = title.trim();
        let Some(caps) = self.marker_re.captures(title) else {
            return ParsedTitle {
                identifier: String::new(),
                name: self.strip_boilerplate(title),
            };
        };
        let (Some(whole), Some(token)) = (caps.get(0), caps.get(1)) else {
            return ParsedTitle {
                identifier: String::new(),
                name: self.strip_boilerplate(title),
            };
        };

        let name = if whole.start() == 0 {
            &title[whole.end()..]
        } else {
            &title[..whole.start()]
        };

        ParsedTitle {
            identifier: token.as_str().to_string(),
            name: self.strip_boilerplate(name),
        }
    }

    fn strip_boilerplate(&self, name: &str) -> String {
        let mut out = name.to_string();
        let mut stripped = false;
        for word in &self.boilerplate {
            if out.contains(word.as_str()) {
                out = out.replace(word.as_str(), "");
                stripped = true;
            }
        }
        if stripped {
            out.split_whitespace().collect::<Vec<_>>().join(" ")
        } else {
            out.trim().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grammar() -> TitleGrammar {
        TitleGrammar::new(&ExtractSettings::default()).unwrap()
    }

    #[test]
    fn marker_at_start() {
        let p = grammar().parse("No. 773 Hudson Steam Locomotive");
        assert_eq!(p.identifier, "773");
        assert_eq!(p.name, "Hudson Steam Locomotive");
    }

    #[test]
    fn marker_after_name() {
        let p = grammar().parse("Hudson Steam Locomotive No. 773");
        assert_eq!(p.identifier, "773");
        assert_eq!(p.name, "Hudson Steam Locomotive");
    }

    #[test]
    fn marker_mid_title_drops_trailing_text() {
        let p = grammar().parse("Hudson No. 773 (1950 edition)");
        assert_eq!(p.identifier, "773");
        assert_eq!(p.name, "Hudson");
    }

    #[test]
    fn no_marker() {
        let p = grammar().parse("  Operating Milk Car  ");
        assert_eq!(p.identifier, "");
        assert_eq!(p.name, "Operating Milk Car");
    }

    #[test]
    fn marker_without_token_is_absent() {
        let p = grammar().parse("Catalog No.");
        assert_eq!(p.identifier, "");
        assert_eq!(p.name, "Catalog No.");
    }

    #[test]
    fn boilerplate_stripped() {
        let p = grammar().parse("Lionel Trains Hudson No. 773");
        assert_eq!(p.name, "Hudson");
        let p = grammar().parse("No. 2332 The Lionel GG1  Electric");
        assert_eq!(p.identifier, "2332");
        assert_eq!(p.name, "GG1 Electric");
    }

    #[test]
    fn identifier_keeps_punctuation() {
        let p = grammar().parse("No. 6464-1 Western Pacific Boxcar");
        assert_eq!(p.identifier, "6464-1");
        assert_eq!(p.name, "Western Pacific Boxcar");
    }

    #[test]
    fn zero_identifier_is_kept() {
        let p = grammar().parse("No. 0 Scale Figure");
        assert_eq!(p.identifier, "0");
    }

    #[test]
    fn custom_marker() {
        let settings = ExtractSettings {
            marker: "Cat#".into(),
            boilerplate: vec![],
            ..ExtractSettings::default()
        };
        let p = TitleGrammar::new(&settings).unwrap().parse("Cat# 12 Caboose");
        assert_eq!(p.identifier, "12");
        assert_eq!(p.name, "Caboose");
    }
}
