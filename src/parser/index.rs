use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use url::Url;

use super::fragment::decode_entities;

static CELL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<td\b([^>]*)>(.*?)</td>").unwrap());
static LEFT_ALIGN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)align\s*=\s*"?left"?"#).unwrap());
static IMG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());
static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?href\s*=\s*"([^"]*)"[^>]*>(.*?)</a>([^<]*)"#).unwrap()
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static SRC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"src="([^"]*)""#).unwrap());

/// An item page linked from the master index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLink {
    pub title: String,
    pub url: String,
}

/// Collect every link inside a table cell of the index page.
///
/// Text trailing an anchor (e.g. `<a>773</a> 1950`) is appended to the title
/// as `773-1950`.
pub fn extract_links(html: &str, base: &Url) -> Vec<IndexLink> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for cell in CELL_RE.captures_iter(html) {
        let body = &cell[2];
        for a in ANCHOR_RE.captures_iter(body) {
            let href = a[1].trim();
            if href.is_empty() || href.starts_with('#') || href.starts_with("mailto:") {
                continue;
            }
            let Ok(url) = base.join(href) else {
                continue;
            };
            let url = url.to_string();
            if !seen.insert(url.clone()) {
                continue;
            }

            let mut title = inner_text(&a[2]);
            let sibling = decode_entities(a[3].trim());
            if !sibling.is_empty() {
                title = format!("{}-{}", title, sibling);
            }
            links.push(IndexLink { title, url });
        }
    }

    links
}

/// `<img>` tags inside left-aligned table cells of an item page.
pub fn select_fragments(html: &str) -> Vec<String> {
    CELL_RE
        .captures_iter(html)
        .filter(|c| LEFT_ALIGN_RE.is_match(&c[1]))
        .flat_map(|c| {
            IMG_RE
                .find_iter(c.get(2).map_or("", |m| m.as_str()))
                .map(|m| m.as_str().to_string())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Keeps identification images only, and only the first fragment per `src`.
pub struct FragmentFilter {
    pattern: Regex,
    seen_srcs: HashSet<String>,
}

impl FragmentFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(&format!(r#"src="[^"]*{}""#, pattern))?,
            seen_srcs: HashSet::new(),
        })
    }

    pub fn admit(&mut self, fragment: &str) -> bool {
        if !self.pattern.is_match(fragment) {
            return false;
        }
        match SRC_RE.captures(fragment) {
            Some(c) => self.seen_srcs.insert(c[1].to_string()),
            None => false,
        }
    }
}

/// One fragment per non-blank line, run through `filter`. Returns the number
/// of fragments read and the ones kept.
pub fn filter_lines(text: &str, filter: &mut FragmentFilter) -> (usize, Vec<String>) {
    let mut read = 0;
    let kept: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .inspect(|_| read += 1)
        .filter(|l| filter.admit(l))
        .map(String::from)
        .collect();
    (read, kept)
}

fn inner_text(html: &str) -> String {
    let text = TAG_RE.replace_all(html, " ");
    decode_entities(&text.split_whitespace().collect::<Vec<_>>().join(" "))
}
