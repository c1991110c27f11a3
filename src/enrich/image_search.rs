use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::USER_AGENT;

use super::ImageSearch;
use crate::error::LookupError;

static IMG_SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<img\b[^>]*?\bsrc="(https?://[^"]+)""#).unwrap());

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

/// Scrapes the first result of a web image search.
pub struct WebImageSearch {
    client: reqwest::Client,
    search_url: String,
}

impl WebImageSearch {
    pub fn new(search_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            search_url: search_url.to_string(),
        })
    }
}

#[async_trait]
impl ImageSearch for WebImageSearch {
    async fn search(&self, query: &str) -> Result<String, LookupError> {
        let ua = USER_AGENTS[fastrand::usize(..USER_AGENTS.len())];
        let resp = self
            .client
            .get(&self.search_url)
            .query(&[("q", query)])
            .header(USER_AGENT, ua)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(LookupError::from_status(status));
        }

        let html = resp.text().await?;
        first_image(&html)
            .ok_or_else(|| LookupError::Transient(format!("no image results for '{}'", query)))
    }
}

fn first_image(html: &str) -> Option<String> {
    IMG_SRC_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().replace("&amp;", "&"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_absolute_image() {
        let html = r#"<img src="data:image/gif;base64,R0lGOD"><img class="rg_i" alt="x" src="https://encrypted-tbn0.gstatic.com/images?q=tbn:abc&amp;s=1"><img src="https://b"/>"#;
        assert_eq!(
            first_image(html).as_deref(),
            Some("https://encrypted-tbn0.gstatic.com/images?q=tbn:abc&s=1")
        );
    }

    #[test]
    fn no_images() {
        assert!(first_image("<div>nothing</div>").is_none());
        assert!(first_image(r#"<img src="/relative.png">"#).is_none());
    }
}
