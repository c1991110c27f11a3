use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::db;
use crate::error::FetchError;
use crate::parser::index::{self, FragmentFilter, IndexLink};
use crate::pipeline::progress_bar;

const CONCURRENCY: usize = 5;
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;

/// Returns rendered markup for a URL.
#[async_trait]
pub trait PageLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<String, FetchError>;
}

pub struct SpiderLoader {
    spider: Spider,
}

impl SpiderLoader {
    pub fn new(api_key: String) -> Result<Self, FetchError> {
        let spider =
            Spider::new(Some(api_key)).map_err(|e| FetchError::Unavailable(e.to_string()))?;
        Ok(Self { spider })
    }
}

#[async_trait]
impl PageLoader for SpiderLoader {
    async fn load(&self, url: &str) -> Result<String, FetchError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| FetchError::Failed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };

        parsed
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .filter(|c| !c.trim().is_empty())
            .map(String::from)
            .ok_or_else(|| FetchError::Empty {
                url: url.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScrapeOptions {
    pub concurrency: usize,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub show_progress: bool,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            concurrency: CONCURRENCY,
            max_retries: MAX_RETRIES,
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
            show_progress: true,
        }
    }
}

/// Scrape stats returned after completion.
#[derive(Debug, Default)]
pub struct ScrapeStats {
    pub pages: usize,
    pub ok: usize,
    pub errors: usize,
    pub selected: usize,
    pub stored: usize,
}

/// Load the index, then every linked item page concurrently. Fragments are
/// filtered and stored in index order so the batch is the same on every run.
pub async fn scrape_index(
    conn: &Connection,
    loader: Arc<dyn PageLoader>,
    index_url: &str,
    batch: &str,
    limit: Option<usize>,
    filter: &mut FragmentFilter,
    opts: ScrapeOptions,
) -> Result<ScrapeStats> {
    let base = Url::parse(index_url).with_context(|| format!("invalid index URL {}", index_url))?;
    info!("Loading index: {}", index_url);
    let html = load_with_retry(loader.as_ref(), index_url, &opts)
        .await
        .context("Failed to load index page")?;

    let mut links = index::extract_links(&html, &base);
    info!("Item pages on index: {}", links.len());
    if let Some(n) = limit {
        links.truncate(n);
    }

    let total = links.len();
    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let pb = progress_bar(total, opts.show_progress);

    let (tx, mut rx) =
        mpsc::channel::<(usize, IndexLink, Result<String, FetchError>)>(opts.concurrency.max(1) * 2);

    for (idx, link) in links.into_iter().enumerate() {
        let loader = Arc::clone(&loader);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            let result = load_with_retry(loader.as_ref(), &link.url, &opts).await;
            let _ = tx.send((idx, link, result)).await;
        });
    }
    drop(tx);

    let mut stats = ScrapeStats {
        pages: total,
        ..ScrapeStats::default()
    };
    let mut pending = BTreeMap::new();
    let mut next = 0usize;

    while let Some((idx, link, result)) = rx.recv().await {
        pb.inc(1);
        pending.insert(idx, (link, result));
        while let Some((link, result)) = pending.remove(&next) {
            next += 1;
            store_page(conn, batch, &link, result, filter, &mut stats)?;
        }
    }
    // Pages whose task never reported leave gaps; flush what arrived.
    for (_, (link, result)) in pending {
        store_page(conn, batch, &link, result, filter, &mut stats)?;
    }

    pb.finish_and_clear();
    info!(
        "Scraped {} pages ({} ok, {} errors); stored {}/{} fragments under '{}'",
        total, stats.ok, stats.errors, stats.stored, stats.selected, batch
    );
    Ok(stats)
}

fn store_page(
    conn: &Connection,
    batch: &str,
    link: &IndexLink,
    result: Result<String, FetchError>,
    filter: &mut FragmentFilter,
    stats: &mut ScrapeStats,
) -> Result<()> {
    let html = match result {
        Ok(html) => html,
        Err(e) => {
            warn!("Skipping {} ({}): {}", link.title, link.url, e);
            stats.errors += 1;
            return Ok(());
        }
    };
    stats.ok += 1;

    let selected = index::select_fragments(&html);
    stats.selected += selected.len();
    let kept: Vec<String> = selected.into_iter().filter(|f| filter.admit(f)).collect();
    debug!("{}: kept {} fragments", link.title, kept.len());
    stats.stored += db::insert_fragments(conn, batch, Some(&link.url), &kept)?;
    Ok(())
}

async fn load_with_retry(
    loader: &dyn PageLoader,
    url: &str,
    opts: &ScrapeOptions,
) -> Result<String, FetchError> {
    let mut attempt = 0u32;
    loop {
        match loader.load(url).await {
            Err(e) if e.is_retryable() && attempt < opts.max_retries => {
                let backoff = opts.base_backoff.saturating_mul(2u32.saturating_pow(attempt));
                warn!(
                    "Rate limited on {} (attempt {}/{}), backing off {:.1}s",
                    url,
                    attempt + 1,
                    opts.max_retries,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Serves fixed pages; the first `flaky` loads of each URL fail with 503.
    struct FakeLoader {
        pages: HashMap<String, String>,
        flaky: usize,
        calls: AtomicUsize,
        seen: std::sync::Mutex<HashMap<String, usize>>,
    }

    impl FakeLoader {
        fn new(pages: &[(&str, &str)], flaky: usize) -> Self {
            Self {
                pages: pages.iter().map(|(u, h)| (u.to_string(), h.to_string())).collect(),
                flaky,
                calls: AtomicUsize::new(0),
                seen: std::sync::Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl PageLoader for FakeLoader {
        async fn load(&self, url: &str) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = {
                let mut seen = self.seen.lock().unwrap();
                let n = seen.entry(url.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            if n <= self.flaky {
                return Err(FetchError::Failed {
                    url: url.into(),
                    reason: "HTTP 503".into(),
                });
            }
            self.pages.get(url).cloned().ok_or_else(|| FetchError::Failed {
                url: url.into(),
                reason: "HTTP 404".into(),
            })
        }
    }

    const INDEX: &str = r#"<table><tr>
        <td><a href="773.htm">773</a> 1950</td>
        <td><a href="2332.htm">2332</a></td>
        <td><a href="missing.htm">gone</a></td>
    </tr></table>"#;

    const PAGE_773: &str = r#"<table><tr>
        <td align="left"><img src="773_ident.jpg" title="No. 773 Hudson"></td>
        <td align="left"><img src="shared_ident.gif" title="No. 1 Shared"></td>
        <td align="center"><img src="other_ident.jpg" title="No. 9 Centered"></td>
        <td align="left"><img src="773_box.jpg" title="No. 773 Box"></td>
    </tr></table>"#;

    const PAGE_2332: &str = r#"<table><tr>
        <td align=left><img src="shared_ident.gif" title="No. 1 Shared"></td>
        <td align=left><img src="2332_ident.gif" title="No. 2332 GG1"></td>
    </tr></table>"#;

    fn opts() -> ScrapeOptions {
        ScrapeOptions {
            concurrency: 3,
            max_retries: 2,
            base_backoff: Duration::ZERO,
            show_progress: false,
        }
    }

    fn setup() -> (Connection, FragmentFilter) {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        (conn, FragmentFilter::new(r"_ident\.(gif|jpg)").unwrap())
    }

    #[tokio::test]
    async fn stores_filtered_fragments_in_index_order() {
        let (conn, mut filter) = setup();
        let loader = Arc::new(FakeLoader::new(
            &[
                ("https://x/lionel/index.htm", INDEX),
                ("https://x/lionel/773.htm", PAGE_773),
                ("https://x/lionel/2332.htm", PAGE_2332),
            ],
            0,
        ));

        let stats = scrape_index(
            &conn,
            loader,
            "https://x/lionel/index.htm",
            "postwar",
            None,
            &mut filter,
            opts(),
        )
        .await
        .unwrap();

        assert_eq!(stats.pages, 3);
        assert_eq!(stats.ok, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.selected, 5);
        assert_eq!(stats.stored, 3);

        let batches = db::fetch_batches(&conn).unwrap();
        assert_eq!(batches.len(), 1);
        let srcs: Vec<_> = batches[0]
            .fragments
            .iter()
            .map(|f| f.markup.split('"').nth(1).unwrap_or_default().to_string())
            .collect();
        assert_eq!(srcs, vec!["773_ident.jpg", "shared_ident.gif", "2332_ident.gif"]);
    }

    #[tokio::test]
    async fn retries_rate_limited_loads() {
        let (conn, mut filter) = setup();
        let loader = Arc::new(FakeLoader::new(
            &[
                ("https://x/lionel/index.htm", INDEX),
                ("https://x/lionel/773.htm", PAGE_773),
                ("https://x/lionel/2332.htm", PAGE_2332),
            ],
            2,
        ));

        let stats = scrape_index(
            &conn,
            loader.clone(),
            "https://x/lionel/index.htm",
            "postwar",
            Some(2),
            &mut filter,
            opts(),
        )
        .await
        .unwrap();

        assert_eq!(stats.pages, 2);
        assert_eq!(stats.ok, 2);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn unreachable_index_is_an_error() {
        let (conn, mut filter) = setup();
        let loader = Arc::new(FakeLoader::new(&[], 0));
        let r = scrape_index(
            &conn,
            loader,
            "https://x/lionel/index.htm",
            "postwar",
            None,
            &mut filter,
            opts(),
        )
        .await;
        assert!(r.is_err());
    }
}
