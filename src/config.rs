use std::time::Duration;

pub const DEFAULT_DB_PATH: &str = "data/catalog.sqlite";
pub const IDENTIFIER_MARKER: &str = "No.";
pub const NAME_BOILERPLATE: &[&str] = &["Lionel Trains", "The Lionel"];
pub const DISALLOWED_SUBSTRINGS: &[&str] = &["!", "(", ")", "Mint"];
pub const IMAGE_BASE_URL: &str = "https://www.tandem-associates.com/lionel/";
pub const FRAGMENT_IMAGE_PATTERN: &str = r"_ident\.(gif|jpg)";
pub const IMAGE_SEARCH_URL: &str = "https://www.google.com/search?tbm=isch";
pub const PRICE_ENDPOINT: &str = "https://api.ebay.com/buy/browse/v1/item_summary/search";

/// Every tunable of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: String,
    pub extract: ExtractSettings,
    pub reconcile: ReconcileSettings,
    pub enrich: EnrichSettings,
    pub show_progress: bool,
}

#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub marker: String,
    pub boilerplate: Vec<String>,
    pub image_base_url: Option<String>,
    pub fragment_image_pattern: String,
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub disallowed: Vec<String>,
    pub sentinel_identifiers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EnrichSettings {
    pub workers: usize,
    pub requests_per_second: u32,
    pub spacing_min: Duration,
    pub spacing_max: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub breaker_threshold: u32,
    pub image_search_url: String,
    pub price_endpoint: String,
    pub price_token: Option<String>,
    pub price_zip: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            extract: ExtractSettings::default(),
            reconcile: ReconcileSettings::default(),
            enrich: EnrichSettings::default(),
            show_progress: true,
        }
    }
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            marker: IDENTIFIER_MARKER.to_string(),
            boilerplate: to_strings(NAME_BOILERPLATE),
            image_base_url: Some(IMAGE_BASE_URL.to_string()),
            fragment_image_pattern: FRAGMENT_IMAGE_PATTERN.to_string(),
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            disallowed: to_strings(DISALLOWED_SUBSTRINGS),
            sentinel_identifiers: Vec::new(),
        }
    }
}

impl Default for EnrichSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            requests_per_second: 2,
            spacing_min: Duration::from_millis(1000),
            spacing_max: Duration::from_millis(2000),
            max_retries: 3,
            base_backoff: Duration::from_millis(2000),
            breaker_threshold: 10,
            image_search_url: IMAGE_SEARCH_URL.to_string(),
            price_endpoint: PRICE_ENDPOINT.to_string(),
            price_token: None,
            price_zip: "10001".to_string(),
        }
    }
}

impl EnrichSettings {
    /// No spacing, no backoff: for fakes that answer instantly.
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            workers: 1,
            requests_per_second: 1000,
            spacing_min: Duration::ZERO,
            spacing_max: Duration::ZERO,
            base_backoff: Duration::ZERO,
            ..Self::default()
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = get("CATALOG_DB") {
            cfg.db_path = v;
        }
        if let Some(v) = get("CATALOG_IMAGE_BASE") {
            cfg.extract.image_base_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = get("CATALOG_SENTINEL_IDS") {
            cfg.reconcile.sentinel_identifiers = split_list(&v);
        }
        if let Some(n) = get("ENRICH_WORKERS").and_then(|v| v.parse().ok()) {
            cfg.enrich.workers = n;
        }
        if let Some(n) = get("ENRICH_RPS").and_then(|v| v.parse().ok()) {
            cfg.enrich.requests_per_second = n;
        }
        if let Some(n) = get("ENRICH_BREAKER").and_then(|v| v.parse().ok()) {
            cfg.enrich.breaker_threshold = n;
        }
        cfg.enrich.price_token = get("EBAY_ACCESS_TOKEN").filter(|s| !s.is_empty());
        if let Some(v) = get("EBAY_ZIP") {
            cfg.enrich.price_zip = v;
        }
        cfg
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
