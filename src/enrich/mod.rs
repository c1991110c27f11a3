pub mod image_search;
pub mod price;
pub mod retry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use indicatif::ProgressBar;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::config::EnrichSettings;
use crate::error::LookupError;
use crate::model::CanonicalRecord;
use crate::pipeline::{CircuitBreaker, Endpoint};
use retry::{with_retry, RetryPolicy, Throttle};

#[async_trait]
pub trait ImageSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<String, LookupError>;
}

#[async_trait]
pub trait PriceLookup: Send + Sync {
    /// Prices of matching listings; an empty set means no estimate.
    async fn price_query(&self, query: &str) -> Result<Vec<Decimal>, LookupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// Both lookups answered.
    Success,
    /// One lookup answered, the other failed or was cancelled.
    Partial,
    Failed,
    /// Nothing answered because the run was curtailed.
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichCounts {
    pub success: usize,
    pub partial: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl EnrichCounts {
    fn add(&mut self, outcome: EnrichOutcome) {
        match outcome {
            EnrichOutcome::Success => self.success += 1,
            EnrichOutcome::Partial => self.partial += 1,
            EnrichOutcome::Failed => self.failed += 1,
            EnrichOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Image and price lookups for canonical records, a bounded number at a time.
#[derive(Clone)]
pub struct Enricher {
    images: Arc<dyn ImageSearch>,
    prices: Arc<dyn PriceLookup>,
    image_throttle: Arc<Throttle>,
    price_throttle: Arc<Throttle>,
    retry: RetryPolicy,
    workers: usize,
    seen_images: Arc<Mutex<HashMap<String, String>>>,
}

impl Enricher {
    pub fn new(
        images: Arc<dyn ImageSearch>,
        prices: Arc<dyn PriceLookup>,
        settings: &EnrichSettings,
    ) -> Self {
        let throttle = || {
            Arc::new(Throttle::new(
                settings.requests_per_second,
                settings.spacing_min,
                settings.spacing_max,
            ))
        };
        Self {
            images,
            prices,
            image_throttle: throttle(),
            price_throttle: throttle(),
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                base_backoff: settings.base_backoff,
            },
            workers: settings.workers.max(1),
            seen_images: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enrich every record concurrently. Output keeps input order; records
    /// never reached after the breaker trips come back unchanged.
    pub async fn enrich_all(
        &self,
        records: Vec<CanonicalRecord>,
        breaker: Arc<CircuitBreaker>,
        pb: &ProgressBar,
    ) -> (Vec<CanonicalRecord>, EnrichCounts) {
        let total = records.len();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let (tx, mut rx) =
            mpsc::channel::<(usize, CanonicalRecord, EnrichOutcome)>(self.workers * 2);

        let mut slots: Vec<CanonicalRecord> = records.clone();
        for (idx, record) in records.into_iter().enumerate() {
            let this = self.clone();
            let sem = Arc::clone(&semaphore);
            let breaker = Arc::clone(&breaker);
            let tx = tx.clone();

            tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return;
                };
                let (record, outcome) = this.enrich(record, &breaker).await;
                let _ = tx.send((idx, record, outcome)).await;
            });
        }
        drop(tx);

        let mut counts = EnrichCounts::default();
        let mut received = 0usize;
        while let Some((idx, record, outcome)) = rx.recv().await {
            counts.add(outcome);
            slots[idx] = record;
            received += 1;
            pb.inc(1);
        }
        if received < total {
            warn!("{} enrichment tasks ended without a result", total - received);
            counts.cancelled += total - received;
        }

        info!(
            "Enriched {} records ({} ok, {} partial, {} failed, {} cancelled)",
            total, counts.success, counts.partial, counts.failed, counts.cancelled
        );
        (slots, counts)
    }

    /// Best-effort enrichment of one record.
    pub async fn enrich(
        &self,
        mut record: CanonicalRecord,
        breaker: &CircuitBreaker,
    ) -> (CanonicalRecord, EnrichOutcome) {
        if breaker.is_tripped() {
            return (record, EnrichOutcome::Cancelled);
        }

        let query = record.composite();
        let token = breaker.token();
        let (image, price) = tokio::join!(
            with_retry("image", &query, self.retry, &self.image_throttle, &token, || {
                self.images.search(&query)
            }),
            with_retry("price", &query, self.retry, &self.price_throttle, &token, || {
                self.prices.price_query(&query)
            }),
        );

        let mut answered = 0;
        let mut failed = 0;
        let results = [
            (Endpoint::Image, image.as_ref().map(|_| ())),
            (Endpoint::Price, price.as_ref().map(|_| ())),
        ];
        for (endpoint, result) in results {
            match result {
                Ok(()) => {
                    answered += 1;
                    breaker.record_success(endpoint);
                }
                Err(LookupError::Cancelled) => {}
                Err(e) => {
                    failed += 1;
                    debug!("{} lookup failed for '{}': {}", endpoint.label(), query, e);
                    breaker.record_failure(endpoint);
                }
            }
        }

        match image {
            Ok(url) => {
                self.note_image(&record.identifier, &url);
                record.enriched_image_url = Some(url);
            }
            Err(LookupError::Cancelled) => {}
            Err(e) => warn!("No image for '{}': {}", query, e),
        }
        match price {
            Ok(prices) => record.price_estimate = price::mean_price(&prices),
            Err(LookupError::Cancelled) => {}
            Err(e) => warn!("No price for '{}': {}", query, e),
        }

        let outcome = match (answered, failed) {
            (2, _) => EnrichOutcome::Success,
            (1, _) => EnrichOutcome::Partial,
            (_, f) if f > 0 => EnrichOutcome::Failed,
            _ => EnrichOutcome::Cancelled,
        };
        (record, outcome)
    }

    /// The same picture may legitimately back two catalog entries; note it
    /// and keep both.
    fn note_image(&self, identifier: &str, url: &str) {
        let Ok(mut seen) = self.seen_images.lock() else {
            return;
        };
        match seen.get(url) {
            Some(other) if other != identifier => {
                debug!("Image for {} already fetched for {}: {}", identifier, other, url);
            }
            Some(_) => {}
            None => {
                seen.insert(url.to_string(), identifier.to_string());
            }
        }
    }
}
