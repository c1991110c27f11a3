use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::arbiter::{self, Arbitration};
use crate::ask::Ask;
use crate::config::PipelineConfig;
use crate::enrich::{EnrichCounts, Enricher};
use crate::model::{AdmittedRecord, Batch, CanonicalRecord};
use crate::parser::{self, fragment::RecordExtractor};
use crate::reconcile::{ConflictPolicy, ReconcileStats, Reconciler};

/// Lookup service a breaker streak is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Image,
    Price,
}

impl Endpoint {
    fn slot(self) -> usize {
        match self {
            Self::Image => 0,
            Self::Price => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Price => "price",
        }
    }
}

/// Run-level guard: once either endpoint fails `threshold` lookups in a row,
/// every in-flight and queued enrichment call is cancelled. Each endpoint
/// keeps its own streak. `0` disables it.
pub struct CircuitBreaker {
    threshold: u32,
    consecutive: [AtomicU32; 2],
    token: CancellationToken,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive: [AtomicU32::new(0), AtomicU32::new(0)],
            token: CancellationToken::new(),
        }
    }

    pub fn record_success(&self, endpoint: Endpoint) {
        self.consecutive[endpoint.slot()].store(0, Ordering::SeqCst);
    }

    /// Returns true when this failure tripped the breaker.
    pub fn record_failure(&self, endpoint: Endpoint) -> bool {
        let n = self.consecutive[endpoint.slot()].fetch_add(1, Ordering::SeqCst) + 1;
        if self.threshold == 0 || n < self.threshold || self.token.is_cancelled() {
            return false;
        }
        warn!(
            "Circuit breaker tripped after {} consecutive {} lookup failures; halting enrichment",
            n,
            endpoint.label()
        );
        self.token.cancel();
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub extracted: usize,
    pub extraction_misses: usize,
    pub admitted: usize,
    pub skipped_at_arbitration: usize,
    pub reconciled: usize,
    pub reconciliation: ReconcileStats,
    pub enrichment: EnrichCounts,
    pub circuit_tripped: bool,
}

impl RunReport {
    pub fn print(&self) {
        let r = &self.reconciliation;
        let c = &r.collisions;
        let e = &self.enrichment;
        println!(
            "Extracted {} ({} misses), admitted {} ({} skipped).",
            self.extracted, self.extraction_misses, self.admitted, self.skipped_at_arbitration
        );
        println!(
            "Reconciled {} records: {} collisions (keep-first {}, keep-second {}, renamed {}, skip {}), {} conflict errors, {} rejected.",
            self.reconciled,
            c.total(),
            c.keep_first,
            c.keep_second,
            c.keep_both_renamed,
            c.skip,
            r.errors,
            r.rejected_invalid + r.rejected_sentinel,
        );
        println!(
            "Enrichment: {} ok, {} partial, {} failed, {} cancelled{}.",
            e.success,
            e.partial,
            e.failed,
            e.cancelled,
            if self.circuit_tripped { " (circuit breaker tripped)" } else { "" }
        );
    }
}

pub struct PipelineOutput {
    pub records: Vec<CanonicalRecord>,
    pub report: RunReport,
}

/// Drives extraction, arbitration and reconciliation on one thread, then
/// hands the canonical set to the enricher.
pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    ask: &'a mut dyn Ask,
    policy: &'a mut dyn ConflictPolicy,
    report: RunReport,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        ask: &'a mut dyn Ask,
        policy: &'a mut dyn ConflictPolicy,
    ) -> Self {
        Self {
            config,
            ask,
            policy,
            report: RunReport::default(),
        }
    }

    /// Reconcile every batch in order, then enrich if an enricher is given.
    pub async fn run(mut self, batches: &[Batch], enricher: Option<&Enricher>) -> Result<PipelineOutput> {
        let records = self.reconcile(batches)?;
        let records = match enricher {
            Some(e) => self.enrich(e, records).await,
            None => records,
        };
        Ok(PipelineOutput {
            records,
            report: self.report,
        })
    }

    pub fn reconcile(&mut self, batches: &[Batch]) -> Result<Vec<CanonicalRecord>> {
        let extractor = parser::build_extractor(&self.config.extract)?;
        let mut reconciler = Reconciler::new(&self.config.reconcile);

        for batch in batches {
            let admitted = self.admit(&extractor, batch);
            info!(
                "Batch '{}': {} fragments, {} admitted",
                batch.tag,
                batch.fragments.len(),
                admitted.len()
            );
            reconciler.merge_batch(admitted, &mut *self.policy, &mut *self.ask);
        }

        let (records, stats) = reconciler.finish();
        self.report.reconciled = records.len();
        self.report.reconciliation = stats;
        Ok(records)
    }

    fn admit(&mut self, extractor: &RecordExtractor, batch: &Batch) -> Vec<AdmittedRecord> {
        let mut admitted = Vec::new();
        for fragment in &batch.fragments {
            let Some(candidate) = extractor.extract(fragment) else {
                self.report.extraction_misses += 1;
                continue;
            };
            self.report.extracted += 1;
            match arbiter::resolve(candidate, &mut *self.ask) {
                Arbitration::Admitted(r) => {
                    self.report.admitted += 1;
                    admitted.push(r);
                }
                Arbitration::Skipped(_) => self.report.skipped_at_arbitration += 1,
            }
        }
        admitted
    }

    pub async fn enrich(&mut self, enricher: &Enricher, records: Vec<CanonicalRecord>) -> Vec<CanonicalRecord> {
        let (records, counts, tripped) = enrich_records(self.config, enricher, records).await;
        self.report.enrichment = counts;
        self.report.circuit_tripped = tripped;
        records
    }

    pub fn into_report(self) -> RunReport {
        self.report
    }
}

/// Enrich under a fresh circuit breaker. Records the breaker kept from being
/// looked up come back unchanged.
pub async fn enrich_records(
    config: &PipelineConfig,
    enricher: &Enricher,
    records: Vec<CanonicalRecord>,
) -> (Vec<CanonicalRecord>, EnrichCounts, bool) {
    let breaker = Arc::new(CircuitBreaker::new(config.enrich.breaker_threshold));
    let pb = progress_bar(records.len(), config.show_progress);
    let (records, counts) = enricher.enrich_all(records, Arc::clone(&breaker), &pb).await;
    pb.finish_and_clear();
    (records, counts, breaker.is_tripped())
}

pub fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::ask::{DenyAll, ScriptedAsk};
    use crate::config::EnrichSettings;
    use crate::enrich::{ImageSearch, PriceLookup};
    use crate::error::LookupError;
    use crate::model::RawFragment;
    use crate::reconcile::{KeepFirstPolicy, RenameWithSuffix};

    struct EchoImages;

    #[async_trait]
    impl ImageSearch for EchoImages {
        async fn search(&self, query: &str) -> Result<String, LookupError> {
            Ok(format!("https://img/{}", query.replace(' ', "+")))
        }
    }

    struct NoPrices;

    #[async_trait]
    impl PriceLookup for NoPrices {
        async fn price_query(&self, _: &str) -> Result<Vec<rust_decimal::Decimal>, LookupError> {
            Err(LookupError::Permanent("malformed".into()))
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            show_progress: false,
            enrich: EnrichSettings::immediate(),
            ..PipelineConfig::default()
        }
    }

    fn batch(tag: &str, fragments: &[&str]) -> Batch {
        Batch {
            tag: tag.into(),
            fragments: fragments.iter().map(|f| RawFragment::new(*f, tag)).collect(),
        }
    }

    fn batches() -> Vec<Batch> {
        vec![
            batch(
                "first",
                &[
                    r#"<img src="p/773_ident.jpg" title="No. 773 Hudson Steam Locomotive">"#,
                    r#"<img src="p/milk_ident.jpg" title="Operating Milk Car">"#,
                    r#"<hr>"#,
                ],
            ),
            batch(
                "second",
                &[
                    r#"<img src="p/773b_ident.jpg" title="Hudson Deluxe No. 773">"#,
                    r#"<img src="p/2332_ident.gif" title="GG1 Electric No. 2332">"#,
                    r#"<img src="p/nameless_ident.gif">"#,
                ],
            ),
        ]
    }

    #[test]
    fn breaker_threshold() {
        let b = CircuitBreaker::new(3);
        assert!(!b.record_failure(Endpoint::Price));
        assert!(!b.record_failure(Endpoint::Price));
        b.record_success(Endpoint::Price);
        assert!(!b.record_failure(Endpoint::Price));
        assert!(!b.record_failure(Endpoint::Price));
        assert!(b.record_failure(Endpoint::Price));
        assert!(b.is_tripped());
        assert!(!b.record_failure(Endpoint::Price));
        assert!(b.token().is_cancelled());
    }

    #[test]
    fn streaks_are_kept_per_endpoint() {
        let b = CircuitBreaker::new(2);
        assert!(!b.record_failure(Endpoint::Price));
        b.record_success(Endpoint::Image);
        assert!(!b.record_failure(Endpoint::Image));
        b.record_success(Endpoint::Image);
        assert!(b.record_failure(Endpoint::Price));
        assert!(b.is_tripped());
    }

    #[test]
    fn disabled_breaker_never_trips() {
        let b = CircuitBreaker::new(0);
        for _ in 0..100 {
            b.record_failure(Endpoint::Image);
        }
        assert!(!b.is_tripped());
    }

    #[test]
    fn reconcile_counts_every_stage() {
        let cfg = config();
        let mut ask = DenyAll;
        let mut policy = KeepFirstPolicy;
        let mut p = Pipeline::new(&cfg, &mut ask, &mut policy);
        let records = p.reconcile(&batches()).unwrap();

        let ids: Vec<_> = records.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["773", "2332"]);
        assert_eq!(records[0].name, "Hudson Steam Locomotive");

        let report = p.into_report();
        assert_eq!(report.extracted, 5);
        assert_eq!(report.extraction_misses, 1);
        assert_eq!(report.admitted, 3);
        assert_eq!(report.skipped_at_arbitration, 2);
        assert_eq!(report.reconciled, 2);
        assert_eq!(report.reconciliation.collisions.keep_first, 1);
    }

    #[test]
    fn prompts_fill_missing_fields_in_order() {
        let cfg = config();
        let mut ask = ScriptedAsk::new([Some("3472")]);
        let mut policy = RenameWithSuffix::default();
        let mut p = Pipeline::new(&cfg, &mut ask, &mut policy);
        let records = p.reconcile(&batches()).unwrap();
        drop(p);

        let ids: Vec<_> = records.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["773", "3472", "773second", "2332"]);
        assert_eq!(ask.prompts.len(), 1);
        assert!(ask.prompts[0].contains("Operating Milk Car"));
    }

    #[tokio::test]
    async fn run_enriches_best_effort() {
        let cfg = config();
        let mut ask = DenyAll;
        let mut policy = KeepFirstPolicy;
        let enricher = Enricher::new(Arc::new(EchoImages), Arc::new(NoPrices), &cfg.enrich);
        let out = Pipeline::new(&cfg, &mut ask, &mut policy)
            .run(&batches(), Some(&enricher))
            .await
            .unwrap();

        assert_eq!(out.records.len(), 2);
        assert_eq!(
            out.records[0].enriched_image_url.as_deref(),
            Some("https://img/773+Hudson+Steam+Locomotive")
        );
        assert!(out.records.iter().all(|r| r.price_estimate.is_none()));
        assert_eq!(out.report.enrichment.partial, 2);
        assert!(!out.report.circuit_tripped);
    }
}
