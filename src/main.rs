mod arbiter;
mod ask;
mod config;
mod db;
mod enrich;
mod error;
mod model;
mod parser;
mod pipeline;
mod reconcile;
mod scraper;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use ask::{Ask, DenyAll, ScriptedAsk, TerminalAsk};
use config::PipelineConfig;
use enrich::image_search::WebImageSearch;
use enrich::price::EbayPriceLookup;
use enrich::Enricher;
use parser::index::FragmentFilter;
use pipeline::{Pipeline, RunReport};
use reconcile::PolicyKind;

#[derive(Parser)]
#[command(name = "train_catalog", about = "Model train catalog builder: scrape, reconcile, enrich")]
struct Cli {
    /// SQLite database path (overrides CATALOG_DB)
    #[arg(long, global = true)]
    db: Option<String>,
    /// Hide progress bars
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Load the index page and store item-page fragments as one batch
    Scrape {
        /// Master index page
        #[arg(long)]
        index_url: String,
        /// Batch tag for the stored fragments
        #[arg(long)]
        batch: String,
        /// Max item pages to load (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Store one fragment per line of FILE as one batch
    Import {
        #[arg(long)]
        batch: String,
        file: PathBuf,
    },
    /// Extract, arbitrate and reconcile every stored batch
    Reconcile(ReconcileArgs),
    /// Look up images and prices for records not yet enriched
    Enrich {
        /// Max records to enrich (default: all pending)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Reconcile and enrich in one pass
    Run(ReconcileArgs),
    /// Canonical records table
    List {
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Write canonical records as JSON
    Export {
        #[arg(long)]
        out: PathBuf,
    },
    /// Show catalog statistics
    Stats,
}

#[derive(Args)]
struct ReconcileArgs {
    /// How to settle two records with the same model number
    #[arg(long, value_enum, default_value = "keep-first")]
    on_conflict: PolicyKind,
    /// Never prompt; missing or invalid values drop the record
    #[arg(long)]
    non_interactive: bool,
    /// Replay prompt answers from FILE, one per line (blank declines)
    #[arg(long, conflicts_with = "non_interactive")]
    answers: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut cfg = PipelineConfig::from_env();
    if let Some(db) = cli.db {
        cfg.db_path = db;
    }
    cfg.show_progress = !cli.quiet;

    let conn = db::connect(&cfg.db_path)?;
    db::init_schema(&conn)?;
    let started = Utc::now();

    let result = match cli.command {
        Commands::Init => {
            println!("Schema ready at {}", cfg.db_path);
            Ok(())
        }
        Commands::Scrape {
            index_url,
            batch,
            limit,
        } => {
            let key = std::env::var("SPIDER_API_KEY")
                .context("SPIDER_API_KEY environment variable must be set")?;
            let loader = Arc::new(scraper::SpiderLoader::new(key)?);
            let mut filter = FragmentFilter::new(&cfg.extract.fragment_image_pattern)?;
            let opts = scraper::ScrapeOptions {
                show_progress: cfg.show_progress,
                ..Default::default()
            };
            let stats =
                scraper::scrape_index(&conn, loader, &index_url, &batch, limit, &mut filter, opts)
                    .await?;
            println!(
                "Done: {} pages ({} ok, {} errors), {} of {} fragments stored as '{}'.",
                stats.pages, stats.ok, stats.errors, stats.stored, stats.selected, batch
            );
            Ok(())
        }
        Commands::Import { batch, file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mut filter = FragmentFilter::new(&cfg.extract.fragment_image_pattern)?;
            let (read, kept) = parser::index::filter_lines(&text, &mut filter);
            let n = db::insert_fragments(&conn, &batch, None, &kept)?;
            println!("Imported {} of {} fragments as '{}'", n, read, batch);
            Ok(())
        }
        Commands::Reconcile(args) => {
            let batches = db::fetch_batches(&conn)?;
            if batches.is_empty() {
                println!("No fragments stored. Run 'scrape' or 'import' first.");
                return Ok(());
            }
            let mut ask = build_asker(&args)?;
            let mut policy = args.on_conflict.build();
            let mut p = Pipeline::new(&cfg, ask.as_mut(), policy.as_mut());
            let records = p.reconcile(&batches)?;
            let report = p.into_report();

            db::save_canonical(&conn, &records)?;
            finish(&conn, "reconcile", started, &report)
        }
        Commands::Enrich { limit } => {
            let pending = db::fetch_canonical(&conn, limit, true)?;
            if pending.is_empty() {
                println!("Nothing to enrich. Run 'reconcile' first or all records are enriched.");
                return Ok(());
            }
            let enricher = build_enricher(&cfg)?;
            println!("Enriching {} records...", pending.len());
            let (records, counts, tripped) =
                pipeline::enrich_records(&cfg, &enricher, pending).await;
            let saved = db::update_enrichment(&conn, &records)?;
            println!("Saved enrichment for {} records.", saved);

            let report = RunReport {
                enrichment: counts,
                circuit_tripped: tripped,
                ..RunReport::default()
            };
            finish(&conn, "enrich", started, &report)
        }
        Commands::Run(args) => {
            let batches = db::fetch_batches(&conn)?;
            if batches.is_empty() {
                println!("No fragments stored. Run 'scrape' or 'import' first.");
                return Ok(());
            }
            let enricher = build_enricher(&cfg)?;
            let mut ask = build_asker(&args)?;
            let mut policy = args.on_conflict.build();
            let out = Pipeline::new(&cfg, ask.as_mut(), policy.as_mut())
                .run(&batches, Some(&enricher))
                .await?;

            db::save_canonical(&conn, &out.records)?;
            finish(&conn, "run", started, &out.report)
        }
        Commands::List { limit } => {
            let rows = db::fetch_canonical(&conn, Some(limit), false)?;
            if rows.is_empty() {
                println!("No canonical records.");
                return Ok(());
            }

            println!(
                "{:>4} | {:<10} | {:<40} | {:>9} | {:<5}",
                "#", "Model", "Name", "Price", "Image"
            );
            println!("{}", "-".repeat(80));
            for (i, r) in rows.iter().enumerate() {
                let price = r
                    .price_estimate
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_else(|| "-".into());
                let image = if r.enriched_image_url.is_some() { "yes" } else { "-" };
                println!(
                    "{:>4} | {:<10} | {:<40} | {:>9} | {:<5}",
                    i + 1,
                    truncate(&r.identifier, 10),
                    truncate(&r.name, 40),
                    price,
                    image
                );
            }
            println!("\n{} records", rows.len());
            Ok(())
        }
        Commands::Export { out } => {
            let rows = db::fetch_canonical(&conn, None, false)?;
            let json = serde_json::to_string_pretty(&rows)?;
            std::fs::write(&out, json).with_context(|| format!("writing {}", out.display()))?;
            println!("Exported {} records to {}", rows.len(), out.display());
            Ok(())
        }
        Commands::Stats => {
            let s = db::get_stats(&conn)?;
            println!("Fragments:  {}", s.fragments);
            println!("Batches:    {}", s.batches);
            println!("Canonical:  {}", s.canonical);
            println!("Enriched:   {}", s.enriched);
            println!("Pending:    {}", s.unenriched);
            println!("Priced:     {}", s.priced);
            println!("Runs:       {}", s.runs);
            if let Some(run) = db::last_run(&conn)? {
                println!(
                    "\nLast run: {} ({} -> {})\n{}",
                    run.command,
                    run.started_at,
                    run.finished_at,
                    serde_json::to_string_pretty(&run.report)?
                );
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn build_asker(args: &ReconcileArgs) -> anyhow::Result<Box<dyn Ask>> {
    if let Some(path) = &args.answers {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading answers {}", path.display()))?;
        return Ok(Box::new(ScriptedAsk::from_lines(&text)));
    }
    if args.non_interactive {
        return Ok(Box::new(DenyAll));
    }
    Ok(Box::new(TerminalAsk))
}

fn build_enricher(cfg: &PipelineConfig) -> anyhow::Result<Enricher> {
    let s = &cfg.enrich;
    let token = s
        .price_token
        .as_deref()
        .context("EBAY_ACCESS_TOKEN environment variable must be set to enrich")?;
    let images = WebImageSearch::new(&s.image_search_url)?;
    let prices = EbayPriceLookup::new(&s.price_endpoint, token, &s.price_zip)?;
    Ok(Enricher::new(Arc::new(images), Arc::new(prices), s))
}

fn finish(
    conn: &rusqlite::Connection,
    command: &str,
    started: chrono::DateTime<Utc>,
    report: &RunReport,
) -> anyhow::Result<()> {
    report.print();
    db::save_run(conn, command, started, report)?;
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
