use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::model::{Batch, CanonicalRecord, RawFragment};

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let conn = Connection::open(path).with_context(|| format!("opening {}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS fragments (
            id         INTEGER PRIMARY KEY,
            batch      TEXT NOT NULL,
            page_url   TEXT,
            markup     TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_fragments_batch ON fragments(batch);

        CREATE TABLE IF NOT EXISTS canonical_records (
            position           INTEGER PRIMARY KEY,
            identifier         TEXT UNIQUE NOT NULL,
            name               TEXT NOT NULL,
            image_ref          TEXT NOT NULL,
            enriched_image_url TEXT,
            price_estimate     TEXT,
            enriched_at        TEXT
        );

        CREATE TABLE IF NOT EXISTS runs (
            id          INTEGER PRIMARY KEY,
            command     TEXT NOT NULL,
            started_at  TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            report      TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

// ── Fragments ──

pub fn insert_fragments(
    conn: &Connection,
    batch: &str,
    page_url: Option<&str>,
    fragments: &[String],
) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt =
            tx.prepare("INSERT INTO fragments (batch, page_url, markup) VALUES (?1, ?2, ?3)")?;
        for markup in fragments {
            count += stmt.execute(params![batch, page_url, markup])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Stored fragments grouped by batch, batches in the order they first arrived.
pub fn fetch_batches(conn: &Connection) -> Result<Vec<Batch>> {
    let mut stmt = conn.prepare("SELECT batch, markup FROM fragments ORDER BY id")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut batches: IndexMap<String, Batch> = IndexMap::new();
    for (tag, markup) in rows {
        let batch = batches.entry(tag.clone()).or_insert_with(|| Batch {
            tag: tag.clone(),
            fragments: Vec::new(),
        });
        batch.fragments.push(RawFragment::new(markup, tag));
    }
    Ok(batches.into_values().collect())
}

// ── Canonical set ──

/// Replace the canonical table with `records`, keeping their order. A record
/// whose identifier and name are unchanged keeps its earlier enrichment.
pub fn save_canonical(conn: &Connection, records: &[CanonicalRecord]) -> Result<usize> {
    let previous = enrichment_by_key(conn)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM canonical_records", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO canonical_records
             (position, identifier, name, image_ref, enriched_image_url, price_estimate, enriched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        let now = Utc::now().to_rfc3339();
        for (i, r) in records.iter().enumerate() {
            let (image, price, enriched_at) = if r.is_enriched() {
                (r.enriched_image_url.clone(), price_text(r.price_estimate), Some(now.clone()))
            } else {
                previous
                    .get(&(r.identifier.clone(), r.name.clone()))
                    .cloned()
                    .unwrap_or_default()
            };
            stmt.execute(params![
                i as i64,
                r.identifier,
                r.name,
                r.image_ref,
                image,
                price,
                enriched_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(records.len())
}

// Prices are stored as decimal text so cents survive exactly.
fn price_text(price: Option<Decimal>) -> Option<String> {
    price.map(|d| d.to_string())
}

fn price_column(row: &Row, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse::<Decimal>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

type Enrichment = (Option<String>, Option<String>, Option<String>);

fn enrichment_by_key(conn: &Connection) -> Result<HashMap<(String, String), Enrichment>> {
    let mut stmt = conn.prepare(
        "SELECT identifier, name, enriched_image_url, price_estimate, enriched_at
         FROM canonical_records WHERE enriched_at IS NOT NULL",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                (row.get(0)?, row.get(1)?),
                (row.get(2)?, row.get(3)?, row.get(4)?),
            ))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

pub fn fetch_canonical(
    conn: &Connection,
    limit: Option<usize>,
    only_unenriched: bool,
) -> Result<Vec<CanonicalRecord>> {
    let sql = format!(
        "SELECT identifier, name, image_ref, enriched_image_url, price_estimate
         FROM canonical_records{}
         ORDER BY position{}",
        if only_unenriched {
            " WHERE enriched_at IS NULL"
        } else {
            ""
        },
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CanonicalRecord {
                identifier: row.get(0)?,
                name: row.get(1)?,
                image_ref: row.get(2)?,
                enriched_image_url: row.get(3)?,
                price_estimate: price_column(row, 4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Write back the enrichment columns. Records that gained nothing stay
/// eligible for the next `enrich`.
pub fn update_enrichment(conn: &Connection, records: &[CanonicalRecord]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "UPDATE canonical_records
             SET enriched_image_url = ?2, price_estimate = ?3, enriched_at = ?4
             WHERE identifier = ?1",
        )?;
        let now = Utc::now().to_rfc3339();
        for r in records.iter().filter(|r| r.is_enriched()) {
            count += stmt.execute(params![
                r.identifier,
                r.enriched_image_url,
                price_text(r.price_estimate),
                now,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

// ── Runs ──

pub fn save_run(
    conn: &Connection,
    command: &str,
    started_at: DateTime<Utc>,
    report: &impl serde::Serialize,
) -> Result<i64> {
    let json = serde_json::to_string(report)?;
    conn.execute(
        "INSERT INTO runs (command, started_at, finished_at, report) VALUES (?1, ?2, ?3, ?4)",
        params![command, started_at.to_rfc3339(), Utc::now().to_rfc3339(), json],
    )?;
    Ok(conn.last_insert_rowid())
}

pub struct RunRow {
    pub command: String,
    pub started_at: String,
    pub finished_at: String,
    pub report: serde_json::Value,
}

pub fn last_run(conn: &Connection) -> Result<Option<RunRow>> {
    let row = conn
        .query_row(
            "SELECT command, started_at, finished_at, report FROM runs ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((command, started_at, finished_at, report)) = row else {
        return Ok(None);
    };
    Ok(Some(RunRow {
        command,
        started_at,
        finished_at,
        report: serde_json::from_str(&report)?,
    }))
}

// ── Stats ──

pub struct Stats {
    pub fragments: usize,
    pub batches: usize,
    pub canonical: usize,
    pub enriched: usize,
    pub unenriched: usize,
    pub priced: usize,
    pub runs: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let fragments: usize = conn.query_row("SELECT COUNT(*) FROM fragments", [], |r| r.get(0))?;
    let batches: usize =
        conn.query_row("SELECT COUNT(DISTINCT batch) FROM fragments", [], |r| r.get(0))?;
    let canonical: usize =
        conn.query_row("SELECT COUNT(*) FROM canonical_records", [], |r| r.get(0))?;
    let enriched: usize = conn.query_row(
        "SELECT COUNT(*) FROM canonical_records WHERE enriched_at IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    let priced: usize = conn.query_row(
        "SELECT COUNT(*) FROM canonical_records WHERE price_estimate IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    let runs: usize = conn.query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))?;
    Ok(Stats {
        fragments,
        batches,
        canonical,
        enriched,
        unenriched: canonical - enriched,
        priced,
        runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn rec(id: &str, name: &str) -> CanonicalRecord {
        CanonicalRecord {
            identifier: id.into(),
            name: name.into(),
            image_ref: format!("https://img/{}.jpg", id),
            enriched_image_url: None,
            price_estimate: None,
        }
    }

    #[test]
    fn batches_keep_arrival_order() {
        let conn = mem();
        insert_fragments(&conn, "b2", None, &["x".into(), "y".into()]).unwrap();
        insert_fragments(&conn, "b1", Some("https://p/1"), &["z".into()]).unwrap();
        insert_fragments(&conn, "b2", None, &["w".into()]).unwrap();

        let batches = fetch_batches(&conn).unwrap();
        let tags: Vec<_> = batches.iter().map(|b| b.tag.as_str()).collect();
        assert_eq!(tags, vec!["b2", "b1"]);
        let markup: Vec<_> = batches[0].fragments.iter().map(|f| f.markup.as_str()).collect();
        assert_eq!(markup, vec!["x", "y", "w"]);
        assert_eq!(batches[1].fragments[0].batch, "b1");
    }

    #[test]
    fn save_canonical_replaces_in_order() {
        let conn = mem();
        save_canonical(&conn, &[rec("1", "a"), rec("2", "b")]).unwrap();
        save_canonical(&conn, &[rec("9", "z"), rec("1", "a")]).unwrap();

        let rows = fetch_canonical(&conn, None, false).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["9", "1"]);
        assert_eq!(fetch_canonical(&conn, Some(1), false).unwrap().len(), 1);
    }

    #[test]
    fn enrichment_updates_only_enriched_rows() {
        let conn = mem();
        save_canonical(&conn, &[rec("1", "a"), rec("2", "b")]).unwrap();

        let mut done = rec("1", "a");
        done.enriched_image_url = Some("https://img/found.jpg".into());
        done.price_estimate = Some(Decimal::new(1001, 2));
        let n = update_enrichment(&conn, &[done.clone(), rec("2", "b")]).unwrap();
        assert_eq!(n, 1);

        let pending = fetch_canonical(&conn, None, true).unwrap();
        assert_eq!(pending, vec![rec("2", "b")]);
        let all = fetch_canonical(&conn, None, false).unwrap();
        assert_eq!(all[0], done);
        let stored: String = conn
            .query_row("SELECT price_estimate FROM canonical_records WHERE identifier = '1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, "10.01");

        let stats = get_stats(&conn).unwrap();
        assert_eq!(stats.canonical, 2);
        assert_eq!(stats.enriched, 1);
        assert_eq!(stats.unenriched, 1);
        assert_eq!(stats.priced, 1);
    }

    #[test]
    fn reconcile_rewrite_keeps_enrichment_for_same_key() {
        let conn = mem();
        save_canonical(&conn, &[rec("1", "a"), rec("2", "b")]).unwrap();
        let mut done = rec("1", "a");
        done.price_estimate = Some(Decimal::new(3, 0));
        let mut renamed = rec("2", "b");
        renamed.price_estimate = Some(Decimal::new(4, 0));
        update_enrichment(&conn, &[done.clone(), renamed]).unwrap();

        save_canonical(&conn, &[rec("1", "a"), rec("2", "b2")]).unwrap();
        let all = fetch_canonical(&conn, None, false).unwrap();
        assert_eq!(all[0], done);
        assert_eq!(all[1], rec("2", "b2"));
    }

    #[test]
    fn runs_round_trip_report() {
        let conn = mem();
        assert!(last_run(&conn).unwrap().is_none());
        save_run(&conn, "reconcile", Utc::now(), &serde_json::json!({"reconciled": 3})).unwrap();
        let run = last_run(&conn).unwrap().unwrap();
        assert_eq!(run.command, "reconcile");
        assert_eq!(run.report["reconciled"], 3);
        assert_eq!(get_stats(&conn).unwrap().runs, 1);
    }
}
