//! Merge admitted batches into one identifier-keyed canonical set.
//!
//! Each record is validated first (disallowed substrings, sentinel ids) and
//! merged second. A collision is settled by a `ConflictPolicy` and applied as
//! a single map update.

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ask::Ask;
use crate::config::ReconcileSettings;
use crate::error::ReconcileError;
use crate::model::{AdmittedRecord, CanonicalRecord, ConflictDecision};

pub trait ConflictPolicy {
    fn decide(
        &mut self,
        existing: &CanonicalRecord,
        incoming: &AdmittedRecord,
        ask: &mut dyn Ask,
    ) -> ConflictDecision;
}

pub struct KeepFirstPolicy;

impl ConflictPolicy for KeepFirstPolicy {
    fn decide(&mut self, _: &CanonicalRecord, _: &AdmittedRecord, _: &mut dyn Ask) -> ConflictDecision {
        ConflictDecision::KeepFirst
    }
}

pub struct KeepSecondPolicy;

impl ConflictPolicy for KeepSecondPolicy {
    fn decide(&mut self, _: &CanonicalRecord, _: &AdmittedRecord, _: &mut dyn Ask) -> ConflictDecision {
        ConflictDecision::KeepSecond
    }
}

/// Keeps the incoming record under `identifier + suffix`.
pub struct RenameWithSuffix {
    pub suffix: String,
}

impl Default for RenameWithSuffix {
    fn default() -> Self {
        Self {
            suffix: "second".to_string(),
        }
    }
}

impl ConflictPolicy for RenameWithSuffix {
    fn decide(&mut self, _: &CanonicalRecord, incoming: &AdmittedRecord, _: &mut dyn Ask) -> ConflictDecision {
        ConflictDecision::KeepBothRenamed(format!("{}{}", incoming.identifier, self.suffix))
    }
}

/// Lets a human pick: `1`, `2`, a new identifier, or nothing to skip.
pub struct InteractivePolicy;

impl ConflictPolicy for InteractivePolicy {
    fn decide(
        &mut self,
        existing: &CanonicalRecord,
        incoming: &AdmittedRecord,
        ask: &mut dyn Ask,
    ) -> ConflictDecision {
        let prompt = format!(
            "Duplicate model {} found.\n  1. Keep first:  {}\n  2. Keep second: {}\nEnter 1, 2, a new model number to keep both, or 'skip'",
            existing.identifier, existing.name, incoming.name
        );
        match ask.ask(&prompt).as_deref() {
            None => ConflictDecision::Skip,
            Some("1") => ConflictDecision::KeepFirst,
            Some("2") => ConflictDecision::KeepSecond,
            Some(s) if s.eq_ignore_ascii_case("skip") => ConflictDecision::Skip,
            Some(s) => ConflictDecision::KeepBothRenamed(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PolicyKind {
    KeepFirst,
    KeepSecond,
    Rename,
    Ask,
}

impl PolicyKind {
    pub fn build(self) -> Box<dyn ConflictPolicy> {
        match self {
            Self::KeepFirst => Box::new(KeepFirstPolicy),
            Self::KeepSecond => Box::new(KeepSecondPolicy),
            Self::Rename => Box::new(RenameWithSuffix::default()),
            Self::Ask => Box::new(InteractivePolicy),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollisionCounts {
    pub keep_first: usize,
    pub keep_second: usize,
    pub keep_both_renamed: usize,
    pub skip: usize,
}

impl CollisionCounts {
    pub fn total(&self) -> usize {
        self.keep_first + self.keep_second + self.keep_both_renamed + self.skip
    }

    fn count(&mut self, decision: &ConflictDecision) {
        match decision {
            ConflictDecision::KeepFirst => self.keep_first += 1,
            ConflictDecision::KeepSecond => self.keep_second += 1,
            ConflictDecision::KeepBothRenamed(_) => self.keep_both_renamed += 1,
            ConflictDecision::Skip => self.skip += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub inserted: usize,
    pub collisions: CollisionCounts,
    pub errors: usize,
    pub rejected_invalid: usize,
    pub rejected_sentinel: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Collided(ConflictDecision),
    Rejected,
    Failed(ReconcileError),
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Identifier,
    Name,
}

impl Field {
    fn label(self) -> &'static str {
        match self {
            Self::Identifier => "model number",
            Self::Name => "name",
        }
    }
}

pub struct Reconciler {
    records: IndexMap<String, CanonicalRecord>,
    disallowed: Vec<String>,
    sentinels: Vec<String>,
    stats: ReconcileStats,
}

impl Reconciler {
    pub fn new(settings: &ReconcileSettings) -> Self {
        Self {
            records: IndexMap::new(),
            disallowed: settings.disallowed.clone(),
            sentinels: settings.sentinel_identifiers.clone(),
            stats: ReconcileStats::default(),
        }
    }

    /// Merge every batch, in the order given, into a fresh canonical set.
    pub fn reconcile(
        settings: &ReconcileSettings,
        batches: Vec<Vec<AdmittedRecord>>,
        policy: &mut dyn ConflictPolicy,
        ask: &mut dyn Ask,
    ) -> (Vec<CanonicalRecord>, ReconcileStats) {
        let mut reconciler = Self::new(settings);
        for batch in batches {
            reconciler.merge_batch(batch, policy, ask);
        }
        reconciler.finish()
    }

    pub fn merge_batch(
        &mut self,
        batch: Vec<AdmittedRecord>,
        policy: &mut dyn ConflictPolicy,
        ask: &mut dyn Ask,
    ) {
        let before = self.records.len();
        let n = batch.len();
        for record in batch {
            self.merge(record, policy, ask);
        }
        info!(
            "Merged batch of {} records ({} new canonical entries)",
            n,
            self.records.len() - before
        );
    }

    pub fn merge(
        &mut self,
        record: AdmittedRecord,
        policy: &mut dyn ConflictPolicy,
        ask: &mut dyn Ask,
    ) -> MergeOutcome {
        let Some(record) = self.validate(record, ask) else {
            return MergeOutcome::Rejected;
        };

        if !self.records.contains_key(&record.identifier) {
            debug!("New canonical record {}", record.composite());
            self.records
                .insert(record.identifier.clone(), CanonicalRecord::from(record));
            self.stats.inserted += 1;
            return MergeOutcome::Inserted;
        }

        let decision = policy.decide(&self.records[&record.identifier], &record, ask);
        match self.apply(record, &decision) {
            Ok(()) => {
                self.stats.collisions.count(&decision);
                MergeOutcome::Collided(decision)
            }
            Err(e) => {
                warn!("Reconciliation conflict: {}", e);
                self.stats.errors += 1;
                MergeOutcome::Failed(e)
            }
        }
    }

    fn apply(&mut self, incoming: AdmittedRecord, decision: &ConflictDecision) -> Result<(), ReconcileError> {
        match decision {
            ConflictDecision::KeepFirst | ConflictDecision::Skip => {
                debug!("Dropping duplicate {} ({})", incoming.composite(), decision.kind());
            }
            ConflictDecision::KeepSecond => {
                if let Some(existing) = self.records.get_mut(&incoming.identifier) {
                    existing.name = incoming.name;
                    existing.image_ref = incoming.image_ref;
                }
            }
            ConflictDecision::KeepBothRenamed(target) => {
                let target = target.trim();
                if target.is_empty() {
                    return Err(ReconcileError::EmptyRenameTarget {
                        original: incoming.identifier,
                    });
                }
                if self.records.contains_key(target) {
                    return Err(ReconcileError::RenameTargetExists {
                        original: incoming.identifier,
                        target: target.to_string(),
                    });
                }
                if self.offending(target) {
                    return Err(ReconcileError::DisallowedRenameTarget {
                        original: incoming.identifier,
                        target: target.to_string(),
                    });
                }
                let renamed = AdmittedRecord {
                    identifier: target.to_string(),
                    ..incoming
                };
                self.records
                    .insert(renamed.identifier.clone(), CanonicalRecord::from(renamed));
            }
        }
        Ok(())
    }

    /// Substitute offending fields via `ask`; `None` drops the record.
    fn validate(&mut self, mut record: AdmittedRecord, ask: &mut dyn Ask) -> Option<AdmittedRecord> {
        for field in [Field::Identifier, Field::Name] {
            let value = match field {
                Field::Identifier => &record.identifier,
                Field::Name => &record.name,
            };
            if !self.offending(value) {
                continue;
            }
            let prompt = format!(
                "Found unwanted string in {}: {}. Enter new {}:",
                field.label(),
                value,
                field.label()
            );
            match ask.ask(&prompt) {
                Some(v) if !self.offending(&v) => match field {
                    Field::Identifier => record.identifier = v,
                    Field::Name => record.name = v,
                },
                _ => {
                    warn!(
                        "Dropping {}: no acceptable {} supplied",
                        record.composite(),
                        field.label()
                    );
                    self.stats.rejected_invalid += 1;
                    return None;
                }
            }
        }

        if self.sentinels.iter().any(|s| *s == record.identifier) {
            warn!("Dropping {}: sentinel model number", record.composite());
            self.stats.rejected_sentinel += 1;
            return None;
        }
        Some(record)
    }

    fn offending(&self, value: &str) -> bool {
        self.disallowed.iter().any(|d| value.contains(d.as_str()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Canonical records in insertion order.
    pub fn finish(self) -> (Vec<CanonicalRecord>, ReconcileStats) {
        (self.records.into_values().collect(), self.stats)
    }
}
