use tracing::{debug, warn};

use crate::ask::Ask;
use crate::model::{AdmittedRecord, CandidateRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arbitration {
    Admitted(AdmittedRecord),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Neither identifier nor name was extracted.
    NoIdentity,
    /// The human declined to supply a missing field.
    Declined,
}

/// Fill a missing identifier or name by asking, at most once per field.
pub fn resolve(candidate: CandidateRecord, ask: &mut dyn Ask) -> Arbitration {
    let CandidateRecord {
        identifier,
        name,
        image_ref,
        source_batch,
    } = candidate;

    let (identifier, name) = match (identifier, name) {
        (None, None) => {
            debug!("Skipping fragment with no identifier or name ({})", source_batch);
            return Arbitration::Skipped(SkipReason::NoIdentity);
        }
        (Some(id), Some(name)) => (id, name),
        (None, Some(name)) => {
            let Some(id) = ask.ask(&format!("Enter model number for title: {}", name)) else {
                warn!("No model number supplied for '{}', skipping", name);
                return Arbitration::Skipped(SkipReason::Declined);
            };
            (id, name)
        }
        (Some(id), None) => {
            let Some(name) = ask.ask(&format!("Enter title for model number: {}", id)) else {
                warn!("No title supplied for model {}, skipping", id);
                return Arbitration::Skipped(SkipReason::Declined);
            };
            (id, name)
        }
    };

    let record = AdmittedRecord {
        identifier,
        name,
        image_ref: image_ref.unwrap_or_default(),
        source_batch,
    };
    debug!("Admitted {}", record.composite());
    Arbitration::Admitted(record)
}
