//! Domain core for the FieldLedger knowledge store.
//!
//! Everything in this crate is pure: the entry model, schema validation,
//! secret scanning, the record codec, and the query engine all operate on
//! values handed in by the caller. Persistence lives in
//! `field-ledger-store`.

mod codec;
mod model;
mod query;
mod scan;
mod validate;

pub use codec::{decode, encode, EntryRecord, METADATA_MARKER};
pub use model::{
    Entry, EntryId, EntryInput, EntryStatus, Environment, Evidence, EvidenceInput, EvidenceType,
    Kind, Provenance, ProvenanceInput, Scope, Section, SourceType, CONTENT_MAX_CHARS,
    SUMMARY_MAX_CHARS,
};
pub use query::{run_query, QueryFilters, QueryItem, RankScores, QUERY_LIMIT_CEILING};
pub use scan::{scan, ScanOutcome};
pub use validate::{validate, ValidationOutcome, LOW_CONFIDENCE_WARNING_THRESHOLD};

/// Closed error taxonomy shared by the core and the store.
///
/// Callers pattern-match recoverable kinds (`Validation`, `Conflict`)
/// against fatal ones (`BoundaryViolation`, `Storage`) instead of
/// inspecting message text.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation failed: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },
    #[error("secret detected, write blocked: {}", .errors.join("; "))]
    SecretDetected { errors: Vec<String> },
    #[error("evidence invalid: {0}")]
    EvidenceInvalid(String),
    #[error("duplicate entry for subject '{subject}' in scope '{scope}'")]
    Conflict { subject: String, scope: String },
    #[error("query error: {0}")]
    Query(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("workspace boundary violation: {0}")]
    BoundaryViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
}
