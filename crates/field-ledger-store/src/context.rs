//! Grouped-by-subject Markdown digest of the store's strongest knowledge,
//! written for downstream consumers that read files rather than call the
//! query API.

use std::collections::BTreeMap;
use std::path::PathBuf;

use time::format_description::well_known::Rfc3339;

use field_ledger_core::{Entry, EntryStatus, EvidenceType, LedgerError};

use crate::backend::write_atomic;
use crate::guard::assert_within_root;
use crate::{Ledger, CONTEXT_FILE};

/// Entries below this confidence stay out of the synced context.
pub const CONTEXT_MIN_CONFIDENCE: f32 = 0.8;

fn qualifies(entry: &Entry) -> bool {
    entry.status == EntryStatus::Active
        && entry.confidence >= CONTEXT_MIN_CONFIDENCE
        && entry.evidence.iter().any(|e| {
            matches!(e.evidence_type, EvidenceType::Code | EvidenceType::Artifact)
        })
}

impl Ledger {
    /// Write the context digest and return its path.
    ///
    /// Only active, high-confidence entries backed by code or artifact
    /// evidence make the cut; they are grouped by subject so consumers see
    /// one section per topic.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] on read/write failure and
    /// [`LedgerError::BoundaryViolation`] if the storage directory has
    /// been moved outside the root since open.
    pub fn sync_context(&self) -> Result<PathBuf, LedgerError> {
        let target = assert_within_root(&self.root, &self.storage_dir.join(CONTEXT_FILE))?;

        let mut by_subject: BTreeMap<String, Vec<Entry>> = BTreeMap::new();
        for entry in self.entries()?.into_iter().filter(qualifies) {
            by_subject.entry(entry.subject.clone()).or_default().push(entry);
        }

        let generated = self.now().format(&Rfc3339).unwrap_or_default();
        let mut doc = String::new();
        doc.push_str("# Validated project knowledge\n\n");
        doc.push_str(&format!("_Synced {generated}. High-confidence entries with code or artifact evidence._\n"));

        for (subject, entries) in &by_subject {
            doc.push_str(&format!("\n## {subject}\n\n"));
            for entry in entries {
                doc.push_str(&format!(
                    "- **{}** ({}, {}, confidence {:.2})\n",
                    entry.summary,
                    entry.section.as_str(),
                    entry.scope,
                    entry.confidence
                ));
                if !entry.content.is_empty() {
                    for line in entry.content.lines() {
                        doc.push_str(&format!("  {line}\n"));
                    }
                }
                for evidence in &entry.evidence {
                    doc.push_str(&format!(
                        "  - evidence ({}): {}\n",
                        evidence.evidence_type.as_str(),
                        evidence.uri
                    ));
                }
            }
        }

        write_atomic(&target, doc.as_bytes())?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{open_test_ledger, sample_input};

    #[test]
    fn context_includes_only_strong_entries_grouped_by_subject() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (mut ledger, _clock) = open_test_ledger(dir.path());

        ledger.create(&sample_input("caching")).unwrap_or_else(|e| panic!("create: {e}"));

        let mut weak = sample_input("hunches");
        weak.confidence = Some(0.6);
        ledger.create(&weak).unwrap_or_else(|e| panic!("create: {e}"));

        let mut assumed = sample_input("guesses");
        assumed.evidence[0].evidence_type = "assumption".to_string();
        ledger.create(&assumed).unwrap_or_else(|e| panic!("create: {e}"));

        let path = ledger.sync_context().unwrap_or_else(|e| panic!("sync: {e}"));
        let doc = std::fs::read_to_string(path).unwrap_or_else(|e| panic!("read: {e}"));

        assert!(doc.contains("## caching"));
        assert!(doc.contains("summary for caching"));
        assert!(!doc.contains("hunches"));
        assert!(!doc.contains("guesses"));
    }

    #[test]
    fn deprecated_entries_drop_out_of_the_context() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (mut ledger, _clock) = open_test_ledger(dir.path());

        let id = ledger.create(&sample_input("retired")).unwrap_or_else(|e| panic!("create: {e}"));
        ledger.deprecate(&id).unwrap_or_else(|e| panic!("deprecate: {e}"));

        let path = ledger.sync_context().unwrap_or_else(|e| panic!("sync: {e}"));
        let doc = std::fs::read_to_string(path).unwrap_or_else(|e| panic!("read: {e}"));
        assert!(!doc.contains("retired"));
    }
}
