//! Bulk export/import with per-line isolation and three-way conflict
//! resolution.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use field_ledger_core::{
    encode, validate, Entry, EntryId, EntryInput, EntryStatus, EvidenceInput, LedgerError,
    ProvenanceInput, Section,
};

use crate::backend::write_atomic;
use crate::guard::assert_within_root;
use crate::Ledger;

/// What to do when an imported line carries an id the store already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStrategy {
    Skip,
    Overwrite,
    Merge,
}

impl ImportStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Overwrite => "overwrite",
            Self::Merge => "merge",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "skip" => Some(Self::Skip),
            "overwrite" => Some(Self::Overwrite),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

/// Filter subset applied on export.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExportFilters {
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub min_confidence: Option<f32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_after: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_before: Option<OffsetDateTime>,
}

impl ExportFilters {
    fn admits(&self, entry: &Entry) -> bool {
        if !self.sections.is_empty() && !self.sections.contains(&entry.section) {
            return false;
        }
        if let Some(floor) = self.min_confidence {
            if entry.confidence < floor {
                return false;
            }
        }
        if let Some(bound) = self.created_after {
            if entry.created_at < bound {
                return false;
            }
        }
        if let Some(bound) = self.created_before {
            if entry.created_at > bound {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportConflict {
    pub id: String,
    pub line: usize,
    pub resolution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportLineError {
    pub line: usize,
    pub message: String,
}

/// Aggregate result of one import run. Per-line failures land in
/// `errors`; the run itself only fails on unreadable input.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub total: usize,
    pub success_count: usize,
    pub skip_count: usize,
    pub error_count: usize,
    pub conflicts: Vec<ImportConflict>,
    pub errors: Vec<ImportLineError>,
}

impl Ledger {
    /// Export surviving entries as one JSON line each.
    ///
    /// # Errors
    /// [`LedgerError::BoundaryViolation`] when `path` escapes the project
    /// root; [`LedgerError::Storage`] on read/write failure.
    pub fn export(&self, path: &Path, filters: &ExportFilters) -> Result<usize, LedgerError> {
        let safe = assert_within_root(&self.root, path)?;
        if let Some(parent) = safe.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Storage(format!("cannot create export dir: {e}")))?;
        }

        let mut contents = String::new();
        let mut count = 0_usize;
        for entry in self.entries()?.iter().filter(|e| filters.admits(e)) {
            let line = serde_json::to_string(entry)
                .map_err(|e| LedgerError::Storage(format!("cannot serialize entry: {e}")))?;
            contents.push_str(&line);
            contents.push('\n');
            count += 1;
        }
        write_atomic(&safe, contents.as_bytes())?;
        Ok(count)
    }

    /// Import a line-delimited export, isolating each line.
    ///
    /// A parse or validation failure is recorded against its line number
    /// and processing continues; nothing aborts the batch. Id collisions
    /// are resolved per `strategy` and always reported as conflicts.
    ///
    /// # Errors
    /// [`LedgerError::BoundaryViolation`] when `path` escapes the project
    /// root; [`LedgerError::Storage`] when the file cannot be read at all.
    pub fn import(
        &mut self,
        path: &Path,
        strategy: ImportStrategy,
    ) -> Result<ImportReport, LedgerError> {
        let safe = assert_within_root(&self.root, path)?;
        let contents = std::fs::read_to_string(&safe)
            .map_err(|e| LedgerError::Storage(format!("cannot read import file: {e}")))?;

        let mut existing: BTreeMap<EntryId, Entry> =
            self.entries()?.into_iter().map(|e| (e.id, e)).collect();
        let mut report = ImportReport::default();
        let now = self.now();

        for (index, line) in contents.lines().enumerate() {
            let line_no = index + 1;
            if line.trim().is_empty() {
                continue;
            }
            report.total += 1;

            let incoming: Entry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(error) => {
                    report.error_count += 1;
                    report.errors.push(ImportLineError {
                        line: line_no,
                        message: format!("parse failure: {error}"),
                    });
                    continue;
                }
            };

            if let Err(message) = check_imported(&incoming) {
                report.error_count += 1;
                report.errors.push(ImportLineError { line: line_no, message });
                continue;
            }

            let outcome = if let Some(current) = existing.get(&incoming.id) {
                self.resolve_conflict(current.clone(), incoming, strategy, line_no, now)
            } else {
                self.backend.append(&encode(&incoming)).map(|()| Applied::Inserted(incoming))
            };

            match outcome {
                Ok(Applied::Inserted(entry)) => {
                    report.success_count += 1;
                    existing.insert(entry.id, entry);
                }
                Ok(Applied::Replaced(entry, conflict)) => {
                    report.success_count += 1;
                    report.conflicts.push(conflict);
                    existing.insert(entry.id, entry);
                }
                Ok(Applied::Skipped(conflict)) => {
                    report.skip_count += 1;
                    report.conflicts.push(conflict);
                }
                Err(error) => {
                    report.error_count += 1;
                    report
                        .errors
                        .push(ImportLineError { line: line_no, message: error.to_string() });
                }
            }
        }

        if report.success_count > 0 {
            self.cache.invalidate();
        }
        Ok(report)
    }

    fn resolve_conflict(
        &mut self,
        current: Entry,
        incoming: Entry,
        strategy: ImportStrategy,
        line_no: usize,
        now: OffsetDateTime,
    ) -> Result<Applied, LedgerError> {
        let id = incoming.id.to_string();
        let conflict = move |resolution: ImportStrategy| ImportConflict {
            id: id.clone(),
            line: line_no,
            resolution: resolution.as_str().to_string(),
        };
        match strategy {
            ImportStrategy::Skip => Ok(Applied::Skipped(conflict(ImportStrategy::Skip))),
            ImportStrategy::Overwrite => {
                self.backend.update(&encode(&incoming))?;
                Ok(Applied::Replaced(incoming, conflict(ImportStrategy::Overwrite)))
            }
            ImportStrategy::Merge => {
                let merged = merge_entries(&current, &incoming, now);
                self.backend.update(&encode(&merged))?;
                Ok(Applied::Replaced(merged, conflict(ImportStrategy::Merge)))
            }
        }
    }
}

enum Applied {
    Inserted(Entry),
    Replaced(Entry, ImportConflict),
    Skipped(ImportConflict),
}

/// Re-check the schema rules on an already-typed entry, plus the
/// supersede-link invariant the type system cannot express.
fn check_imported(entry: &Entry) -> Result<(), String> {
    let outcome = validate(&entry_as_input(entry));
    if !outcome.valid {
        return Err(outcome.errors.join("; "));
    }
    if (entry.status == EntryStatus::Superseded) != entry.superseded_by.is_some() {
        return Err("superseded_by MUST be set exactly when status is superseded".to_string());
    }
    Ok(())
}

fn entry_as_input(entry: &Entry) -> EntryInput {
    EntryInput {
        section: entry.section.as_str().to_string(),
        kind: entry.kind.as_str().to_string(),
        subject: entry.subject.clone(),
        scope: entry.scope.to_string(),
        summary: entry.summary.clone(),
        content: entry.content.clone(),
        tags: entry.tags.clone(),
        confidence: Some(entry.confidence),
        evidence: entry
            .evidence
            .iter()
            .map(|e| EvidenceInput {
                evidence_type: e.evidence_type.as_str().to_string(),
                uri: e.uri.clone(),
                note: e.note.clone(),
            })
            .collect(),
        provenance: ProvenanceInput {
            source_type: entry.provenance.source_type.as_str().to_string(),
            source_ref: entry.provenance.source_ref.clone(),
            note: entry.provenance.note.clone(),
        },
        status: Some(entry.status.as_str().to_string()),
        related_entries: entry.related_entries.iter().map(ToString::to_string).collect(),
        created_by: entry.created_by.clone(),
    }
}

/// Merge an incoming duplicate into the stored entry: the
/// higher-confidence side keeps summary/content/status/provenance,
/// confidence takes the max, tags and related references union, and
/// evidence merges by URI with the incoming side winning collisions.
fn merge_entries(current: &Entry, incoming: &Entry, now: OffsetDateTime) -> Entry {
    let mut merged = current.clone();

    if incoming.confidence > current.confidence {
        merged.summary = incoming.summary.clone();
        merged.content = incoming.content.clone();
        merged.status = incoming.status;
        merged.provenance = incoming.provenance.clone();
        merged.superseded_by = if incoming.status == EntryStatus::Superseded {
            incoming.superseded_by
        } else {
            None
        };
    }
    merged.confidence = current.confidence.max(incoming.confidence);

    merged.tags.extend(incoming.tags.iter().cloned());
    for related in &incoming.related_entries {
        if !merged.related_entries.contains(related) {
            merged.related_entries.push(*related);
        }
    }
    for evidence in &incoming.evidence {
        if let Some(slot) = merged.evidence.iter_mut().find(|e| e.uri == evidence.uri) {
            *slot = evidence.clone();
        } else {
            merged.evidence.push(evidence.clone());
        }
    }
    merged.updated_at = now;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{open_test_ledger, sample_input};
    use crate::RECORD_FILE;

    #[test]
    fn export_then_reimport_with_skip_is_idempotent() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (mut ledger, _clock) = open_test_ledger(dir.path());
        ledger.create(&sample_input("one")).unwrap_or_else(|e| panic!("create: {e}"));
        ledger.create(&sample_input("two")).unwrap_or_else(|e| panic!("create: {e}"));

        let out = dir.path().join("dump.jsonl");
        let exported =
            ledger.export(&out, &ExportFilters::default()).unwrap_or_else(|e| panic!("export: {e}"));
        assert_eq!(exported, 2);

        for _ in 0..2 {
            let report = ledger
                .import(&out, ImportStrategy::Skip)
                .unwrap_or_else(|e| panic!("import: {e}"));
            assert_eq!(report.total, 2);
            assert_eq!(report.skip_count, 2);
            assert_eq!(report.success_count, 0);
            assert_eq!(report.conflicts.len(), 2);
        }
        assert_eq!(ledger.list().unwrap_or_else(|e| panic!("list: {e}")).len(), 2);
    }

    #[test]
    fn export_respects_the_filter_subset() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (mut ledger, _clock) = open_test_ledger(dir.path());

        let mut weak = sample_input("weak");
        weak.confidence = Some(0.5);
        ledger.create(&weak).unwrap_or_else(|e| panic!("create: {e}"));
        ledger.create(&sample_input("strong")).unwrap_or_else(|e| panic!("create: {e}"));

        let out = dir.path().join("dump.jsonl");
        let filters = ExportFilters { min_confidence: Some(0.8), ..ExportFilters::default() };
        let exported = ledger.export(&out, &filters).unwrap_or_else(|e| panic!("export: {e}"));
        assert_eq!(exported, 1);
    }

    #[test]
    fn export_outside_the_root_is_blocked() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (ledger, _clock) = open_test_ledger(dir.path());
        let result = ledger.export(&dir.path().join("../escape.jsonl"), &ExportFilters::default());
        assert!(matches!(result, Err(LedgerError::BoundaryViolation(_))));
    }

    #[test]
    fn corrupt_lines_are_isolated_not_fatal() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (mut ledger, _clock) = open_test_ledger(dir.path());
        ledger.create(&sample_input("keeper")).unwrap_or_else(|e| panic!("create: {e}"));

        let out = dir.path().join("dump.jsonl");
        ledger.export(&out, &ExportFilters::default()).unwrap_or_else(|e| panic!("export: {e}"));
        let mut contents =
            std::fs::read_to_string(&out).unwrap_or_else(|e| panic!("read: {e}"));
        contents.insert_str(0, "{this is not json\n");
        std::fs::write(&out, contents).unwrap_or_else(|e| panic!("write: {e}"));

        // Fresh store, so the good line imports cleanly.
        let fresh_dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (mut fresh, _clock) = open_test_ledger(fresh_dir.path());
        std::fs::copy(&out, fresh_dir.path().join("dump.jsonl"))
            .unwrap_or_else(|e| panic!("copy: {e}"));
        let report = fresh
            .import(&fresh_dir.path().join("dump.jsonl"), ImportStrategy::Skip)
            .unwrap_or_else(|e| panic!("import: {e}"));

        assert_eq!(report.total, 2);
        assert_eq!(report.success_count, 1);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.errors[0].line, 1);
    }

    #[test]
    fn overwrite_replaces_wholesale() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (mut ledger, _clock) = open_test_ledger(dir.path());
        let id = ledger.create(&sample_input("original")).unwrap_or_else(|e| panic!("create: {e}"));

        let mut entry = ledger
            .get(&id)
            .unwrap_or_else(|e| panic!("get: {e}"))
            .unwrap_or_else(|| panic!("entry should exist"));
        entry.summary = "rewritten from the dump".to_string();
        let line = serde_json::to_string(&entry).unwrap_or_else(|e| panic!("serialize: {e}"));
        let dump = dir.path().join("dump.jsonl");
        std::fs::write(&dump, format!("{line}\n")).unwrap_or_else(|e| panic!("write: {e}"));

        let report = ledger
            .import(&dump, ImportStrategy::Overwrite)
            .unwrap_or_else(|e| panic!("import: {e}"));
        assert_eq!(report.success_count, 1);
        assert_eq!(report.conflicts[0].resolution, "overwrite");

        let stored = ledger
            .get(&id)
            .unwrap_or_else(|e| panic!("get: {e}"))
            .unwrap_or_else(|| panic!("entry should exist"));
        assert_eq!(stored.summary, "rewritten from the dump");
    }

    #[test]
    fn merge_keeps_the_higher_confidence_side_and_unions_the_rest() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (mut ledger, _clock) = open_test_ledger(dir.path());
        let id = ledger.create(&sample_input("mergeable")).unwrap_or_else(|e| panic!("create: {e}"));

        let mut incoming = ledger
            .get(&id)
            .unwrap_or_else(|e| panic!("get: {e}"))
            .unwrap_or_else(|| panic!("entry should exist"));
        incoming.confidence = 0.95;
        incoming.summary = "higher confidence wins".to_string();
        incoming.tags.insert("imported".to_string());
        incoming.evidence[0].note = "updated note".to_string();
        let line = serde_json::to_string(&incoming).unwrap_or_else(|e| panic!("serialize: {e}"));
        let dump = dir.path().join("dump.jsonl");
        std::fs::write(&dump, format!("{line}\n")).unwrap_or_else(|e| panic!("write: {e}"));

        let report = ledger
            .import(&dump, ImportStrategy::Merge)
            .unwrap_or_else(|e| panic!("import: {e}"));
        assert_eq!(report.conflicts[0].resolution, "merge");

        let merged = ledger
            .get(&id)
            .unwrap_or_else(|e| panic!("get: {e}"))
            .unwrap_or_else(|| panic!("entry should exist"));
        assert_eq!(merged.summary, "higher confidence wins");
        assert!((merged.confidence - 0.95).abs() < f32::EPSILON);
        assert!(merged.tags.contains("imported"));
        assert_eq!(merged.evidence.len(), 1);
        assert_eq!(merged.evidence[0].note, "updated note");
    }

    #[test]
    fn merge_with_lower_incoming_confidence_keeps_current_text() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (mut ledger, _clock) = open_test_ledger(dir.path());
        let id = ledger.create(&sample_input("sticky")).unwrap_or_else(|e| panic!("create: {e}"));

        let mut incoming = ledger
            .get(&id)
            .unwrap_or_else(|e| panic!("get: {e}"))
            .unwrap_or_else(|| panic!("entry should exist"));
        incoming.confidence = 0.2;
        incoming.summary = "should not win".to_string();
        let line = serde_json::to_string(&incoming).unwrap_or_else(|e| panic!("serialize: {e}"));
        let dump = dir.path().join("dump.jsonl");
        std::fs::write(&dump, format!("{line}\n")).unwrap_or_else(|e| panic!("write: {e}"));

        ledger.import(&dump, ImportStrategy::Merge).unwrap_or_else(|e| panic!("import: {e}"));

        let merged = ledger
            .get(&id)
            .unwrap_or_else(|e| panic!("get: {e}"))
            .unwrap_or_else(|| panic!("entry should exist"));
        assert_eq!(merged.summary, "summary for sticky");
        assert!((merged.confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn imported_entries_survive_in_the_record_file() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (mut ledger, _clock) = open_test_ledger(dir.path());
        ledger.create(&sample_input("exported")).unwrap_or_else(|e| panic!("create: {e}"));
        let out = dir.path().join("dump.jsonl");
        ledger.export(&out, &ExportFilters::default()).unwrap_or_else(|e| panic!("export: {e}"));

        let fresh_dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
        let (mut fresh, _clock) = open_test_ledger(fresh_dir.path());
        let dump = fresh_dir.path().join("dump.jsonl");
        std::fs::copy(&out, &dump).unwrap_or_else(|e| panic!("copy: {e}"));
        let report =
            fresh.import(&dump, ImportStrategy::Skip).unwrap_or_else(|e| panic!("import: {e}"));
        assert_eq!(report.success_count, 1);

        let record_file = fresh_dir.path().join(".field-ledger").join(RECORD_FILE);
        let contents =
            std::fs::read_to_string(record_file).unwrap_or_else(|e| panic!("read: {e}"));
        assert_eq!(contents.lines().count(), 1);
    }
}
