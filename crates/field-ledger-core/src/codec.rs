use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::model::{
    Entry, EntryId, EntryStatus, Evidence, Kind, Provenance, Scope, Section, SourceType,
};

/// Literal separator between an entry's content and its metadata block
/// inside a record body.
pub const METADATA_MARKER: &str = "---METADATA---";

/// On-disk record: one line of the record file, and the payload exchanged
/// with the tracker backend. Every field is defaulted so a partially
/// corrupt line still parses.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Structured metadata riding in the record body after the marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordMeta {
    #[serde(default)]
    subject: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    evidence: Vec<Evidence>,
    #[serde(default)]
    provenance: Option<Provenance>,
    #[serde(default)]
    superseded_by: Option<String>,
    #[serde(default)]
    related_entries: Vec<String>,
    #[serde(default)]
    created_by: String,
}

impl Default for RecordMeta {
    fn default() -> Self {
        Self {
            subject: String::new(),
            confidence: default_confidence(),
            evidence: Vec::new(),
            provenance: None,
            superseded_by: None,
            related_entries: Vec::new(),
            created_by: String::new(),
        }
    }
}

fn default_confidence() -> f32 {
    0.5
}

#[must_use]
pub fn encode(entry: &Entry) -> EntryRecord {
    let meta = RecordMeta {
        subject: entry.subject.clone(),
        confidence: entry.confidence,
        evidence: entry.evidence.clone(),
        provenance: Some(entry.provenance.clone()),
        superseded_by: entry.superseded_by.map(|id| id.to_string()),
        related_entries: entry.related_entries.iter().map(ToString::to_string).collect(),
        created_by: entry.created_by.clone(),
    };
    let meta_json = serde_json::to_string(&meta).unwrap_or_else(|_| "{}".to_string());

    let mut labels = vec![
        format!("section:{}", entry.section.as_str()),
        format!("kind:{}", entry.kind.as_str()),
        format!("scope:{}", entry.scope),
        format!("status:{}", entry.status.as_str()),
    ];
    labels.extend(entry.tags.iter().map(|tag| format!("tag:{tag}")));

    EntryRecord {
        id: entry.id.to_string(),
        title: entry.summary.clone(),
        body: format!("{}\n\n{METADATA_MARKER}\n{meta_json}", entry.content),
        labels,
        created_by: entry.created_by.clone(),
        created_at: format_timestamp(entry.created_at),
        updated_at: format_timestamp(entry.updated_at),
    }
}

/// Decode a record back into an entry.
///
/// Never fails: a malformed or missing metadata block falls back to
/// per-field defaults (confidence 0.5, evidence [], scope repo, section
/// observations) so one corrupt record cannot take a whole query down.
#[must_use]
pub fn decode(record: &EntryRecord) -> Entry {
    let (content, meta) = split_body(&record.body);

    let mut section = Section::Observations;
    let mut kind = Kind::Other;
    let mut scope = Scope::Repo;
    let mut status = EntryStatus::Active;
    let mut tags = BTreeSet::new();
    for label in &record.labels {
        if let Some(value) = label.strip_prefix("section:") {
            section = Section::parse(value).unwrap_or(section);
        } else if let Some(value) = label.strip_prefix("kind:") {
            kind = Kind::parse(value).unwrap_or(kind);
        } else if let Some(value) = label.strip_prefix("scope:") {
            scope = Scope::parse(value).unwrap_or(scope);
        } else if let Some(value) = label.strip_prefix("status:") {
            status = EntryStatus::parse(value).unwrap_or(status);
        } else if let Some(value) = label.strip_prefix("tag:") {
            tags.insert(value.to_string());
        }
    }

    let created_at = parse_timestamp(&record.created_at);
    let mut updated_at = parse_timestamp(&record.updated_at);
    if updated_at < created_at {
        updated_at = created_at;
    }

    // superseded_by only means something on a superseded entry.
    let superseded_by = if status == EntryStatus::Superseded {
        meta.superseded_by.as_deref().and_then(EntryId::parse)
    } else {
        None
    };

    let created_by = if record.created_by.is_empty() {
        meta.created_by.clone()
    } else {
        record.created_by.clone()
    };

    Entry {
        id: EntryId::parse(&record.id).unwrap_or_default(),
        section,
        kind,
        subject: meta.subject,
        scope,
        summary: record.title.clone(),
        content: content.to_string(),
        tags,
        confidence: meta.confidence.clamp(0.0, 1.0),
        evidence: meta.evidence,
        provenance: meta.provenance.unwrap_or_else(|| Provenance {
            source_type: SourceType::Other,
            source_ref: None,
            note: None,
        }),
        status,
        superseded_by,
        related_entries: meta
            .related_entries
            .iter()
            .filter_map(|id| EntryId::parse(id))
            .collect(),
        created_by,
        created_at,
        updated_at,
    }
}

fn split_body(body: &str) -> (&str, RecordMeta) {
    let Some((content, meta_json)) = body.split_once(METADATA_MARKER) else {
        return (body, RecordMeta::default());
    };
    let meta = serde_json::from_str(meta_json.trim()).unwrap_or_default();
    // encode appends exactly one blank line before the marker; strip only
    // that so content with trailing newlines of its own survives.
    let content = content.strip_suffix("\n\n").unwrap_or_else(|| content.trim_end_matches('\n'));
    (content, meta)
}

fn format_timestamp(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_default()
}

fn parse_timestamp(value: &str) -> OffsetDateTime {
    OffsetDateTime::parse(value, &Rfc3339).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Environment, EvidenceType};

    fn fixture_entry() -> Entry {
        let created = parse_timestamp("2026-07-01T10:00:00Z");
        Entry {
            id: EntryId::new(),
            section: Section::Decisions,
            kind: Kind::Decision,
            subject: "cache invalidation".to_string(),
            scope: Scope::Environment(Environment::Staging),
            summary: "Invalidate statistics cache on every write".to_string(),
            content: "Stale snapshots after supersede confused the dashboard.".to_string(),
            tags: ["cache".to_string(), "stats".to_string()].into_iter().collect(),
            confidence: 0.85,
            evidence: vec![Evidence {
                evidence_type: EvidenceType::Code,
                uri: "src/stats.rs#L88".to_string(),
                note: "invalidation hook".to_string(),
            }],
            provenance: Provenance {
                source_type: SourceType::AgentResult,
                source_ref: Some("run-412".to_string()),
                note: None,
            },
            status: EntryStatus::Active,
            superseded_by: None,
            related_entries: vec![EntryId::new()],
            created_by: "agent-3".to_string(),
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let entry = fixture_entry();
        let decoded = decode(&encode(&entry));
        assert_eq!(decoded, entry);
    }

    #[test]
    fn round_trip_preserves_superseded_link() {
        let mut entry = fixture_entry();
        let replacement = EntryId::new();
        entry.status = EntryStatus::Superseded;
        entry.superseded_by = Some(replacement);
        let decoded = decode(&encode(&entry));
        assert_eq!(decoded.status, EntryStatus::Superseded);
        assert_eq!(decoded.superseded_by, Some(replacement));
    }

    #[test]
    fn labels_carry_all_facets() {
        let record = encode(&fixture_entry());
        assert!(record.labels.contains(&"section:decisions".to_string()));
        assert!(record.labels.contains(&"kind:decision".to_string()));
        assert!(record.labels.contains(&"scope:environment:staging".to_string()));
        assert!(record.labels.contains(&"status:active".to_string()));
        assert!(record.labels.contains(&"tag:cache".to_string()));
        assert!(record.labels.contains(&"tag:stats".to_string()));
    }

    #[test]
    fn missing_metadata_block_falls_back_to_defaults() {
        let record = EntryRecord {
            id: EntryId::new().to_string(),
            title: "bare record".to_string(),
            body: "just some text, no marker".to_string(),
            labels: Vec::new(),
            created_by: "someone".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        };
        let entry = decode(&record);
        assert_eq!(entry.section, Section::Observations);
        assert_eq!(entry.scope, Scope::Repo);
        assert_eq!(entry.status, EntryStatus::Active);
        assert!((entry.confidence - 0.5).abs() < f32::EPSILON);
        assert!(entry.evidence.is_empty());
        assert_eq!(entry.content, "just some text, no marker");
    }

    #[test]
    fn corrupt_metadata_json_does_not_fail() {
        let record = EntryRecord {
            id: EntryId::new().to_string(),
            title: "corrupt".to_string(),
            body: format!("content here\n\n{METADATA_MARKER}\n{{not json"),
            labels: vec!["section:learnings".to_string()],
            ..EntryRecord::default()
        };
        let entry = decode(&record);
        assert_eq!(entry.section, Section::Learnings);
        assert!((entry.confidence - 0.5).abs() < f32::EPSILON);
        assert!(entry.evidence.is_empty());
        assert_eq!(entry.content, "content here");
    }

    #[test]
    fn bad_timestamps_fall_back_to_epoch_and_stay_ordered() {
        let record = EntryRecord {
            created_at: "2026-05-01T00:00:00Z".to_string(),
            updated_at: "not a timestamp".to_string(),
            ..EntryRecord::default()
        };
        let entry = decode(&record);
        assert_eq!(entry.created_at, parse_timestamp("2026-05-01T00:00:00Z"));
        assert_eq!(entry.updated_at, entry.created_at);
    }

    #[test]
    fn unknown_labels_are_ignored() {
        let record = EntryRecord {
            labels: vec![
                "section:bogus".to_string(),
                "priority:high".to_string(),
                "kind:incident".to_string(),
            ],
            ..EntryRecord::default()
        };
        let entry = decode(&record);
        assert_eq!(entry.section, Section::Observations);
        assert_eq!(entry.kind, Kind::Incident);
    }
}
