use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::{Entry, EntryId, EntryStatus, Evidence, Kind, Scope, Section};

/// Hard ceiling on results per query; requested limits above this are
/// clamped, never honored.
pub const QUERY_LIMIT_CEILING: usize = 50;

/// Minimum confidence injected when the caller supplies none.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.6;

const SECONDS_PER_DAY: f32 = 86_400.0;

/// Immutable query description. Empty arrays mean "no constraint on this
/// dimension"; unset confidence/limit/status pick up the documented
/// defaults at execution time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryFilters {
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub kinds: Vec<Kind>,
    #[serde(default)]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<EntryStatus>,
    #[serde(default)]
    pub min_confidence: Option<f32>,
    #[serde(default)]
    pub max_confidence: Option<f32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_after: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_before: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_after: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_before: Option<OffsetDateTime>,
    #[serde(default)]
    pub summary_only: bool,
    #[serde(default)]
    pub include_related: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Per-item score components, reported alongside ranked results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankScores {
    pub composite: f32,
    pub confidence: f32,
    pub evidence_quality: f32,
    pub recency: f32,
    pub scope_match: f32,
}

/// One query result. Summary projection leaves the optional fields unset,
/// so serialized output genuinely omits content, evidence, tags, and
/// timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryItem {
    pub id: EntryId,
    pub section: Section,
    pub kind: Kind,
    pub subject: String,
    pub scope: Scope,
    pub summary: String,
    pub status: EntryStatus,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<EntryId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_entries: Vec<EntryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Vec<Evidence>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Unset on related-expansion items, which ride along unranked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<RankScores>,
}

struct Candidate<'a> {
    entry: &'a Entry,
    scores: RankScores,
}

impl Candidate<'_> {
    fn cmp(lhs: &Self, rhs: &Self) -> Ordering {
        rhs.scores
            .composite
            .partial_cmp(&lhs.scores.composite)
            .unwrap_or(Ordering::Equal)
    }
}

/// Run the filter/rank/project pipeline over a decoded record set.
///
/// Defaults are injected first (`status=[active]`, minimum confidence
/// 0.6, limit 50), then scope hierarchy expansion, conjunctive filtering,
/// composite ranking (stable on ties), truncation, projection, and
/// optional related-entry expansion.
#[must_use]
pub fn run_query(entries: &[Entry], filters: &QueryFilters, now: OffsetDateTime) -> Vec<QueryItem> {
    let statuses: Vec<EntryStatus> = if filters.statuses.is_empty() {
        vec![EntryStatus::Active]
    } else {
        filters.statuses.clone()
    };
    let min_confidence = filters.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE);
    let limit = filters.limit.unwrap_or(QUERY_LIMIT_CEILING).min(QUERY_LIMIT_CEILING);

    let mut candidates: Vec<Candidate<'_>> = entries
        .iter()
        .filter(|entry| admits(entry, filters, &statuses, min_confidence))
        .map(|entry| {
            let scores = score(entry, &filters.scopes, now);
            Candidate { entry, scores }
        })
        .collect();

    // Vec::sort_by is stable, so equal composites keep record order.
    candidates.sort_by(Candidate::cmp);
    candidates.truncate(limit);

    let mut selected_ids: BTreeSet<EntryId> = candidates.iter().map(|c| c.entry.id).collect();
    let mut items: Vec<QueryItem> = candidates
        .iter()
        .map(|c| project(c.entry, filters.summary_only, Some(c.scores.clone())))
        .collect();

    if filters.include_related {
        let related_ids: Vec<EntryId> = candidates
            .iter()
            .flat_map(|c| c.entry.related_entries.iter().copied())
            .collect();
        for id in related_ids {
            if !selected_ids.insert(id) {
                continue;
            }
            // Missing targets are soft references; drop them silently.
            if let Some(entry) = entries.iter().find(|e| e.id == id) {
                items.push(project(entry, filters.summary_only, None));
            }
        }
    }

    items
}

fn admits(
    entry: &Entry,
    filters: &QueryFilters,
    statuses: &[EntryStatus],
    min_confidence: f32,
) -> bool {
    if !statuses.contains(&entry.status) {
        return false;
    }
    if !filters.sections.is_empty() && !filters.sections.contains(&entry.section) {
        return false;
    }
    if !filters.kinds.is_empty() && !filters.kinds.contains(&entry.kind) {
        return false;
    }
    if !scope_admits(&entry.scope, &filters.scopes) {
        return false;
    }
    if !filters.subjects.is_empty() && !filters.subjects.contains(&entry.subject) {
        return false;
    }
    if !filters.tags.is_empty() && !filters.tags.iter().any(|tag| entry.tags.contains(tag)) {
        return false;
    }
    if entry.confidence < min_confidence {
        return false;
    }
    if let Some(max) = filters.max_confidence {
        if entry.confidence > max {
            return false;
        }
    }
    if let Some(bound) = filters.created_after {
        if entry.created_at < bound {
            return false;
        }
    }
    if let Some(bound) = filters.created_before {
        if entry.created_at > bound {
            return false;
        }
    }
    if let Some(bound) = filters.updated_after {
        if entry.updated_at < bound {
            return false;
        }
    }
    if let Some(bound) = filters.updated_before {
        if entry.updated_at > bound {
            return false;
        }
    }
    true
}

/// Hierarchical scope admission: an entry passes an exact scope match, and
/// broad (`repo`/`org`) entries additionally pass any narrow
/// (`customer`/`service:*`/`environment:*`) filter. Narrow entries are
/// never admitted by a filter that does not name them.
fn scope_admits(scope: &Scope, filter: &[Scope]) -> bool {
    if filter.is_empty() {
        return true;
    }
    if filter.contains(scope) {
        return true;
    }
    scope.is_broad() && filter.iter().any(Scope::is_narrow)
}

fn score(entry: &Entry, scope_filter: &[Scope], now: OffsetDateTime) -> RankScores {
    let confidence = entry.confidence;
    let evidence_quality = entry.evidence_quality();

    let age_days = (now - entry.updated_at).as_seconds_f32() / SECONDS_PER_DAY;
    let recency = (1.0 - age_days / 365.0).clamp(0.0, 1.0);

    let scope_match = if scope_filter.is_empty() {
        0.5
    } else if scope_filter.contains(&entry.scope) {
        1.0
    } else if entry.scope.is_broad() {
        0.5
    } else {
        0.0
    };

    let composite =
        0.5 * confidence + 0.3 * evidence_quality + 0.1 * recency + 0.1 * scope_match;
    RankScores { composite, confidence, evidence_quality, recency, scope_match }
}

fn project(entry: &Entry, summary_only: bool, scores: Option<RankScores>) -> QueryItem {
    let mut item = QueryItem {
        id: entry.id,
        section: entry.section,
        kind: entry.kind,
        subject: entry.subject.clone(),
        scope: entry.scope.clone(),
        summary: entry.summary.clone(),
        status: entry.status,
        confidence: entry.confidence,
        superseded_by: entry.superseded_by,
        related_entries: entry.related_entries.clone(),
        content: None,
        evidence: None,
        tags: None,
        created_at: None,
        updated_at: None,
        created_by: None,
        scores,
    };
    if !summary_only {
        item.content = Some(entry.content.clone());
        item.evidence = Some(entry.evidence.clone());
        item.tags = Some(entry.tags.clone());
        item.created_at = Some(entry.created_at);
        item.updated_at = Some(entry.updated_at);
        item.created_by = Some(entry.created_by.clone());
    }
    item
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::format_description::well_known::Rfc3339;

    use super::*;
    use crate::model::{Environment, EvidenceType, Provenance, SourceType};

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::parse("2026-08-01T00:00:00Z", &Rfc3339)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    fn mk_entry(subject: &str, scope: Scope, confidence: f32, evidence: EvidenceType) -> Entry {
        let now = fixture_time();
        Entry {
            id: EntryId::new(),
            section: Section::Observations,
            kind: Kind::Other,
            subject: subject.to_string(),
            scope,
            summary: format!("summary of {subject}"),
            content: format!("content of {subject}"),
            tags: BTreeSet::new(),
            confidence,
            evidence: vec![Evidence {
                evidence_type: evidence,
                uri: format!("refs/{subject}"),
                note: "fixture".to_string(),
            }],
            provenance: Provenance {
                source_type: SourceType::Manual,
                source_ref: None,
                note: None,
            },
            status: EntryStatus::Active,
            superseded_by: None,
            related_entries: Vec::new(),
            created_by: "tester".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn default_filters_hide_low_confidence_and_inactive() {
        let low = mk_entry("low", Scope::Repo, 0.4, EvidenceType::Code);
        let high = mk_entry("high", Scope::Repo, 0.8, EvidenceType::Code);
        let mut draft = mk_entry("draft", Scope::Repo, 0.9, EvidenceType::Code);
        draft.status = EntryStatus::Draft;

        let items = run_query(
            &[low, high.clone(), draft],
            &QueryFilters::default(),
            fixture_time(),
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, high.id);
    }

    #[test]
    fn scope_hierarchy_admits_broad_not_sibling_narrow() {
        let repo = mk_entry("repo-fact", Scope::Repo, 0.9, EvidenceType::Code);
        let auth = mk_entry("auth-fact", Scope::Service("auth".to_string()), 0.9, EvidenceType::Code);
        let payments =
            mk_entry("pay-fact", Scope::Service("payments".to_string()), 0.9, EvidenceType::Code);

        let filters = QueryFilters {
            scopes: vec![Scope::Service("auth".to_string())],
            ..QueryFilters::default()
        };
        let items = run_query(
            &[repo.clone(), auth.clone(), payments.clone()],
            &filters,
            fixture_time(),
        );
        let ids: Vec<EntryId> = items.iter().map(|i| i.id).collect();
        assert!(ids.contains(&repo.id));
        assert!(ids.contains(&auth.id));
        assert!(!ids.contains(&payments.id));
    }

    #[test]
    fn narrow_entries_stay_invisible_to_broad_filters() {
        let auth = mk_entry("auth-fact", Scope::Service("auth".to_string()), 0.9, EvidenceType::Code);
        let filters = QueryFilters { scopes: vec![Scope::Repo], ..QueryFilters::default() };
        assert!(run_query(&[auth], &filters, fixture_time()).is_empty());
    }

    #[test]
    fn environment_filter_admits_org_entries() {
        let org = mk_entry("org-fact", Scope::Org, 0.9, EvidenceType::Code);
        let filters = QueryFilters {
            scopes: vec![Scope::Environment(Environment::Prod)],
            ..QueryFilters::default()
        };
        let items = run_query(&[org.clone()], &filters, fixture_time());
        assert_eq!(items.len(), 1);
        let Some(scores) = &items[0].scores else {
            panic!("primary items carry scores");
        };
        assert!((scores.scope_match - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn code_evidence_outranks_assumption_at_equal_confidence() {
        let assumed = mk_entry("assumed", Scope::Repo, 0.8, EvidenceType::Assumption);
        let proven = mk_entry("proven", Scope::Repo, 0.8, EvidenceType::Code);
        let items = run_query(
            &[assumed.clone(), proven.clone()],
            &QueryFilters::default(),
            fixture_time(),
        );
        assert_eq!(items[0].id, proven.id);
        assert_eq!(items[1].id, assumed.id);
    }

    #[test]
    fn higher_confidence_outranks_at_equal_evidence() {
        let weaker = mk_entry("weaker", Scope::Repo, 0.7, EvidenceType::Code);
        let stronger = mk_entry("stronger", Scope::Repo, 0.95, EvidenceType::Code);
        let items = run_query(
            &[weaker.clone(), stronger.clone()],
            &QueryFilters::default(),
            fixture_time(),
        );
        assert_eq!(items[0].id, stronger.id);
    }

    #[test]
    fn stale_entries_rank_below_fresh_ones() {
        let mut stale = mk_entry("stale", Scope::Repo, 0.8, EvidenceType::Code);
        stale.updated_at = fixture_time() - time::Duration::days(400);
        let fresh = mk_entry("fresh", Scope::Repo, 0.8, EvidenceType::Code);
        let items = run_query(&[stale, fresh.clone()], &QueryFilters::default(), fixture_time());
        assert_eq!(items[0].id, fresh.id);
    }

    #[test]
    fn ties_preserve_record_order() {
        let first = mk_entry("first", Scope::Repo, 0.8, EvidenceType::Code);
        let second = mk_entry("second", Scope::Repo, 0.8, EvidenceType::Code);
        let items = run_query(
            &[first.clone(), second.clone()],
            &QueryFilters::default(),
            fixture_time(),
        );
        assert_eq!(items[0].id, first.id);
        assert_eq!(items[1].id, second.id);
    }

    #[test]
    fn limit_is_capped_at_the_ceiling() {
        let entries: Vec<Entry> = (0..80)
            .map(|i| mk_entry(&format!("entry-{i}"), Scope::Repo, 0.9, EvidenceType::Code))
            .collect();
        let filters = QueryFilters { limit: Some(1000), ..QueryFilters::default() };
        let items = run_query(&entries, &filters, fixture_time());
        assert_eq!(items.len(), QUERY_LIMIT_CEILING);
    }

    #[test]
    fn summary_projection_strips_heavy_fields() {
        let mut entry = mk_entry("projected", Scope::Repo, 0.9, EvidenceType::Code);
        entry.tags.insert("keep".to_string());
        let filters = QueryFilters { summary_only: true, ..QueryFilters::default() };
        let items = run_query(&[entry], &filters, fixture_time());
        assert_eq!(items.len(), 1);
        assert!(items[0].content.is_none());
        assert!(items[0].evidence.is_none());
        assert!(items[0].tags.is_none());
        assert!(items[0].created_at.is_none());
        assert!(items[0].updated_at.is_none());
        assert!(!items[0].summary.is_empty());
    }

    #[test]
    fn related_expansion_appends_unranked_and_drops_missing() {
        let related = mk_entry("related", Scope::Repo, 0.9, EvidenceType::Doc);
        let missing = EntryId::new();
        let mut primary = mk_entry("primary", Scope::Repo, 0.95, EvidenceType::Code);
        primary.related_entries = vec![related.id, missing];

        let filters = QueryFilters { include_related: true, ..QueryFilters::default() };
        let items = run_query(&[primary.clone(), related.clone()], &filters, fixture_time());

        // `related` already qualifies on its own, so it is not duplicated.
        assert_eq!(items.len(), 2);

        let mut shy_related = related;
        shy_related.confidence = 0.3;
        let items = run_query(
            &[primary.clone(), shy_related.clone()],
            &filters,
            fixture_time(),
        );
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].id, shy_related.id);
        assert!(items[1].scores.is_none());
    }

    proptest! {
        #[test]
        fn property_ranking_is_deterministic_for_distinct_scores(seed in any::<u64>()) {
            let base: Vec<Entry> = (0..8)
                .map(|i| {
                    #[allow(clippy::cast_precision_loss)]
                    let confidence = 0.6 + (i as f32) * 0.04;
                    mk_entry(&format!("e{i}"), Scope::Repo, confidence, EvidenceType::Code)
                })
                .collect();

            let mut shuffled = base.clone();
            let mut state = seed;
            for i in (1..shuffled.len()).rev() {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                #[allow(clippy::cast_possible_truncation)]
                let j = (state % (i as u64 + 1)) as usize;
                shuffled.swap(i, j);
            }

            let expected: Vec<EntryId> =
                run_query(&base, &QueryFilters::default(), fixture_time())
                    .iter()
                    .map(|i| i.id)
                    .collect();
            let got: Vec<EntryId> =
                run_query(&shuffled, &QueryFilters::default(), fixture_time())
                    .iter()
                    .map(|i| i.id)
                    .collect();
            prop_assert_eq!(expected, got);
        }
    }
}
