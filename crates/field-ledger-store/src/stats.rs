use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use field_ledger_core::{Entry, EvidenceType};

/// How long a computed snapshot stays servable from the cache.
pub const STATISTICS_TTL: Duration = Duration::minutes(5);

/// Clock seam so TTL behavior is deterministic under test.
pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock used outside tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Creation-time bounds a snapshot is computed over.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
}

impl DateRange {
    fn cache_key(&self) -> String {
        let render = |t: Option<OffsetDateTime>| {
            t.and_then(|t| t.format(&Rfc3339).ok()).unwrap_or_else(|| "*".to_string())
        };
        format!("{}..{}", render(self.from), render(self.to))
    }

    fn contains(&self, at: OffsetDateTime) -> bool {
        if let Some(from) = self.from {
            if at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if at > to {
                return false;
            }
        }
        true
    }
}

/// Derived view over the store. Never authoritative; always recomputable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatisticsSnapshot {
    pub total_entries: usize,
    pub by_section: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub by_scope: BTreeMap<String, usize>,
    pub average_confidence: f32,
    /// Entries carrying at least one code or artifact evidence pointer.
    pub with_strong_evidence: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

#[must_use]
pub fn compute_snapshot(
    entries: &[Entry],
    range: &DateRange,
    now: OffsetDateTime,
) -> StatisticsSnapshot {
    let mut by_section = BTreeMap::new();
    let mut by_status = BTreeMap::new();
    let mut by_scope = BTreeMap::new();
    let mut confidence_sum = 0.0_f32;
    let mut total = 0_usize;
    let mut strong = 0_usize;

    for entry in entries.iter().filter(|e| range.contains(e.created_at)) {
        total += 1;
        confidence_sum += entry.confidence;
        *by_section.entry(entry.section.as_str().to_string()).or_insert(0) += 1;
        *by_status.entry(entry.status.as_str().to_string()).or_insert(0) += 1;
        *by_scope.entry(entry.scope.to_string()).or_insert(0) += 1;
        let has_strong = entry.evidence.iter().any(|e| {
            matches!(e.evidence_type, EvidenceType::Code | EvidenceType::Artifact)
        });
        if has_strong {
            strong += 1;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let average_confidence = if total == 0 { 0.0 } else { confidence_sum / total as f32 };

    StatisticsSnapshot {
        total_entries: total,
        by_section,
        by_status,
        by_scope,
        average_confidence,
        with_strong_evidence: strong,
        generated_at: now,
    }
}

/// TTL + write-invalidated cache for statistics snapshots, keyed by
/// `(store identity, date range)`. Owned by the `Ledger` instance; nothing
/// here is a process-wide singleton.
#[derive(Debug, Default)]
pub struct StatsCache {
    slots: HashMap<(String, String), (OffsetDateTime, StatisticsSnapshot)>,
}

impl StatsCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(
        &self,
        identity: &str,
        range: &DateRange,
        now: OffsetDateTime,
    ) -> Option<StatisticsSnapshot> {
        let key = (identity.to_string(), range.cache_key());
        let (computed_at, snapshot) = self.slots.get(&key)?;
        if now - *computed_at < STATISTICS_TTL {
            Some(snapshot.clone())
        } else {
            None
        }
    }

    pub fn put(&mut self, identity: &str, range: &DateRange, snapshot: StatisticsSnapshot) {
        let key = (identity.to_string(), range.cache_key());
        self.slots.insert(key, (snapshot.generated_at, snapshot));
    }

    /// Drop every cached snapshot. Called synchronously from each
    /// successful write before it returns.
    pub fn invalidate(&mut self) {
        self.slots.clear();
    }
}
