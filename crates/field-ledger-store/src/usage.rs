use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use field_ledger_core::QueryFilters;

/// Rotation thresholds for the usage log.
pub const USAGE_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const USAGE_MAX_LINES: usize = 10_000;

/// Shape of one query, without its results: which dimensions were
/// constrained and how many entries came back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryShape {
    pub timestamp: String,
    pub sections: Vec<String>,
    pub kinds: Vec<String>,
    pub scopes: Vec<String>,
    pub subjects: usize,
    pub tags: Vec<String>,
    pub statuses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f32>,
    pub summary_only: bool,
    pub include_related: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_limit: Option<usize>,
    pub result_count: usize,
}

impl QueryShape {
    #[must_use]
    pub fn from_filters(filters: &QueryFilters, result_count: usize, now: OffsetDateTime) -> Self {
        Self {
            timestamp: now.format(&Rfc3339).unwrap_or_default(),
            sections: filters.sections.iter().map(|s| s.as_str().to_string()).collect(),
            kinds: filters.kinds.iter().map(|k| k.as_str().to_string()).collect(),
            scopes: filters.scopes.iter().map(ToString::to_string).collect(),
            subjects: filters.subjects.len(),
            tags: filters.tags.clone(),
            statuses: filters.statuses.iter().map(|s| s.as_str().to_string()).collect(),
            min_confidence: filters.min_confidence,
            summary_only: filters.summary_only,
            include_related: filters.include_related,
            requested_limit: filters.limit,
            result_count,
        }
    }
}

/// Append-only query-shape log with half-length rotation.
///
/// Every write is best-effort: failures are logged and swallowed so a
/// usage-log problem can never fail the query that triggered it.
#[derive(Debug, Clone)]
pub struct UsageLogger {
    path: PathBuf,
}

impl UsageLogger {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn record(&self, shape: &QueryShape) {
        if let Err(error) = self.try_record(shape) {
            tracing::warn!(path = %self.path.display(), %error, "usage log write failed");
        }
    }

    fn try_record(&self, shape: &QueryShape) -> std::io::Result<()> {
        self.rotate_if_needed()?;
        let line = serde_json::to_string(shape)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")
    }

    /// Keep the most recent half once the log exceeds either threshold.
    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let Ok(metadata) = std::fs::metadata(&self.path) else {
            return Ok(());
        };

        let oversized = metadata.len() > USAGE_MAX_BYTES;
        let contents = if oversized {
            std::fs::read_to_string(&self.path)?
        } else if metadata.len() > (USAGE_MAX_LINES as u64) * 8 {
            // Cheap lower bound: a line is at least 8 bytes, so smaller
            // files cannot exceed the line threshold.
            std::fs::read_to_string(&self.path)?
        } else {
            return Ok(());
        };

        let lines: Vec<&str> = contents.lines().collect();
        if !oversized && lines.len() <= USAGE_MAX_LINES {
            return Ok(());
        }

        let keep_from = lines.len() / 2;
        let mut kept = lines[keep_from..].join("\n");
        if !kept.is_empty() {
            kept.push('\n');
        }
        crate::backend::write_atomic(&self.path, kept.as_bytes())
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}
