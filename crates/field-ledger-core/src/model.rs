use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::validate;
use crate::LedgerError;

/// Maximum length of an entry summary, in characters.
pub const SUMMARY_MAX_CHARS: usize = 300;

/// Maximum length of an entry body, in characters.
pub const CONTENT_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId(pub Ulid);

impl EntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_str(value).ok().map(Self)
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Decisions,
    State,
    Observations,
    Learnings,
}

impl Section {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decisions => "decisions",
            Self::State => "state",
            Self::Observations => "observations",
            Self::Learnings => "learnings",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "decisions" => Some(Self::Decisions),
            "state" => Some(Self::State),
            "observations" => Some(Self::Observations),
            "learnings" => Some(Self::Learnings),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Decision,
    Requirement,
    Invariant,
    Incident,
    Metric,
    Hypothesis,
    RunbookStep,
    Other,
}

impl Kind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Requirement => "requirement",
            Self::Invariant => "invariant",
            Self::Incident => "incident",
            Self::Metric => "metric",
            Self::Hypothesis => "hypothesis",
            Self::RunbookStep => "runbook_step",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "decision" => Some(Self::Decision),
            "requirement" => Some(Self::Requirement),
            "invariant" => Some(Self::Invariant),
            "incident" => Some(Self::Incident),
            "metric" => Some(Self::Metric),
            "hypothesis" => Some(Self::Hypothesis),
            "runbook_step" => Some(Self::RunbookStep),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Active,
    Superseded,
    Deprecated,
    Draft,
}

impl EntryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Deprecated => "deprecated",
            Self::Draft => "draft",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "superseded" => Some(Self::Superseded),
            "deprecated" => Some(Self::Deprecated),
            "draft" => Some(Self::Draft),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    Code,
    Artifact,
    Log,
    Screenshot,
    Assumption,
    Ticket,
    Doc,
}

impl EvidenceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Artifact => "artifact",
            Self::Log => "log",
            Self::Screenshot => "screenshot",
            Self::Assumption => "assumption",
            Self::Ticket => "ticket",
            Self::Doc => "doc",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "code" => Some(Self::Code),
            "artifact" => Some(Self::Artifact),
            "log" => Some(Self::Log),
            "screenshot" => Some(Self::Screenshot),
            "assumption" => Some(Self::Assumption),
            "ticket" => Some(Self::Ticket),
            "doc" => Some(Self::Doc),
            _ => None,
        }
    }

    /// Ranking weight of one piece of evidence. Direct pointers into the
    /// codebase or a produced artifact carry the most weight, bare
    /// assumptions the least.
    #[must_use]
    pub fn quality_weight(self) -> f32 {
        match self {
            Self::Code | Self::Artifact => 1.0,
            Self::Ticket | Self::Doc => 0.8,
            Self::Log | Self::Screenshot => 0.6,
            Self::Assumption => 0.4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    FieldNote,
    AgentResult,
    Manual,
    Import,
    Validation,
    Compaction,
    System,
    Other,
}

impl SourceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FieldNote => "field_note",
            Self::AgentResult => "agent_result",
            Self::Manual => "manual",
            Self::Import => "import",
            Self::Validation => "validation",
            Self::Compaction => "compaction",
            Self::System => "system",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "field_note" => Some(Self::FieldNote),
            "agent_result" => Some(Self::AgentResult),
            "manual" => Some(Self::Manual),
            "import" => Some(Self::Import),
            "validation" => Some(Self::Validation),
            "compaction" => Some(Self::Compaction),
            "system" => Some(Self::System),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Prod,
    Staging,
}

impl Environment {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Staging => "staging",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "prod" => Some(Self::Prod),
            "staging" => Some(Self::Staging),
            _ => None,
        }
    }
}

/// Blast-radius label on an entry, used for hierarchical query admission.
///
/// `repo` and `org` are broad scopes; `customer`, `service:<name>` and
/// `environment:(prod|staging)` are narrow ones. Broad entries are always
/// visible to narrow queries, never the reverse.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Scope {
    Repo,
    Org,
    Customer,
    Service(String),
    Environment(Environment),
}

impl Scope {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "repo" => return Some(Self::Repo),
            "org" => return Some(Self::Org),
            "customer" => return Some(Self::Customer),
            _ => {}
        }
        if let Some(name) = value.strip_prefix("service:") {
            if !name.is_empty() && !name.contains(char::is_whitespace) {
                return Some(Self::Service(name.to_string()));
            }
            return None;
        }
        if let Some(env) = value.strip_prefix("environment:") {
            return Environment::parse(env).map(Self::Environment);
        }
        None
    }

    /// Whether this scope sits below `repo`/`org` in the hierarchy.
    #[must_use]
    pub fn is_narrow(&self) -> bool {
        matches!(self, Self::Customer | Self::Service(_) | Self::Environment(_))
    }

    #[must_use]
    pub fn is_broad(&self) -> bool {
        matches!(self, Self::Repo | Self::Org)
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo => write!(f, "repo"),
            Self::Org => write!(f, "org"),
            Self::Customer => write!(f, "customer"),
            Self::Service(name) => write!(f, "service:{name}"),
            Self::Environment(env) => write!(f, "environment:{}", env.as_str()),
        }
    }
}

impl FromStr for Scope {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
            .ok_or_else(|| LedgerError::Validation { errors: vec![format!("scope: '{value}' does not match the scope grammar")] })
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid scope '{raw}'")))
    }
}

/// Typed pointer substantiating an entry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Evidence {
    #[serde(rename = "type")]
    pub evidence_type: EvidenceType,
    pub uri: String,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Provenance {
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One unit of stored knowledge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    pub section: Section,
    pub kind: Kind,
    pub subject: String,
    pub scope: Scope,
    pub summary: String,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub confidence: f32,
    pub evidence: Vec<Evidence>,
    pub provenance: Provenance,
    #[serde(default)]
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<EntryId>,
    #[serde(default)]
    pub related_entries: Vec<EntryId>,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Entry {
    /// Highest evidence weight carried by this entry, 0.4 when the
    /// evidence list is empty.
    #[must_use]
    pub fn evidence_quality(&self) -> f32 {
        self.evidence
            .iter()
            .map(|e| e.evidence_type.quality_weight())
            .reduce(f32::max)
            .unwrap_or(0.4)
    }

    /// Validate `input` and convert it into a typed entry.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] with the full accumulated error
    /// list when the input fails any schema or business-rule check.
    pub fn from_input(input: &EntryInput, id: EntryId, now: OffsetDateTime) -> Result<Self, LedgerError> {
        let outcome = validate::validate(input);
        if !outcome.valid {
            return Err(LedgerError::Validation { errors: outcome.errors });
        }

        let evidence = input
            .evidence
            .iter()
            .map(|e| Evidence {
                evidence_type: EvidenceType::parse(&e.evidence_type).unwrap_or(EvidenceType::Assumption),
                uri: e.uri.clone(),
                note: e.note.clone(),
            })
            .collect();

        Ok(Self {
            id,
            section: Section::parse(&input.section).unwrap_or(Section::Observations),
            kind: Kind::parse(&input.kind).unwrap_or(Kind::Other),
            subject: input.subject.clone(),
            scope: Scope::parse(&input.scope).unwrap_or(Scope::Repo),
            summary: input.summary.clone(),
            content: input.content.clone(),
            tags: input.tags.clone(),
            confidence: input.confidence.unwrap_or(0.5),
            evidence,
            provenance: Provenance {
                source_type: SourceType::parse(&input.provenance.source_type)
                    .unwrap_or(SourceType::Other),
                source_ref: input.provenance.source_ref.clone(),
                note: input.provenance.note.clone(),
            },
            status: input
                .status
                .as_deref()
                .and_then(EntryStatus::parse)
                .unwrap_or_default(),
            superseded_by: None,
            // Soft references: unparseable ids are dropped, missing targets
            // are tolerated at query time.
            related_entries: input.related_entries.iter().filter_map(|s| EntryId::parse(s)).collect(),
            created_by: input.created_by.clone(),
            created_at: now,
            updated_at: now,
        })
    }
}

/// Loosely-typed write-side draft of an entry.
///
/// Enum-valued fields stay strings here so that [`crate::validate`] can
/// report out-of-enum values as validation errors naming the field rather
/// than failing at deserialization time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntryInput {
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub evidence: Vec<EvidenceInput>,
    #[serde(default)]
    pub provenance: ProvenanceInput,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub related_entries: Vec<String>,
    #[serde(default)]
    pub created_by: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct EvidenceInput {
    #[serde(rename = "type", default)]
    pub evidence_type: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProvenanceInput {
    #[serde(default)]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}
