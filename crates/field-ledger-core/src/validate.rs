use crate::model::{
    EntryInput, EntryStatus, EvidenceType, Kind, Scope, Section, SourceType, CONTENT_MAX_CHARS,
    SUMMARY_MAX_CHARS,
};

/// Confidence below this produces a warning, never an error.
pub const LOW_CONFIDENCE_WARNING_THRESHOLD: f32 = 0.5;

/// Result of validating one write-side draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Check a draft against the entry schema and business rules.
///
/// Checks run in a fixed order: required-field presence, enum membership,
/// scope grammar, length caps, confidence range, evidence rules, provenance
/// rules. Pure; never fails, touches no storage. Every error names the
/// offending field.
#[must_use]
pub fn validate(input: &EntryInput) -> ValidationOutcome {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if input.subject.trim().is_empty() {
        errors.push("subject MUST be provided".to_string());
    }
    if input.summary.trim().is_empty() {
        errors.push("summary MUST be provided".to_string());
    }
    if input.section.trim().is_empty() {
        errors.push("section MUST be provided".to_string());
    }
    if input.kind.trim().is_empty() {
        errors.push("kind MUST be provided".to_string());
    }
    if input.scope.trim().is_empty() {
        errors.push("scope MUST be provided".to_string());
    }
    if input.created_by.trim().is_empty() {
        errors.push("created_by MUST be provided".to_string());
    }
    if input.confidence.is_none() {
        errors.push("confidence MUST be provided".to_string());
    }

    if !input.section.trim().is_empty() && Section::parse(&input.section).is_none() {
        errors.push(format!(
            "section MUST be one of decisions|state|observations|learnings (got '{}')",
            input.section
        ));
    }
    if !input.kind.trim().is_empty() && Kind::parse(&input.kind).is_none() {
        errors.push(format!("kind '{}' is not a recognized kind", input.kind));
    }
    if let Some(status) = input.status.as_deref() {
        if EntryStatus::parse(status).is_none() {
            errors.push(format!(
                "status MUST be one of active|superseded|deprecated|draft (got '{status}')"
            ));
        }
    }

    if !input.scope.trim().is_empty() && Scope::parse(&input.scope).is_none() {
        errors.push(format!(
            "scope '{}' does not match repo|org|customer|service:<name>|environment:(prod|staging)",
            input.scope
        ));
    }

    if input.summary.chars().count() > SUMMARY_MAX_CHARS {
        errors.push(format!("summary MUST be at most {SUMMARY_MAX_CHARS} characters"));
    }
    if input.content.chars().count() > CONTENT_MAX_CHARS {
        errors.push(format!("content MUST be at most {CONTENT_MAX_CHARS} characters"));
    }

    if let Some(confidence) = input.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            errors.push("confidence MUST be in [0.0, 1.0]".to_string());
        } else if confidence < LOW_CONFIDENCE_WARNING_THRESHOLD {
            warnings.push(format!(
                "confidence {confidence} is below {LOW_CONFIDENCE_WARNING_THRESHOLD}; consider gathering stronger evidence"
            ));
        }
    }

    if input.evidence.is_empty() {
        errors.push("evidence MUST contain at least one element".to_string());
    }
    for (index, evidence) in input.evidence.iter().enumerate() {
        if evidence.evidence_type.trim().is_empty() {
            errors.push(format!("evidence[{index}].type MUST be provided"));
        } else if EvidenceType::parse(&evidence.evidence_type).is_none() {
            errors.push(format!(
                "evidence[{index}].type '{}' is not a recognized evidence type",
                evidence.evidence_type
            ));
        }
        if evidence.uri.trim().is_empty() {
            errors.push(format!("evidence[{index}].uri MUST be provided"));
        }
        if evidence.note.trim().is_empty() {
            errors.push(format!("evidence[{index}].note MUST be provided"));
        }
    }

    if input.provenance.source_type.trim().is_empty() {
        errors.push("provenance.source_type MUST be provided".to_string());
    } else {
        match SourceType::parse(&input.provenance.source_type) {
            None => errors.push(format!(
                "provenance.source_type '{}' is not a recognized source type",
                input.provenance.source_type
            )),
            Some(SourceType::FieldNote) => match input.provenance.source_ref.as_deref() {
                Some(source_ref) if !source_ref.trim().is_empty() => {}
                _ => errors.push(
                    "provenance.source_ref MUST be provided when source_type is field_note"
                        .to_string(),
                ),
            },
            Some(_) => {}
        }
    }

    ValidationOutcome { valid: errors.is_empty(), errors, warnings }
}
