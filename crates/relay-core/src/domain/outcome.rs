//! Outcome model: the audit record of one pipeline stage.
//!
//! Records are appended to `metadata.transformations` of the envelope and are
//! the definitive history of a pipeline run. The list is append-only: one
//! entry per stage attempted, including the stage that rejected or failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::envelope::Envelope;
use super::errors::{ErrorKind, FailureReason};

/// Metadata key holding the ordered audit trail.
pub const TRANSFORMATIONS_KEY: &str = "transformations";

/// Serialized as SUCCESS / PASS_THROUGH / REJECTED / FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// The stage produced a transformed envelope.
    Success,
    /// The stage let the envelope through unchanged.
    PassThrough,
    /// The stage deliberately dropped the envelope.
    Rejected,
    /// The stage broke; downstream continues with the stage's input.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationRecord {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StageStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl TransformationRecord {
    pub fn new(
        stage: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: StageStatus,
    ) -> Self {
        Self {
            stage: stage.into(),
            started_at,
            finished_at,
            outcome,
            note: None,
            error_kind: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_failure(mut self, reason: &FailureReason) -> Self {
        self.note = Some(reason.message.clone());
        self.error_kind = Some(reason.kind);
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StageStatus::Success | StageStatus::PassThrough)
    }
}

/// Appends `record` to the envelope's audit trail.
pub fn append_transformation(envelope: &mut Envelope, record: &TransformationRecord) {
    let entry = serde_json::to_value(record).unwrap_or(Value::Null);
    let trail = envelope
        .metadata_mut()
        .entry(TRANSFORMATIONS_KEY)
        .or_insert_with(|| Value::Array(Vec::new()));
    match trail {
        Value::Array(items) => items.push(entry),
        other => *other = Value::Array(vec![entry]),
    }
}

/// Reads the audit trail back. Unparseable entries are skipped.
pub fn transformations(envelope: &Envelope) -> Vec<TransformationRecord> {
    envelope
        .metadata()
        .get(TRANSFORMATIONS_KEY)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
