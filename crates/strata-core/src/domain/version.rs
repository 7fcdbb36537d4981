//! Version history: immutable, append-only snapshots of a TaskContext.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::{ContextField, ContextSnapshot};
use super::ids::{SessionId, TaskId};

/// Why a version was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    /// Restored from an earlier ContextVersion.
    Rollback,
    /// Restored from a Checkpoint.
    CheckpointRollback,
    /// Re-applied from a crashed session's last snapshot.
    Recovery,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Rollback => "rollback",
            ChangeType::CheckpointRollback => "checkpoint_rollback",
            ChangeType::Recovery => "recovery",
        }
    }

    /// Restores may move `iteration` backwards and always write a version.
    pub fn is_restore(self) -> bool {
        matches!(
            self,
            ChangeType::Rollback | ChangeType::CheckpointRollback | ChangeType::Recovery
        )
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable entry of `context_versions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextVersion {
    pub task_id: TaskId,
    pub version: u64,
    pub snapshot: ContextSnapshot,
    pub change_type: ChangeType,
    pub change_summary: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub session_id: Option<SessionId>,
}

/// Metadata attached to a write: who, why, and under which session.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMeta {
    pub change_type: ChangeType,
    pub summary: Option<String>,
    pub created_by: String,
    pub session_id: Option<SessionId>,
}

impl ChangeMeta {
    pub const DEFAULT_AUTHOR: &'static str = "agent";

    pub fn new(change_type: ChangeType) -> Self {
        Self {
            change_type,
            summary: None,
            created_by: Self::DEFAULT_AUTHOR.to_string(),
            session_id: None,
        }
    }

    pub fn update() -> Self {
        Self::new(ChangeType::Update)
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn by(mut self, author: impl Into<String>) -> Self {
        self.created_by = author.into();
        self
    }

    pub fn in_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

impl Default for ChangeMeta {
    fn default() -> Self {
        Self::update()
    }
}

/// The named predicate deciding which writes create a ContextVersion.
///
/// A write is significant when it supplies any field in the set. Restores are
/// always versioned regardless of this set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignificantFields(BTreeSet<ContextField>);

impl SignificantFields {
    pub fn new<I: IntoIterator<Item = ContextField>>(fields: I) -> Self {
        Self(fields.into_iter().collect())
    }

    /// status, current_phase, iteration, immediate_context, locked_elements
    pub fn default_v1() -> Self {
        Self::new([
            ContextField::Status,
            ContextField::CurrentPhase,
            ContextField::Iteration,
            ContextField::ImmediateContext,
            ContextField::LockedElements,
        ])
    }

    pub fn contains(&self, field: ContextField) -> bool {
        self.0.contains(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_significant(&self, supplied: &BTreeSet<ContextField>) -> bool {
        supplied.iter().any(|field| self.0.contains(field))
    }
}

impl Default for SignificantFields {
    fn default() -> Self {
        Self::default_v1()
    }
}

/// Human-readable default summary, e.g. `"updated status, iteration"`.
pub fn summarize_fields(change_type: ChangeType, fields: &BTreeSet<ContextField>) -> String {
    let names: Vec<&str> = fields.iter().map(|f| f.as_str()).collect();
    match change_type {
        ChangeType::Create => "created".to_string(),
        _ if names.is_empty() => change_type.as_str().to_string(),
        ChangeType::Update => format!("updated {}", names.join(", ")),
        other => format!("{other}: {}", names.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::status(ContextField::Status, true)]
    #[case::phase(ContextField::CurrentPhase, true)]
    #[case::iteration(ContextField::Iteration, true)]
    #[case::immediate(ContextField::ImmediateContext, true)]
    #[case::locked(ContextField::LockedElements, true)]
    #[case::score(ContextField::Score, false)]
    #[case::decisions(ContextField::TechnicalDecisions, false)]
    #[case::key_files(ContextField::KeyFiles, false)]
    fn default_significance(#[case] field: ContextField, #[case] significant: bool) {
        let supplied = BTreeSet::from([field]);
        assert_eq!(SignificantFields::default_v1().is_significant(&supplied), significant);
    }

    #[test]
    fn significance_set_is_configurable() {
        let fields = SignificantFields::new([ContextField::Score]);
        assert!(fields.is_significant(&BTreeSet::from([ContextField::Score])));
        assert!(!fields.is_significant(&BTreeSet::from([ContextField::Status])));
    }

    #[test]
    fn significant_fields_deserialize_from_names() {
        let fields: SignificantFields = serde_json::from_str(r#"["status","key_files"]"#).unwrap();
        assert!(fields.contains(ContextField::KeyFiles));
        assert!(!fields.contains(ContextField::Iteration));
    }

    #[test]
    fn summaries_list_fields() {
        let fields = BTreeSet::from([ContextField::Status, ContextField::Iteration]);
        assert_eq!(
            summarize_fields(ChangeType::Update, &fields),
            "updated status, iteration"
        );
        assert_eq!(
            summarize_fields(ChangeType::CheckpointRollback, &fields),
            "checkpoint_rollback: status, iteration"
        );
        assert_eq!(summarize_fields(ChangeType::Create, &fields), "created");
    }
}
