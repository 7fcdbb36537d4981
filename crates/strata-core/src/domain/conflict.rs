//! Conflicts: divergence surfaced by the detector (or reported by a caller).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ConflictId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    StateMismatch,
    FileConflict,
    SpecContradiction,
    VersionDivergence,
    LockCollision,
    DataInconsistency,
}

impl ConflictType {
    pub const ALL: [ConflictType; 6] = [
        ConflictType::StateMismatch,
        ConflictType::FileConflict,
        ConflictType::SpecContradiction,
        ConflictType::VersionDivergence,
        ConflictType::LockCollision,
        ConflictType::DataInconsistency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::StateMismatch => "state_mismatch",
            ConflictType::FileConflict => "file_conflict",
            ConflictType::SpecContradiction => "spec_contradiction",
            ConflictType::VersionDivergence => "version_divergence",
            ConflictType::LockCollision => "lock_collision",
            ConflictType::DataInconsistency => "data_inconsistency",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: ConflictId,
    pub task_a_id: TaskId,
    pub task_b_id: Option<TaskId>,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    /// Confidence in `[0, 1]`.
    pub strength: f64,
    pub description: String,
    pub evidence: serde_json::Value,
    pub detected_by: String,
    pub detection_method: String,
    pub status: ConflictStatus,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

impl Conflict {
    pub fn key(&self) -> ConflictKey {
        ConflictKey::new(
            self.task_a_id.clone(),
            self.task_b_id.clone(),
            self.conflict_type,
        )
    }

    pub fn is_unresolved(&self) -> bool {
        self.status == ConflictStatus::Unresolved
    }

    pub fn involves(&self, task_id: &TaskId) -> bool {
        &self.task_a_id == task_id || self.task_b_id.as_ref() == Some(task_id)
    }

    /// Transition to `resolved`. Returns false when already resolved.
    pub fn resolve(&mut self, now: DateTime<Utc>, resolution: Option<String>) -> bool {
        if self.status == ConflictStatus::Resolved {
            return false;
        }
        self.status = ConflictStatus::Resolved;
        self.resolved_at = Some(now);
        self.resolution = resolution;
        true
    }
}

/// Unordered `(taskA, taskB, type)` tuple; at most one unresolved conflict per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConflictKey {
    low: TaskId,
    high: Option<TaskId>,
    conflict_type: ConflictType,
}

impl ConflictKey {
    pub fn new(a: TaskId, b: Option<TaskId>, conflict_type: ConflictType) -> Self {
        let (low, high) = match b {
            Some(b) if b < a => (b, Some(a)),
            other => (a, other),
        };
        Self {
            low,
            high,
            conflict_type,
        }
    }
}

/// A conflict before it has an id, timestamps and status.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDraft {
    pub task_a_id: TaskId,
    pub task_b_id: Option<TaskId>,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub strength: f64,
    pub description: String,
    pub evidence: serde_json::Value,
    pub detection_method: String,
}

impl ConflictDraft {
    pub fn key(&self) -> ConflictKey {
        ConflictKey::new(
            self.task_a_id.clone(),
            self.task_b_id.clone(),
            self.conflict_type,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictFilter {
    pub status: Option<ConflictStatus>,
    pub task_id: Option<TaskId>,
}

impl ConflictFilter {
    pub fn unresolved() -> Self {
        Self {
            status: Some(ConflictStatus::Unresolved),
            task_id: None,
        }
    }

    pub fn matches(&self, conflict: &Conflict) -> bool {
        self.status.is_none_or(|s| conflict.status == s)
            && self.task_id.as_ref().is_none_or(|t| conflict.involves(t))
    }
}

/// Result of one scan: newly persisted conflicts plus still-open older ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanReport {
    pub detected: Vec<Conflict>,
    pub existing: Vec<Conflict>,
}

impl ScanReport {
    pub fn total(&self) -> usize {
        self.detected.len() + self.existing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    #[test]
    fn conflict_key_is_unordered() {
        let ab = ConflictKey::new(tid("A"), Some(tid("B")), ConflictType::FileConflict);
        let ba = ConflictKey::new(tid("B"), Some(tid("A")), ConflictType::FileConflict);
        assert_eq!(ab, ba);

        let other_type = ConflictKey::new(tid("A"), Some(tid("B")), ConflictType::StateMismatch);
        assert_ne!(ab, other_type);
    }

    #[test]
    fn single_task_keys_differ_from_pairs() {
        let single = ConflictKey::new(tid("A"), None, ConflictType::LockCollision);
        let pair = ConflictKey::new(tid("A"), Some(tid("B")), ConflictType::LockCollision);
        assert_ne!(single, pair);
    }

    #[test]
    fn filter_matches_either_side() {
        let conflict = Conflict {
            id: ConflictId::from_ulid(ulid::Ulid::new()),
            task_a_id: tid("A"),
            task_b_id: Some(tid("B")),
            conflict_type: ConflictType::FileConflict,
            severity: Severity::Medium,
            strength: 0.2,
            description: String::new(),
            evidence: serde_json::Value::Null,
            detected_by: "test".into(),
            detection_method: "test".into(),
            status: ConflictStatus::Unresolved,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        };
        let by_b = ConflictFilter {
            task_id: Some(tid("B")),
            ..ConflictFilter::unresolved()
        };
        assert!(by_b.matches(&conflict));
        let by_c = ConflictFilter {
            task_id: Some(tid("C")),
            status: None,
        };
        assert!(!by_c.matches(&conflict));
    }

    #[test]
    fn resolve_is_one_way() {
        let mut conflict = Conflict {
            id: ConflictId::from_ulid(ulid::Ulid::new()),
            task_a_id: tid("A"),
            task_b_id: None,
            conflict_type: ConflictType::StateMismatch,
            severity: Severity::High,
            strength: 0.9,
            description: String::new(),
            evidence: serde_json::Value::Null,
            detected_by: "test".into(),
            detection_method: "test".into(),
            status: ConflictStatus::Unresolved,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        };
        assert!(conflict.resolve(Utc::now(), Some("cache refreshed".into())));
        let first = conflict.resolved_at;
        assert!(!conflict.resolve(Utc::now(), None));
        assert_eq!(conflict.resolved_at, first);
        assert_eq!(conflict.resolution.as_deref(), Some("cache refreshed"));
    }
}
