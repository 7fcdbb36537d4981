//! Events - ドメインイベント
//!
//! 監査用の `ContextEvent` に変換して EventSink へ送る。配送は at-most-once で、
//! 受信側が落ちていればイベントは失われる。復旧の正しさは heartbeat と
//! version 履歴だけから導かれ、イベントの受信には依存しない。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::checkpoint::{CheckpointScope, CheckpointType};
use super::conflict::{ConflictType, Severity};
use super::ids::{CheckpointId, ConflictId, SessionId, TaskId};
use super::session::RecoveryType;
use super::version::ChangeType;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    TaskCreated {
        task_id: TaskId,
    },
    TaskUpdated {
        task_id: TaskId,
        version: u64,
        change_type: ChangeType,
        fields: Vec<String>,
        versioned: bool,
    },
    TaskDeleted {
        task_id: TaskId,
    },
    GlobalContextUpdated,
    CheckpointCreated {
        checkpoint_id: CheckpointId,
        scope: CheckpointScope,
        checkpoint_type: CheckpointType,
        included_tasks: Vec<TaskId>,
    },
    CheckpointRestored {
        checkpoint_id: CheckpointId,
        task_id: TaskId,
        version: u64,
        backup_id: Option<CheckpointId>,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        task_id: TaskId,
        conflict_type: ConflictType,
        severity: Severity,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        task_id: TaskId,
    },
    SessionStarted {
        session_id: SessionId,
        task_id: Option<TaskId>,
    },
    SessionEnded {
        session_id: SessionId,
    },
    SessionCrashed {
        session_id: SessionId,
        recovery_type: RecoveryType,
    },
    SessionRecovered {
        session_id: SessionId,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::TaskCreated { .. } => "task_created",
            DomainEvent::TaskUpdated { .. } => "task_updated",
            DomainEvent::TaskDeleted { .. } => "task_deleted",
            DomainEvent::GlobalContextUpdated => "global_context_updated",
            DomainEvent::CheckpointCreated { .. } => "checkpoint_created",
            DomainEvent::CheckpointRestored { .. } => "checkpoint_restored",
            DomainEvent::ConflictDetected { .. } => "conflict_detected",
            DomainEvent::ConflictResolved { .. } => "conflict_resolved",
            DomainEvent::SessionStarted { .. } => "session_started",
            DomainEvent::SessionEnded { .. } => "session_ended",
            DomainEvent::SessionCrashed { .. } => "session_crashed",
            DomainEvent::SessionRecovered { .. } => "session_recovered",
        }
    }

    /// Aggregate the event belongs to (`task:<id>`, `checkpoint:<id>`, ...).
    pub fn aggregate_id(&self) -> String {
        match self {
            DomainEvent::TaskCreated { task_id }
            | DomainEvent::TaskUpdated { task_id, .. }
            | DomainEvent::TaskDeleted { task_id }
            | DomainEvent::CheckpointRestored { task_id, .. } => format!("task:{task_id}"),
            DomainEvent::GlobalContextUpdated => "global".to_string(),
            DomainEvent::CheckpointCreated { checkpoint_id, .. } => {
                format!("checkpoint:{checkpoint_id}")
            }
            DomainEvent::ConflictDetected { conflict_id, .. }
            | DomainEvent::ConflictResolved { conflict_id, .. } => {
                format!("conflict:{conflict_id}")
            }
            DomainEvent::SessionStarted { session_id, .. }
            | DomainEvent::SessionEnded { session_id }
            | DomainEvent::SessionCrashed { session_id, .. }
            | DomainEvent::SessionRecovered { session_id } => format!("session:{session_id}"),
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            DomainEvent::TaskCreated { task_id } | DomainEvent::TaskDeleted { task_id } => {
                json!({ "taskId": task_id })
            }
            DomainEvent::TaskUpdated {
                task_id,
                version,
                change_type,
                fields,
                versioned,
            } => json!({
                "taskId": task_id,
                "version": version,
                "changeType": change_type,
                "fields": fields,
                "versioned": versioned,
            }),
            DomainEvent::GlobalContextUpdated => json!({}),
            DomainEvent::CheckpointCreated {
                checkpoint_id,
                scope,
                checkpoint_type,
                included_tasks,
            } => json!({
                "checkpointId": checkpoint_id.to_string(),
                "scope": scope,
                "checkpointType": checkpoint_type,
                "includedTasks": included_tasks,
            }),
            DomainEvent::CheckpointRestored {
                checkpoint_id,
                task_id,
                version,
                backup_id,
            } => json!({
                "checkpointId": checkpoint_id.to_string(),
                "taskId": task_id,
                "version": version,
                "backupId": backup_id.as_ref().map(ToString::to_string),
            }),
            DomainEvent::ConflictDetected {
                conflict_id,
                task_id,
                conflict_type,
                severity,
            } => json!({
                "conflictId": conflict_id.to_string(),
                "taskId": task_id,
                "conflictType": conflict_type,
                "severity": severity,
            }),
            DomainEvent::ConflictResolved {
                conflict_id,
                task_id,
            } => json!({
                "conflictId": conflict_id.to_string(),
                "taskId": task_id,
            }),
            DomainEvent::SessionStarted {
                session_id,
                task_id,
            } => json!({ "sessionId": session_id, "taskId": task_id }),
            DomainEvent::SessionEnded { session_id }
            | DomainEvent::SessionRecovered { session_id } => json!({ "sessionId": session_id }),
            DomainEvent::SessionCrashed {
                session_id,
                recovery_type,
            } => json!({ "sessionId": session_id, "recoveryType": recovery_type }),
        }
    }

    pub fn into_context_event(
        self,
        session_id: Option<SessionId>,
        occurred_at: DateTime<Utc>,
    ) -> ContextEvent {
        ContextEvent {
            aggregate_id: self.aggregate_id(),
            event_type: self.event_type().to_string(),
            payload: self.payload(),
            session_id,
            occurred_at,
        }
    }
}

/// Wire shape of `createContextEvent(aggregateId, eventType, payload, sessionId?)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEvent {
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub session_id: Option<SessionId>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_events_aggregate_on_task_key() {
        let event = DomainEvent::TaskUpdated {
            task_id: TaskId::new("T1").unwrap(),
            version: 3,
            change_type: ChangeType::Update,
            fields: vec!["iteration".into()],
            versioned: true,
        };
        let ctx = event.into_context_event(None, Utc::now());
        assert_eq!(ctx.aggregate_id, "task:T1");
        assert_eq!(ctx.event_type, "task_updated");
        assert_eq!(ctx.payload["version"], 3);
        assert_eq!(ctx.payload["changeType"], "update");
    }

    #[test]
    fn session_events_carry_recovery_type() {
        let event = DomainEvent::SessionCrashed {
            session_id: SessionId::new("s1").unwrap(),
            recovery_type: RecoveryType::Compaction,
        };
        assert_eq!(event.aggregate_id(), "session:s1");
        assert_eq!(event.payload()["recoveryType"], "compaction");
    }
}
