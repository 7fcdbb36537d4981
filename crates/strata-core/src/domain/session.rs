//! Session records and their lifecycle.
//!
//! # 状態遷移
//! - active → ended（明示的な終了）
//! - active → crashed（heartbeat 途絶、または compaction / timeout マーカー）
//! - crashed → recovered（明示的な `mark_recovered`、冪等）
//!
//! 遷移の判定はここ（純粋なデータ操作）で行い、時刻の判定は RecoveryEngine が行う。

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::ImmediateContext;
use super::errors::ContextError;
use super::ids::{SessionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
    Crashed,
    Recovered,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::Crashed => "crashed",
            SessionStatus::Recovered => "recovered",
        }
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Active, SessionStatus::Ended)
                | (SessionStatus::Active, SessionStatus::Crashed)
                | (SessionStatus::Crashed, SessionStatus::Recovered)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session stopped without ending cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryType {
    /// Heartbeat stopped being renewed.
    Crash,
    /// Context window was compacted.
    Compaction,
    /// Caller-declared timeout.
    Timeout,
}

/// One entry of a session's tool/action history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    pub tool: String,
    pub summary: String,
    pub at: DateTime<Utc>,
}

/// What the session last told us about its in-flight work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(default)]
    pub immediate_context: Option<ImmediateContext>,
    #[serde(default)]
    pub unsaved_changes: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub task_id: Option<TaskId>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub context_snapshot: Option<SessionSnapshot>,
    pub recovery_type: Option<RecoveryType>,
    pub recovered_at: Option<DateTime<Utc>>,
    /// Oldest first; bounded by the engine's configured capacity.
    pub recent_actions: VecDeque<ActionEntry>,
}

impl SessionRecord {
    pub fn start(session_id: SessionId, task_id: Option<TaskId>, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            task_id,
            status: SessionStatus::Active,
            started_at: now,
            last_heartbeat: now,
            ended_at: None,
            context_snapshot: None,
            recovery_type: None,
            recovered_at: None,
            recent_actions: VecDeque::new(),
        }
    }

    fn transition(&mut self, next: SessionStatus) -> Result<(), ContextError> {
        if !self.status.can_transition_to(next) {
            return Err(ContextError::Validation(format!(
                "session {} cannot move from {} to {}",
                self.session_id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn heartbeat(
        &mut self,
        now: DateTime<Utc>,
        snapshot: Option<SessionSnapshot>,
    ) -> Result<(), ContextError> {
        if self.status != SessionStatus::Active {
            return Err(ContextError::Validation(format!(
                "session {} is {}, heartbeat rejected",
                self.session_id, self.status
            )));
        }
        self.last_heartbeat = now;
        if snapshot.is_some() {
            self.context_snapshot = snapshot;
        }
        Ok(())
    }

    pub fn end(&mut self, now: DateTime<Utc>) -> Result<(), ContextError> {
        self.transition(SessionStatus::Ended)?;
        self.ended_at = Some(now);
        Ok(())
    }

    pub fn mark_crashed(
        &mut self,
        recovery_type: RecoveryType,
        snapshot: Option<SessionSnapshot>,
    ) -> Result<(), ContextError> {
        self.transition(SessionStatus::Crashed)?;
        self.recovery_type = Some(recovery_type);
        if snapshot.is_some() {
            self.context_snapshot = snapshot;
        }
        Ok(())
    }

    pub fn mark_recovered(&mut self, now: DateTime<Utc>) -> Result<(), ContextError> {
        self.transition(SessionStatus::Recovered)?;
        self.recovered_at = Some(now);
        Ok(())
    }

    pub fn push_action(&mut self, entry: ActionEntry, capacity: usize) {
        self.recent_actions.push_back(entry);
        while self.recent_actions.len() > capacity {
            self.recent_actions.pop_front();
        }
    }

    /// Most recent first, at most `limit` entries.
    pub fn recent_actions(&self, limit: usize) -> Vec<ActionEntry> {
        self.recent_actions.iter().rev().take(limit).cloned().collect()
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record() -> SessionRecord {
        SessionRecord::start(SessionId::new("s1").unwrap(), None, Utc::now())
    }

    #[rstest]
    #[case(SessionStatus::Active, SessionStatus::Ended, true)]
    #[case(SessionStatus::Active, SessionStatus::Crashed, true)]
    #[case(SessionStatus::Crashed, SessionStatus::Recovered, true)]
    #[case(SessionStatus::Active, SessionStatus::Recovered, false)]
    #[case(SessionStatus::Ended, SessionStatus::Crashed, false)]
    #[case(SessionStatus::Recovered, SessionStatus::Active, false)]
    #[case(SessionStatus::Crashed, SessionStatus::Ended, false)]
    fn transitions(#[case] from: SessionStatus, #[case] to: SessionStatus, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn crashed_session_rejects_heartbeat() {
        let mut session = record();
        session.mark_crashed(RecoveryType::Compaction, None).unwrap();
        assert!(session.heartbeat(Utc::now(), None).is_err());
        assert_eq!(session.recovery_type, Some(RecoveryType::Compaction));
    }

    #[test]
    fn heartbeat_keeps_previous_snapshot_when_none_given() {
        let mut session = record();
        let snapshot = SessionSnapshot {
            unsaved_changes: vec!["src/lib.rs".into()],
            ..Default::default()
        };
        session.heartbeat(Utc::now(), Some(snapshot.clone())).unwrap();
        session.heartbeat(Utc::now(), None).unwrap();
        assert_eq!(session.context_snapshot, Some(snapshot));
    }

    #[test]
    fn action_history_is_bounded_and_newest_first() {
        let mut session = record();
        for i in 0..5 {
            session.push_action(
                ActionEntry {
                    tool: format!("tool{i}"),
                    summary: String::new(),
                    at: Utc::now(),
                },
                3,
            );
        }
        let recent = session.recent_actions(10);
        let tools: Vec<_> = recent.iter().map(|a| a.tool.as_str()).collect();
        assert_eq!(tools, vec!["tool4", "tool3", "tool2"]);
        assert_eq!(session.recent_actions(1).len(), 1);
    }
}
