//! RecoveryEngine - heartbeat による crash 検出と再開
//!
//! # 状態遷移
//! - active → ended: `end_session`
//! - active → crashed: heartbeat 途絶（`detect_crashes`）、または `mark_interrupted`
//! - crashed → recovered: `mark_recovered` / `resume`（冪等）
//!
//! # 判定
//! heartbeat の経過時間が `heartbeat_interval × crash_threshold_multiplier` を
//! **超えた**とき recovery 対象になる（ちょうど閾値なら対象外）。
//! 判定は SessionStore の heartbeat と version 履歴だけで行い、イベントの受信には依存しない。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::secondary::Secondaries;
use super::status::{Persisted, SavedTo};
use super::versioned_store::VersionedStore;
use crate::config::EngineConfig;
use crate::domain::{
    ActionEntry, ChangeMeta, ChangeType, ContextError, DomainEvent, Entity, ImmediateContext,
    RecoveryType, SessionId, SessionRecord, SessionSnapshot, SessionStatus, TaskContext,
    TaskContextPatch, TaskId,
};
use crate::ports::{Clock, SessionStore};

/// One recovery-eligible session, with everything needed to pick up the work.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCandidate {
    pub session_id: SessionId,
    pub task_id: Option<TaskId>,
    pub status: SessionStatus,
    pub recovery_type: RecoveryType,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_age_secs: i64,
    pub task: Option<TaskContext>,
    pub resume_prompt: String,
    /// Most recent first; empty unless history was requested.
    pub recent_actions: Vec<ActionEntry>,
    pub unsaved_changes: Vec<String>,
    /// Empty when no graph backend is attached.
    pub blocking_tasks: Vec<TaskId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub needs_recovery: bool,
    pub sessions: Vec<RecoveryCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeOutcome {
    pub session: SessionRecord,
    /// The task after its immediate context was re-applied, if there was one.
    pub task: Option<TaskContext>,
}

pub struct RecoveryEngine {
    sessions: Arc<dyn SessionStore>,
    versions: Arc<VersionedStore>,
    secondaries: Arc<Secondaries>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    /// Serializes read-modify-write of session records.
    transitions: Mutex<()>,
}

impl RecoveryEngine {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        versions: Arc<VersionedStore>,
        secondaries: Arc<Secondaries>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            sessions,
            versions,
            secondaries,
            clock,
            config,
            transitions: Mutex::new(()),
        }
    }

    pub async fn start_session(
        &self,
        session_id: SessionId,
        task_id: Option<TaskId>,
    ) -> Result<Persisted<SessionRecord>, ContextError> {
        if let Some(task_id) = &task_id {
            self.versions.get(task_id).await?;
        }
        let record = SessionRecord::start(session_id, task_id, self.clock.now());
        self.sessions.insert_session(record.clone()).await?;
        info!(
            session_id = %record.session_id,
            task_id = ?record.task_id.as_ref().map(ToString::to_string),
            "session started"
        );

        let mut saved_to = SavedTo::store_only();
        saved_to.graph = self
            .secondaries
            .record_session(&record.session_id, record.task_id.as_ref())
            .await;
        saved_to.events = self
            .secondaries
            .emit(
                DomainEvent::SessionStarted {
                    session_id: record.session_id.clone(),
                    task_id: record.task_id.clone(),
                },
                Some(&record.session_id),
            )
            .await;
        Ok(Persisted::new(record, saved_to))
    }

    /// Renew the heartbeat; a snapshot, when given, replaces the stored one.
    pub async fn heartbeat(
        &self,
        session_id: &SessionId,
        snapshot: Option<SessionSnapshot>,
    ) -> Result<Persisted<SessionRecord>, ContextError> {
        let _guard = self.transitions.lock().await;
        let mut record = self.load(session_id).await?;
        record.heartbeat(self.clock.now(), snapshot)?;
        self.sessions.put_session(record.clone()).await?;
        debug!(session_id = %session_id, "heartbeat");
        Ok(Persisted::new(record, SavedTo::store_only()))
    }

    pub async fn record_action(
        &self,
        session_id: &SessionId,
        tool: impl Into<String>,
        summary: impl Into<String>,
    ) -> Result<Persisted<SessionRecord>, ContextError> {
        let _guard = self.transitions.lock().await;
        let mut record = self.load(session_id).await?;
        if record.status != SessionStatus::Active {
            return Err(ContextError::Validation(format!(
                "session {session_id} is {}, cannot record actions",
                record.status
            )));
        }
        record.push_action(
            ActionEntry {
                tool: tool.into(),
                summary: summary.into(),
                at: self.clock.now(),
            },
            self.config.session_action_capacity,
        );
        self.sessions.put_session(record.clone()).await?;
        Ok(Persisted::new(record, SavedTo::store_only()))
    }

    /// Clean shutdown. Ending an already ended session is a no-op.
    pub async fn end_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Persisted<SessionRecord>, ContextError> {
        let _guard = self.transitions.lock().await;
        let mut record = self.load(session_id).await?;
        if record.status == SessionStatus::Ended {
            return Ok(Persisted::new(record, SavedTo::untouched()));
        }
        record.end(self.clock.now())?;
        self.sessions.put_session(record.clone()).await?;
        info!(session_id = %session_id, "session ended");

        let mut saved_to = SavedTo::store_only();
        saved_to.events = self
            .secondaries
            .emit(
                DomainEvent::SessionEnded {
                    session_id: session_id.clone(),
                },
                Some(session_id),
            )
            .await;
        Ok(Persisted::new(record, saved_to))
    }

    /// Explicit compaction / timeout marker (or a caller-declared crash).
    pub async fn mark_interrupted(
        &self,
        session_id: &SessionId,
        recovery_type: RecoveryType,
        snapshot: Option<SessionSnapshot>,
    ) -> Result<Persisted<SessionRecord>, ContextError> {
        let _guard = self.transitions.lock().await;
        let mut record = self.load(session_id).await?;
        if record.status == SessionStatus::Crashed {
            return Ok(Persisted::new(record, SavedTo::untouched()));
        }
        record.mark_crashed(recovery_type, snapshot)?;
        self.sessions.put_session(record.clone()).await?;
        let saved_to = self.announce_crash(&record, recovery_type).await;
        Ok(Persisted::new(record, saved_to))
    }

    /// Move every stale `active` session to `crashed`.
    pub async fn detect_crashes(&self) -> Result<Persisted<Vec<SessionRecord>>, ContextError> {
        let _guard = self.transitions.lock().await;
        let now = self.clock.now();
        let active = self.sessions.list_sessions(Some(SessionStatus::Active)).await?;

        let mut crashed = Vec::new();
        let mut saved_to = SavedTo::untouched();
        for mut record in active.into_iter().filter(|r| self.is_stale(r, now)) {
            record.mark_crashed(RecoveryType::Crash, None)?;
            self.sessions.put_session(record.clone()).await?;
            saved_to = saved_to.merge(self.announce_crash(&record, RecoveryType::Crash).await);
            crashed.push(record);
        }
        if !crashed.is_empty() {
            info!(crashed = crashed.len(), "crash sweep finished");
        }
        Ok(Persisted::new(crashed, saved_to))
    }

    /// Read-only: every crashed or stale session, with a resume prompt.
    pub async fn check_for_recovery(
        &self,
        include_history: bool,
    ) -> Result<RecoveryReport, ContextError> {
        let now = self.clock.now();
        let mut sessions = Vec::new();
        for record in self.sessions.list_sessions(None).await? {
            if !self.is_eligible(&record, now) {
                continue;
            }
            sessions.push(self.candidate(record, now, include_history).await?);
        }
        Ok(RecoveryReport {
            needs_recovery: !sessions.is_empty(),
            sessions,
        })
    }

    /// Idempotent. A stale session that the sweep has not reached yet goes
    /// through `crashed` first.
    pub async fn mark_recovered(
        &self,
        session_id: &SessionId,
    ) -> Result<Persisted<SessionRecord>, ContextError> {
        let _guard = self.transitions.lock().await;
        self.mark_recovered_locked(session_id).await
    }

    /// Re-apply the session's last immediate context to its task as a
    /// `recovery` version, then mark the session recovered.
    pub async fn resume(
        &self,
        session_id: &SessionId,
    ) -> Result<Persisted<ResumeOutcome>, ContextError> {
        let _guard = self.transitions.lock().await;
        let record = self.load(session_id).await?;
        if record.status == SessionStatus::Recovered {
            return Err(ContextError::Validation(format!(
                "session {session_id} was already recovered"
            )));
        }
        if !self.is_eligible(&record, self.clock.now()) {
            return Err(ContextError::Validation(format!(
                "session {session_id} is {} and not eligible for recovery",
                record.status
            )));
        }

        let mut saved_to = SavedTo::untouched();
        let immediate = record
            .context_snapshot
            .as_ref()
            .and_then(|s| s.immediate_context.clone());
        let task = match (&record.task_id, immediate) {
            (Some(task_id), Some(immediate)) => {
                let meta = ChangeMeta::new(ChangeType::Recovery)
                    .summary(format!("recovered from session {session_id}"))
                    .in_session(session_id.clone());
                match self
                    .versions
                    .update_with(task_id, TaskContextPatch::new().immediate_context(immediate), meta)
                    .await
                {
                    Ok(updated) => {
                        saved_to = saved_to.merge(updated.saved_to);
                        Some(updated.value)
                    }
                    Err(ContextError::NotFound { .. }) => {
                        warn!(session_id = %session_id, task_id = %task_id, "task of crashed session no longer exists");
                        None
                    }
                    Err(err) => return Err(err),
                }
            }
            (Some(task_id), None) => self.task_if_present(task_id).await?,
            (None, _) => None,
        };

        let recovered = self.mark_recovered_locked(session_id).await?;
        saved_to = saved_to.merge(recovered.saved_to);
        Ok(Persisted::new(
            ResumeOutcome {
                session: recovered.value,
                task,
            },
            saved_to,
        ))
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Result<SessionRecord, ContextError> {
        self.load(session_id).await
    }

    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRecord>, ContextError> {
        Ok(self.sessions.list_sessions(status).await?)
    }

    /// Heartbeat age strictly greater than the threshold; exactly at it is still alive.
    pub fn is_stale(&self, record: &SessionRecord, now: DateTime<Utc>) -> bool {
        record.status == SessionStatus::Active
            && record.heartbeat_age(now) > self.config.crash_threshold()
    }

    fn is_eligible(&self, record: &SessionRecord, now: DateTime<Utc>) -> bool {
        record.status == SessionStatus::Crashed || self.is_stale(record, now)
    }

    async fn mark_recovered_locked(
        &self,
        session_id: &SessionId,
    ) -> Result<Persisted<SessionRecord>, ContextError> {
        let now = self.clock.now();
        let mut record = self.load(session_id).await?;
        if record.status == SessionStatus::Recovered {
            return Ok(Persisted::new(record, SavedTo::untouched()));
        }

        let mut saved_to = SavedTo::store_only();
        let passed_through_crash = self.is_stale(&record, now);
        if passed_through_crash {
            record.mark_crashed(RecoveryType::Crash, None)?;
        } else if record.status == SessionStatus::Active {
            return Err(ContextError::Validation(format!(
                "session {session_id} is still active (last heartbeat {})",
                record.last_heartbeat
            )));
        }
        record.mark_recovered(now)?;
        self.sessions.put_session(record.clone()).await?;
        info!(session_id = %session_id, "session recovered");

        if passed_through_crash {
            saved_to = saved_to.merge(self.announce_crash(&record, RecoveryType::Crash).await);
        }
        let event = self
            .secondaries
            .emit(
                DomainEvent::SessionRecovered {
                    session_id: session_id.clone(),
                },
                Some(session_id),
            )
            .await;
        saved_to.events = saved_to.events.and(event);
        Ok(Persisted::new(record, saved_to))
    }

    async fn announce_crash(&self, record: &SessionRecord, recovery_type: RecoveryType) -> SavedTo {
        warn!(
            session_id = %record.session_id,
            recovery_type = ?recovery_type,
            last_heartbeat = %record.last_heartbeat,
            "session interrupted"
        );
        let mut saved_to = SavedTo::store_only();
        saved_to.events = self
            .secondaries
            .emit(
                DomainEvent::SessionCrashed {
                    session_id: record.session_id.clone(),
                    recovery_type,
                },
                Some(&record.session_id),
            )
            .await;
        saved_to
    }

    async fn candidate(
        &self,
        record: SessionRecord,
        now: DateTime<Utc>,
        include_history: bool,
    ) -> Result<RecoveryCandidate, ContextError> {
        let task = match &record.task_id {
            Some(task_id) => self.task_if_present(task_id).await?,
            None => None,
        };
        let blocking_tasks = match &record.task_id {
            Some(task_id) => self.secondaries.blocking_tasks(task_id).await,
            None => Vec::new(),
        };
        let snapshot = record.context_snapshot.clone().unwrap_or_default();
        let resume_prompt = build_resume_prompt(&record, task.as_ref(), &snapshot, &blocking_tasks);
        let recent_actions = if include_history {
            record.recent_actions(self.config.recent_action_limit)
        } else {
            Vec::new()
        };

        Ok(RecoveryCandidate {
            session_id: record.session_id,
            task_id: record.task_id,
            status: record.status,
            recovery_type: record.recovery_type.unwrap_or(RecoveryType::Crash),
            last_heartbeat: record.last_heartbeat,
            heartbeat_age_secs: (now - record.last_heartbeat).num_seconds(),
            task,
            resume_prompt,
            recent_actions,
            unsaved_changes: snapshot.unsaved_changes,
            blocking_tasks,
        })
    }

    async fn task_if_present(&self, task_id: &TaskId) -> Result<Option<TaskContext>, ContextError> {
        match self.versions.get(task_id).await {
            Ok(task) => Ok(Some(task)),
            Err(ContextError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn load(&self, session_id: &SessionId) -> Result<SessionRecord, ContextError> {
        self.sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| ContextError::not_found(Entity::Session, session_id))
    }
}

/// Human-readable prompt for picking the work back up.
///
/// The session's own snapshot wins over the task's stored immediate context,
/// since it is the fresher of the two.
fn build_resume_prompt(
    record: &SessionRecord,
    task: Option<&TaskContext>,
    snapshot: &SessionSnapshot,
    blocking_tasks: &[TaskId],
) -> String {
    let mut lines = Vec::new();
    match task {
        Some(task) => {
            let mut header = format!(
                "Resuming task {} \"{}\" [{}",
                task.task_id, task.fields.name, task.fields.status
            );
            if !task.fields.current_phase.is_empty() {
                header.push_str(&format!(", phase: {}", task.fields.current_phase));
            }
            header.push_str(&format!(", iteration {}]", task.fields.iteration));
            lines.push(header);
        }
        None => lines.push(format!("Resuming session {}", record.session_id)),
    }

    let immediate: Option<&ImmediateContext> = snapshot
        .immediate_context
        .as_ref()
        .or(task.map(|t| &t.fields.immediate_context))
        .filter(|ic| !ic.is_empty());
    if let Some(ic) = immediate {
        if !ic.working_on.is_empty() {
            lines.push(format!("Working on: {}", ic.working_on));
        }
        if !ic.last_action.is_empty() {
            lines.push(format!("Last action: {}", ic.last_action));
        }
        if !ic.next_step.is_empty() {
            lines.push(format!("Next step: {}", ic.next_step));
        }
        if !ic.blockers.is_empty() {
            lines.push(format!("Blockers: {}", ic.blockers.join("; ")));
        }
    }
    if !snapshot.unsaved_changes.is_empty() {
        lines.push(format!("Unsaved changes: {}", snapshot.unsaved_changes.join(", ")));
    }
    if let Some(note) = &snapshot.note {
        lines.push(format!("Note: {note}"));
    }
    if !blocking_tasks.is_empty() {
        let ids: Vec<String> = blocking_tasks.iter().map(ToString::to_string).collect();
        lines.push(format!("Blocked by: {}", ids.join(", ")));
    }
    if let Some(task) = task
        && !task.fields.resume_prompt.is_empty()
    {
        lines.push(task.fields.resume_prompt.clone());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{Harness, harness, sid, tid};
    use crate::domain::{ContextSnapshot, TaskStatus};
    use chrono::Duration;

    async fn seed_task(h: &Harness) {
        let mut fields = ContextSnapshot::named("auth rewrite");
        fields.status = TaskStatus::InProgress;
        fields.current_phase = "implementation".into();
        fields.resume_prompt = "Run the migration tests first.".into();
        fields.immediate_context = ImmediateContext {
            working_on: "token refresh".into(),
            ..Default::default()
        };
        h.engine.versions().create(tid("T1"), fields).await.unwrap();
    }

    #[tokio::test]
    async fn crash_boundary_is_strictly_greater_than_threshold() {
        let h = harness();
        let recovery = h.engine.recovery();
        recovery.start_session(sid("s1"), None).await.unwrap();

        h.clock.advance(Duration::seconds(89));
        assert!(!recovery.check_for_recovery(false).await.unwrap().needs_recovery);

        h.clock.advance(Duration::seconds(1));
        assert!(!recovery.check_for_recovery(false).await.unwrap().needs_recovery);
        assert!(recovery.detect_crashes().await.unwrap().value.is_empty());

        h.clock.advance(Duration::seconds(1));
        let report = recovery.check_for_recovery(false).await.unwrap();
        assert!(report.needs_recovery);
        assert_eq!(report.sessions[0].heartbeat_age_secs, 91);
        assert_eq!(report.sessions[0].status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn heartbeat_keeps_session_alive() {
        let h = harness();
        let recovery = h.engine.recovery();
        recovery.start_session(sid("s1"), None).await.unwrap();
        for _ in 0..5 {
            h.clock.advance(Duration::seconds(30));
            recovery.heartbeat(&sid("s1"), None).await.unwrap();
        }
        assert!(!recovery.check_for_recovery(false).await.unwrap().needs_recovery);
    }

    #[tokio::test]
    async fn check_for_recovery_is_read_only() {
        let h = harness();
        let recovery = h.engine.recovery();
        recovery.start_session(sid("s1"), None).await.unwrap();
        h.clock.advance(Duration::seconds(120));

        recovery.check_for_recovery(true).await.unwrap();
        let record = recovery.get_session(&sid("s1")).await.unwrap();
        assert_eq!(record.status, SessionStatus::Active);

        let swept = recovery.detect_crashes().await.unwrap().value;
        assert_eq!(swept.len(), 1);
        let record = recovery.get_session(&sid("s1")).await.unwrap();
        assert_eq!(record.status, SessionStatus::Crashed);
        assert_eq!(record.recovery_type, Some(RecoveryType::Crash));
    }

    #[tokio::test]
    async fn recovery_output_carries_prompt_history_and_unsaved_changes() {
        let h = harness();
        seed_task(&h).await;
        h.graph.add_blocker(tid("T0"), tid("T1")).await;
        let recovery = h.engine.recovery();
        recovery.start_session(sid("s1"), Some(tid("T1"))).await.unwrap();
        for i in 0..12 {
            recovery
                .record_action(&sid("s1"), format!("tool{i}"), "edit")
                .await
                .unwrap();
        }
        recovery
            .heartbeat(
                &sid("s1"),
                Some(SessionSnapshot {
                    immediate_context: Some(ImmediateContext {
                        working_on: "refresh rotation".into(),
                        next_step: "write expiry test".into(),
                        ..Default::default()
                    }),
                    unsaved_changes: vec!["src/auth.rs".into()],
                    note: None,
                }),
            )
            .await
            .unwrap();
        h.clock.advance(Duration::seconds(91));

        let report = recovery.check_for_recovery(true).await.unwrap();
        let candidate = &report.sessions[0];
        assert_eq!(candidate.task_id, Some(tid("T1")));
        assert_eq!(candidate.recent_actions.len(), 10);
        assert_eq!(candidate.recent_actions[0].tool, "tool11");
        assert_eq!(candidate.unsaved_changes, vec!["src/auth.rs".to_string()]);
        assert_eq!(candidate.blocking_tasks, vec![tid("T0")]);
        assert!(candidate.resume_prompt.contains("Resuming task T1 \"auth rewrite\""));
        assert!(candidate.resume_prompt.contains("Working on: refresh rotation"));
        assert!(candidate.resume_prompt.contains("Next step: write expiry test"));
        assert!(candidate.resume_prompt.contains("Unsaved changes: src/auth.rs"));
        assert!(candidate.resume_prompt.contains("Blocked by: T0"));
        assert!(candidate.resume_prompt.ends_with("Run the migration tests first."));

        let without_history = recovery.check_for_recovery(false).await.unwrap();
        assert!(without_history.sessions[0].recent_actions.is_empty());
    }

    #[tokio::test]
    async fn mark_recovered_is_idempotent() {
        let h = harness();
        let recovery = h.engine.recovery();
        recovery.start_session(sid("s1"), None).await.unwrap();
        recovery
            .mark_interrupted(&sid("s1"), RecoveryType::Compaction, None)
            .await
            .unwrap();

        let first = recovery.mark_recovered(&sid("s1")).await.unwrap();
        assert_eq!(first.value.status, SessionStatus::Recovered);
        let second = recovery.mark_recovered(&sid("s1")).await.unwrap();
        assert_eq!(second.value.status, SessionStatus::Recovered);
        assert_eq!(second.saved_to, SavedTo::untouched());
        assert_eq!(second.value.recovery_type, Some(RecoveryType::Compaction));
    }

    #[tokio::test]
    async fn live_session_cannot_be_marked_recovered() {
        let h = harness();
        let recovery = h.engine.recovery();
        recovery.start_session(sid("s1"), None).await.unwrap();
        assert!(matches!(
            recovery.mark_recovered(&sid("s1")).await,
            Err(ContextError::Validation(_))
        ));

        h.clock.advance(Duration::seconds(200));
        let recovered = recovery.mark_recovered(&sid("s1")).await.unwrap().value;
        assert_eq!(recovered.status, SessionStatus::Recovered);
        assert_eq!(recovered.recovery_type, Some(RecoveryType::Crash));
        assert_eq!(
            h.events.event_types().await,
            vec!["session_started", "session_crashed", "session_recovered"]
        );
    }

    #[tokio::test]
    async fn end_session_is_idempotent_and_final() {
        let h = harness();
        let recovery = h.engine.recovery();
        recovery.start_session(sid("s1"), None).await.unwrap();
        recovery.end_session(&sid("s1")).await.unwrap();
        let again = recovery.end_session(&sid("s1")).await.unwrap();
        assert_eq!(again.saved_to, SavedTo::untouched());

        h.clock.advance(Duration::seconds(1000));
        assert!(!recovery.check_for_recovery(false).await.unwrap().needs_recovery);
        assert!(recovery.heartbeat(&sid("s1"), None).await.is_err());
        assert!(
            recovery
                .mark_interrupted(&sid("s1"), RecoveryType::Timeout, None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn resume_reapplies_snapshot_as_recovery_version() {
        let h = harness();
        seed_task(&h).await;
        let recovery = h.engine.recovery();
        recovery.start_session(sid("s1"), Some(tid("T1"))).await.unwrap();
        recovery
            .mark_interrupted(
                &sid("s1"),
                RecoveryType::Compaction,
                Some(SessionSnapshot {
                    immediate_context: Some(ImmediateContext {
                        working_on: "session-local work".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        let outcome = recovery.resume(&sid("s1")).await.unwrap().value;
        assert_eq!(outcome.session.status, SessionStatus::Recovered);
        let task = outcome.task.unwrap();
        assert_eq!(task.version, 2);
        assert_eq!(task.fields.immediate_context.working_on, "session-local work");

        let latest = &h.engine.versions().list_versions(&tid("T1"), 1).await.unwrap()[0];
        assert_eq!(latest.change_type, ChangeType::Recovery);
        assert_eq!(latest.session_id, Some(sid("s1")));

        assert!(recovery.resume(&sid("s1")).await.is_err());
    }

    #[tokio::test]
    async fn unknown_session_and_task_are_not_found() {
        let h = harness();
        let recovery = h.engine.recovery();
        assert!(matches!(
            recovery.heartbeat(&sid("ghost"), None).await,
            Err(ContextError::NotFound { .. })
        ));
        assert!(matches!(
            recovery.start_session(sid("s1"), Some(tid("ghost"))).await,
            Err(ContextError::NotFound { .. })
        ));
        recovery.start_session(sid("s1"), None).await.unwrap();
        assert!(matches!(
            recovery.start_session(sid("s1"), None).await,
            Err(ContextError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn session_store_outage_aborts_heartbeat() {
        let h = harness();
        let recovery = h.engine.recovery();
        recovery.start_session(sid("s1"), None).await.unwrap();
        h.sessions.set_available(false);
        assert!(matches!(
            recovery.heartbeat(&sid("s1"), None).await,
            Err(ContextError::BackendUnavailable(_))
        ));
        h.sessions.set_available(true);
        assert!(recovery.heartbeat(&sid("s1"), None).await.is_ok());
    }

    #[tokio::test]
    async fn session_start_is_recorded_in_graph() {
        let h = harness();
        seed_task(&h).await;
        let started = h
            .engine
            .recovery()
            .start_session(sid("s1"), Some(tid("T1")))
            .await
            .unwrap();
        assert_eq!(started.saved_to.graph, crate::app::status::SecondaryWrite::Written);
        assert_eq!(h.graph.session_task(&sid("s1")).await, Some(Some(tid("T1"))));
    }
}
