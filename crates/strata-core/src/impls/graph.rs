//! GraphStore の実装
//!
//! - NoopGraphStore: グラフバックエンド無し。依存関係は常に空
//! - InMemoryGraphStore: `blocks` エッジだけを持つ最小グラフ（テスト・デモ用）

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{SessionId, TaskId};
use crate::ports::{GraphStore, PortError};

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGraphStore;

#[async_trait]
impl GraphStore for NoopGraphStore {
    fn is_available(&self) -> bool {
        false
    }

    async fn blocking_tasks(&self, _task_id: &TaskId) -> Result<Vec<TaskId>, PortError> {
        Ok(Vec::new())
    }

    async fn record_session(
        &self,
        _session_id: &SessionId,
        _task_id: Option<&TaskId>,
    ) -> Result<(), PortError> {
        Ok(())
    }
}

#[derive(Default)]
struct GraphState {
    /// blocked task → tasks blocking it
    blocked_by: BTreeMap<TaskId, BTreeSet<TaskId>>,
    sessions: HashMap<SessionId, Option<TaskId>>,
}

#[derive(Default)]
pub struct InMemoryGraphStore {
    state: Arc<Mutex<GraphState>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `blocker -[blocks]-> blocked`.
    pub async fn add_blocker(&self, blocker: TaskId, blocked: TaskId) {
        let mut state = self.state.lock().await;
        state.blocked_by.entry(blocked).or_default().insert(blocker);
    }

    pub async fn session_task(&self, session_id: &SessionId) -> Option<Option<TaskId>> {
        self.state.lock().await.sessions.get(session_id).cloned()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn blocking_tasks(&self, task_id: &TaskId) -> Result<Vec<TaskId>, PortError> {
        let state = self.state.lock().await;
        Ok(state
            .blocked_by
            .get(task_id)
            .map(|blockers| blockers.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_session(
        &self,
        session_id: &SessionId,
        task_id: Option<&TaskId>,
    ) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        state.sessions.insert(session_id.clone(), task_id.cloned());
        Ok(())
    }
}
