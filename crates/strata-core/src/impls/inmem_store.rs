//! InMemoryContextStore - 開発用・テスト用の正本
//!
//! # 実装詳細
//! - 全テーブルを 1 つの `Mutex<InMemoryStoreState>` の下に置く
//! - `commit` は「全前提条件を検証 → 全 op を適用」の 2 段階なので、
//!   途中で失敗しても状態は変わらない（トランザクション相当）
//! - `set_available(false)` で障害を注入できる

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    Checkpoint, CheckpointFilter, CheckpointId, Conflict, ConflictFilter, ConflictId,
    ContextVersion, Entity, GlobalContext, TaskContext, TaskId, TaskStatus,
};
use crate::ports::{ContextStore, StoreError, WriteBatch, WriteOp};

#[derive(Default)]
struct InMemoryStoreState {
    /// task_contexts (single source of truth for current state).
    tasks: BTreeMap<TaskId, TaskContext>,

    /// context_versions, keyed by task then version.
    versions: HashMap<TaskId, BTreeMap<u64, ContextVersion>>,

    checkpoints: HashMap<CheckpointId, Checkpoint>,

    /// ULID keys keep detection order.
    conflicts: BTreeMap<ConflictId, Conflict>,

    global: Option<GlobalContext>,
}

impl InMemoryStoreState {
    /// Preconditions are checked against the state before the batch.
    fn validate(&self, op: &WriteOp) -> Result<(), StoreError> {
        match op {
            WriteOp::InsertTask(context) => {
                if self.tasks.contains_key(&context.task_id) {
                    return Err(StoreError::Duplicate {
                        entity: Entity::Task,
                        key: context.task_id.to_string(),
                    });
                }
            }
            WriteOp::PutTask {
                context,
                expected_version,
            } => self.check_version(&context.task_id, *expected_version)?,
            WriteOp::AssertTaskVersion { task_id, version } => {
                self.check_version(task_id, *version)?
            }
            WriteOp::DeleteTask(task_id) => {
                if !self.tasks.contains_key(task_id) {
                    return Err(missing_task(task_id));
                }
            }
            WriteOp::AppendVersion(version) => {
                let taken = self
                    .versions
                    .get(&version.task_id)
                    .is_some_and(|history| history.contains_key(&version.version));
                if taken {
                    return Err(StoreError::Duplicate {
                        entity: Entity::Version,
                        key: format!("{}@{}", version.task_id, version.version),
                    });
                }
            }
            WriteOp::PutCheckpoint(checkpoint) => {
                if self.checkpoints.contains_key(&checkpoint.checkpoint_id) {
                    return Err(StoreError::Duplicate {
                        entity: Entity::Checkpoint,
                        key: checkpoint.checkpoint_id.to_string(),
                    });
                }
            }
            WriteOp::PutConflict(_) | WriteOp::PutGlobal(_) => {}
        }
        Ok(())
    }

    fn check_version(&self, task_id: &TaskId, expected: u64) -> Result<(), StoreError> {
        let current = self.tasks.get(task_id).ok_or_else(|| missing_task(task_id))?;
        if current.version != expected {
            return Err(StoreError::VersionConflict {
                task_id: task_id.to_string(),
                expected,
                actual: current.version,
            });
        }
        Ok(())
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::InsertTask(context) | WriteOp::PutTask { context, .. } => {
                self.tasks.insert(context.task_id.clone(), context);
            }
            WriteOp::DeleteTask(task_id) => {
                self.tasks.remove(&task_id);
                self.versions.remove(&task_id);
            }
            WriteOp::AssertTaskVersion { .. } => {}
            WriteOp::AppendVersion(version) => {
                self.versions
                    .entry(version.task_id.clone())
                    .or_default()
                    .insert(version.version, version);
            }
            WriteOp::PutCheckpoint(checkpoint) => {
                self.checkpoints
                    .insert(checkpoint.checkpoint_id, checkpoint);
            }
            WriteOp::PutConflict(conflict) => {
                self.conflicts.insert(conflict.id, conflict);
            }
            WriteOp::PutGlobal(global) => {
                self.global = Some(global);
            }
        }
    }
}

fn missing_task(task_id: &TaskId) -> StoreError {
    StoreError::Missing {
        entity: Entity::Task,
        key: task_id.to_string(),
    }
}

/// In-memory implementation of the authoritative store.
pub struct InMemoryContextStore {
    state: Arc<Mutex<InMemoryStoreState>>,
    available: Arc<AtomicBool>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryStoreState::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".into()))
        }
    }
}

impl Default for InMemoryContextStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskContext>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskContext>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.fields.status == s))
            .cloned()
            .collect())
    }

    async fn list_versions(
        &self,
        task_id: &TaskId,
        limit: usize,
    ) -> Result<Vec<ContextVersion>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .versions
            .get(task_id)
            .map(|history| history.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_version(
        &self,
        task_id: &TaskId,
        version: u64,
    ) -> Result<Option<ContextVersion>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .versions
            .get(task_id)
            .and_then(|history| history.get(&version))
            .cloned())
    }

    async fn prune_versions(
        &self,
        task_id: &TaskId,
        keep_latest: usize,
    ) -> Result<usize, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let Some(history) = state.versions.get_mut(task_id) else {
            return Ok(0);
        };
        let excess = history.len().saturating_sub(keep_latest);
        let doomed: Vec<u64> = history.keys().take(excess).copied().collect();
        for version in &doomed {
            history.remove(version);
        }
        Ok(doomed.len())
    }

    async fn get_checkpoint(&self, id: &CheckpointId) -> Result<Option<Checkpoint>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.checkpoints.get(id).cloned())
    }

    async fn list_checkpoints(
        &self,
        filter: &CheckpointFilter,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut found: Vec<Checkpoint> = state
            .checkpoints
            .values()
            .filter(|c| filter.scope.is_none_or(|s| c.scope == s))
            .filter(|c| filter.task_id.as_ref().is_none_or(|t| c.includes(t)))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.checkpoint_id.cmp(&a.checkpoint_id))
        });
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn get_conflict(&self, id: &ConflictId) -> Result<Option<Conflict>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.conflicts.get(id).cloned())
    }

    async fn list_conflicts(&self, filter: &ConflictFilter) -> Result<Vec<Conflict>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .conflicts
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    async fn get_global(&self) -> Result<Option<GlobalContext>, StoreError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.global.clone())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        for op in batch.ops() {
            state.validate(op)?;
        }
        for op in batch.into_ops() {
            state.apply(op);
        }
        Ok(())
    }
}
