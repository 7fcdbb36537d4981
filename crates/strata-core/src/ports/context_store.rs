//! ContextStore port - 正本（source of truth）
//!
//! ContextStore は以下の論理テーブルを管理します：
//! - `task_contexts`（現在の状態、task_id で一意、`version` 列）
//! - `context_versions`（append-only、task_id + version で索引）
//! - `checkpoints`（checkpoint_id と scope で索引）
//! - `conflicts`（task_id と status で索引）
//! - `global_contexts`（プロジェクトごとのシングルトン）
//!
//! # 設計原則
//! - 書き込みは `WriteBatch` 単位で原子的（全部成功するか、何も変わらないか）
//! - `PutTask` / `AssertTaskVersion` は version による compare-and-swap
//! - 読み取り → スナップショット → 書き込み を 1 バッチにまとめることで、
//!   checkpoint 作成と rollback を正本に対して原子的にする

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    Checkpoint, CheckpointFilter, CheckpointId, Conflict, ConflictFilter, ConflictId,
    ContextError, ContextVersion, Entity, GlobalContext, TaskContext, TaskId, TaskStatus,
};

/// Failure of an authoritative backend (context store or session store).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("version conflict on task {task_id}: expected {expected}, found {actual}")]
    VersionConflict {
        task_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("{entity} already exists: {key}")]
    Duplicate { entity: Entity, key: String },

    #[error("{entity} missing: {key}")]
    Missing { entity: Entity, key: String },
}

impl From<StoreError> for ContextError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => ContextError::BackendUnavailable(reason),
            StoreError::VersionConflict {
                task_id,
                expected,
                actual,
            } => ContextError::ConcurrentModification {
                task_id,
                expected,
                actual,
            },
            StoreError::Duplicate { entity, key } => ContextError::AlreadyExists { entity, key },
            StoreError::Missing { entity, key } => ContextError::NotFound { entity, key },
        }
    }
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Fails with `Duplicate` if the task exists.
    InsertTask(TaskContext),
    /// Replaces the row; fails with `VersionConflict` unless the stored version equals `expected_version`.
    PutTask {
        context: TaskContext,
        expected_version: u64,
    },
    /// Removes the row and its version history.
    DeleteTask(TaskId),
    /// Precondition only: the task exists at exactly `version`.
    AssertTaskVersion { task_id: TaskId, version: u64 },
    /// Fails with `Duplicate` if `(task_id, version)` is already recorded.
    AppendVersion(ContextVersion),
    /// Fails with `Duplicate` if the checkpoint id is taken.
    PutCheckpoint(Checkpoint),
    /// Insert or replace (resolution updates the same id).
    PutConflict(Conflict),
    PutGlobal(GlobalContext),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn with(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn extend<I: IntoIterator<Item = WriteOp>>(&mut self, ops: I) {
        self.ops.extend(ops);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// ContextStore は状態・履歴・checkpoint・conflict の正本
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskContext>, StoreError>;

    /// All tasks, optionally filtered by status, ordered by task id.
    async fn list_tasks(&self, status: Option<TaskStatus>)
        -> Result<Vec<TaskContext>, StoreError>;

    /// Newest first.
    async fn list_versions(
        &self,
        task_id: &TaskId,
        limit: usize,
    ) -> Result<Vec<ContextVersion>, StoreError>;

    async fn get_version(
        &self,
        task_id: &TaskId,
        version: u64,
    ) -> Result<Option<ContextVersion>, StoreError>;

    /// Retention: drop all but the newest `keep_latest` versions. Returns how many were removed.
    async fn prune_versions(&self, task_id: &TaskId, keep_latest: usize)
        -> Result<usize, StoreError>;

    async fn get_checkpoint(&self, id: &CheckpointId) -> Result<Option<Checkpoint>, StoreError>;

    /// Newest first.
    async fn list_checkpoints(&self, filter: &CheckpointFilter)
        -> Result<Vec<Checkpoint>, StoreError>;

    async fn get_conflict(&self, id: &ConflictId) -> Result<Option<Conflict>, StoreError>;

    /// Oldest first.
    async fn list_conflicts(&self, filter: &ConflictFilter) -> Result<Vec<Conflict>, StoreError>;

    async fn get_global(&self) -> Result<Option<GlobalContext>, StoreError>;

    /// Apply every op or none of them.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_domain_taxonomy() {
        let err: ContextError = StoreError::Unavailable("connection refused".into()).into();
        assert!(matches!(err, ContextError::BackendUnavailable(_)));

        let err: ContextError = StoreError::VersionConflict {
            task_id: "T1".into(),
            expected: 2,
            actual: 3,
        }
        .into();
        assert!(matches!(
            err,
            ContextError::ConcurrentModification { expected: 2, actual: 3, .. }
        ));

        let err: ContextError = StoreError::Missing {
            entity: Entity::Task,
            key: "T1".into(),
        }
        .into();
        assert_eq!(err, ContextError::not_found(Entity::Task, "T1"));
    }
}
