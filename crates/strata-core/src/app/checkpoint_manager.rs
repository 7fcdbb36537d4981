//! CheckpointManager - 名前付きの完全スナップショットと復元
//!
//! # 原子性
//! - 作成: 各 task に `AssertTaskVersion` を付けて `PutCheckpoint` と同じバッチでコミット。
//!   読んだ時点から task が動いていればコミットごと失敗し、読み直す
//! - 復元: backup checkpoint・復元後の task 行・ContextVersion を 1 バッチでコミット。
//!   backup だけが残ることも、復元だけが起きることもない

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::secondary::Secondaries;
use super::status::{Persisted, SavedTo};
use super::versioned_store::VersionedStore;
use crate::config::EngineConfig;
use crate::domain::{
    ChangeMeta, ChangeType, Checkpoint, CheckpointFilter, CheckpointId, CheckpointRequest,
    CheckpointScope, CheckpointSnapshot, CheckpointType, ContextError, DomainEvent, Entity,
    GlobalContext, TaskContext, TaskContextPatch, TaskId, TaskSnapshot,
};
use crate::ports::{Clock, ContextStore, IdGenerator, StoreError, WriteBatch, WriteOp};

pub const BACKUP_LABEL: &str = "Backup before rollback";

/// Result of `rollback_to_checkpoint`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRollback {
    pub task: TaskContext,
    pub checkpoint_id: CheckpointId,
    /// The `recovery_point` checkpoint of the pre-rollback state, if requested.
    pub backup: Option<Checkpoint>,
}

pub struct CheckpointManager {
    store: Arc<dyn ContextStore>,
    versions: Arc<VersionedStore>,
    secondaries: Arc<Secondaries>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn ContextStore>,
        versions: Arc<VersionedStore>,
        secondaries: Arc<Secondaries>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            versions,
            secondaries,
            ids,
            clock,
            config,
        }
    }

    /// Snapshot the global context plus every requested task.
    ///
    /// Scope comes from the number of tasks: none is `global`, one is `task`,
    /// two or more is `multi_task`.
    pub async fn create(
        &self,
        request: CheckpointRequest,
    ) -> Result<Persisted<Checkpoint>, ContextError> {
        if request.label.trim().is_empty() {
            return Err(ContextError::Validation("checkpoint label must not be empty".into()));
        }
        let included = request.included_tasks();

        let mut attempt = 0;
        let checkpoint = loop {
            attempt += 1;
            let mut tasks = Vec::with_capacity(included.len());
            for task_id in &included {
                tasks.push(self.versions.get(task_id).await?);
            }
            let global = self.store.get_global().await?;
            let checkpoint = self.build(&request, &tasks, global);

            let mut batch = WriteBatch::new();
            for task in &tasks {
                batch.push(WriteOp::AssertTaskVersion {
                    task_id: task.task_id.clone(),
                    version: task.version,
                });
            }
            batch.push(WriteOp::PutCheckpoint(checkpoint.clone()));

            match self.store.commit(batch).await {
                Ok(()) => break checkpoint,
                Err(err @ StoreError::VersionConflict { .. })
                    if attempt < self.config.update_retry_limit =>
                {
                    debug!(label = %request.label, attempt, error = %err, "task moved while checkpointing, re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        };

        info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            scope = %checkpoint.scope,
            tasks = checkpoint.included_tasks.len(),
            "checkpoint created"
        );
        let saved_to = self.publish_created(&checkpoint).await;
        Ok(Persisted::new(checkpoint, saved_to))
    }

    pub async fn get(&self, checkpoint_id: &CheckpointId) -> Result<Checkpoint, ContextError> {
        self.store
            .get_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| ContextError::not_found(Entity::Checkpoint, checkpoint_id))
    }

    /// Newest first.
    pub async fn list(&self, filter: &CheckpointFilter) -> Result<Vec<Checkpoint>, ContextError> {
        Ok(self.store.list_checkpoints(filter).await?)
    }

    /// Restore one task from a checkpoint.
    ///
    /// With `create_backup`, the pre-rollback state is captured as a
    /// `recovery_point` checkpoint in the same commit, so the rollback can
    /// itself be rolled back.
    pub async fn rollback_to_checkpoint(
        &self,
        task_id: &TaskId,
        checkpoint_id: &CheckpointId,
        create_backup: bool,
    ) -> Result<Persisted<CheckpointRollback>, ContextError> {
        let checkpoint = self.get(checkpoint_id).await?;
        let snapshot = checkpoint
            .snapshot
            .task(task_id)
            .ok_or_else(|| ContextError::ScopeMismatch {
                checkpoint_id: checkpoint_id.to_string(),
                task_id: task_id.to_string(),
            })?;
        let meta = ChangeMeta::new(ChangeType::CheckpointRollback)
            .summary(format!(
                "checkpoint_rollback to '{}' ({})",
                checkpoint.label, checkpoint.checkpoint_id
            ));

        let mut attempt = 0;
        let (staged, backup) = loop {
            attempt += 1;
            let current = self.versions.get(task_id).await?;
            let backup = if create_backup {
                let global = self.store.get_global().await?;
                let request = CheckpointRequest::new(BACKUP_LABEL)
                    .for_task(task_id.clone())
                    .kind(CheckpointType::RecoveryPoint)
                    .description(format!("before rollback to {}", checkpoint.checkpoint_id))
                    .by("system");
                Some(self.build(&request, std::slice::from_ref(&current), global))
            } else {
                None
            };
            let staged = self
                .versions
                .stage_for(&current, TaskContextPatch::from(snapshot.fields.clone()), &meta)
                .await?;

            let mut batch = WriteBatch::new();
            if let Some(backup) = &backup {
                batch.push(WriteOp::PutCheckpoint(backup.clone()));
            }
            staged.push_into(&mut batch);

            match self.store.commit(batch).await {
                Ok(()) => break (staged, backup),
                Err(err @ StoreError::VersionConflict { .. })
                    if attempt < self.config.update_retry_limit =>
                {
                    debug!(task_id = %task_id, attempt, error = %err, "task moved during rollback, re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        };

        let mut saved_to = SavedTo::store_only();
        if let Some(backup) = &backup {
            saved_to = saved_to.merge(self.publish_created(backup).await);
        }
        let restored = self.versions.publish(staged).await;
        saved_to = saved_to.merge(restored.saved_to);
        let task = restored.value;

        info!(
            task_id = %task_id,
            checkpoint_id = %checkpoint_id,
            version = task.version,
            backup = ?backup.as_ref().map(|b| b.checkpoint_id.to_string()),
            "task restored from checkpoint"
        );
        let restored_event = self
            .secondaries
            .emit(
                DomainEvent::CheckpointRestored {
                    checkpoint_id: *checkpoint_id,
                    task_id: task_id.clone(),
                    version: task.version,
                    backup_id: backup.as_ref().map(|b| b.checkpoint_id),
                },
                None,
            )
            .await;
        saved_to.events = saved_to.events.and(restored_event);

        Ok(Persisted::new(
            CheckpointRollback {
                task,
                checkpoint_id: *checkpoint_id,
                backup,
            },
            saved_to,
        ))
    }

    /// Put back the GlobalContext embedded in a checkpoint.
    pub async fn restore_global(
        &self,
        checkpoint_id: &CheckpointId,
    ) -> Result<Persisted<GlobalContext>, ContextError> {
        let checkpoint = self.get(checkpoint_id).await?;
        let global = checkpoint
            .snapshot
            .global
            .ok_or_else(|| ContextError::not_found(Entity::GlobalContext, checkpoint_id))?;
        self.store
            .commit(WriteBatch::new().with(WriteOp::PutGlobal(global.clone())))
            .await?;
        info!(checkpoint_id = %checkpoint_id, "global context restored");

        let mut saved_to = SavedTo::store_only();
        saved_to.events = self
            .secondaries
            .emit(DomainEvent::GlobalContextUpdated, None)
            .await;
        Ok(Persisted::new(global, saved_to))
    }

    fn build(
        &self,
        request: &CheckpointRequest,
        tasks: &[TaskContext],
        global: Option<GlobalContext>,
    ) -> Checkpoint {
        let included_tasks: Vec<TaskId> = tasks.iter().map(|t| t.task_id.clone()).collect();
        Checkpoint {
            checkpoint_id: self.ids.generate_checkpoint_id(),
            label: request.label.clone(),
            description: request.description.clone(),
            checkpoint_type: request.checkpoint_type,
            scope: CheckpointScope::for_task_count(included_tasks.len()),
            included_tasks,
            snapshot: CheckpointSnapshot {
                global,
                tasks: tasks
                    .iter()
                    .map(|t| TaskSnapshot {
                        task_id: t.task_id.clone(),
                        version: t.version,
                        fields: t.snapshot(),
                    })
                    .collect(),
            },
            created_by: request.created_by.clone(),
            session_id: request.session_id.clone(),
            created_at: self.clock.now(),
        }
    }

    async fn publish_created(&self, checkpoint: &Checkpoint) -> SavedTo {
        let mut saved_to = SavedTo::store_only();
        saved_to.cache = self.secondaries.cache_checkpoint(checkpoint).await;
        saved_to.events = self
            .secondaries
            .emit(
                DomainEvent::CheckpointCreated {
                    checkpoint_id: checkpoint.checkpoint_id,
                    scope: checkpoint.scope,
                    checkpoint_type: checkpoint.checkpoint_type,
                    included_tasks: checkpoint.included_tasks.clone(),
                },
                checkpoint.session_id.as_ref(),
            )
            .await;
        saved_to
    }
}
