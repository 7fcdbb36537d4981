//! VersionedStore - task context の CRUD と append-only な version 履歴
//!
//! # 書き込みの流れ
//! 1. 正本から現在の行を読む
//! 2. patch をマージして `stage` する（version + 1、必要なら ContextVersion を作る）
//! 3. `PutTask { expected_version }` で compare-and-swap コミット
//! 4. cache / event へ best-effort で反映
//!
//! version 番号は rollback でも減らない。rollback 自体が新しい version になる。

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::secondary::Secondaries;
use super::status::{Persisted, SavedTo};
use crate::config::EngineConfig;
use crate::domain::version::summarize_fields;
use crate::domain::{
    ChangeMeta, ChangeType, ContextError, ContextField, ContextSnapshot, ContextVersion,
    DomainEvent, Entity, GlobalContext, GlobalContextPatch, SessionId, TaskContext,
    TaskContextPatch, TaskId, TaskStatus,
};
use crate::ports::{CacheKey, Clock, ContextStore, StoreError, WriteBatch, WriteOp};

/// A merged-but-uncommitted update. Lets callers put extra ops in the same batch.
#[derive(Debug, Clone)]
pub(crate) struct StagedUpdate {
    pub context: TaskContext,
    pub version: Option<ContextVersion>,
    /// Snapshot of the replaced state when history has no entry for it.
    pub baseline: Option<ContextVersion>,
    pub fields: BTreeSet<ContextField>,
    pub change_type: ChangeType,
    pub session_id: Option<SessionId>,
    expected_version: u64,
}

impl StagedUpdate {
    pub fn push_into(&self, batch: &mut WriteBatch) {
        batch.push(WriteOp::PutTask {
            context: self.context.clone(),
            expected_version: self.expected_version,
        });
        if let Some(baseline) = &self.baseline {
            batch.push(WriteOp::AppendVersion(baseline.clone()));
        }
        if let Some(version) = &self.version {
            batch.push(WriteOp::AppendVersion(version.clone()));
        }
    }

    fn batch(&self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        self.push_into(&mut batch);
        batch
    }
}

pub struct VersionedStore {
    store: Arc<dyn ContextStore>,
    secondaries: Arc<Secondaries>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl VersionedStore {
    pub fn new(
        store: Arc<dyn ContextStore>,
        secondaries: Arc<Secondaries>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            secondaries,
            clock,
            config,
        }
    }

    pub async fn create(
        &self,
        task_id: TaskId,
        fields: ContextSnapshot,
    ) -> Result<Persisted<TaskContext>, ContextError> {
        self.create_with(task_id, fields, ChangeMeta::new(ChangeType::Create))
            .await
    }

    /// Insert a task at version 1 together with its first ContextVersion.
    pub async fn create_with(
        &self,
        task_id: TaskId,
        fields: ContextSnapshot,
        meta: ChangeMeta,
    ) -> Result<Persisted<TaskContext>, ContextError> {
        fields.validate()?;
        let now = self.clock.now();
        let context = TaskContext::new(task_id, fields, now);
        let first = ContextVersion {
            task_id: context.task_id.clone(),
            version: context.version,
            snapshot: context.snapshot(),
            change_type: ChangeType::Create,
            change_summary: meta
                .summary
                .clone()
                .unwrap_or_else(|| summarize_fields(ChangeType::Create, &BTreeSet::new())),
            created_at: now,
            created_by: meta.created_by.clone(),
            session_id: meta.session_id.clone(),
        };
        self.store
            .commit(
                WriteBatch::new()
                    .with(WriteOp::InsertTask(context.clone()))
                    .with(WriteOp::AppendVersion(first)),
            )
            .await?;
        info!(task_id = %context.task_id, version = context.version, "task created");

        let mut saved_to = SavedTo::store_only();
        saved_to.cache = self.secondaries.cache_task(&context).await;
        saved_to.events = self
            .secondaries
            .emit(
                DomainEvent::TaskCreated {
                    task_id: context.task_id.clone(),
                },
                meta.session_id.as_ref(),
            )
            .await;
        Ok(Persisted::new(context, saved_to))
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<TaskContext, ContextError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| ContextError::not_found(Entity::Task, task_id))
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskContext>, ContextError> {
        Ok(self.store.list_tasks(status).await?)
    }

    /// Partial merge, last writer wins after up to `update_retry_limit` re-reads.
    pub async fn update(
        &self,
        task_id: &TaskId,
        patch: TaskContextPatch,
    ) -> Result<Persisted<TaskContext>, ContextError> {
        self.update_with(task_id, patch, ChangeMeta::update()).await
    }

    pub async fn update_with(
        &self,
        task_id: &TaskId,
        patch: TaskContextPatch,
        meta: ChangeMeta,
    ) -> Result<Persisted<TaskContext>, ContextError> {
        patch.validate()?;
        if patch.is_empty() {
            let current = self.get(task_id).await?;
            return Ok(Persisted::new(current, SavedTo::untouched()));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.get(task_id).await?;
            let staged = self.stage_for(&current, patch.clone(), &meta).await?;
            match self.store.commit(staged.batch()).await {
                Ok(()) => return Ok(self.publish(staged).await),
                Err(err @ StoreError::VersionConflict { .. })
                    if attempt < self.config.update_retry_limit =>
                {
                    debug!(task_id = %task_id, attempt, error = %err, "version race, re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Optimistic compare-and-swap: fails with `ConcurrentModification` unless
    /// the stored version still equals `expected_version`.
    pub async fn update_checked(
        &self,
        task_id: &TaskId,
        patch: TaskContextPatch,
        expected_version: u64,
        meta: ChangeMeta,
    ) -> Result<Persisted<TaskContext>, ContextError> {
        patch.validate()?;
        let current = self.get(task_id).await?;
        if current.version != expected_version {
            return Err(ContextError::ConcurrentModification {
                task_id: task_id.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }
        if patch.is_empty() {
            return Ok(Persisted::new(current, SavedTo::untouched()));
        }
        let staged = self.stage_for(&current, patch, &meta).await?;
        self.store.commit(staged.batch()).await?;
        Ok(self.publish(staged).await)
    }

    pub async fn archive(&self, task_id: &TaskId) -> Result<Persisted<TaskContext>, ContextError> {
        self.update_with(
            task_id,
            TaskContextPatch::new().status(TaskStatus::Archived),
            ChangeMeta::update().summary("archived"),
        )
        .await
    }

    /// Remove the row and its history; clears `task:` and `lock:` mirrors.
    /// Checkpoints that include the task are kept.
    pub async fn delete(&self, task_id: &TaskId) -> Result<Persisted<TaskId>, ContextError> {
        self.store
            .commit(WriteBatch::new().with(WriteOp::DeleteTask(task_id.clone())))
            .await?;
        info!(task_id = %task_id, "task deleted");

        let mut saved_to = SavedTo::store_only();
        saved_to.cache = self
            .secondaries
            .evict(CacheKey::Task(task_id.clone()))
            .await
            .and(self.secondaries.evict(CacheKey::Lock(task_id.clone())).await);
        saved_to.events = self
            .secondaries
            .emit(
                DomainEvent::TaskDeleted {
                    task_id: task_id.clone(),
                },
                None,
            )
            .await;
        Ok(Persisted::new(task_id.clone(), saved_to))
    }

    /// Newest first.
    pub async fn list_versions(
        &self,
        task_id: &TaskId,
        limit: usize,
    ) -> Result<Vec<ContextVersion>, ContextError> {
        self.get(task_id).await?;
        Ok(self.store.list_versions(task_id, limit).await?)
    }

    pub async fn get_version(
        &self,
        task_id: &TaskId,
        version: u64,
    ) -> Result<ContextVersion, ContextError> {
        self.store
            .get_version(task_id, version)
            .await?
            .ok_or_else(|| ContextError::not_found(Entity::Version, format!("{task_id}@{version}")))
    }

    pub async fn rollback_to_version(
        &self,
        task_id: &TaskId,
        version: u64,
    ) -> Result<Persisted<TaskContext>, ContextError> {
        self.rollback_to_version_with(task_id, version, ChangeMeta::new(ChangeType::Rollback))
            .await
    }

    /// Restore every field from version `version`. The restore is written as a
    /// new, higher version; history is never rewritten.
    pub async fn rollback_to_version_with(
        &self,
        task_id: &TaskId,
        version: u64,
        meta: ChangeMeta,
    ) -> Result<Persisted<TaskContext>, ContextError> {
        let target = self.get_version(task_id, version).await?;
        let meta = ChangeMeta {
            change_type: ChangeType::Rollback,
            summary: meta
                .summary
                .or_else(|| Some(format!("rollback to version {version}"))),
            ..meta
        };
        let restored = self
            .update_with(task_id, TaskContextPatch::from(target.snapshot), meta)
            .await?;
        info!(
            task_id = %task_id,
            target_version = version,
            version = restored.value.version,
            "task rolled back"
        );
        Ok(restored)
    }

    /// Explicit retention: keep the newest `keep_latest` versions.
    pub async fn prune_versions(
        &self,
        task_id: &TaskId,
        keep_latest: usize,
    ) -> Result<usize, ContextError> {
        if keep_latest == 0 {
            return Err(ContextError::Validation(
                "keep_latest must be at least 1".into(),
            ));
        }
        self.get(task_id).await?;
        let removed = self.store.prune_versions(task_id, keep_latest).await?;
        info!(task_id = %task_id, removed, keep_latest, "pruned version history");
        Ok(removed)
    }

    pub async fn get_global(&self) -> Result<Option<GlobalContext>, ContextError> {
        Ok(self.store.get_global().await?)
    }

    pub async fn update_global(
        &self,
        patch: GlobalContextPatch,
    ) -> Result<Persisted<GlobalContext>, ContextError> {
        let mut global = self.store.get_global().await?.unwrap_or_default();
        if patch.is_empty() {
            return Ok(Persisted::new(global, SavedTo::untouched()));
        }
        if let Some(Some(active)) = &patch.active_task_id {
            self.get(active).await?;
        }
        patch.apply_to(&mut global);
        self.store
            .commit(WriteBatch::new().with(WriteOp::PutGlobal(global.clone())))
            .await?;
        info!("global context updated");

        let mut saved_to = SavedTo::store_only();
        saved_to.events = self
            .secondaries
            .emit(DomainEvent::GlobalContextUpdated, None)
            .await;
        Ok(Persisted::new(global, saved_to))
    }

    /// Merge `patch` into `current` without touching the store.
    pub(crate) fn stage(
        &self,
        current: &TaskContext,
        patch: TaskContextPatch,
        meta: &ChangeMeta,
    ) -> Result<StagedUpdate, ContextError> {
        if meta.change_type == ChangeType::Create {
            return Err(ContextError::Validation(
                "create is not a valid change type for an update".into(),
            ));
        }
        let restore = meta.change_type.is_restore();
        if !restore
            && let Some(next) = patch.iteration
            && next < current.fields.iteration
        {
            return Err(ContextError::Validation(format!(
                "iteration must not decrease ({} -> {next})",
                current.fields.iteration
            )));
        }

        let fields = patch.fields();
        let now = self.clock.now();
        let mut next = current.clone();
        patch.apply_to(&mut next.fields);
        next.fields.validate()?;
        next.version = current.version + 1;
        next.updated_at = now;

        let versioned = restore || self.config.significant_fields.is_significant(&fields);
        let version = versioned.then(|| ContextVersion {
            task_id: next.task_id.clone(),
            version: next.version,
            snapshot: next.snapshot(),
            change_type: meta.change_type,
            change_summary: meta
                .summary
                .clone()
                .unwrap_or_else(|| summarize_fields(meta.change_type, &fields)),
            created_at: now,
            created_by: meta.created_by.clone(),
            session_id: meta.session_id.clone(),
        });

        Ok(StagedUpdate {
            context: next,
            version,
            baseline: None,
            fields,
            change_type: meta.change_type,
            session_id: meta.session_id.clone(),
            expected_version: current.version,
        })
    }

    /// `stage`, plus a baseline for restores.
    ///
    /// A restore overwrites the task, so the state it replaces must be in
    /// history to be restorable in turn. Updates below the significance bar
    /// leave no entry for their version; the baseline fills that gap in the
    /// same commit.
    pub(crate) async fn stage_for(
        &self,
        current: &TaskContext,
        patch: TaskContextPatch,
        meta: &ChangeMeta,
    ) -> Result<StagedUpdate, ContextError> {
        let mut staged = self.stage(current, patch, meta)?;
        if meta.change_type.is_restore()
            && self
                .store
                .get_version(&current.task_id, current.version)
                .await?
                .is_none()
        {
            staged.baseline = Some(ContextVersion {
                task_id: current.task_id.clone(),
                version: current.version,
                snapshot: current.snapshot(),
                change_type: ChangeType::Update,
                change_summary: format!("state before {}", meta.change_type),
                created_at: current.updated_at,
                created_by: meta.created_by.clone(),
                session_id: meta.session_id.clone(),
            });
        }
        Ok(staged)
    }

    /// Best-effort side effects of a committed update.
    pub(crate) async fn publish(&self, staged: StagedUpdate) -> Persisted<TaskContext> {
        let StagedUpdate {
            context,
            version,
            fields,
            change_type,
            session_id,
            ..
        } = staged;
        info!(
            task_id = %context.task_id,
            version = context.version,
            change_type = %change_type,
            versioned = version.is_some(),
            "task updated"
        );

        let mut saved_to = SavedTo::store_only();
        saved_to.cache = self.secondaries.cache_task(&context).await;
        saved_to.events = self
            .secondaries
            .emit(
                DomainEvent::TaskUpdated {
                    task_id: context.task_id.clone(),
                    version: context.version,
                    change_type,
                    fields: fields.iter().map(|f| f.as_str().to_string()).collect(),
                    versioned: version.is_some(),
                },
                session_id.as_ref(),
            )
            .await;
        Persisted::new(context, saved_to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::status::SecondaryWrite;
    use crate::app::testing::{harness, harness_with, tid};
    use crate::domain::{ImmediateContext, TechnicalDecision};
    use crate::ports::MirrorCache;
    use rstest::rstest;

    #[tokio::test]
    async fn create_starts_at_version_one_with_history() {
        let h = harness();
        let created = h
            .engine
            .versions()
            .create(tid("T1"), ContextSnapshot::named("auth"))
            .await
            .unwrap();
        assert_eq!(created.value.version, 1);
        assert_eq!(created.saved_to.cache, SecondaryWrite::Written);

        let history = h.engine.versions().list_versions(&tid("T1"), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].change_type, ChangeType::Create);

        let dup = h
            .engine
            .versions()
            .create(tid("T1"), ContextSnapshot::named("auth"))
            .await;
        assert!(matches!(dup, Err(ContextError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn significant_updates_are_monotonic() {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();

        for i in 1..=4 {
            versions
                .update(&tid("T1"), TaskContextPatch::new().iteration(i))
                .await
                .unwrap();
        }

        let current = versions.get(&tid("T1")).await.unwrap();
        assert_eq!(current.version, 5);

        let history = versions.list_versions(&tid("T1"), 10).await.unwrap();
        let numbers: Vec<u64> = history.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![5, 4, 3, 2, 1]);
        assert_eq!(history[0].snapshot.iteration, 4);
        assert_eq!(history[0].change_summary, "updated iteration");
    }

    #[tokio::test]
    async fn insignificant_update_bumps_version_without_history() {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();

        let updated = versions
            .update(
                &tid("T1"),
                TaskContextPatch::new()
                    .score(Some(0.4))
                    .append_decision(TechnicalDecision::new("use ULIDs")),
            )
            .await
            .unwrap();
        assert_eq!(updated.value.version, 2);
        assert_eq!(updated.value.fields.technical_decisions.len(), 1);
        assert_eq!(versions.list_versions(&tid("T1"), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_update_is_a_read() {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();

        let same = versions.update(&tid("T1"), TaskContextPatch::new()).await.unwrap();
        assert_eq!(same.value.version, 1);
        assert_eq!(same.saved_to, SavedTo::untouched());
    }

    #[tokio::test]
    async fn omitted_fields_keep_prior_values() {
        let h = harness();
        let versions = h.engine.versions();
        let mut fields = ContextSnapshot::named("t");
        fields.key_files = vec!["src/lib.rs".into()];
        versions.create(tid("T1"), fields).await.unwrap();

        let updated = versions
            .update(&tid("T1"), TaskContextPatch::new().current_phase("review"))
            .await
            .unwrap();
        assert_eq!(updated.value.fields.current_phase, "review");
        assert_eq!(updated.value.fields.key_files, vec!["src/lib.rs".to_string()]);
    }

    #[tokio::test]
    async fn iteration_cannot_go_backwards_on_plain_update() {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();
        versions
            .update(&tid("T1"), TaskContextPatch::new().iteration(3))
            .await
            .unwrap();

        let err = versions
            .update(&tid("T1"), TaskContextPatch::new().iteration(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Validation(_)));
    }

    #[tokio::test]
    async fn rollback_is_reversible() {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();
        versions
            .update(
                &tid("T1"),
                TaskContextPatch::new()
                    .status(TaskStatus::InProgress)
                    .current_phase("impl"),
            )
            .await
            .unwrap();
        versions
            .update(
                &tid("T1"),
                TaskContextPatch::new().iteration(7).immediate_context(ImmediateContext {
                    working_on: "parser".into(),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        let before = versions.get(&tid("T1")).await.unwrap();
        assert_eq!(before.version, 3);

        let rolled = versions.rollback_to_version(&tid("T1"), 2).await.unwrap();
        assert_eq!(rolled.value.version, 4);
        assert_eq!(rolled.value.fields.iteration, 0);

        let restored = versions.rollback_to_version(&tid("T1"), 3).await.unwrap();
        assert_eq!(restored.value.version, 5);
        assert_eq!(restored.value.fields, before.fields);

        let latest = &versions.list_versions(&tid("T1"), 1).await.unwrap()[0];
        assert_eq!(latest.change_type, ChangeType::Rollback);
        assert_eq!(latest.change_summary, "rollback to version 3");
    }

    #[rstest]
    #[case::score_only(TaskContextPatch::new().score(Some(0.9)))]
    #[case::decision_only(
        TaskContextPatch::new().append_decision(TechnicalDecision::new("keep sqlite"))
    )]
    #[tokio::test]
    async fn rollback_is_reversible_after_unversioned_update(#[case] last_write: TaskContextPatch) {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();
        versions
            .update(&tid("T1"), TaskContextPatch::new().iteration(1))
            .await
            .unwrap();
        versions.update(&tid("T1"), last_write).await.unwrap();
        let before = versions.get(&tid("T1")).await.unwrap();
        assert_eq!(before.version, 3);
        assert!(versions.get_version(&tid("T1"), 3).await.is_err());

        let rolled = versions.rollback_to_version(&tid("T1"), 1).await.unwrap();
        assert_eq!(rolled.value.version, 4);
        assert_eq!(rolled.value.fields.score, None);
        assert!(rolled.value.fields.technical_decisions.is_empty());

        let baseline = versions.get_version(&tid("T1"), 3).await.unwrap();
        assert_eq!(baseline.change_type, ChangeType::Update);
        assert_eq!(baseline.change_summary, "state before rollback");
        assert_eq!(baseline.snapshot, before.fields);

        let restored = versions.rollback_to_version(&tid("T1"), 3).await.unwrap();
        assert_eq!(restored.value.version, 5);
        assert_eq!(restored.value.fields, before.fields);

        let numbers: Vec<u64> = versions
            .list_versions(&tid("T1"), 10)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(numbers, vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn rollback_to_missing_version_is_not_found() {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();

        let err = versions.rollback_to_version(&tid("T1"), 9).await.unwrap_err();
        assert_eq!(err, ContextError::not_found(Entity::Version, "T1@9"));
        assert_eq!(versions.get(&tid("T1")).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn checked_update_rejects_stale_token() {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();
        versions
            .update_checked(
                &tid("T1"),
                TaskContextPatch::new().current_phase("a"),
                1,
                ChangeMeta::update(),
            )
            .await
            .unwrap();

        let err = versions
            .update_checked(
                &tid("T1"),
                TaskContextPatch::new().current_phase("b"),
                1,
                ChangeMeta::update(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ContextError::ConcurrentModification { expected: 1, actual: 2, .. }
        ));
    }

    #[tokio::test]
    async fn update_records_author_and_session() {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();
        let session = SessionId::new("s1").unwrap();
        versions
            .update_with(
                &tid("T1"),
                TaskContextPatch::new().status(TaskStatus::Blocked),
                ChangeMeta::update().by("reviewer").in_session(session.clone()),
            )
            .await
            .unwrap();

        let latest = versions.get_version(&tid("T1"), 2).await.unwrap();
        assert_eq!(latest.created_by, "reviewer");
        assert_eq!(latest.session_id, Some(session.clone()));

        let events = h.events.events().await;
        let last = events.last().unwrap();
        assert_eq!(last.event_type, "task_updated");
        assert_eq!(last.session_id, Some(session));
    }

    #[tokio::test]
    async fn store_outage_aborts_but_cache_outage_does_not() {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();

        h.cache.set_available(false);
        let updated = versions
            .update(&tid("T1"), TaskContextPatch::new().iteration(1))
            .await
            .unwrap();
        assert_eq!(updated.value.version, 2);
        assert!(updated.saved_to.cache.is_failed());
        assert!(updated.saved_to.is_degraded());

        h.cache.set_available(true);
        h.store.set_available(false);
        let err = versions
            .update(&tid("T1"), TaskContextPatch::new().iteration(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn delete_clears_mirrors_and_history() {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();
        h.engine.locks().acquire(&tid("T1"), "agent-a").await.unwrap();

        versions.delete(&tid("T1")).await.unwrap();
        assert!(h.cache.get(&CacheKey::Task(tid("T1"))).await.unwrap().is_none());
        assert!(h.cache.get(&CacheKey::Lock(tid("T1"))).await.unwrap().is_none());
        assert!(matches!(
            versions.list_versions(&tid("T1"), 5).await,
            Err(ContextError::NotFound { .. })
        ));
        assert!(matches!(
            versions.delete(&tid("T1")).await,
            Err(ContextError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn archive_and_prune() {
        let h = harness();
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();
        for i in 1..=3 {
            versions
                .update(&tid("T1"), TaskContextPatch::new().iteration(i))
                .await
                .unwrap();
        }
        let archived = versions.archive(&tid("T1")).await.unwrap();
        assert_eq!(archived.value.fields.status, TaskStatus::Archived);

        assert_eq!(versions.prune_versions(&tid("T1"), 2).await.unwrap(), 3);
        let left: Vec<u64> = versions
            .list_versions(&tid("T1"), 10)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(left, vec![5, 4]);
        assert!(versions.prune_versions(&tid("T1"), 0).await.is_err());
    }

    #[tokio::test]
    async fn significant_field_set_is_configurable() {
        let mut config = EngineConfig::default_v1();
        config.significant_fields = crate::domain::SignificantFields::new([ContextField::Score]);
        let h = harness_with(config);
        let versions = h.engine.versions();
        versions.create(tid("T1"), ContextSnapshot::named("t")).await.unwrap();

        versions
            .update(&tid("T1"), TaskContextPatch::new().current_phase("x"))
            .await
            .unwrap();
        versions
            .update(&tid("T1"), TaskContextPatch::new().score(Some(1.0)))
            .await
            .unwrap();
        let numbers: Vec<u64> = versions
            .list_versions(&tid("T1"), 10)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(numbers, vec![3, 1]);
    }

    #[tokio::test]
    async fn global_context_round_trip() {
        let h = harness();
        let versions = h.engine.versions();
        assert!(versions.get_global().await.unwrap().is_none());

        let patch = GlobalContextPatch {
            hard_rules: Some(vec!["never force-push".into()]),
            ..Default::default()
        };
        let saved = versions.update_global(patch).await.unwrap();
        assert_eq!(saved.value.hard_rules, vec!["never force-push".to_string()]);

        let missing_task = GlobalContextPatch {
            active_task_id: Some(Some(tid("ghost"))),
            ..Default::default()
        };
        assert!(matches!(
            versions.update_global(missing_task).await,
            Err(ContextError::NotFound { .. })
        ));
    }
}
