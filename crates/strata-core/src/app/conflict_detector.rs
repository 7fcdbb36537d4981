//! ConflictDetector - 正本・ミラー・並行タスク間のずれを見つける
//!
//! # 検出ルール
//! - **file_conflict**: 2 タスクの key_files の共通部分（ペアごとに独立なので
//!   `scan_workers` 個のワーカーに分けて計算する）
//! - **lock_collision**: 期限切れのまま残っている advisory lock
//! - **state_mismatch**: status / iteration / current_phase が正本と cache で異なる
//! - **version_divergence**: 直近の version に recovery が繰り返し現れる
//!
//! 検出は読み取りのみ。最後に新規分だけをまとめて永続化する。
//! 同じ (taskA, taskB, type) の未解決 conflict は二重に作らない。

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::secondary::Secondaries;
use super::status::{Persisted, SavedTo, SecondaryWrite};
use crate::config::EngineConfig;
use crate::domain::{
    ChangeType, Conflict, ConflictDraft, ConflictFilter, ConflictId, ConflictKey, ConflictStatus,
    ConflictType, ContextError, DomainEvent, Entity, ScanReport, Severity, TaskContext, TaskId,
    TaskStatus,
};
use crate::ports::{AdvisoryLock, CacheKey, Clock, ContextStore, IdGenerator, WriteBatch, WriteOp};

const DETECTED_BY: &str = "conflict_detector";

/// Shared files at which `strength` saturates at 1.0.
const FILE_STRENGTH_SATURATION: f64 = 5.0;
const STATE_MISMATCH_STRENGTH: f64 = 0.9;
const LOCK_COLLISION_STRENGTH: f64 = 0.7;

/// Types the scan can find on its own. The others are caller-reported.
pub const SCANNED_TYPES: [ConflictType; 4] = [
    ConflictType::FileConflict,
    ConflictType::LockCollision,
    ConflictType::StateMismatch,
    ConflictType::VersionDivergence,
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanRequest {
    /// `None` scans every `in_progress` task.
    pub task_ids: Option<Vec<TaskId>>,
    /// `None` runs every scanned type.
    pub conflict_types: Option<BTreeSet<ConflictType>>,
}

impl ScanRequest {
    pub fn in_progress() -> Self {
        Self::default()
    }

    pub fn tasks<I: IntoIterator<Item = TaskId>>(task_ids: I) -> Self {
        Self {
            task_ids: Some(task_ids.into_iter().collect()),
            conflict_types: None,
        }
    }

    pub fn only<I: IntoIterator<Item = ConflictType>>(mut self, types: I) -> Self {
        self.conflict_types = Some(types.into_iter().collect());
        self
    }

    fn runs(&self, conflict_type: ConflictType) -> bool {
        self.conflict_types
            .as_ref()
            .is_none_or(|types| types.contains(&conflict_type))
    }
}

/// Fields compared between the authoritative row and its `task:` mirror.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MirroredState {
    status: Option<TaskStatus>,
    iteration: Option<u64>,
    current_phase: Option<String>,
}

struct FileSet {
    task_id: TaskId,
    files: BTreeSet<String>,
}

pub struct ConflictDetector {
    store: Arc<dyn ContextStore>,
    secondaries: Arc<Secondaries>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    /// Serializes the dedup check with the insert.
    persist: Mutex<()>,
}

impl ConflictDetector {
    pub fn new(
        store: Arc<dyn ContextStore>,
        secondaries: Arc<Secondaries>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            secondaries,
            ids,
            clock,
            config,
            persist: Mutex::new(()),
        }
    }

    pub async fn scan(&self, request: ScanRequest) -> Result<Persisted<ScanReport>, ContextError> {
        let mut candidates = self.candidates(&request).await?;
        candidates.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let mut drafts = Vec::new();
        if request.runs(ConflictType::FileConflict) {
            drafts.extend(self.file_conflicts(&candidates).await);
        }
        for task in &candidates {
            if request.runs(ConflictType::LockCollision)
                && let Some(draft) = self.stale_lock(task).await
            {
                drafts.push(draft);
            }
            if request.runs(ConflictType::StateMismatch)
                && let Some(draft) = self.state_mismatch(task).await
            {
                drafts.push(draft);
            }
            if request.runs(ConflictType::VersionDivergence)
                && let Some(draft) = self.version_divergence(task).await?
            {
                drafts.push(draft);
            }
        }

        let _guard = self.persist.lock().await;
        let open = self.store.list_conflicts(&ConflictFilter::unresolved()).await?;
        let mut seen: HashSet<ConflictKey> = open.iter().map(Conflict::key).collect();
        let now = self.clock.now();
        let detected: Vec<Conflict> = drafts
            .into_iter()
            .filter(|draft| seen.insert(draft.key()))
            .map(|draft| self.materialize(draft, DETECTED_BY, now))
            .collect();

        if !detected.is_empty() {
            let mut batch = WriteBatch::new();
            batch.extend(detected.iter().cloned().map(WriteOp::PutConflict));
            self.store.commit(batch).await?;
        }

        let scanned: HashSet<&TaskId> = candidates.iter().map(|t| &t.task_id).collect();
        let existing: Vec<Conflict> = open
            .into_iter()
            .filter(|c| {
                scanned.contains(&c.task_a_id)
                    || c.task_b_id.as_ref().is_some_and(|b| scanned.contains(b))
            })
            .filter(|c| {
                request
                    .conflict_types
                    .as_ref()
                    .is_none_or(|types| types.contains(&c.conflict_type))
            })
            .collect();

        info!(
            tasks = candidates.len(),
            detected = detected.len(),
            existing = existing.len(),
            "conflict scan finished"
        );

        let mut saved_to = if detected.is_empty() {
            SavedTo::untouched()
        } else {
            SavedTo::store_only()
        };
        for conflict in &detected {
            saved_to.events = saved_to.events.and(self.emit_detected(conflict).await);
        }
        Ok(Persisted::new(ScanReport { detected, existing }, saved_to))
    }

    /// Record a conflict found outside the scan (e.g. `spec_contradiction`).
    pub async fn report(
        &self,
        draft: ConflictDraft,
        reported_by: &str,
    ) -> Result<Persisted<Conflict>, ContextError> {
        if !(0.0..=1.0).contains(&draft.strength) {
            return Err(ContextError::Validation(format!(
                "conflict strength must be within [0, 1], got {}",
                draft.strength
            )));
        }
        if draft.task_b_id.as_ref() == Some(&draft.task_a_id) {
            return Err(ContextError::Validation(
                "a conflict needs two distinct tasks".into(),
            ));
        }
        for task_id in std::iter::once(&draft.task_a_id).chain(draft.task_b_id.as_ref()) {
            if self.store.get_task(task_id).await?.is_none() {
                return Err(ContextError::not_found(Entity::Task, task_id));
            }
        }

        let _guard = self.persist.lock().await;
        let key = draft.key();
        let open = self.store.list_conflicts(&ConflictFilter::unresolved()).await?;
        if let Some(duplicate) = open.iter().find(|c| c.key() == key) {
            return Err(ContextError::AlreadyExists {
                entity: Entity::Conflict,
                key: duplicate.id.to_string(),
            });
        }
        let conflict = self.materialize(draft, reported_by, self.clock.now());
        self.store
            .commit(WriteBatch::new().with(WriteOp::PutConflict(conflict.clone())))
            .await?;
        info!(
            conflict_id = %conflict.id,
            conflict_type = %conflict.conflict_type,
            task_id = %conflict.task_a_id,
            "conflict reported"
        );

        let mut saved_to = SavedTo::store_only();
        saved_to.events = self.emit_detected(&conflict).await;
        Ok(Persisted::new(conflict, saved_to))
    }

    /// Mark resolved. Resolving twice is a no-op that returns the stored record.
    pub async fn resolve(
        &self,
        conflict_id: &ConflictId,
        resolution: Option<String>,
    ) -> Result<Persisted<Conflict>, ContextError> {
        let _guard = self.persist.lock().await;
        let mut conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| ContextError::not_found(Entity::Conflict, conflict_id))?;
        if !conflict.resolve(self.clock.now(), resolution) {
            return Ok(Persisted::new(conflict, SavedTo::untouched()));
        }
        self.store
            .commit(WriteBatch::new().with(WriteOp::PutConflict(conflict.clone())))
            .await?;
        info!(conflict_id = %conflict_id, "conflict resolved");

        let mut saved_to = SavedTo::store_only();
        saved_to.events = self
            .secondaries
            .emit(
                DomainEvent::ConflictResolved {
                    conflict_id: *conflict_id,
                    task_id: conflict.task_a_id.clone(),
                },
                None,
            )
            .await;
        Ok(Persisted::new(conflict, saved_to))
    }

    /// Oldest first.
    pub async fn list(&self, filter: &ConflictFilter) -> Result<Vec<Conflict>, ContextError> {
        Ok(self.store.list_conflicts(filter).await?)
    }

    async fn candidates(&self, request: &ScanRequest) -> Result<Vec<TaskContext>, ContextError> {
        match &request.task_ids {
            None => Ok(self.store.list_tasks(Some(TaskStatus::InProgress)).await?),
            Some(ids) => {
                let mut tasks = Vec::with_capacity(ids.len());
                let mut seen = HashSet::new();
                for task_id in ids {
                    if !seen.insert(task_id) {
                        continue;
                    }
                    let task = self
                        .store
                        .get_task(task_id)
                        .await?
                        .ok_or_else(|| ContextError::not_found(Entity::Task, task_id))?;
                    tasks.push(task);
                }
                Ok(tasks)
            }
        }
    }

    /// Pairwise key-file intersection on a bounded pool of `scan_workers` tasks.
    async fn file_conflicts(&self, candidates: &[TaskContext]) -> Vec<ConflictDraft> {
        let sets: Arc<Vec<FileSet>> = Arc::new(
            candidates
                .iter()
                .map(|t| FileSet {
                    task_id: t.task_id.clone(),
                    files: t.fields.key_files.iter().cloned().collect(),
                })
                .collect(),
        );
        let n = sets.len();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect();
        if pairs.is_empty() {
            return Vec::new();
        }

        let chunk_size = pairs.len().div_ceil(self.config.scan_workers);
        let threshold = self.config.file_conflict_high_threshold;
        let mut workers = JoinSet::new();
        for chunk in pairs.chunks(chunk_size) {
            let chunk = chunk.to_vec();
            let sets = Arc::clone(&sets);
            workers.spawn(async move {
                chunk
                    .into_iter()
                    .filter_map(|(i, j)| file_conflict(&sets[i], &sets[j], threshold))
                    .collect::<Vec<_>>()
            });
        }

        let mut drafts = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(found) => drafts.extend(found),
                Err(err) => match err.try_into_panic() {
                    Ok(panic) => std::panic::resume_unwind(panic),
                    Err(err) => warn!(error = %err, "file-conflict worker cancelled"),
                },
            }
        }
        drafts.sort_by(|a, b| a.key().cmp(&b.key()));
        debug!(pairs = pairs.len(), found = drafts.len(), "file-conflict pass finished");
        drafts
    }

    /// A lock whose lease ran out but is still sitting in the cache.
    async fn stale_lock(&self, task: &TaskContext) -> Option<ConflictDraft> {
        let key = CacheKey::Lock(task.task_id.clone());
        let raw = match self.secondaries.cache().get(&key).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(cache_key = %key, op = "get", error = %err, "lock lookup failed, skipping");
                return None;
            }
        };
        let lock: AdvisoryLock = match serde_json::from_value(raw) {
            Ok(lock) => lock,
            Err(err) => {
                warn!(cache_key = %key, error = %err, "unreadable lock entry, skipping");
                return None;
            }
        };
        let now = self.clock.now();
        if !lock.is_expired(now) {
            return None;
        }
        Some(ConflictDraft {
            task_a_id: task.task_id.clone(),
            task_b_id: None,
            conflict_type: ConflictType::LockCollision,
            severity: Severity::Medium,
            strength: LOCK_COLLISION_STRENGTH,
            description: format!(
                "lock on task {} held by {} expired at {} and was never renewed",
                task.task_id, lock.holder, lock.expires_at
            ),
            evidence: json!({
                "holder": lock.holder,
                "acquiredAt": lock.acquired_at,
                "expiresAt": lock.expires_at,
                "staleForSecs": (now - lock.expires_at).num_seconds(),
            }),
            detection_method: "stale_lock_ttl".into(),
        })
    }

    /// Drift between the store and the `task:` mirror. A missing mirror is not drift.
    async fn state_mismatch(&self, task: &TaskContext) -> Option<ConflictDraft> {
        let key = CacheKey::Task(task.task_id.clone());
        let raw = match self.secondaries.cache().get(&key).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(cache_key = %key, op = "get", error = %err, "mirror lookup failed, skipping");
                return None;
            }
        };
        let mirrored: MirroredState = match serde_json::from_value(raw) {
            Ok(state) => state,
            Err(err) => {
                warn!(cache_key = %key, error = %err, "unreadable mirror entry, skipping");
                return None;
            }
        };

        let mut diverged = Vec::new();
        if mirrored.status != Some(task.fields.status) {
            diverged.push(json!({
                "field": "status",
                "store": task.fields.status,
                "cache": mirrored.status,
            }));
        }
        if mirrored.iteration != Some(task.fields.iteration) {
            diverged.push(json!({
                "field": "iteration",
                "store": task.fields.iteration,
                "cache": mirrored.iteration,
            }));
        }
        if mirrored.current_phase.as_deref() != Some(task.fields.current_phase.as_str()) {
            diverged.push(json!({
                "field": "current_phase",
                "store": task.fields.current_phase,
                "cache": mirrored.current_phase,
            }));
        }
        if diverged.is_empty() {
            return None;
        }

        let names: Vec<&str> = diverged
            .iter()
            .filter_map(|d| d["field"].as_str())
            .collect();
        Some(ConflictDraft {
            task_a_id: task.task_id.clone(),
            task_b_id: None,
            conflict_type: ConflictType::StateMismatch,
            severity: Severity::High,
            strength: STATE_MISMATCH_STRENGTH,
            description: format!(
                "mirror cache for task {} diverges from the store on {}",
                task.task_id,
                names.join(", ")
            ),
            evidence: json!({ "diverged": diverged }),
            detection_method: "store_cache_compare".into(),
        })
    }

    /// Repeated `recovery` writes among the most recent versions.
    async fn version_divergence(
        &self,
        task: &TaskContext,
    ) -> Result<Option<ConflictDraft>, ContextError> {
        let window = self.config.version_divergence_window;
        let recent = self.store.list_versions(&task.task_id, window).await?;
        let recoveries: Vec<u64> = recent
            .iter()
            .filter(|v| v.change_type == ChangeType::Recovery)
            .map(|v| v.version)
            .collect();
        if recoveries.len() < self.config.version_divergence_min_recoveries {
            return Ok(None);
        }
        Ok(Some(ConflictDraft {
            task_a_id: task.task_id.clone(),
            task_b_id: None,
            conflict_type: ConflictType::VersionDivergence,
            severity: Severity::Medium,
            strength: (recoveries.len() as f64 / window as f64).min(1.0),
            description: format!(
                "task {} went through {} recoveries in its last {} versions",
                task.task_id,
                recoveries.len(),
                recent.len()
            ),
            evidence: json!({
                "recoveryVersions": recoveries,
                "window": window,
            }),
            detection_method: "recent_version_history".into(),
        }))
    }

    fn materialize(
        &self,
        draft: ConflictDraft,
        detected_by: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Conflict {
        Conflict {
            id: self.ids.generate_conflict_id(),
            task_a_id: draft.task_a_id,
            task_b_id: draft.task_b_id,
            conflict_type: draft.conflict_type,
            severity: draft.severity,
            strength: draft.strength,
            description: draft.description,
            evidence: draft.evidence,
            detected_by: detected_by.to_string(),
            detection_method: draft.detection_method,
            status: ConflictStatus::Unresolved,
            detected_at: now,
            resolved_at: None,
            resolution: None,
        }
    }

    async fn emit_detected(&self, conflict: &Conflict) -> SecondaryWrite {
        self.secondaries
            .emit(
                DomainEvent::ConflictDetected {
                    conflict_id: conflict.id,
                    task_id: conflict.task_a_id.clone(),
                    conflict_type: conflict.conflict_type,
                    severity: conflict.severity,
                },
                None,
            )
            .await
    }
}

fn file_conflict(a: &FileSet, b: &FileSet, high_threshold: usize) -> Option<ConflictDraft> {
    let shared: Vec<String> = a.files.intersection(&b.files).cloned().collect();
    if shared.is_empty() {
        return None;
    }
    let severity = if shared.len() > high_threshold {
        Severity::High
    } else {
        Severity::Medium
    };
    Some(ConflictDraft {
        task_a_id: a.task_id.clone(),
        task_b_id: Some(b.task_id.clone()),
        conflict_type: ConflictType::FileConflict,
        severity,
        strength: (shared.len() as f64 / FILE_STRENGTH_SATURATION).min(1.0),
        description: format!(
            "tasks {} and {} both touch {} file(s): {}",
            a.task_id,
            b.task_id,
            shared.len(),
            shared.join(", ")
        ),
        evidence: json!({ "sharedFiles": shared }),
        detection_method: "key_file_intersection".into(),
    })
}
