//! LockService - task ごとの協調的 advisory lock
//!
//! lock は cache の `lock:<taskId>` に置くだけで、正本は一切強制しない。
//! lock を無視した書き込みも通る。目的は「誰も更新しなくなった lock」を
//! ConflictDetector が見つけられるようにすること。
//!
//! cache の TTL は lease + `stale_lock_retention_secs`。lease が切れた後も
//! しばらく残るので、detector が stale lock として報告できる。

use std::sync::Arc;

use tracing::{debug, info};

use super::secondary::Secondaries;
use super::status::{Persisted, SavedTo, SecondaryWrite};
use crate::config::EngineConfig;
use crate::domain::{ContextError, Entity, SecondaryTarget, TaskId};
use crate::ports::{AdvisoryLock, CacheKey, Clock, ContextStore};

pub struct LockService {
    store: Arc<dyn ContextStore>,
    secondaries: Arc<Secondaries>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl LockService {
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

    /// Take the lock. Fails while another holder's lease is live; re-acquiring
    /// your own lock extends it.
    pub async fn acquire(
        &self,
        task_id: &TaskId,
        holder: &str,
    ) -> Result<Persisted<AdvisoryLock>, ContextError> {
        validate_holder(holder)?;
        if self.store.get_task(task_id).await?.is_none() {
            return Err(ContextError::not_found(Entity::Task, task_id));
        }
        let now = self.clock.now();
        if let Some(current) = self.inspect(task_id).await?
            && current.holder != holder
            && !current.is_expired(now)
        {
            return Err(ContextError::Validation(format!(
                "task {task_id} is locked by {} until {}",
                current.holder, current.expires_at
            )));
        }

        let lock = AdvisoryLock {
            task_id: task_id.clone(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + self.config.lock_ttl(),
        };
        let saved_to = self.write(&lock).await?;
        info!(task_id = %task_id, holder, expires_at = %lock.expires_at, "advisory lock acquired");
        Ok(Persisted::new(lock, saved_to))
    }

    /// Extend the lease. Only the holder may renew, even after expiry.
    pub async fn renew(
        &self,
        task_id: &TaskId,
        holder: &str,
    ) -> Result<Persisted<AdvisoryLock>, ContextError> {
        let mut lock = self
            .inspect(task_id)
            .await?
            .ok_or_else(|| ContextError::Validation(format!("task {task_id} is not locked")))?;
        if lock.holder != holder {
            return Err(ContextError::Validation(format!(
                "task {task_id} is locked by {}, not {holder}",
                lock.holder
            )));
        }
        lock.expires_at = self.clock.now() + self.config.lock_ttl();
        let saved_to = self.write(&lock).await?;
        debug!(task_id = %task_id, holder, expires_at = %lock.expires_at, "advisory lock renewed");
        Ok(Persisted::new(lock, saved_to))
    }

    /// Drop the lock. Releasing an absent lock is a no-op; releasing someone
    /// else's live lock is rejected.
    pub async fn release(
        &self,
        task_id: &TaskId,
        holder: &str,
    ) -> Result<Persisted<Option<AdvisoryLock>>, ContextError> {
        let Some(current) = self.inspect(task_id).await? else {
            return Ok(Persisted::new(None, SavedTo::untouched()));
        };
        if current.holder != holder && !current.is_expired(self.clock.now()) {
            return Err(ContextError::Validation(format!(
                "task {task_id} is locked by {}, not {holder}",
                current.holder
            )));
        }
        match self.secondaries.evict(CacheKey::Lock(task_id.clone())).await {
            SecondaryWrite::Failed(reason) => Err(ContextError::SecondaryWriteFailed {
                target: SecondaryTarget::Cache,
                reason,
            }),
            written => {
                info!(task_id = %task_id, holder, "advisory lock released");
                Ok(Persisted::new(
                    Some(current),
                    SavedTo {
                        cache: written,
                        ..SavedTo::untouched()
                    },
                ))
            }
        }
    }

    /// Current lock entry, expired or not.
    pub async fn inspect(&self, task_id: &TaskId) -> Result<Option<AdvisoryLock>, ContextError> {
        let key = CacheKey::Lock(task_id.clone());
        let raw = self
            .secondaries
            .cache()
            .get(&key)
            .await
            .map_err(|e| ContextError::SecondaryWriteFailed {
                target: SecondaryTarget::Cache,
                reason: e.to_string(),
            })?;
        raw.map(serde_json::from_value)
            .transpose()
            .map_err(|e| ContextError::Validation(format!("unreadable lock entry {key}: {e}")))
    }

    /// The cache is the only home of a lock, so a failed write is an error here.
    async fn write(&self, lock: &AdvisoryLock) -> Result<SavedTo, ContextError> {
        match self.secondaries.cache_lock(lock).await {
            SecondaryWrite::Failed(reason) => Err(ContextError::SecondaryWriteFailed {
                target: SecondaryTarget::Cache,
                reason,
            }),
            written => Ok(SavedTo {
                cache: written,
                ..SavedTo::untouched()
            }),
        }
    }
}

fn validate_holder(holder: &str) -> Result<(), ContextError> {
    if holder.trim().is_empty() {
        return Err(ContextError::Validation("lock holder must not be empty".into()));
    }
    Ok(())
}
