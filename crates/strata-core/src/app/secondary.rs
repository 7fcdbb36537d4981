//! Secondaries - best-effort な二次書き込み
//!
//! cache / graph / event sink への書き込みはすべてここを通す。
//! 失敗は `warn!` に「手で再実行できるだけの情報」（key, 操作, 理由）を残し、
//! `SecondaryWrite::Failed` として返すだけ。呼び出し元にエラーは伝播しない。

use std::sync::Arc;

use tracing::{debug, warn};

use super::status::SecondaryWrite;
use crate::config::EngineConfig;
use crate::domain::{Checkpoint, DomainEvent, SessionId, TaskContext, TaskId};
use crate::ports::{AdvisoryLock, CacheKey, Clock, EventSink, GraphStore, MirrorCache, PortError};

pub struct Secondaries {
    cache: Arc<dyn MirrorCache>,
    graph: Arc<dyn GraphStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl Secondaries {
    pub fn new(
        cache: Arc<dyn MirrorCache>,
        graph: Arc<dyn GraphStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            cache,
            graph,
            events,
            clock,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<dyn MirrorCache> {
        &self.cache
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    /// Mirror the current task row under `task:<id>`.
    pub async fn cache_task(&self, context: &TaskContext) -> SecondaryWrite {
        let key = CacheKey::Task(context.task_id.clone());
        let value = serde_json::to_value(context).map_err(PortError::from);
        self.cache_set(key, value, Some(self.config.cache_ttl())).await
    }

    pub async fn cache_checkpoint(&self, checkpoint: &Checkpoint) -> SecondaryWrite {
        let key = CacheKey::Checkpoint(checkpoint.checkpoint_id);
        let value = serde_json::to_value(checkpoint).map_err(PortError::from);
        self.cache_set(key, value, Some(self.config.cache_ttl())).await
    }

    pub async fn cache_lock(&self, lock: &AdvisoryLock) -> SecondaryWrite {
        let key = CacheKey::Lock(lock.task_id.clone());
        let value = serde_json::to_value(lock).map_err(PortError::from);
        self.cache_set(key, value, Some(self.config.lock_cache_ttl())).await
    }

    async fn cache_set(
        &self,
        key: CacheKey,
        value: Result<serde_json::Value, PortError>,
        ttl: Option<std::time::Duration>,
    ) -> SecondaryWrite {
        let result = match value {
            Ok(value) => self.cache.set(&key, value, ttl).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => SecondaryWrite::Written,
            Err(err) => {
                warn!(cache_key = %key, op = "set", error = %err, "mirror cache write failed");
                SecondaryWrite::Failed(err.to_string())
            }
        }
    }

    pub async fn evict(&self, key: CacheKey) -> SecondaryWrite {
        match self.cache.delete(&key).await {
            Ok(()) => SecondaryWrite::Written,
            Err(err) => {
                warn!(cache_key = %key, op = "delete", error = %err, "mirror cache eviction failed");
                SecondaryWrite::Failed(err.to_string())
            }
        }
    }

    /// Fire-and-forget audit event.
    pub async fn emit(&self, event: DomainEvent, session_id: Option<&SessionId>) -> SecondaryWrite {
        if !self.events.is_enabled() {
            return SecondaryWrite::Skipped;
        }
        let event = event.into_context_event(session_id.cloned(), self.clock.now());
        let (aggregate_id, event_type) = (event.aggregate_id.clone(), event.event_type.clone());
        match self.events.create_context_event(event).await {
            Ok(()) => {
                debug!(%aggregate_id, %event_type, "context event recorded");
                SecondaryWrite::Written
            }
            Err(err) => {
                warn!(%aggregate_id, %event_type, error = %err, "context event dropped");
                SecondaryWrite::Failed(err.to_string())
            }
        }
    }

    pub async fn record_session(
        &self,
        session_id: &SessionId,
        task_id: Option<&TaskId>,
    ) -> SecondaryWrite {
        if !self.graph.is_available() {
            return SecondaryWrite::Skipped;
        }
        match self.graph.record_session(session_id, task_id).await {
            Ok(()) => SecondaryWrite::Written,
            Err(err) => {
                warn!(session_id = %session_id, op = "record_session", error = %err, "graph write failed");
                SecondaryWrite::Failed(err.to_string())
            }
        }
    }

    /// Dependency lookup for recovery output; empty when the graph is absent or failing.
    pub async fn blocking_tasks(&self, task_id: &TaskId) -> Vec<TaskId> {
        if !self.graph.is_available() {
            return Vec::new();
        }
        match self.graph.blocking_tasks(task_id).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(task_id = %task_id, op = "blocking_tasks", error = %err, "graph read failed");
                Vec::new()
            }
        }
    }
}
