//! MirrorCache port - 高速な読み取り用のミラー（Redis または InMemory）
//!
//! # 設計原則
//! - キーは名前空間付き: `task:<id>`, `checkpoint:<id>`, `lock:<id>`
//! - TTL をサポート
//! - コアから見ると常に best-effort。失敗は呼び出し箇所で捕捉してログに残す

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{CheckpointId, TaskId};

/// Failure of a best-effort collaborator (cache, graph, event sink).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PortError {
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PortError {
    fn from(err: serde_json::Error) -> Self {
        PortError::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Task(TaskId),
    Checkpoint(CheckpointId),
    Lock(TaskId),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Task(id) => write!(f, "task:{id}"),
            CacheKey::Checkpoint(id) => write!(f, "checkpoint:{id}"),
            CacheKey::Lock(id) => write!(f, "lock:{id}"),
        }
    }
}

/// Cooperative per-task lock stored under `lock:<taskId>`.
///
/// The store never enforces it; the detector flags it once `expires_at` passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryLock {
    pub task_id: TaskId,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AdvisoryLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait MirrorCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<serde_json::Value>, PortError>;

    /// `ttl = None` keeps the entry until it is overwritten or deleted.
    async fn set(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), PortError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), PortError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_are_namespaced() {
        let task = TaskId::new("T1").unwrap();
        assert_eq!(CacheKey::Task(task.clone()).to_string(), "task:T1");
        assert_eq!(CacheKey::Lock(task).to_string(), "lock:T1");

        let ckpt = CheckpointId::from_ulid(ulid::Ulid::nil());
        assert!(CacheKey::Checkpoint(ckpt).to_string().starts_with("checkpoint:ckpt-"));
    }

    #[test]
    fn lock_expiry_is_inclusive() {
        let now = Utc::now();
        let lock = AdvisoryLock {
            task_id: TaskId::new("T1").unwrap(),
            holder: "agent-a".into(),
            acquired_at: now,
            expires_at: now,
        };
        assert!(lock.is_expired(now));
        assert!(!lock.is_expired(now - chrono::Duration::seconds(1)));
    }
}
