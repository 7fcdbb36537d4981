//! Errors - エラー型と分類
//!
//! # 伝播ポリシー
//! - 正本ストア（authoritative store）の失敗は常に中断して呼び出し側へ返す
//! - セカンダリ（cache / graph / audit）の失敗はその場で捕捉してログに残し、
//!   主操作の結果は変えない（`SavedTo` に記録されるだけ）

use std::fmt;

use serde_json::json;
use thiserror::Error;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（再読込してリトライ可能）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（ストア / キャッシュの障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// NotFound / AlreadyExists の対象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Task,
    Version,
    Checkpoint,
    Conflict,
    Session,
    GlobalContext,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Task => "task",
            Entity::Version => "version",
            Entity::Checkpoint => "checkpoint",
            Entity::Conflict => "conflict",
            Entity::Session => "session",
            Entity::GlobalContext => "global context",
        };
        f.write_str(name)
    }
}

/// Best-effort collaborators whose failures never fail the primary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryTarget {
    Cache,
    Graph,
    Events,
}

impl fmt::Display for SecondaryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecondaryTarget::Cache => "mirror cache",
            SecondaryTarget::Graph => "graph store",
            SecondaryTarget::Events => "event sink",
        };
        f.write_str(name)
    }
}

/// ContextError はドメインエラー
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: Entity, key: String },

    #[error("task {task_id} is not included in checkpoint {checkpoint_id}")]
    ScopeMismatch {
        checkpoint_id: String,
        task_id: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: Entity, key: String },

    #[error("concurrent modification of task {task_id}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        task_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("authoritative store unavailable: {0}")]
    BackendUnavailable(String),

    #[error("secondary write to {target} failed: {reason}")]
    SecondaryWriteFailed {
        target: SecondaryTarget,
        reason: String,
    },
}

impl ContextError {
    pub fn not_found(entity: Entity, key: impl fmt::Display) -> Self {
        ContextError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ContextError::ConcurrentModification { .. } => ErrorKind::Transient,
            ContextError::BackendUnavailable(_) | ContextError::SecondaryWriteFailed { .. } => {
                ErrorKind::Infrastructure
            }
            ContextError::NotFound { .. }
            | ContextError::ScopeMismatch { .. }
            | ContextError::Validation(_)
            | ContextError::AlreadyExists { .. } => ErrorKind::Permanent,
        }
    }

    /// Stable machine-readable code for tool-level responses.
    pub fn code(&self) -> &'static str {
        match self {
            ContextError::NotFound { .. } => "not_found",
            ContextError::ScopeMismatch { .. } => "scope_mismatch",
            ContextError::Validation(_) => "validation_error",
            ContextError::AlreadyExists { .. } => "already_exists",
            ContextError::ConcurrentModification { .. } => "concurrent_modification",
            ContextError::BackendUnavailable(_) => "backend_unavailable",
            ContextError::SecondaryWriteFailed { .. } => "secondary_write_failed",
        }
    }

    /// Tool-level failure body: `{"success": false, "error": {...}}`.
    pub fn to_response(&self) -> serde_json::Value {
        json!({
            "success": false,
            "error": {
                "kind": self.code(),
                "message": self.to_string(),
            },
        })
    }
}
