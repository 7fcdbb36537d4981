//! Checkpoints: named, immutable, full-state snapshots.
//!
//! # 設計原則
//! - scope は呼び出し側が宣言しない。含まれる task 数から導出する
//!   （0 → global, 1 → task, 2+ → multi_task）
//! - snapshot は version 番号ではなく完全なコピー
//!   （version 履歴の保持期間に依存せず復元できる）

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::{ContextSnapshot, GlobalContext};
use super::ids::{CheckpointId, SessionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Manual,
    Milestone,
    PreMigration,
    RecoveryPoint,
    Auto,
}

impl CheckpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointType::Manual => "manual",
            CheckpointType::Milestone => "milestone",
            CheckpointType::PreMigration => "pre_migration",
            CheckpointType::RecoveryPoint => "recovery_point",
            CheckpointType::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointScope {
    Task,
    Global,
    MultiTask,
}

impl CheckpointScope {
    pub fn for_task_count(count: usize) -> Self {
        match count {
            0 => CheckpointScope::Global,
            1 => CheckpointScope::Task,
            _ => CheckpointScope::MultiTask,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointScope::Task => "task",
            CheckpointScope::Global => "global",
            CheckpointScope::MultiTask => "multi_task",
        }
    }
}

impl fmt::Display for CheckpointScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task's state as captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    /// Version the task was at when captured (informational).
    pub version: u64,
    pub fields: ContextSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSnapshot {
    pub global: Option<GlobalContext>,
    pub tasks: Vec<TaskSnapshot>,
}

impl CheckpointSnapshot {
    pub fn task(&self, task_id: &TaskId) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| &t.task_id == task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub label: String,
    pub description: Option<String>,
    pub checkpoint_type: CheckpointType,
    pub scope: CheckpointScope,
    pub included_tasks: Vec<TaskId>,
    pub snapshot: CheckpointSnapshot,
    pub created_by: String,
    pub session_id: Option<SessionId>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// `included_tasks` が scope と整合しているか
    pub fn scope_is_consistent(&self) -> bool {
        CheckpointScope::for_task_count(self.included_tasks.len()) == self.scope
            && self.snapshot.tasks.len() == self.included_tasks.len()
    }

    pub fn includes(&self, task_id: &TaskId) -> bool {
        self.included_tasks.contains(task_id)
    }
}

/// Input of `CheckpointManager::create`.
///
/// `task_id` と `additional_task_ids` を連結し、重複を除いた順序が
/// `included_tasks` になる。
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRequest {
    pub label: String,
    pub description: Option<String>,
    pub checkpoint_type: CheckpointType,
    pub task_id: Option<TaskId>,
    pub additional_task_ids: Vec<TaskId>,
    pub created_by: String,
    pub session_id: Option<SessionId>,
}

impl CheckpointRequest {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description: None,
            checkpoint_type: CheckpointType::Manual,
            task_id: None,
            additional_task_ids: Vec::new(),
            created_by: "agent".to_string(),
            session_id: None,
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_tasks<I: IntoIterator<Item = TaskId>>(mut self, task_ids: I) -> Self {
        self.additional_task_ids.extend(task_ids);
        self
    }

    pub fn kind(mut self, checkpoint_type: CheckpointType) -> Self {
        self.checkpoint_type = checkpoint_type;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn by(mut self, author: impl Into<String>) -> Self {
        self.created_by = author.into();
        self
    }

    pub fn in_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Ordered, de-duplicated task list.
    pub fn included_tasks(&self) -> Vec<TaskId> {
        let mut tasks: Vec<TaskId> = Vec::new();
        for id in self.task_id.iter().chain(self.additional_task_ids.iter()) {
            if !tasks.contains(id) {
                tasks.push(id.clone());
            }
        }
        tasks
    }

    pub fn scope(&self) -> CheckpointScope {
        CheckpointScope::for_task_count(self.included_tasks().len())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointFilter {
    pub scope: Option<CheckpointScope>,
    pub task_id: Option<TaskId>,
    pub limit: Option<usize>,
}
