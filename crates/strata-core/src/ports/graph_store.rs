//! GraphStore port - タスク依存グラフ（オプショナル）
//!
//! # v1 最小実装
//! - NoopGraphStore: 何もしない（グラフバックエンドが無い場合）
//!
//! 呼び出し側はバックエンドの有無を意識しない。無い場合は
//! 復旧出力の依存関係部分が空になるだけ。

use async_trait::async_trait;

use super::mirror_cache::PortError;
use crate::domain::{SessionId, TaskId};

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Whether a real backend is attached. Only used for reporting (`savedTo.graph`).
    fn is_available(&self) -> bool {
        true
    }

    /// Tasks that must finish before `task_id` can proceed.
    async fn blocking_tasks(&self, task_id: &TaskId) -> Result<Vec<TaskId>, PortError>;

    async fn record_session(
        &self,
        session_id: &SessionId,
        task_id: Option<&TaskId>,
    ) -> Result<(), PortError>;
}
