//! SessionStore port - セッションの正本
//!
//! heartbeat と状態遷移の記録先。RecoveryEngine はここだけを見て
//! クラッシュを判定する（イベントの受信には依存しない）。

use async_trait::async_trait;

use super::context_store::StoreError;
use crate::domain::{SessionId, SessionRecord, SessionStatus};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails with `Duplicate` if the session id is taken.
    async fn insert_session(&self, record: SessionRecord) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &SessionId)
        -> Result<Option<SessionRecord>, StoreError>;

    /// Replace an existing record; fails with `Missing` if absent.
    async fn put_session(&self, record: SessionRecord) -> Result<(), StoreError>;

    /// Ordered by `started_at`.
    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRecord>, StoreError>;
}
