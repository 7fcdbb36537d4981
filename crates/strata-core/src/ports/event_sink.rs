//! EventSink port - 監査イベントの記録
//!
//! fire-and-forget。失敗しても主操作はブロックされない。
//!
//! - NoopEventSink: 何もしない
//! - MemoryEventSink: 記録するだけ（テスト・デモ用）
//! - BroadcastEventSink: at-most-once の通知チャネル

use async_trait::async_trait;

use super::mirror_cache::PortError;
use crate::domain::ContextEvent;

#[async_trait]
pub trait EventSink: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    /// `createContextEvent(aggregateId, eventType, payload, sessionId?)`
    async fn create_context_event(&self, event: ContextEvent) -> Result<(), PortError>;
}
