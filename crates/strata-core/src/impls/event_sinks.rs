//! EventSink の実装
//!
//! - NoopEventSink: 監査ログを持たない構成
//! - MemoryEventSink: 記録したイベントを後から読める（テスト・デモ用）
//! - BroadcastEventSink: tokio broadcast で購読者に流す。受信者がいなくても成功扱い

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};

use crate::domain::ContextEvent;
use crate::ports::{EventSink, PortError};

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn create_context_event(&self, _event: ContextEvent) -> Result<(), PortError> {
        Ok(())
    }
}

pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<ContextEvent>>>,
    available: Arc<AtomicBool>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Recorded events in emission order.
    pub async fn events(&self) -> Vec<ContextEvent> {
        self.events.lock().await.clone()
    }

    pub async fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }
}

impl Default for MemoryEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn create_context_event(&self, event: ContextEvent) -> Result<(), PortError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(PortError::Unavailable("memory event sink marked unavailable".into()));
        }
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// At-most-once fan-out. Slow subscribers lose events (`RecvError::Lagged`).
pub struct BroadcastEventSink {
    sender: broadcast::Sender<ContextEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn create_context_event(&self, event: ContextEvent) -> Result<(), PortError> {
        // send は受信者ゼロのときだけ失敗する。誰も聞いていないのは正常
        let _ = self.sender.send(event);
        Ok(())
    }
}
