//! HeartbeatPump - セッションの heartbeat を定期送信するバックグラウンドタスク
//!
//! `shutdown_tx` に true を送ると次の tick を待たずに止まる。
//! セッションが active でなくなった（ended / crashed）場合も自分で止まる。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::recovery_engine::RecoveryEngine;
use crate::domain::{ContextError, SessionId};

pub struct HeartbeatPump {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HeartbeatPump {
    pub fn spawn(recovery: Arc<RecoveryEngine>, session_id: SessionId, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            pump(recovery, session_id, interval, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await
            && err.is_panic()
        {
            std::panic::resume_unwind(err.into_panic());
        }
    }
}

async fn pump(
    recovery: Arc<RecoveryEngine>,
    session_id: SessionId,
    interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown_rx.changed() => continue,
            _ = ticker.tick() => {}
        }

        match recovery.heartbeat(&session_id, None).await {
            Ok(_) => {}
            Err(err @ (ContextError::Validation(_) | ContextError::NotFound { .. })) => {
                info!(session_id = %session_id, reason = %err, "heartbeat pump stopped");
                return;
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "heartbeat failed, will retry");
            }
        }
    }
    debug!(session_id = %session_id, "heartbeat pump shut down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{harness, sid};
    use crate::domain::SessionStatus;
    use crate::ports::Clock as _;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn pump_renews_heartbeat_until_shutdown() {
        let h = harness();
        let recovery = h.engine.recovery();
        recovery.start_session(sid("s1"), None).await.unwrap();
        h.clock.advance(ChronoDuration::seconds(120));

        let pump = HeartbeatPump::spawn(recovery.clone(), sid("s1"), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        pump.shutdown_and_join().await;

        let record = recovery.get_session(&sid("s1")).await.unwrap();
        assert_eq!(record.last_heartbeat, h.clock.now());
        assert!(!recovery.check_for_recovery(false).await.unwrap().needs_recovery);
    }

    #[tokio::test]
    async fn pump_stops_once_session_ends() {
        let h = harness();
        let recovery = h.engine.recovery();
        recovery.start_session(sid("s1"), None).await.unwrap();
        recovery.end_session(&sid("s1")).await.unwrap();

        let pump = HeartbeatPump::spawn(recovery.clone(), sid("s1"), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pump.is_finished());
        pump.shutdown_and_join().await;
        assert_eq!(
            recovery.get_session(&sid("s1")).await.unwrap().status,
            SessionStatus::Ended
        );
    }
}
