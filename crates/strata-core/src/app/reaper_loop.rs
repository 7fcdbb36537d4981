//! ReaperLoop - heartbeat が途絶えたセッションの定期回収
//!
//! # フロー
//! 1. `reaper_interval` ごとに RecoveryEngine::detect_crashes() を呼ぶ
//! 2. stale な active セッションを crashed へ遷移（SessionCrashed を発行）
//! 3. 失敗はログに残して次の tick で再試行

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::recovery_engine::RecoveryEngine;

pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    pub fn spawn(recovery: Arc<RecoveryEngine>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            reap(recovery, interval, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
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

async fn reap(
    recovery: Arc<RecoveryEngine>,
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

        match recovery.detect_crashes().await {
            Ok(swept) if !swept.value.is_empty() => {
                debug!(crashed = swept.value.len(), "reaper moved sessions to crashed");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "crash sweep failed"),
        }
    }
    debug!("reaper loop shut down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{harness, sid};
    use crate::domain::SessionStatus;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn reaper_marks_stale_sessions_crashed() {
        let h = harness();
        let recovery = h.engine.recovery();
        recovery.start_session(sid("stale"), None).await.unwrap();
        h.clock.advance(ChronoDuration::seconds(91));
        recovery.start_session(sid("fresh"), None).await.unwrap();

        let reaper = ReaperLoop::spawn(recovery.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        reaper.shutdown_and_join().await;

        let stale = recovery.get_session(&sid("stale")).await.unwrap();
        let fresh = recovery.get_session(&sid("fresh")).await.unwrap();
        assert_eq!(stale.status, SessionStatus::Crashed);
        assert_eq!(fresh.status, SessionStatus::Active);
        assert_eq!(
            h.events
                .event_types()
                .await
                .iter()
                .filter(|t| *t == "session_crashed")
                .count(),
            1
        );
    }
}
