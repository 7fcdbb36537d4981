//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - build() 時に EngineConfig を検証し、不正な値なら BuildError を返す
//! - 指定されなかった port はインメモリ実装（graph / events は Noop）で埋める
//!
//! # 使用例
//! ```ignore
//! let engine = EngineBuilder::new()
//!     .config(EngineConfig::from_toml_str(&text)?)
//!     .events(Arc::new(BroadcastEventSink::new(256)))
//!     .build()?;
//! engine.versions().create(task_id, ContextSnapshot::named("auth rewrite")).await?;
//! ```

use std::sync::Arc;

use super::checkpoint_manager::CheckpointManager;
use super::conflict_detector::ConflictDetector;
use super::heartbeat::HeartbeatPump;
use super::locks::LockService;
use super::reaper_loop::ReaperLoop;
use super::recovery_engine::RecoveryEngine;
use super::secondary::Secondaries;
use super::versioned_store::VersionedStore;
use crate::config::{ConfigError, EngineConfig};
use crate::domain::SessionId;
use crate::impls::{InMemoryContextStore, InMemoryMirrorCache, InMemorySessionStore, NoopEventSink, NoopGraphStore};
use crate::ports::{
    Clock, ContextStore, EventSink, GraphStore, IdGenerator, MirrorCache, SessionStore,
    SystemClock, UlidGenerator,
};

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    store: Option<Arc<dyn ContextStore>>,
    sessions: Option<Arc<dyn SessionStore>>,
    cache: Option<Arc<dyn MirrorCache>>,
    graph: Option<Arc<dyn GraphStore>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn MirrorCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn graph(mut self, graph: Arc<dyn GraphStore>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let config = Arc::new(config);

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let store: Arc<dyn ContextStore> = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryContextStore::new()));
        let sessions: Arc<dyn SessionStore> = self
            .sessions
            .unwrap_or_else(|| Arc::new(InMemorySessionStore::new()));
        let cache: Arc<dyn MirrorCache> = self
            .cache
            .unwrap_or_else(|| Arc::new(InMemoryMirrorCache::new(Arc::clone(&clock))));
        let graph: Arc<dyn GraphStore> = self.graph.unwrap_or_else(|| Arc::new(NoopGraphStore));
        let events: Arc<dyn EventSink> = self.events.unwrap_or_else(|| Arc::new(NoopEventSink));

        let secondaries = Arc::new(Secondaries::new(
            cache,
            graph,
            events,
            Arc::clone(&clock),
            Arc::clone(&config),
        ));
        let versions = Arc::new(VersionedStore::new(
            Arc::clone(&store),
            Arc::clone(&secondaries),
            Arc::clone(&clock),
            Arc::clone(&config),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&store),
            Arc::clone(&versions),
            Arc::clone(&secondaries),
            Arc::clone(&ids),
            Arc::clone(&clock),
            Arc::clone(&config),
        ));
        let conflicts = Arc::new(ConflictDetector::new(
            Arc::clone(&store),
            Arc::clone(&secondaries),
            ids,
            Arc::clone(&clock),
            Arc::clone(&config),
        ));
        let locks = Arc::new(LockService::new(
            store,
            Arc::clone(&secondaries),
            Arc::clone(&clock),
            Arc::clone(&config),
        ));
        let recovery = Arc::new(RecoveryEngine::new(
            sessions,
            Arc::clone(&versions),
            secondaries,
            clock,
            Arc::clone(&config),
        ));

        Ok(Engine {
            config,
            versions,
            checkpoints,
            conflicts,
            locks,
            recovery,
        })
    }
}

/// Engine は組み上がった各サービスの束
pub struct Engine {
    config: Arc<EngineConfig>,
    versions: Arc<VersionedStore>,
    checkpoints: Arc<CheckpointManager>,
    conflicts: Arc<ConflictDetector>,
    locks: Arc<LockService>,
    recovery: Arc<RecoveryEngine>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn versions(&self) -> &Arc<VersionedStore> {
        &self.versions
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn conflicts(&self) -> &Arc<ConflictDetector> {
        &self.conflicts
    }

    pub fn locks(&self) -> &Arc<LockService> {
        &self.locks
    }

    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.recovery
    }

    /// Crash sweep every `reaper_interval_secs`.
    pub fn spawn_reaper(&self) -> ReaperLoop {
        ReaperLoop::spawn(Arc::clone(&self.recovery), self.config.reaper_interval())
    }

    /// Heartbeat for one session every `heartbeat_interval_secs`.
    pub fn spawn_heartbeat(&self, session_id: SessionId) -> HeartbeatPump {
        HeartbeatPump::spawn(
            Arc::clone(&self.recovery),
            session_id,
            self.config.heartbeat_interval(),
        )
    }
}
