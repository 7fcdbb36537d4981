//! テスト用ハーネス
//!
//! すべての port をインメモリ実装で組み、FixedClock で時刻を固定する。
//! 各フィールドは Engine と同じインスタンスを共有するので、テストから
//! 障害注入（`set_available(false)`）や中身の確認ができる。

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use super::builder::{Engine, EngineBuilder};
use crate::config::EngineConfig;
use crate::domain::{SessionId, TaskId};
use crate::impls::{InMemoryContextStore, InMemoryGraphStore, InMemoryMirrorCache, InMemorySessionStore, MemoryEventSink};
use crate::ports::{Clock, FixedClock, UlidGenerator};

pub(crate) struct Harness {
    pub engine: Engine,
    pub store: Arc<InMemoryContextStore>,
    pub sessions: Arc<InMemorySessionStore>,
    pub cache: Arc<InMemoryMirrorCache>,
    pub graph: Arc<InMemoryGraphStore>,
    pub events: Arc<MemoryEventSink>,
    pub clock: FixedClock,
}

pub(crate) fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

pub(crate) fn harness_with(config: EngineConfig) -> Harness {
    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 9, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let clock = FixedClock::new(start);
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());

    let store = Arc::new(InMemoryContextStore::new());
    let sessions = Arc::new(InMemorySessionStore::new());
    let cache = Arc::new(InMemoryMirrorCache::new(Arc::clone(&shared_clock)));
    let graph = Arc::new(InMemoryGraphStore::new());
    let events = Arc::new(MemoryEventSink::new());

    let engine = EngineBuilder::new()
        .config(config)
        .store(store.clone())
        .sessions(sessions.clone())
        .cache(cache.clone())
        .graph(graph.clone())
        .events(events.clone())
        .ids(Arc::new(UlidGenerator::new(Arc::clone(&shared_clock))))
        .clock(shared_clock)
        .build()
        .expect("test config is valid");

    Harness {
        engine,
        store,
        sessions,
        cache,
        graph,
        events,
        clock,
    }
}

pub(crate) fn tid(raw: &str) -> TaskId {
    TaskId::new(raw).expect("valid task id")
}

pub(crate) fn sid(raw: &str) -> SessionId {
    SessionId::new(raw).expect("valid session id")
}
