//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryContextStore**: 正本（task / version / checkpoint / conflict / global）
//! - **InMemorySessionStore**: セッションの正本
//! - **InMemoryMirrorCache**: TTL 付きミラー
//! - **NoopGraphStore / InMemoryGraphStore**: 依存グラフ
//! - **NoopEventSink / MemoryEventSink / BroadcastEventSink**: 監査イベント
//!
//! # 本番用実装
//! 本番用の実装は別クレートに配置する想定です（リレーショナル DB, Redis, グラフ DB）。
//! どれも ports の trait を実装するだけでコアには手を入れません。

pub mod inmem_store;
pub mod inmem_sessions;
pub mod inmem_cache;
pub mod graph;
pub mod event_sinks;

// 主要な型を再エクスポート
pub use self::inmem_store::InMemoryContextStore;
pub use self::inmem_sessions::InMemorySessionStore;
pub use self::inmem_cache::InMemoryMirrorCache;
pub use self::graph::{InMemoryGraphStore, NoopGraphStore};
pub use self::event_sinks::{BroadcastEventSink, MemoryEventSink, NoopEventSink};
