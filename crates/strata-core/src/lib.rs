//! strata-core
//!
//! Core building blocks for versioned task contexts: version history,
//! checkpoints and rollback, conflict detection, and crash recovery.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, context, version, checkpoint, conflict, session, events, errors）
//! - **ports**: 抽象化レイヤー（ContextStore, SessionStore, MirrorCache, GraphStore, EventSink, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（builder, versioned_store, checkpoint_manager, conflict_detector, locks, recovery_engine）
//! - **impls**: 実装（インメモリ / Noop の開発・テスト用アダプタ）
//! - **config**: EngineConfig（TOML から読み込み、起動時に検証）

pub mod domain;
pub mod ports;
pub mod app;
pub mod impls;
pub mod config;
