//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（リレーショナル DB, Redis, グラフ DB, 監査ログ）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - ContextStore / SessionStore が正本。失敗は操作を中断する
//! - MirrorCache / GraphStore / EventSink は best-effort。失敗はログに残すだけ

pub mod context_store;
pub mod session_store;
pub mod mirror_cache;
pub mod graph_store;
pub mod event_sink;
pub mod clock;
pub mod id_generator;

// 主要な trait を再エクスポート
pub use self::context_store::{ContextStore, StoreError, WriteBatch, WriteOp};
pub use self::session_store::SessionStore;
pub use self::mirror_cache::{AdvisoryLock, CacheKey, MirrorCache, PortError};
pub use self::graph_store::GraphStore;
pub use self::event_sink::EventSink;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
