//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: エンジンの構築とワイヤリング
//! - **VersionedStore**: task の CRUD とバージョン履歴
//! - **CheckpointManager**: 名前付きスナップショットと rollback
//! - **ConflictDetector**: 並行作業の衝突検出
//! - **LockService**: advisory lock
//! - **RecoveryEngine**: heartbeat による crash 検出と再開
//! - **HeartbeatPump / ReaperLoop**: バックグラウンドループ

pub mod builder;
pub mod status;
pub mod secondary;
pub mod versioned_store;
pub mod checkpoint_manager;
pub mod conflict_detector;
pub mod locks;
pub mod recovery_engine;
pub mod heartbeat;
pub mod reaper_loop;

#[cfg(test)]
pub(crate) mod testing;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Engine, EngineBuilder};
pub use self::status::{Persisted, SavedTo, SecondaryWrite};
pub use self::versioned_store::VersionedStore;
pub use self::checkpoint_manager::{CheckpointManager, CheckpointRollback};
pub use self::conflict_detector::{ConflictDetector, ScanRequest};
pub use self::locks::LockService;
pub use self::recovery_engine::{RecoveryCandidate, RecoveryEngine, RecoveryReport, ResumeOutcome};
pub use self::heartbeat::HeartbeatPump;
pub use self::reaper_loop::ReaperLoop;
