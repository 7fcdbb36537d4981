//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use std::sync::Arc;

use crate::domain::ids::{CheckpointId, ConflictId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator はエンジンが発行する ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数タスクから使える）
pub trait IdGenerator: Send + Sync {
    fn generate_checkpoint_id(&self) -> CheckpointId;

    fn generate_conflict_id(&self) -> ConflictId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// FixedClock を使うと timestamp 部分が決定的になります。
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_checkpoint_id(&self) -> CheckpointId {
        CheckpointId::from(self.next_ulid())
    }

    fn generate_conflict_id(&self) -> ConflictId {
        ConflictId::from(self.next_ulid())
    }
}
