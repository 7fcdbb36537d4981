//! Domain model (ids, contexts, versions, checkpoints, conflicts, sessions, ...).
//!
//! このモジュールは純粋なデータと状態遷移のみを持ち、I/O は行いません。

pub mod ids;
pub mod context;
pub mod version;
pub mod checkpoint;
pub mod conflict;
pub mod session;
pub mod events;
pub mod errors;

pub use self::ids::{CheckpointId, ConflictId, SessionId, TaskId};
pub use self::context::{
    ContextField, ContextSnapshot, GlobalContext, GlobalContextPatch, ImmediateContext,
    TaskContext, TaskContextPatch, TaskStatus, TechnicalDecision,
};
pub use self::version::{ChangeMeta, ChangeType, ContextVersion, SignificantFields};
pub use self::checkpoint::{
    Checkpoint, CheckpointFilter, CheckpointRequest, CheckpointScope, CheckpointSnapshot,
    CheckpointType, TaskSnapshot,
};
pub use self::conflict::{
    Conflict, ConflictDraft, ConflictFilter, ConflictKey, ConflictStatus, ConflictType,
    ScanReport, Severity,
};
pub use self::session::{
    ActionEntry, RecoveryType, SessionRecord, SessionSnapshot, SessionStatus,
};
pub use self::events::{ContextEvent, DomainEvent};
pub use self::errors::{ContextError, Entity, ErrorKind, SecondaryTarget};
