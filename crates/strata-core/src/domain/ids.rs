//! Domain identifiers (strongly-typed IDs).
//!
//! # 2 種類の ID
//! - **`Id<T>`**: エンジン自身が発行する ULID ベースの ID（Checkpoint, Conflict）
//! - **`Key<T>`**: 呼び出し側が決める文字列キー（Task, Session）
//!
//! どちらも Phantom type パターンで、`CheckpointId` と `ConflictId`、
//! `TaskId` と `SessionId` をコンパイル時に区別します。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: checkpoint 一覧を作成順に並べられる
//! - **分散生成可能**: 調整なしで複数プロセスから生成できる

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

use super::errors::ContextError;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"ckpt-", "conflict-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// エンジンが発行するジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// `"ckpt-01H..."` 形式の文字列から復元
    pub fn parse(value: &str) -> Result<Self, ContextError> {
        let raw = value.strip_prefix(T::prefix()).unwrap_or(value);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|e| ContextError::Validation(format!("invalid id '{value}': {e}")))
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// KeyMarker は呼び出し側キーのマーカー trait
pub trait KeyMarker: Send + Sync + 'static {
    /// エラーメッセージで使う名前（例: "task id"）
    fn label() -> &'static str;
}

/// Upper bound on caller-supplied keys; they end up inside cache keys.
pub const MAX_KEY_LEN: usize = 128;

/// 呼び出し側が決める文字列キー
///
/// 空文字・空白・`:` を含むキーは拒否します（`task:<id>` の名前空間を壊すため）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key<T: KeyMarker> {
    value: String,
    _marker: PhantomData<T>,
}

impl<T: KeyMarker> Key<T> {
    pub fn new(value: impl Into<String>) -> Result<Self, ContextError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ContextError::Validation(format!(
                "{} must not be empty",
                T::label()
            )));
        }
        if value.len() > MAX_KEY_LEN {
            return Err(ContextError::Validation(format!(
                "{} exceeds {MAX_KEY_LEN} bytes",
                T::label()
            )));
        }
        if value.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(ContextError::Validation(format!(
                "{} '{value}' contains whitespace or ':'",
                T::label()
            )));
        }
        Ok(Self {
            value,
            _marker: PhantomData,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<T: KeyMarker> fmt::Display for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: KeyMarker> Serialize for Key<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, T: KeyMarker> Deserialize<'de> for Key<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Key::new(raw).map_err(serde::de::Error::custom)
    }
}

impl<T: KeyMarker> TryFrom<&str> for Key<T> {
    type Error = ContextError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Key::new(value)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Checkpoint {}

impl IdMarker for Checkpoint {
    fn prefix() -> &'static str {
        "ckpt-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Conflict {}

impl IdMarker for Conflict {
    fn prefix() -> &'static str {
        "conflict-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl KeyMarker for Task {
    fn label() -> &'static str {
        "task id"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Session {}

impl KeyMarker for Session {
    fn label() -> &'static str {
        "session id"
    }
}

// ========================================
// Type Alias
// ========================================

/// Identifier of a Checkpoint (immutable full-state snapshot).
pub type CheckpointId = Id<Checkpoint>;

/// Identifier of a detected Conflict.
pub type ConflictId = Id<Conflict>;

/// Caller-chosen key of a TaskContext.
pub type TaskId = Key<Task>;

/// Caller-chosen key of an agent work session.
pub type SessionId = Key<Session>;
