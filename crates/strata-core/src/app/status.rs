//! Status - 書き込み結果の報告
//!
//! 正本への書き込みが成功した時点で操作は成功。二次ストア（cache / graph / events）
//! の結果は `SavedTo` に載せて返すだけで、操作の成否は変えない。

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::domain::ContextError;

/// Outcome of one write target.
///
/// Serializes as `"written"`, `"skipped"` or `{"failed": "<reason>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryWrite {
    Written,
    Skipped,
    Failed(String),
}

impl SecondaryWrite {
    pub fn is_failed(&self) -> bool {
        matches!(self, SecondaryWrite::Failed(_))
    }

    /// Fold two writes to the same target: any failure wins, then any write.
    pub fn and(self, other: SecondaryWrite) -> SecondaryWrite {
        match (self, other) {
            (SecondaryWrite::Failed(a), SecondaryWrite::Failed(b)) => {
                SecondaryWrite::Failed(format!("{a}; {b}"))
            }
            (failed @ SecondaryWrite::Failed(_), _) | (_, failed @ SecondaryWrite::Failed(_)) => {
                failed
            }
            (SecondaryWrite::Written, _) | (_, SecondaryWrite::Written) => SecondaryWrite::Written,
            _ => SecondaryWrite::Skipped,
        }
    }
}

/// Where a mutating operation landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTo {
    pub store: SecondaryWrite,
    pub cache: SecondaryWrite,
    pub graph: SecondaryWrite,
    pub events: SecondaryWrite,
}

impl SavedTo {
    /// The authoritative write happened; secondaries not attempted yet.
    pub fn store_only() -> Self {
        Self {
            store: SecondaryWrite::Written,
            cache: SecondaryWrite::Skipped,
            graph: SecondaryWrite::Skipped,
            events: SecondaryWrite::Skipped,
        }
    }

    /// Nothing was written (e.g. an empty update).
    pub fn untouched() -> Self {
        Self {
            store: SecondaryWrite::Skipped,
            ..Self::store_only()
        }
    }

    /// True when any secondary failed; the primary write still stands.
    pub fn is_degraded(&self) -> bool {
        self.cache.is_failed() || self.graph.is_failed() || self.events.is_failed()
    }

    pub fn merge(self, other: SavedTo) -> SavedTo {
        SavedTo {
            store: self.store.and(other.store),
            cache: self.cache.and(other.cache),
            graph: self.graph.and(other.graph),
            events: self.events.and(other.events),
        }
    }
}

/// A successful mutation plus its durability breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct Persisted<T> {
    pub value: T,
    pub saved_to: SavedTo,
}

impl<T> Persisted<T> {
    pub fn new(value: T, saved_to: SavedTo) -> Self {
        Self { value, saved_to }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Persisted<U> {
        Persisted {
            value: f(self.value),
            saved_to: self.saved_to,
        }
    }
}

impl<T: Serialize> Persisted<T> {
    /// Tool-level success body: `{"success": true, "data": ..., "savedTo": ...}`.
    pub fn to_response(&self) -> Result<serde_json::Value, ContextError> {
        let data = serde_json::to_value(&self.value)
            .map_err(|e| ContextError::Validation(format!("response not serializable: {e}")))?;
        let saved_to = serde_json::to_value(&self.saved_to)
            .map_err(|e| ContextError::Validation(format!("response not serializable: {e}")))?;
        Ok(json!({
            "success": true,
            "data": data,
            "savedTo": saved_to,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SecondaryWrite::Written, SecondaryWrite::Skipped, SecondaryWrite::Written)]
    #[case(SecondaryWrite::Skipped, SecondaryWrite::Skipped, SecondaryWrite::Skipped)]
    #[case(
        SecondaryWrite::Written,
        SecondaryWrite::Failed("down".into()),
        SecondaryWrite::Failed("down".into())
    )]
    #[case(
        SecondaryWrite::Failed("a".into()),
        SecondaryWrite::Failed("b".into()),
        SecondaryWrite::Failed("a; b".into())
    )]
    fn folding_writes(
        #[case] left: SecondaryWrite,
        #[case] right: SecondaryWrite,
        #[case] expected: SecondaryWrite,
    ) {
        assert_eq!(left.and(right), expected);
    }

    #[test]
    fn response_reports_degraded_durability() {
        let persisted = Persisted::new(
            json!({"taskId": "T1"}),
            SavedTo {
                cache: SecondaryWrite::Failed("connection refused".into()),
                ..SavedTo::store_only()
            },
        );
        assert!(persisted.saved_to.is_degraded());

        let body = persisted.to_response().unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["taskId"], "T1");
        assert_eq!(body["savedTo"]["store"], "written");
        assert_eq!(body["savedTo"]["cache"]["failed"], "connection refused");
        assert_eq!(body["savedTo"]["graph"], "skipped");
    }
}
