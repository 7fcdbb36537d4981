//! InMemoryMirrorCache - Redis の代わりになる TTL 付きキャッシュ
//!
//! 期限切れは読み取り時に判定する（遅延削除）。時刻は Clock から取るので
//! FixedClock と組み合わせれば TTL の境界もテストできる。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::ports::{CacheKey, Clock, MirrorCache, PortError};

struct Entry {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

pub struct InMemoryMirrorCache {
    entries: Arc<Mutex<HashMap<CacheKey, Entry>>>,
    clock: Arc<dyn Clock>,
    available: Arc<AtomicBool>,
}

impl InMemoryMirrorCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// While false every call fails with `PortError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn ensure_available(&self) -> Result<(), PortError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PortError::Unavailable("in-memory cache marked unavailable".into()))
        }
    }
}

#[async_trait]
impl MirrorCache for InMemoryMirrorCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<serde_json::Value>, PortError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) => entry.expires_at.is_some_and(|at| at <= now),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), PortError> {
        self.ensure_available()?;
        let expires_at = match ttl {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl)
                    .map_err(|e| PortError::Serialization(format!("invalid ttl: {e}")))?;
                Some(self.clock.now() + ttl)
            }
            None => None,
        };
        let mut entries = self.entries.lock().await;
        entries.insert(key.clone(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), PortError> {
        self.ensure_available()?;
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use crate::ports::FixedClock;
    use serde_json::json;

    #[tokio::test]
    async fn entries_expire_at_ttl_boundary() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let cache = InMemoryMirrorCache::new(clock.clone());
        let key = CacheKey::Task(TaskId::new("T1").unwrap());

        cache
            .set(&key, json!({"version": 1}), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(9));
        assert_eq!(cache.get(&key).await.unwrap(), Some(json!({"version": 1})));

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(cache.get(&key).await.unwrap(), None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn unavailable_cache_errors() {
        let cache = InMemoryMirrorCache::new(Arc::new(FixedClock::new(Utc::now())));
        cache.set_available(false);
        let key = CacheKey::Lock(TaskId::new("T1").unwrap());
        assert!(matches!(
            cache.set(&key, json!(null), None).await,
            Err(PortError::Unavailable(_))
        ));
    }
}
