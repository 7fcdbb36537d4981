//! InMemorySessionStore - セッションの正本（開発用・テスト用）

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{Entity, SessionId, SessionRecord, SessionStatus};
use crate::ports::{SessionStore, StoreError};

pub struct InMemorySessionStore {
    sessions: Arc<Mutex<HashMap<SessionId, SessionRecord>>>,
    available: Arc<AtomicBool>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory session store marked unavailable".into()))
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&record.session_id) {
            return Err(StoreError::Duplicate {
                entity: Entity::Session,
                key: record.session_id.to_string(),
            });
        }
        sessions.insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn get_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.ensure_available()?;
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(session_id).cloned())
    }

    async fn put_session(&self, record: SessionRecord) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&record.session_id) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(StoreError::Missing {
                entity: Entity::Session,
                key: record.session_id.to_string(),
            }),
        }
    }

    async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        self.ensure_available()?;
        let sessions = self.sessions.lock().await;
        let mut found: Vec<SessionRecord> = sessions
            .values()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.as_str().cmp(b.session_id.as_str()))
        });
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn insert_rejects_duplicates_and_put_requires_existing() {
        let store = InMemorySessionStore::new();
        let record = SessionRecord::start(sid("s1"), None, Utc::now());
        store.insert_session(record.clone()).await.unwrap();

        assert!(matches!(
            store.insert_session(record).await,
            Err(StoreError::Duplicate { .. })
        ));
        assert!(matches!(
            store
                .put_session(SessionRecord::start(sid("ghost"), None, Utc::now()))
                .await,
            Err(StoreError::Missing { .. })
        ));
    }

    #[tokio::test]
    async fn list_is_ordered_by_start_and_filterable() {
        let store = InMemorySessionStore::new();
        let t0 = Utc::now();
        store
            .insert_session(SessionRecord::start(sid("late"), None, t0 + Duration::seconds(5)))
            .await
            .unwrap();
        let mut early = SessionRecord::start(sid("early"), None, t0);
        early.end(t0).unwrap();
        store.insert_session(early).await.unwrap();

        let all: Vec<String> = store
            .list_sessions(None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id.to_string())
            .collect();
        assert_eq!(all, vec!["early", "late"]);

        let active = store.list_sessions(Some(SessionStatus::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, sid("late"));
    }
}
