//! In-memory session storage

use crate::infrastructure::entities::Session;
use crate::infrastructure::settings::Settings;
use crate::infrastructure::traits::SessionRepository;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use di::{Ref, inject, injectable};
use log::{debug, info};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

struct SessionEntry {
    session: Session,
    last_active: DateTime<Utc>,
}

pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    idle_timeout: TimeDelta,
}

#[injectable(SessionRepository)]
impl InMemorySessionRepository {
    #[inject]
    pub fn create(settings: Ref<Settings>) -> InMemorySessionRepository {
        InMemorySessionRepository::new(settings.session_idle_timeout)
    }
}

impl InMemorySessionRepository {
    pub fn new(idle_timeout: Duration) -> Self {
        InMemorySessionRepository {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout: TimeDelta::from_std(idle_timeout).unwrap_or(TimeDelta::MAX),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn open(&self, session_id: Uuid) -> Session {
        let now = Utc::now();

        if let Some(entry) = self.sessions.write().await.get_mut(&session_id) {
            entry.last_active = now;
            return entry.session.clone();
        }

        let pruned = self.prune_idle(now).await;
        if pruned > 0 {
            debug!("Pruned {pruned} idle sessions");
        }

        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session_id).or_insert_with(|| {
            info!("Opened session {session_id}");
            SessionEntry {
                session: Session::new(session_id),
                last_active: now,
            }
        });
        entry.session.clone()
    }

    async fn find(&self, session_id: Uuid) -> Option<Session> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(|entry| entry.session.clone())
    }

    async fn remove(&self, session_id: Uuid) -> bool {
        let removed = self.sessions.write().await.remove(&session_id).is_some();
        if removed {
            info!("Closed session {session_id}");
        }
        removed
    }

    async fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| {
            entry.session.is_busy() || now - entry.last_active < self.idle_timeout
        });
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_open_returns_same_session() {
        let repo = InMemorySessionRepository::new(Duration::from_secs(60));
        let id = Uuid::new_v4();

        let first = repo.open(id).await;
        let second = repo.open(id).await;

        assert_eq!(first.id, id);
        assert!(Arc::ptr_eq(&first.conversation, &second.conversation));
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let repo = InMemorySessionRepository::new(Duration::from_secs(60));

        let a = repo.open(Uuid::new_v4()).await;
        let b = repo.open(Uuid::new_v4()).await;

        assert!(!Arc::ptr_eq(&a.conversation, &b.conversation));
    }

    #[test]
    fn test_find_and_remove() {
        tokio_test::block_on(async {
            let repo = InMemorySessionRepository::new(Duration::from_secs(60));
            let id = Uuid::new_v4();

            assert!(repo.find(id).await.is_none());
            repo.open(id).await;
            assert!(repo.find(id).await.is_some());

            assert!(repo.remove(id).await);
            assert!(!repo.remove(id).await);
            assert!(repo.find(id).await.is_none());
        });
    }

    #[tokio::test]
    async fn test_prune_drops_idle_sessions() {
        let repo = InMemorySessionRepository::new(Duration::from_secs(60));
        repo.open(Uuid::new_v4()).await;
        repo.open(Uuid::new_v4()).await;

        assert_eq!(repo.prune_idle(Utc::now()).await, 0);
        assert_eq!(
            repo.prune_idle(Utc::now() + TimeDelta::seconds(120)).await,
            2
        );
        assert_eq!(repo.len().await, 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_session_with_reply_in_flight() {
        let repo = InMemorySessionRepository::new(Duration::from_secs(60));
        let busy = repo.open(Uuid::new_v4()).await;
        repo.open(Uuid::new_v4()).await;

        let _guard = busy.conversation.lock().await;
        let pruned = repo.prune_idle(Utc::now() + TimeDelta::seconds(120)).await;

        assert_eq!(pruned, 1);
        assert!(repo.find(busy.id).await.is_some());
    }
}
