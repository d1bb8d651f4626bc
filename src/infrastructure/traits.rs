//! Infrastructure traits, used for DI on higher levels

use crate::infrastructure::entities;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Returns the session with the given id, creating it if it does not exist yet.
    async fn open(&self, session_id: Uuid) -> entities::Session;

    async fn find(&self, session_id: Uuid) -> Option<entities::Session>;

    /// Removes a session. Returns `false` if there was no such session.
    async fn remove(&self, session_id: Uuid) -> bool;

    /// Drops sessions that have been idle for too long, except those with a reply in flight.
    async fn prune_idle(&self, now: DateTime<Utc>) -> usize;
}
