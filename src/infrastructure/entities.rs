//! Session entities

use crate::core::conversation::Conversation;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One open chat page.
///
/// The conversation lock is held for the whole duration of a reply, so at most one reply is in
/// flight per session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub conversation: Arc<Mutex<Conversation>>,
}

impl Session {
    pub fn new(id: Uuid) -> Self {
        Session {
            id,
            created_at: Utc::now(),
            conversation: Arc::new(Mutex::new(Conversation::new())),
        }
    }

    /// Whether a reply is currently being generated in this session.
    pub fn is_busy(&self) -> bool {
        self.conversation.try_lock().is_err()
    }
}
