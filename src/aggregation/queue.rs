//! Message queue seam for received membership parts.
//!
//! Every enqueued message carries a lock token that must be completed exactly
//! once. Completing an unknown or already-completed token is an error.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("unknown lock token {0}")]
    UnknownLockToken(String),
    #[error("message {0} was already completed")]
    AlreadyCompleted(String),
    #[error("message queue unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Records a message for `session_id` and returns its lock token.
    async fn enqueue(&self, session_id: Uuid) -> Result<String, QueueError>;

    /// Acknowledges messages. Either every token is completed or none is.
    async fn complete(&self, lock_tokens: &[String]) -> Result<(), QueueError>;
}

#[derive(Debug, Clone)]
struct QueueEntry {
    session_id: Uuid,
    enqueued_at: DateTime<Utc>,
    completed: bool,
}

/// Queue kept in process memory.
#[derive(Debug, Default)]
pub struct InProcessMessageQueue {
    entries: Mutex<HashMap<String, QueueEntry>>,
}

impl InProcessMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.count(|entry| !entry.completed)
    }

    pub fn completed_count(&self) -> usize {
        self.count(|entry| entry.completed)
    }

    fn count(&self, predicate: impl Fn(&QueueEntry) -> bool) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|entry| predicate(entry)).count())
            .unwrap_or_default()
    }

    fn poisoned() -> QueueError {
        QueueError::Unavailable("queue lock poisoned".to_string())
    }
}

#[async_trait]
impl MessageQueue for InProcessMessageQueue {
    async fn enqueue(&self, session_id: Uuid) -> Result<String, QueueError> {
        let token = Uuid::new_v4().to_string();
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        entries.insert(
            token.clone(),
            QueueEntry {
                session_id,
                enqueued_at: Utc::now(),
                completed: false,
            },
        );
        Ok(token)
    }

    async fn complete(&self, lock_tokens: &[String]) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        for token in lock_tokens {
            match entries.get(token) {
                None => return Err(QueueError::UnknownLockToken(token.clone())),
                Some(entry) if entry.completed => {
                    return Err(QueueError::AlreadyCompleted(token.clone()));
                }
                Some(_) => {}
            }
        }

        for token in lock_tokens {
            if let Some(entry) = entries.get_mut(token) {
                entry.completed = true;
                debug!(
                    session_id = %entry.session_id,
                    lock_token = %token,
                    queued_ms = (Utc::now() - entry.enqueued_at).num_milliseconds(),
                    "Message completed"
                );
            }
        }
        counter!("aggregation_messages_completed_total").increment(lock_tokens.len() as u64);
        Ok(())
    }
}
