//! In-memory storage adapter.

use crate::error::{Result, StorageError};
use crate::store::MessageStore;
use crate::types::{
    MessageQuery, MessageRecord, MessageStatus, Session, SessionCloseReason, SortOrder,
    StoredMessage,
};
use crate::MEMORY_STORE_CAPACITY;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// An in-memory store bounded to the most recent messages.
///
/// Used by tests and by daemons configured with `storage_type = memory`.
pub struct MemoryStore {
    messages: RwLock<VecDeque<StoredMessage>>,
    sessions: RwLock<HashMap<String, Session>>,
    capacity: usize,
}

impl MemoryStore {
    /// Creates a store with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_STORE_CAPACITY)
    }

    /// Creates a store bounded to `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: RwLock::new(VecDeque::new()),
            sessions: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Number of retained messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    /// True when no messages are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    fn reply_count(messages: &VecDeque<StoredMessage>, id: Uuid) -> u64 {
        let id = id.to_string();
        messages
            .iter()
            .filter(|m| m.thread.as_deref() == Some(id.as_str()))
            .count() as u64
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save_message(&self, message: StoredMessage) -> Result<()> {
        let mut messages = self.messages.write();
        if messages.iter().any(|m| m.id == message.id) {
            return Ok(());
        }
        if messages.len() >= self.capacity {
            messages.pop_front();
        }
        messages.push_back(message);
        Ok(())
    }

    async fn get_message_by_id(&self, id: Uuid) -> Result<Option<MessageRecord>> {
        let messages = self.messages.read();
        Ok(messages.iter().find(|m| m.id == id).map(|m| MessageRecord {
            message: m.clone(),
            reply_count: Self::reply_count(&messages, id),
        }))
    }

    async fn get_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>> {
        let messages = self.messages.read();
        let mut rows: Vec<MessageRecord> = messages
            .iter()
            .filter(|m| query.matches(m))
            .map(|m| MessageRecord {
                reply_count: Self::reply_count(&messages, m.id),
                message: m.clone(),
            })
            .collect();

        match query.order {
            SortOrder::Asc => rows.sort_by_key(|r| r.message.ts),
            SortOrder::Desc => rows.sort_by(|a, b| b.message.ts.cmp(&a.message.ts)),
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<()> {
        let mut messages = self.messages.write();
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        if status.rank() < message.status.rank() {
            return Err(StorageError::StatusRegression {
                id: id.to_string(),
                current: message.status.to_string(),
                requested: status.to_string(),
            });
        }
        message.status = status;
        Ok(())
    }

    async fn get_pending_messages_for_session(
        &self,
        agent: &str,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>> {
        let messages = self.messages.read();
        let mut pending: Vec<StoredMessage> = messages
            .iter()
            .filter(|m| {
                m.to == agent
                    && m.status == MessageStatus::Unread
                    && m.delivery_session_id.as_deref() == Some(session_id)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.delivery_seq);
        Ok(pending)
    }

    async fn start_session(&self, session: Session) -> Result<()> {
        self.sessions.write().insert(session.id.clone(), session);
        Ok(())
    }

    async fn end_session(&self, id: &str, closed_by: SessionCloseReason) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if session.ended_at.is_none() {
            session.ended_at = Some(relay_protocol::now_ms());
            session.closed_by = Some(closed_by);
        }
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn get_session_by_resume_token(&self, token: &str) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .read()
            .values()
            .find(|s| s.resume_token.as_deref() == Some(token))
            .cloned())
    }

    async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn increment_session_message_count(&self, id: &str) -> Result<()> {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.message_count += 1;
        }
        Ok(())
    }
}
