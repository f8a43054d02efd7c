//! The storage interface.

use crate::batched::BatchMetricsSnapshot;
use crate::error::Result;
use crate::types::{
    MessageQuery, MessageRecord, MessageStatus, Session, SessionCloseReason, StoredMessage,
};
use async_trait::async_trait;
use uuid::Uuid;

/// Trait for message and session storage backends.
///
/// Implementations must be safe to share across the daemon's tasks. The
/// batched adapter wraps any implementation with write-behind queueing.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists a message row. Saving an id that already exists is a no-op.
    async fn save_message(&self, message: StoredMessage) -> Result<()>;

    /// Persists a batch of rows. The default loops over [`Self::save_message`];
    /// adapters with transactions should override it.
    async fn save_batch(&self, messages: Vec<StoredMessage>) -> Result<()> {
        for message in messages {
            self.save_message(message).await?;
        }
        Ok(())
    }

    /// Fetches one message with its reply count.
    async fn get_message_by_id(&self, id: Uuid) -> Result<Option<MessageRecord>>;

    /// Queries messages; every row carries its reply count.
    async fn get_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>>;

    /// Advances a message's status. Status moves only forward
    /// (`unread -> read -> acked`); equal status is a no-op and regression
    /// fails with [`crate::StorageError::StatusRegression`].
    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<()>;

    /// Returns undelivered (`unread`) rows bound to a recipient session,
    /// ordered by delivery sequence. Used for session replay.
    async fn get_pending_messages_for_session(
        &self,
        agent: &str,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>>;

    /// Opens a session row.
    async fn start_session(&self, session: Session) -> Result<()>;

    /// Closes a session, recording how it ended.
    async fn end_session(&self, id: &str, closed_by: SessionCloseReason) -> Result<()>;

    /// Fetches a session by id.
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// Resolves a resume token to its session.
    async fn get_session_by_resume_token(&self, token: &str) -> Result<Option<Session>>;

    /// Returns the most recently started sessions.
    async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<Session>>;

    /// Best-effort, monotonic bump of a session's message count.
    async fn increment_session_message_count(&self, id: &str) -> Result<()>;

    /// Write-behind batching metrics, for adapters that batch. Readable
    /// through a trait object so observability surfaces can report them.
    fn batch_metrics(&self) -> Option<BatchMetricsSnapshot> {
        None
    }

    /// Flushes any pending writes. Idempotent.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Closes the store, flushing first. Idempotent.
    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}
