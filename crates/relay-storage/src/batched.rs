//! Write-behind batching adapter.
//!
//! Saves are enqueued in memory and flushed when any trigger fires: queue
//! length, pending bytes, or time since the first enqueue. Status updates
//! bypass the queue so the ACK path never races a flush. Reads flush first
//! so replay queries never miss enqueued writes.

use crate::error::{Result, StorageError};
use crate::store::MessageStore;
use crate::types::{
    MessageQuery, MessageRecord, MessageStatus, Session, SessionCloseReason, StoredMessage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Batching thresholds.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush when this many saves are pending.
    pub max_batch_size: usize,
    /// Flush when pending saves reach this many bytes.
    pub max_batch_bytes: usize,
    /// Flush when the oldest pending save reaches this age.
    pub max_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_batch_bytes: 256 * 1024,
            max_batch_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Default)]
struct BatchMetrics {
    batches_written: AtomicU64,
    messages_written: AtomicU64,
    flush_due_to_size: AtomicU64,
    flush_due_to_bytes: AtomicU64,
    flush_due_to_time: AtomicU64,
    flush_failures: AtomicU64,
}

/// A point-in-time view of the batching metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchMetricsSnapshot {
    /// Batches committed to the inner store.
    pub batches_written: u64,
    /// Messages committed to the inner store.
    pub messages_written: u64,
    /// Flushes triggered by queue length.
    pub flush_due_to_size: u64,
    /// Flushes triggered by pending bytes.
    pub flush_due_to_bytes: u64,
    /// Flushes triggered by the delay window.
    pub flush_due_to_time: u64,
    /// Failed flush attempts (batch re-queued).
    pub flush_failures: u64,
    /// Saves currently pending.
    pub pending_count: u64,
    /// Bytes currently pending.
    pub pending_bytes: u64,
}

struct Queue {
    items: VecDeque<StoredMessage>,
    bytes: usize,
    first_enqueued: Option<Instant>,
}

/// Write-behind wrapper around any [`MessageStore`].
pub struct BatchedStore<S: MessageStore + 'static> {
    inner: Arc<S>,
    config: BatchConfig,
    queue: Mutex<Queue>,
    metrics: BatchMetrics,
    // Serializes flushes: at most one batch write in flight.
    flush_lock: tokio::sync::Mutex<()>,
    notify: Arc<Notify>,
    closed: AtomicBool,
}

#[derive(Clone, Copy, Debug)]
enum FlushTrigger {
    Size,
    Bytes,
    Time,
    Explicit,
}

impl<S: MessageStore + 'static> BatchedStore<S> {
    /// Wraps `inner` and starts the background flusher.
    #[must_use]
    pub fn new(inner: S, config: BatchConfig) -> Arc<Self> {
        let store = Arc::new(Self {
            inner: Arc::new(inner),
            config,
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                bytes: 0,
                first_enqueued: None,
            }),
            metrics: BatchMetrics::default(),
            flush_lock: tokio::sync::Mutex::new(()),
            notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(Self::run_flusher(Arc::downgrade(&store)));
        store
    }

    /// Wraps `inner` with the default thresholds.
    #[must_use]
    pub fn with_defaults(inner: S) -> Arc<Self> {
        Self::new(inner, BatchConfig::default())
    }

    /// Returns a snapshot of the batching metrics.
    #[must_use]
    pub fn metrics(&self) -> BatchMetricsSnapshot {
        let queue = self.queue.lock();
        BatchMetricsSnapshot {
            batches_written: self.metrics.batches_written.load(Ordering::Relaxed),
            messages_written: self.metrics.messages_written.load(Ordering::Relaxed),
            flush_due_to_size: self.metrics.flush_due_to_size.load(Ordering::Relaxed),
            flush_due_to_bytes: self.metrics.flush_due_to_bytes.load(Ordering::Relaxed),
            flush_due_to_time: self.metrics.flush_due_to_time.load(Ordering::Relaxed),
            flush_failures: self.metrics.flush_failures.load(Ordering::Relaxed),
            pending_count: queue.items.len() as u64,
            pending_bytes: queue.bytes as u64,
        }
    }

    /// Clears all counters. Pending gauges are unaffected.
    pub fn reset_metrics(&self) {
        self.metrics.batches_written.store(0, Ordering::Relaxed);
        self.metrics.messages_written.store(0, Ordering::Relaxed);
        self.metrics.flush_due_to_size.store(0, Ordering::Relaxed);
        self.metrics.flush_due_to_bytes.store(0, Ordering::Relaxed);
        self.metrics.flush_due_to_time.store(0, Ordering::Relaxed);
        self.metrics.flush_failures.store(0, Ordering::Relaxed);
    }

    async fn run_flusher(store: Weak<Self>) {
        loop {
            let Some(strong) = store.upgrade() else {
                return;
            };
            if strong.closed.load(Ordering::Acquire) {
                return;
            }

            let deadline = {
                let queue = strong.queue.lock();
                queue
                    .first_enqueued
                    .map(|t| t + strong.config.max_batch_delay)
            };
            let notify = strong.notify.clone();

            match deadline {
                None => {
                    // Idle: drop the strong ref while parked so the store can
                    // be dropped, then wake on the next enqueue.
                    drop(strong);
                    notify.notified().await;
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        drop(strong);
                        tokio::select! {
                            () = tokio::time::sleep_until(deadline.into()) => {}
                            () = notify.notified() => {}
                        }
                    } else {
                        strong
                            .metrics
                            .flush_due_to_time
                            .fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = strong.flush_with(FlushTrigger::Time).await {
                            warn!(error = %e, "batched flush failed; batch re-queued");
                            // Back off until the next trigger rather than spinning.
                            drop(strong);
                            notify.notified().await;
                        }
                    }
                }
            }
        }
    }

    async fn flush_with(&self, trigger: FlushTrigger) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<StoredMessage> = {
            let mut queue = self.queue.lock();
            queue.bytes = 0;
            queue.first_enqueued = None;
            queue.items.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(());
        }

        let count = batch.len();
        match self.inner.save_batch(batch.clone()).await {
            Ok(()) => {
                self.metrics.batches_written.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .messages_written
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(count, trigger = ?trigger, "flushed message batch");
                Ok(())
            }
            Err(e) => {
                // Re-queue the whole batch at the head, preserving order.
                let mut queue = self.queue.lock();
                let bytes: usize = batch.iter().map(StoredMessage::approx_bytes).sum();
                for message in batch.into_iter().rev() {
                    queue.items.push_front(message);
                }
                queue.bytes += bytes;
                queue.first_enqueued.get_or_insert_with(Instant::now);
                self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<S: MessageStore + 'static> MessageStore for BatchedStore<S> {
    async fn save_message(&self, message: StoredMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }

        let trigger = {
            let mut queue = self.queue.lock();
            queue.bytes += message.approx_bytes();
            queue.items.push_back(message);
            queue.first_enqueued.get_or_insert_with(Instant::now);

            if queue.items.len() >= self.config.max_batch_size {
                Some(FlushTrigger::Size)
            } else if queue.bytes >= self.config.max_batch_bytes {
                Some(FlushTrigger::Bytes)
            } else {
                None
            }
        };

        if let Some(trigger) = trigger {
            match trigger {
                FlushTrigger::Size => {
                    self.metrics.flush_due_to_size.fetch_add(1, Ordering::Relaxed);
                }
                FlushTrigger::Bytes => {
                    self.metrics
                        .flush_due_to_bytes
                        .fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
            // Errors re-queue the batch; the next trigger retries.
            if let Err(e) = self.flush_with(trigger).await {
                warn!(error = %e, "batched flush failed; batch re-queued");
            }
        } else {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn get_message_by_id(&self, id: Uuid) -> Result<Option<MessageRecord>> {
        self.flush().await?;
        self.inner.get_message_by_id(id).await
    }

    async fn get_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>> {
        self.flush().await?;
        self.inner.get_messages(query).await
    }

    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<()> {
        // Not batched: the ACK path must not race a flush. Drain first so
        // the row is guaranteed to exist in the inner store.
        self.flush().await?;
        self.inner.update_message_status(id, status).await
    }

    async fn get_pending_messages_for_session(
        &self,
        agent: &str,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>> {
        self.flush().await?;
        self.inner
            .get_pending_messages_for_session(agent, session_id)
            .await
    }

    async fn start_session(&self, session: Session) -> Result<()> {
        self.inner.start_session(session).await
    }

    async fn end_session(&self, id: &str, closed_by: SessionCloseReason) -> Result<()> {
        self.inner.end_session(id, closed_by).await
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.inner.get_session(id).await
    }

    async fn get_session_by_resume_token(&self, token: &str) -> Result<Option<Session>> {
        self.inner.get_session_by_resume_token(token).await
    }

    async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        self.inner.get_recent_sessions(limit).await
    }

    async fn increment_session_message_count(&self, id: &str) -> Result<()> {
        self.inner.increment_session_message_count(id).await
    }

    fn batch_metrics(&self) -> Option<BatchMetricsSnapshot> {
        Some(self.metrics())
    }

    async fn flush(&self) -> Result<()> {
        self.flush_with(FlushTrigger::Explicit).await
    }

    async fn close(&self) -> Result<()> {
        let result = self.flush().await;
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use relay_protocol::{DeliveryInfo, Envelope, SendPayload};

    fn sample(body: &str, seq: u64) -> StoredMessage {
        let payload = SendPayload::message(body);
        let env = Envelope::send("alice", "bob", None, &payload).unwrap();
        StoredMessage::from_send(
            &env,
            &payload,
            "bob",
            &DeliveryInfo {
                seq,
                session_id: "sess-1".into(),
            },
        )
    }

    #[tokio::test]
    async fn size_trigger_flushes_once() {
        let store = BatchedStore::new(
            MemoryStore::new(),
            BatchConfig {
                max_batch_size: 5,
                max_batch_bytes: 1024 * 1024,
                max_batch_delay: Duration::from_secs(10),
            },
        );

        for i in 0..5 {
            store.save_message(sample("m", i + 1)).await.unwrap();
        }

        let metrics = store.metrics();
        assert_eq!(metrics.flush_due_to_size, 1);
        assert_eq!(metrics.batches_written, 1);
        assert_eq!(metrics.messages_written, 5);
        assert_eq!(metrics.pending_count, 0);
        assert_eq!(metrics.pending_bytes, 0);
    }

    #[tokio::test]
    async fn bytes_trigger_flushes() {
        let store = BatchedStore::new(
            MemoryStore::new(),
            BatchConfig {
                max_batch_size: 1_000,
                max_batch_bytes: 512,
                max_batch_delay: Duration::from_secs(10),
            },
        );

        let big = "x".repeat(600);
        store.save_message(sample(&big, 1)).await.unwrap();

        let metrics = store.metrics();
        assert_eq!(metrics.flush_due_to_bytes, 1);
        assert_eq!(metrics.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn time_trigger_flushes() {
        let store = BatchedStore::new(
            MemoryStore::new(),
            BatchConfig {
                max_batch_size: 1_000,
                max_batch_bytes: 1024 * 1024,
                max_batch_delay: Duration::from_millis(50),
            },
        );

        store.save_message(sample("m", 1)).await.unwrap();
        assert_eq!(store.metrics().pending_count, 1);

        // Let the flusher observe the deadline.
        tokio::time::sleep(Duration::from_millis(120)).await;
        tokio::task::yield_now().await;

        let metrics = store.metrics();
        assert_eq!(metrics.pending_count, 0);
        assert_eq!(metrics.batches_written, 1);
    }

    #[tokio::test]
    async fn reads_flush_first() {
        let store = BatchedStore::new(
            MemoryStore::new(),
            BatchConfig {
                max_batch_size: 1_000,
                max_batch_bytes: 1024 * 1024,
                max_batch_delay: Duration::from_secs(10),
            },
        );

        let msg = sample("pending", 1);
        let id = msg.id;
        store.save_message(msg).await.unwrap();

        // The row is only enqueued, but the read drains the queue first.
        let fetched = store.get_message_by_id(id).await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drains() {
        let store = BatchedStore::with_defaults(MemoryStore::new());
        store.save_message(sample("last", 1)).await.unwrap();

        store.close().await.unwrap();
        store.close().await.unwrap();

        assert_eq!(store.metrics().pending_count, 0);
        assert!(matches!(
            store.save_message(sample("late", 2)).await,
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test]
    async fn batch_metrics_readable_through_trait_object() {
        let store = BatchedStore::new(
            MemoryStore::new(),
            BatchConfig {
                max_batch_size: 1,
                max_batch_bytes: 1024 * 1024,
                max_batch_delay: Duration::from_secs(10),
            },
        );
        store.save_message(sample("m", 1)).await.unwrap();

        let store: Arc<dyn MessageStore> = store;
        let metrics = store.batch_metrics().expect("batched adapter reports");
        assert_eq!(metrics.batches_written, 1);

        let plain: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        assert!(plain.batch_metrics().is_none());
    }

    #[tokio::test]
    async fn nothing_lost_nor_duplicated() {
        let store = BatchedStore::new(
            MemoryStore::new(),
            BatchConfig {
                max_batch_size: 7,
                max_batch_bytes: 1024 * 1024,
                max_batch_delay: Duration::from_secs(10),
            },
        );

        for i in 0..40 {
            store.save_message(sample("m", i + 1)).await.unwrap();
        }
        store.flush().await.unwrap();

        let metrics = store.metrics();
        assert_eq!(metrics.messages_written, 40);
        let rows = store
            .get_messages(&MessageQuery::for_recipient("bob"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 40);
    }
}
