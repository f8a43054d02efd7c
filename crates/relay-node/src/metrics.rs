//! Prometheus metrics for the daemon.

use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use relay_router::RouterEvent;
use relay_storage::MessageStore;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// The daemon's metric set.
pub struct RelayMetrics {
    registry: Registry,
    /// Currently registered agents.
    pub agents_connected: Gauge,
    /// DELIVERs dispatched.
    pub messages_delivered: Counter,
    /// DELIVERs acknowledged.
    pub deliveries_acked: Counter,
    /// DELIVERs that ran out of retries or TTL.
    pub deliveries_exhausted: Counter,
    /// Processing indicators that timed out.
    pub processing_timeouts: Counter,
    /// Batches the write-behind stores have committed.
    pub store_batches_written: Gauge,
    /// Saves sitting in write-behind queues.
    pub store_pending_writes: Gauge,
    // Stores polled for batching metrics at render time.
    stores: Mutex<Vec<Weak<dyn MessageStore>>>,
}

impl RelayMetrics {
    /// Creates and registers the metric set.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let mut registry = Registry::default();

        let agents_connected = Gauge::default();
        registry.register(
            "relay_agents_connected",
            "Currently registered agents",
            agents_connected.clone(),
        );

        let messages_delivered = Counter::default();
        registry.register(
            "relay_messages_delivered",
            "DELIVER envelopes dispatched",
            messages_delivered.clone(),
        );

        let deliveries_acked = Counter::default();
        registry.register(
            "relay_deliveries_acked",
            "DELIVER envelopes acknowledged",
            deliveries_acked.clone(),
        );

        let deliveries_exhausted = Counter::default();
        registry.register(
            "relay_deliveries_exhausted",
            "Deliveries dropped after retries or TTL",
            deliveries_exhausted.clone(),
        );

        let processing_timeouts = Counter::default();
        registry.register(
            "relay_processing_timeouts",
            "Processing indicators that timed out",
            processing_timeouts.clone(),
        );

        let store_batches_written = Gauge::default();
        registry.register(
            "relay_store_batches_written",
            "Batches committed by write-behind stores",
            store_batches_written.clone(),
        );

        let store_pending_writes = Gauge::default();
        registry.register(
            "relay_store_pending_writes",
            "Saves pending in write-behind queues",
            store_pending_writes.clone(),
        );

        Arc::new(Self {
            registry,
            agents_connected,
            messages_delivered,
            deliveries_acked,
            deliveries_exhausted,
            processing_timeouts,
            store_batches_written,
            store_pending_writes,
            stores: Mutex::new(Vec::new()),
        })
    }

    /// Registers a store whose batching metrics should be reported. Stores
    /// without a batching layer report nothing and cost nothing.
    pub fn watch_store(&self, store: &Arc<dyn MessageStore>) {
        self.stores.lock().push(Arc::downgrade(store));
    }

    fn refresh_store_gauges(&self) {
        let mut batches = 0i64;
        let mut pending = 0i64;
        let mut stores = self.stores.lock();
        stores.retain(|weak| weak.upgrade().is_some());
        for store in stores.iter().filter_map(Weak::upgrade) {
            if let Some(metrics) = store.batch_metrics() {
                batches += metrics.batches_written as i64;
                pending += metrics.pending_count as i64;
            }
        }
        self.store_batches_written.set(batches);
        self.store_pending_writes.set(pending);
    }

    /// Renders the registry in Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        self.refresh_store_gauges();
        let mut output = String::new();
        // Encoding into a String cannot fail.
        let _ = encode(&mut output, &self.registry);
        output
    }

    /// Spawns a task applying router events to the metric set.
    pub fn watch_router(self: &Arc<Self>, mut events: broadcast::Receiver<RouterEvent>) {
        let metrics = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RouterEvent::AgentRegistered { .. }) => {
                        metrics.agents_connected.inc();
                    }
                    Ok(RouterEvent::AgentUnregistered { .. }) => {
                        metrics.agents_connected.dec();
                    }
                    Ok(RouterEvent::Delivered { .. }) => {
                        metrics.messages_delivered.inc();
                    }
                    Ok(RouterEvent::Acked { .. }) => {
                        metrics.deliveries_acked.inc();
                    }
                    Ok(RouterEvent::DeliveryExhausted { .. }) => {
                        metrics.deliveries_exhausted.inc();
                    }
                    Ok(RouterEvent::ProcessingTimeout { .. }) => {
                        metrics.processing_timeouts.inc();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_storage::{BatchConfig, BatchedStore, MemoryStore};
    use std::time::Duration;

    #[test]
    fn renders_registered_metrics() {
        let metrics = RelayMetrics::new();
        metrics.messages_delivered.inc();
        metrics.agents_connected.set(3);

        let text = metrics.render();
        assert!(text.contains("relay_messages_delivered_total 1"));
        assert!(text.contains("relay_agents_connected 3"));
        assert!(text.contains("relay_store_batches_written 0"));
    }

    #[tokio::test]
    async fn store_gauges_follow_batched_store() {
        let metrics = RelayMetrics::new();
        let store: Arc<dyn MessageStore> = BatchedStore::new(
            MemoryStore::new(),
            BatchConfig {
                max_batch_size: 1,
                max_batch_bytes: 1024 * 1024,
                max_batch_delay: Duration::from_secs(10),
            },
        );
        metrics.watch_store(&store);

        let payload = relay_protocol::SendPayload::message("m");
        let envelope = relay_protocol::Envelope::send("a", "b", None, &payload).unwrap();
        let row = relay_storage::StoredMessage::from_send(
            &envelope,
            &payload,
            "b",
            &relay_protocol::DeliveryInfo {
                seq: 1,
                session_id: "s".into(),
            },
        );
        store.save_message(row).await.unwrap();

        let text = metrics.render();
        assert!(text.contains("relay_store_batches_written 1"));
        assert!(text.contains("relay_store_pending_writes 0"));
    }
}
