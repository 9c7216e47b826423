//! In-process bus backend
//!
//! Backs single-process demos and the test suites. One broadcast channel
//! per topic; each subscription gets its own dispatcher task that feeds its
//! handler serially, preserving per-topic order for that subscriber.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, warn};

use aegis_domain::Envelope;

use crate::traits::{EventHandler, MessageBus};
use crate::{BusError, BusResult};

const CHANNEL_CAPACITY: usize = 256;

/// In-process pub/sub backend.
pub struct MemoryBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        MemoryBus {
            topics: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    async fn sender_for(&self, topic: &str) -> broadcast::Sender<Envelope> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> BusResult<()> {
        if *self.shutdown_tx.borrow() {
            return Err(BusError::Disconnected("bus closed".to_string()));
        }
        envelope.validate()?;

        let sender = self.sender_for(topic).await;
        // No receivers is fine: at-least-once only applies to live
        // subscriptions, matching broker semantics for plain topics.
        let delivered = sender.send(envelope.clone()).unwrap_or(0);
        debug!(topic, subscribers = delivered, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> BusResult<()> {
        if *self.shutdown_tx.borrow() {
            return Err(BusError::Disconnected("bus closed".to_string()));
        }

        let mut receiver = self.sender_for(topic).await.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = receiver.recv() => match result {
                        Ok(envelope) => handler.handle(&topic, envelope).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "subscription lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(topic = %topic, "dispatcher stopped");
        });

        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    async fn close(&self) -> BusResult<()> {
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_domain::Severity;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Counter {
        count: AtomicUsize,
        notify: Notify,
    }

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle(&self, _topic: &str, _envelope: Envelope) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    fn sample() -> Envelope {
        Envelope::new("test", Severity::Info, "sector-1", "sample")
    }

    #[tokio::test]
    async fn delivers_to_subscriber() {
        let bus = MemoryBus::new();
        let counter = Arc::new(Counter {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        });
        bus.subscribe("t.a", counter.clone()).await.unwrap();

        bus.publish("t.a", &sample()).await.unwrap();
        counter.notify.notified().await;
        assert_eq!(counter.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = MemoryBus::new();
        let counter = Arc::new(Counter {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        });
        bus.subscribe("t.a", counter.clone()).await.unwrap();

        bus.publish("t.b", &sample()).await.unwrap();
        bus.publish("t.a", &sample()).await.unwrap();
        counter.notify.notified().await;
        assert_eq!(counter.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        assert!(bus.publish("t.silent", &sample()).await.is_ok());
    }

    #[tokio::test]
    async fn closed_bus_refuses_publish() {
        let bus = MemoryBus::new();
        bus.close().await.unwrap();
        let err = bus.publish("t.a", &sample()).await.unwrap_err();
        assert!(err.is_retriable());
        assert!(!bus.is_connected().await);
    }

    #[tokio::test]
    async fn invalid_envelope_rejected() {
        let bus = MemoryBus::new();
        let mut envelope = sample();
        envelope.sector_id = String::new();
        assert!(bus.publish("t.a", &envelope).await.is_err());
    }

    #[tokio::test]
    async fn closure_handlers_work() {
        use crate::traits::handler_fn;

        let bus = MemoryBus::new();
        let notify = Arc::new(Notify::new());
        let handler = {
            let notify = notify.clone();
            handler_fn(move |_topic, _envelope| {
                let notify = notify.clone();
                Box::pin(async move {
                    notify.notify_one();
                })
            })
        };
        bus.subscribe("t.fn", handler).await.unwrap();
        bus.publish("t.fn", &sample()).await.unwrap();
        notify.notified().await;
    }
}

