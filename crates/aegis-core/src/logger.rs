//! State logger
//!
//! Subscribes to every topic and appends each message to the event store.
//! This is the single writer of the raw event stream; all other components
//! only read it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use aegis_bus::{EventHandler, MessageBus};
use aegis_domain::{topics, Envelope};
use aegis_state::EventStore;

use crate::telemetry::COUNTERS;

/// Logs every bus message into the event store.
pub struct EventLogger {
    bus: Arc<dyn MessageBus>,
    events: Arc<dyn EventStore>,
}

impl EventLogger {
    pub fn new(bus: Arc<dyn MessageBus>, events: Arc<dyn EventStore>) -> Arc<Self> {
        Arc::new(EventLogger { bus, events })
    }

    pub async fn wire(self: &Arc<Self>) -> crate::Result<()> {
        for topic in topics::all_topics() {
            self.bus.subscribe(topic, self.clone()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for EventLogger {
    async fn handle(&self, topic: &str, envelope: Envelope) {
        match self.events.append(topic, &envelope).await {
            Ok(()) => {
                COUNTERS.inc_events_logged();
                debug!(topic, event_id = %envelope.event_id, "event logged");
            }
            Err(e) => {
                warn!(topic, error = %e, "failed to log event");
            }
        }
    }
}
