//! NATS bus backend
//!
//! Connection establishment retries with the bounded [`RetryPolicy`]; once
//! connected, the client's own reconnect machinery takes over and restores
//! registered subscriptions transparently. A publish that races a
//! connection gap surfaces as a retriable [`BusError`].
//!
//! Incoming payloads are decoded and validated at this boundary; anything
//! that fails (malformed JSON, offset-less timestamps) is logged at `warn`
//! and dropped before it reaches a handler.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use aegis_domain::Envelope;

use crate::retry::RetryPolicy;
use crate::traits::{EventHandler, MessageBus};
use crate::{BusError, BusResult};

/// NATS-backed [`MessageBus`].
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to the given NATS URL, retrying per `retry` before giving up.
    pub async fn connect(url: &str, retry: RetryPolicy) -> BusResult<Self> {
        let mut attempt = 0u32;
        loop {
            match async_nats::connect(url).await {
                Ok(client) => {
                    info!(url, "connected to NATS");
                    return Ok(NatsBus { client });
                }
                Err(e) if retry.allows(attempt) => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        url,
                        attempt = attempt + 1,
                        max = retry.max_attempts,
                        error = %e,
                        "NATS connect failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(BusError::Connect(format!(
                        "{url}: {e} (after {} attempts)",
                        attempt + 1
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> BusResult<()> {
        envelope.validate()?;
        let payload = envelope.to_wire()?;
        self.client
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        debug!(topic, event_id = %envelope.event_id, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> BusResult<()> {
        let mut subscriber =
            self.client
                .subscribe(topic.to_string())
                .await
                .map_err(|e| BusError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;

        let topic = topic.to_string();
        let task_topic = topic.clone();
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                match Envelope::from_wire(&message.payload) {
                    Ok(envelope) => handler.handle(&task_topic, envelope).await,
                    Err(e) => {
                        warn!(topic = %task_topic, error = %e, "dropping bad payload");
                    }
                }
            }
            debug!(topic = %task_topic, "subscription closed");
        });

        info!(topic = %topic, "subscribed");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn close(&self) -> BusResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Disconnected(e.to_string()))?;
        Ok(())
    }
}
