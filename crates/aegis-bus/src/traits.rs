//! Bus trait definitions
//!
//! `MessageBus` is the seam every component is written against; tests and
//! single-process demos inject [`crate::MemoryBus`], production wires
//! [`crate::NatsBus`]. Construction establishes the connection, so a bus
//! value in hand is a connected bus (or one whose backend reconnects on its
//! own).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use aegis_domain::Envelope;

use crate::BusResult;

/// Handler invoked for every message arriving on a subscription.
///
/// Handlers must not panic and must not assume exactly-once delivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, topic: &str, envelope: Envelope);
}

/// Uniform publish/subscribe surface over a single backend.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an envelope to a topic. Fails with a retriable error while
    /// the backend is disconnected.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> BusResult<()>;

    /// Subscribe a handler to a topic. The handler runs serially with
    /// respect to other messages on the same subscription.
    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> BusResult<()>;

    /// Whether the backend connection is currently live.
    async fn is_connected(&self) -> bool;

    /// Stop dispatchers and release the connection.
    async fn close(&self) -> BusResult<()>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(String, Envelope) -> HandlerFuture + Send + Sync,
{
    async fn handle(&self, topic: &str, envelope: Envelope) {
        (self.0)(topic.to_string(), envelope).await;
    }
}

/// Wrap an async closure as an [`EventHandler`].
///
/// ```rust,ignore
/// bus.subscribe(topics::POWER_FAILURE, handler_fn(|topic, envelope| {
///     Box::pin(async move { /* ... */ })
/// })).await?;
/// ```
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(String, Envelope) -> HandlerFuture + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}
