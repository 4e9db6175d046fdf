//! Broker connections.
//!
//! This module contains:
//! - `Broker` trait: name-addressed publish and consume against a message broker
//! - `Delivery` / `DeliveryStream`: inbound messages and their acknowledgement
//! - Implementations: AMQP (RabbitMQ), in-process channels
//!
//! A broker holds no long-lived connection. Every publish opens and closes its
//! own connection and channel; every consumer owns a dedicated connection
//! until its delivery stream is closed or dropped.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{MessagingConfig, MessagingType};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "channel")]
pub mod channel;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
#[cfg(feature = "channel")]
pub use channel::ChannelBroker;

/// Content type stamped on every published message.
pub const CONTENT_TYPE: &str = "application/json";

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Failed to declare '{destination}': {message}")]
    Declare {
        destination: String,
        message: String,
    },

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),
}

/// When an inbound message is acknowledged to the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The broker considers the message acknowledged as soon as it is delivered.
    /// A failure or crash while handling it loses the message.
    #[default]
    Auto,
    /// Acknowledge after every handler has run. Undecodable messages are
    /// rejected without requeue.
    AfterDispatch,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self) -> Result<()>;
}

/// A message received from a destination.
pub struct Delivery {
    /// Routing key the message was published with (the event name).
    pub routing_key: String,
    /// Encoded event payload.
    pub body: Vec<u8>,
    /// Present only when the consumer was started with `AckMode::AfterDispatch`.
    pub acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Box<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Acknowledge the message. No-op for auto-acknowledged deliveries.
    pub async fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Reject the message without requeue. No-op for auto-acknowledged deliveries.
    pub async fn reject(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.reject().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("bytes", &self.body.len())
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}

/// Releases whatever a consumer holds open on the broker side.
#[async_trait]
pub trait StreamCloser: Send {
    async fn close(self: Box<Self>);
}

/// Stream of deliveries from one destination.
///
/// Keeps the consumer's connection alive until closed. Dropping an unclosed
/// stream spawns the close on the current tokio runtime, if there is one.
pub struct DeliveryStream {
    inner: BoxStream<'static, Result<Delivery>>,
    closer: Option<Box<dyn StreamCloser>>,
}

impl DeliveryStream {
    pub fn new(inner: BoxStream<'static, Result<Delivery>>) -> Self {
        Self {
            inner,
            closer: None,
        }
    }

    pub fn with_closer(mut self, closer: Box<dyn StreamCloser>) -> Self {
        self.closer = Some(closer);
        self
    }

    /// Close the underlying consumer. Later calls, and the drop, do nothing.
    pub async fn close(&mut self) {
        self.inner = futures::stream::empty().boxed();
        if let Some(closer) = self.closer.take() {
            closer.close().await;
        }
    }
}

impl Drop for DeliveryStream {
    fn drop(&mut self) {
        let Some(closer) = self.closer.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(closer.close());
            }
            Err(_) => debug!("No runtime to close delivery stream on, dropping it"),
        }
    }
}

impl Stream for DeliveryStream {
    type Item = Result<Delivery>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Name-addressed access to a message broker.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP, default exchange
/// - `ChannelBroker`: In-process queues for standalone mode and tests
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare `destination` and send `payload` to it, routed by the same name.
    ///
    /// Declaring is idempotent. One attempt, no retry.
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> Result<()>;

    /// Open a dedicated connection, declare `destination` and start consuming it.
    async fn consume(&self, destination: &str, ack_mode: AckMode) -> Result<DeliveryStream>;
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a broker based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - AMQP: `--features amqp`
/// - Channel: `--features channel` (included in default)
pub fn init_broker(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker = AmqpBroker::new(config.amqp.url.clone());
                info!(messaging_type = "amqp", url = %config.amqp.url, "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
        MessagingType::Channel => {
            #[cfg(feature = "channel")]
            {
                info!(messaging_type = "channel", "Broker initialized");
                Ok(Arc::new(ChannelBroker::new()))
            }

            #[cfg(not(feature = "channel"))]
            {
                Err("Channel support requires the 'channel' feature. Rebuild with --features channel".into())
            }
        }
    }
}
