//! In-memory channel-based broker for standalone mode.
//!
//! Each destination is a named queue backed by an unbounded tokio channel.
//! Consumers of the same destination compete for messages, as they would on a
//! shared RabbitMQ queue. Ideal for local development and testing without
//! external dependencies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::{AckMode, Acker, Broker, Delivery, DeliveryStream, Result, TransportError};

/// Message as stored in a queue.
struct Envelope {
    routing_key: String,
    body: Vec<u8>,
}

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>;

/// A declared queue.
struct Queue {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: SharedReceiver,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    published: AtomicUsize,
    acked: AtomicUsize,
    rejected: AtomicUsize,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, Queue>>,
    unreachable: AtomicBool,
    counters: Counters,
}

/// In-process broker using tokio channels.
///
/// Clones share the same queues, so a publisher and any number of event buses
/// in one process can talk through a single instance.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    inner: Arc<Inner>,
}

impl ChannelBroker {
    /// Create a new channel broker with no declared queues.
    pub fn new() -> Self {
        info!("Channel broker initialized");
        Self::default()
    }

    /// Simulate the broker going down (or coming back).
    ///
    /// While unreachable every new connection fails. Consumers that are
    /// already running keep their queue.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Put a raw message on `destination` with an arbitrary routing key.
    pub async fn inject(&self, destination: &str, routing_key: &str, body: Vec<u8>) {
        let sender = self.declare(destination).await;
        // The queue owns its receiver, so the channel cannot be closed.
        let _ = sender.send(Envelope {
            routing_key: routing_key.to_string(),
            body,
        });
    }

    /// Number of connections opened so far (one per publish or consume).
    pub fn connection_count(&self) -> usize {
        self.inner.counters.connections.load(Ordering::SeqCst)
    }

    /// Number of messages published through `Broker::publish`.
    pub fn published_count(&self) -> usize {
        self.inner.counters.published.load(Ordering::SeqCst)
    }

    /// Number of acknowledged deliveries, including auto-acknowledged ones.
    pub fn acked_count(&self) -> usize {
        self.inner.counters.acked.load(Ordering::SeqCst)
    }

    /// Number of rejected deliveries.
    pub fn rejected_count(&self) -> usize {
        self.inner.counters.rejected.load(Ordering::SeqCst)
    }

    /// Names of all declared queues, sorted.
    pub async fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.queues.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn connect(&self) -> Result<()> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(
                "Channel broker is unreachable".to_string(),
            ));
        }
        self.inner.counters.connections.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Declare a queue if absent and return its sender.
    async fn declare(&self, destination: &str) -> mpsc::UnboundedSender<Envelope> {
        let mut queues = self.inner.queues.lock().await;
        queues
            .entry(destination.to_string())
            .or_insert_with(Queue::new)
            .sender
            .clone()
    }

    async fn receiver(&self, destination: &str) -> SharedReceiver {
        let mut queues = self.inner.queues.lock().await;
        queues
            .entry(destination.to_string())
            .or_insert_with(Queue::new)
            .receiver
            .clone()
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(destination = %destination))]
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> Result<()> {
        self.connect()?;

        let sender = self.declare(destination).await;
        let bytes = payload.len();
        sender
            .send(Envelope {
                routing_key: destination.to_string(),
                body: payload,
            })
            .map_err(|_| TransportError::Publish(format!("Queue '{}' is closed", destination)))?;

        self.inner.counters.published.fetch_add(1, Ordering::SeqCst);
        debug!(destination = %destination, bytes, "Published message to channel");

        Ok(())
    }

    async fn consume(&self, destination: &str, ack_mode: AckMode) -> Result<DeliveryStream> {
        self.connect()?;

        let receiver = self.receiver(destination).await;
        let inner = Arc::clone(&self.inner);

        let deliveries = futures::stream::unfold(receiver, move |receiver| {
            let inner = Arc::clone(&inner);
            async move {
                let envelope = receiver.lock().await.recv().await?;
                let delivery = Delivery::new(envelope.routing_key, envelope.body);

                let delivery = match ack_mode {
                    AckMode::Auto => {
                        inner.counters.acked.fetch_add(1, Ordering::SeqCst);
                        delivery
                    }
                    AckMode::AfterDispatch => {
                        delivery.with_acker(Box::new(ChannelAcker { inner }))
                    }
                };

                Some((Ok::<_, TransportError>(delivery), receiver))
            }
        })
        .boxed();

        info!(queue = %destination, ack_mode = ?ack_mode, "Channel consumer started");

        Ok(DeliveryStream::new(deliveries))
    }
}

/// Records settlements in the broker's counters.
struct ChannelAcker {
    inner: Arc<Inner>,
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        self.inner.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.inner.counters.rejected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
