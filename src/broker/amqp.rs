//! AMQP (RabbitMQ) broker implementation.
//!
//! Uses the default exchange: the event name is both the queue name and the
//! routing key. Queues are declared non-durable, non-exclusive and without
//! auto-delete, and messages carry no priority, TTL or persistence flags.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AckMode, Acker, Broker, Delivery, DeliveryStream, Result, StreamCloser, TransportError,
    CONTENT_TYPE,
};

/// The default (nameless, direct) exchange.
const DEFAULT_EXCHANGE: &str = "";

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ broker.
///
/// Opens a fresh connection per publish and per consumer; nothing is pooled.
#[derive(Clone, Debug)]
pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    /// Create a broker for the given AMQP URL (e.g., amqp://localhost:5672).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open a connection and a channel on it.
    async fn connect(&self) -> Result<(Connection, Channel)> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect: {}", e)))?;

        match connection.create_channel().await {
            Ok(channel) => Ok((connection, channel)),
            Err(e) => {
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "OK").await {
                    warn!(error = %close_err, "Failed to close connection");
                }
                Err(TransportError::Connection(format!(
                    "Failed to create channel: {}",
                    e
                )))
            }
        }
    }

    async fn declare(channel: &Channel, destination: &str) -> Result<()> {
        channel
            .queue_declare(
                destination,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Declare {
                destination: destination.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn send(channel: &Channel, destination: &str, payload: &[u8]) -> Result<()> {
        Self::declare(channel, destination).await?;

        channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                destination,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type(CONTENT_TYPE.into()),
            )
            .await
            .map_err(|e| TransportError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| TransportError::Publish(format!("Publish confirmation failed: {}", e)))?;

        Ok(())
    }

    async fn close(connection: Connection, channel: Channel) {
        if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
            warn!(error = %e, "Failed to close channel");
        }
        if let Err(e) = connection.close(REPLY_SUCCESS, "OK").await {
            warn!(error = %e, "Failed to close connection");
        }
    }

    async fn start_consumer(
        channel: &Channel,
        destination: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<Consumer> {
        Self::declare(channel, destination).await?;

        channel
            .basic_consume(
                destination,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: ack_mode == AckMode::Auto,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(format!("Failed to start consumer: {}", e)))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(destination = %destination))]
    async fn publish(&self, destination: &str, payload: Vec<u8>) -> Result<()> {
        let (connection, channel) = self.connect().await?;

        let result = Self::send(&channel, destination, &payload).await;
        Self::close(connection, channel).await;
        result?;

        debug!(
            destination = %destination,
            bytes = payload.len(),
            "Published message"
        );

        Ok(())
    }

    async fn consume(&self, destination: &str, ack_mode: AckMode) -> Result<DeliveryStream> {
        let (connection, channel) = self.connect().await?;

        let consumer_tag = consumer_tag(destination);
        let consumer = match Self::start_consumer(&channel, destination, &consumer_tag, ack_mode)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                Self::close(connection, channel).await;
                return Err(e);
            }
        };

        info!(
            queue = %destination,
            consumer_tag = %consumer_tag,
            ack_mode = ?ack_mode,
            "Consumer started"
        );

        let manual_ack = ack_mode == AckMode::AfterDispatch;
        let deliveries = consumer
            .map(move |delivery| -> Result<Delivery> {
                let delivery = delivery
                    .map_err(|e| TransportError::Consume(format!("Delivery error: {}", e)))?;
                let routing_key = delivery.routing_key.as_str().to_owned();
                let lapin::message::Delivery { data, acker, .. } = delivery;

                let delivery = Delivery::new(routing_key, data);
                Ok(if manual_ack {
                    delivery.with_acker(Box::new(AmqpAcker(acker)))
                } else {
                    delivery
                })
            })
            .boxed();

        Ok(DeliveryStream::new(deliveries).with_closer(Box::new(ConsumerConnection {
            consumer_tag,
            connection,
            channel,
        })))
    }
}

/// Unique per consumer, prefixed with the queue it reads.
fn consumer_tag(destination: &str) -> String {
    format!("{}-{}", destination, Uuid::new_v4())
}

/// The dedicated connection behind one consumer.
struct ConsumerConnection {
    consumer_tag: String,
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl StreamCloser for ConsumerConnection {
    async fn close(self: Box<Self>) {
        debug!(consumer_tag = %self.consumer_tag, "Closing consumer connection");
        let ConsumerConnection {
            connection, channel, ..
        } = *self;
        AmqpBroker::close(connection, channel).await;
    }
}

/// Settles a delivery on the channel it arrived on.
struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Ack(format!("Failed to ack message: {}", e)))
    }

    async fn reject(&self) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Ack(format!("Failed to reject message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_keeps_url() {
        let broker = AmqpBroker::new("amqp://localhost:5672");
        assert_eq!(broker.url(), "amqp://localhost:5672");
    }

    #[tokio::test]
    async fn test_publish_to_unreachable_broker_fails_with_connection_error() {
        // Port 1 is reserved and never accepts AMQP connections.
        let broker = AmqpBroker::new("amqp://127.0.0.1:1");
        let result = broker.publish("OrderCreated", b"{}".to_vec()).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn test_consume_from_unreachable_broker_fails_with_connection_error() {
        let broker = AmqpBroker::new("amqp://127.0.0.1:1");
        let result = broker.consume("OrderCreated", AckMode::Auto).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }

    #[test]
    fn test_consumer_tags_are_unique_per_consumer() {
        let first = consumer_tag("OrderCreated");
        let second = consumer_tag("OrderCreated");

        assert!(first.starts_with("OrderCreated-"));
        assert!(second.starts_with("OrderCreated-"));
        assert_ne!(first, second);
    }
}
