use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::ChannelBroker;
use crate::command::CommandHandler;
use crate::resolve::ServiceContainer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    order_id: u64,
}
impl Event for OrderCreated {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderShipped {
    order_id: u64,
}
impl Event for OrderShipped {}

struct AuditHandler;

#[async_trait]
impl EventHandler<OrderCreated> for AuditHandler {
    async fn handle(&self, _event: &OrderCreated) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

#[async_trait]
impl EventHandler<OrderShipped> for AuditHandler {
    async fn handle(&self, _event: &OrderShipped) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

struct Ping;
impl Command for Ping {
    type Output = &'static str;
}

#[derive(Default)]
struct PingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandHandler<Ping> for PingHandler {
    async fn handle(&self, _command: Ping) -> std::result::Result<&'static str, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("pong")
    }
}

fn builder(broker: &ChannelBroker) -> EventBusBuilder {
    let mut services = ServiceContainer::new();
    services.add_transient(|_| AuditHandler);
    EventBusBuilder::new(Arc::new(broker.clone()), Arc::new(services))
}

#[test]
fn test_subscribe_is_chainable() {
    let broker = ChannelBroker::new();
    let mut builder = builder(&broker);

    builder
        .subscribe::<OrderCreated, AuditHandler>()
        .unwrap()
        .subscribe::<OrderShipped, AuditHandler>()
        .unwrap();

    let names: Vec<_> = builder.registry().event_names().collect();
    assert_eq!(names, vec!["OrderCreated", "OrderShipped"]);
}

#[test]
fn test_duplicate_subscription_keeps_first() {
    let broker = ChannelBroker::new();
    let mut builder = builder(&broker);
    builder.subscribe::<OrderCreated, AuditHandler>().unwrap();

    let err = builder
        .subscribe::<OrderCreated, AuditHandler>()
        .err()
        .unwrap();

    assert!(matches!(err, BusError::DuplicateSubscription { .. }));
    assert_eq!(builder.registry().handlers("OrderCreated").len(), 1);
}

#[tokio::test]
async fn test_start_launches_one_dispatcher_per_event_name() {
    let broker = ChannelBroker::new();
    let mut builder = builder(&broker);
    builder
        .subscribe::<OrderCreated, AuditHandler>()
        .unwrap()
        .subscribe::<OrderShipped, AuditHandler>()
        .unwrap();

    let bus = builder.start().await.unwrap();

    assert_eq!(broker.connection_count(), 2);
    assert_eq!(broker.queues().await, vec!["OrderCreated", "OrderShipped"]);
    assert_eq!(bus.dispatcher_state("OrderCreated"), DispatcherState::Running);
    assert_eq!(bus.dispatcher_state("OrderShipped"), DispatcherState::Running);
    assert_eq!(bus.dispatcher_state("OrderCancelled"), DispatcherState::Stopped);
}

#[tokio::test]
async fn test_start_without_subscriptions_opens_nothing() {
    let broker = ChannelBroker::new();
    let bus = builder(&broker).start().await.unwrap();

    assert_eq!(broker.connection_count(), 0);
    assert!(bus.subscriptions().is_empty());
}

#[tokio::test]
async fn test_start_against_unreachable_broker_fails() {
    let broker = ChannelBroker::new();
    broker.set_unreachable(true);
    let mut builder = builder(&broker);
    builder.subscribe::<OrderCreated, AuditHandler>().unwrap();

    let result = builder.start().await;

    assert!(matches!(result, Err(BusError::Transport(_))));
}

#[tokio::test]
async fn test_publish_against_unreachable_broker_fails() {
    let broker = ChannelBroker::new();
    let bus = builder(&broker).start().await.unwrap();
    broker.set_unreachable(true);

    let result = bus.publish(&OrderCreated { order_id: 1 }).await;

    assert!(matches!(result, Err(BusError::Transport(_))));
    assert_eq!(broker.published_count(), 0);
}

#[tokio::test]
async fn test_publish_opens_one_connection_per_call() {
    let broker = ChannelBroker::new();
    let bus = builder(&broker).start().await.unwrap();

    bus.publish(&OrderCreated { order_id: 1 }).await.unwrap();
    bus.publisher()
        .publish(&OrderShipped { order_id: 1 })
        .await
        .unwrap();

    assert_eq!(broker.connection_count(), 2);
    assert_eq!(broker.published_count(), 2);
}

#[tokio::test]
async fn test_send_command_uses_mediator_only() {
    let broker = ChannelBroker::new();
    let handler = PingHandler::default();
    let calls = Arc::clone(&handler.calls);

    let mut builder = builder(&broker);
    builder.mediator_mut().register::<Ping, _>(handler).unwrap();
    let bus = builder.start().await.unwrap();

    assert_eq!(bus.send_command(Ping).await.unwrap(), "pong");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_send_unbound_command_fails() {
    let broker = ChannelBroker::new();
    let bus = builder(&broker).start().await.unwrap();

    let result = bus.send_command(Ping).await;

    assert!(matches!(
        result,
        Err(BusError::Command(CommandError::NoHandler("Ping")))
    ));
}

#[tokio::test]
async fn test_with_mediator_replaces_bindings() {
    let broker = ChannelBroker::new();
    let mut mediator = Mediator::new();
    mediator
        .register::<Ping, _>(PingHandler::default())
        .unwrap();

    let bus = builder(&broker)
        .with_mediator(mediator)
        .start()
        .await
        .unwrap();

    assert_eq!(bus.send_command(Ping).await.unwrap(), "pong");
}
