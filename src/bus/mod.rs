//! Event bus over a message broker.
//!
//! This module contains:
//! - `Event` / `EventHandler` traits and the JSON wire codec
//! - `Registry`: event names to handlers, filled while building
//! - `Publisher`: encode and send events, one connection per publish
//! - `Dispatcher` / `ConsumerDispatcher`: per-event-name consumer loops
//! - `EventBusBuilder` (registration phase) and `EventBus` (serving phase)
//!
//! Handlers are registered on the builder. `start()` seals the registry and
//! launches one consumer loop per subscribed event name; from then on nothing
//! can be subscribed.

use std::sync::Arc;

use tracing::{debug, info};

use crate::broker::{Broker, TransportError};
use crate::command::{Command, CommandError, Mediator};
use crate::config::ConsumerConfig;
use crate::resolve::ServiceProvider;

pub mod codec;
pub mod dispatcher;
mod event;
pub mod registry;

// Re-exports
pub use codec::CodecError;
pub use dispatcher::{
    log_reporter, ConsumerDispatcher, DispatchError, DispatchOutcome, Dispatcher,
    DispatcherHandle, DispatcherState, ErrorReporter,
};
pub use event::{simple_type_name, Event, EventHandler, HandlerError};
pub use registry::{Registry, RegistrySnapshot};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced to callers of the event bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Handler '{handler}' is already subscribed to '{event}'")]
    DuplicateSubscription {
        event: String,
        handler: &'static str,
    },

    #[error("Event name '{event}' is used by both {existing} and {rejected}")]
    EventNameCollision {
        event: String,
        existing: &'static str,
        rejected: &'static str,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

/// Publishes events to the broker.
///
/// Cheap to clone; command handlers hold one to emit events.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Encode `event` and send it to the destination named after its type.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<()> {
        let name = E::event_name();
        let payload = codec::encode(event)?;
        self.broker.publish(name, payload).await?;
        debug!(event = name, "Event published");
        Ok(())
    }
}

/// Registration phase of an event bus.
pub struct EventBusBuilder {
    broker: Arc<dyn Broker>,
    provider: Arc<dyn ServiceProvider>,
    registry: Registry,
    mediator: Mediator,
    consumer: ConsumerConfig,
    reporter: ErrorReporter,
}

impl EventBusBuilder {
    /// Handlers will be resolved from scopes opened on `provider`.
    pub fn new(broker: Arc<dyn Broker>, provider: Arc<dyn ServiceProvider>) -> Self {
        Self {
            broker,
            provider,
            registry: Registry::new(),
            mediator: Mediator::new(),
            consumer: ConsumerConfig::default(),
            reporter: log_reporter(),
        }
    }

    pub fn with_consumer_config(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }

    /// Replace the default (logging) reporter for dispatch failures.
    pub fn with_error_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_mediator(mut self, mediator: Mediator) -> Self {
        self.mediator = mediator;
        self
    }

    /// Command handler bindings, for registering handlers in place.
    pub fn mediator_mut(&mut self) -> &mut Mediator {
        &mut self.mediator
    }

    /// Subscribe handler type `H` to event `E`.
    ///
    /// `H` is resolved from a fresh scope for every delivered `E`, so it
    /// must be registered with the service provider.
    pub fn subscribe<E: Event, H: EventHandler<E>>(&mut self) -> Result<&mut Self> {
        if self.registry.register::<E, H>()? {
            debug!(event = E::event_name(), "Consumer dispatcher scheduled");
        }
        Ok(self)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Seal the registry and start one consumer loop per subscribed event.
    ///
    /// Fails with `BusError::Transport` if any consumer cannot be set up;
    /// loops already started are stopped again.
    pub async fn start(self) -> Result<EventBus> {
        let registry = Arc::new(self.registry);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            self.provider,
            self.reporter,
        ));

        let mut dispatchers = Vec::new();
        for name in registry.event_names() {
            let handle = ConsumerDispatcher::start(
                Arc::clone(&self.broker),
                name,
                Arc::clone(&dispatcher),
                self.consumer.clone(),
            )
            .await?;
            dispatchers.push(handle);
        }

        info!(dispatchers = dispatchers.len(), "Event bus started");

        Ok(EventBus {
            publisher: Publisher::new(self.broker),
            registry,
            mediator: self.mediator,
            dispatchers,
        })
    }
}

/// Serving phase of an event bus.
///
/// Dropping it stops every consumer loop.
pub struct EventBus {
    publisher: Publisher,
    registry: Arc<Registry>,
    mediator: Mediator,
    dispatchers: Vec<DispatcherHandle>,
}

impl EventBus {
    pub async fn publish<E: Event>(&self, event: &E) -> Result<()> {
        self.publisher.publish(event).await
    }

    /// Run `command` through its bound handler. The broker is not involved.
    pub async fn send_command<C: Command>(&self, command: C) -> Result<C::Output> {
        Ok(self.mediator.send(command).await?)
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Event names mapped to their handler names.
    pub fn subscriptions(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// State of the consumer loop for `event_name`.
    ///
    /// `Stopped` when nothing is subscribed to it.
    pub fn dispatcher_state(&self, event_name: &str) -> DispatcherState {
        self.dispatchers
            .iter()
            .find(|handle| handle.event_name() == event_name)
            .map(DispatcherHandle::state)
            .unwrap_or(DispatcherState::Stopped)
    }
}

#[cfg(all(test, feature = "channel"))]
mod tests;
