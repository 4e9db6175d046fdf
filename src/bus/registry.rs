//! Handler registry.
//!
//! Maps each event name to the handlers subscribed to it, in subscription
//! order, and to the concrete event type used to decode inbound payloads.
//! Everything a delivery needs is captured as typed adapters at subscription
//! time, so dispatch never inspects types at runtime.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use super::codec::{self, CodecError};
use super::event::{simple_type_name, Event, EventHandler, HandlerError};
use super::{BusError, Result};
use crate::resolve::{Instance, ResolutionScope};

/// A decoded event, shared by every handler of one message.
pub(crate) type DecodedEvent = Instance;

type DecodeFn = fn(&[u8]) -> std::result::Result<DecodedEvent, CodecError>;

type InvokeFn = Arc<
    dyn Fn(&dyn ResolutionScope, DecodedEvent) -> Option<BoxFuture<'static, std::result::Result<(), HandlerError>>>
        + Send
        + Sync,
>;

fn decode_as<E: Event>(payload: &[u8]) -> std::result::Result<DecodedEvent, CodecError> {
    codec::decode::<E>(payload).map(|event| Arc::new(event) as DecodedEvent)
}

/// Concrete type registered under an event name.
#[derive(Clone)]
pub struct EventType {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

impl EventType {
    fn of<E: Event>() -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            decode: decode_as::<E>,
        }
    }

    /// Full Rust type name of the event.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn decode(&self, payload: &[u8]) -> std::result::Result<DecodedEvent, CodecError> {
        (self.decode)(payload)
    }
}

impl std::fmt::Debug for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventType")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// One handler subscribed to one event name.
#[derive(Clone)]
pub struct HandlerRegistration {
    handler_type: TypeId,
    handler_name: &'static str,
    invoke: InvokeFn,
}

impl HandlerRegistration {
    fn of<E: Event, H: EventHandler<E>>() -> Self {
        let invoke: InvokeFn = Arc::new(|scope: &dyn ResolutionScope, event: DecodedEvent| {
            let handler = scope.resolve::<H>()?;
            let event = event.downcast::<E>().ok()?;
            let invocation: BoxFuture<'static, std::result::Result<(), HandlerError>> =
                Box::pin(async move { handler.handle(&event).await });
            Some(invocation)
        });

        Self {
            handler_type: TypeId::of::<H>(),
            handler_name: simple_type_name(std::any::type_name::<H>()),
            invoke,
        }
    }

    /// Simple name of the handler type.
    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    /// Resolve the handler from `scope` and start handling `event`.
    ///
    /// Returns `None` when the scope cannot provide a handler instance.
    pub(crate) fn invoke(
        &self,
        scope: &dyn ResolutionScope,
        event: DecodedEvent,
    ) -> Option<BoxFuture<'static, std::result::Result<(), HandlerError>>> {
        (self.invoke)(scope, event)
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("handler_name", &self.handler_name)
            .finish()
    }
}

/// Event name to handler names, as seen by `Registry::snapshot`.
pub type RegistrySnapshot = BTreeMap<String, Vec<&'static str>>;

/// Handler registry and type resolution table.
#[derive(Default, Debug)]
pub struct Registry {
    handlers: HashMap<String, Vec<HandlerRegistration>>,
    event_types: HashMap<String, EventType>,
    /// Event names in order of first subscription.
    names: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `H` to `E`.
    ///
    /// Returns `true` when this is the first subscription for the event name.
    pub fn register<E: Event, H: EventHandler<E>>(&mut self) -> Result<bool> {
        let name = E::event_name();
        let handler = HandlerRegistration::of::<E, H>();

        if let Some(existing) = self.event_types.get(name) {
            if existing.type_id != TypeId::of::<E>() {
                return Err(BusError::EventNameCollision {
                    event: name.to_string(),
                    existing: existing.type_name,
                    rejected: std::any::type_name::<E>(),
                });
            }
        }

        if self
            .handlers(name)
            .iter()
            .any(|registered| registered.handler_type == handler.handler_type)
        {
            return Err(BusError::DuplicateSubscription {
                event: name.to_string(),
                handler: handler.handler_name,
            });
        }

        let first = !self.event_types.contains_key(name);
        if first {
            self.event_types.insert(name.to_string(), EventType::of::<E>());
            self.names.push(name.to_string());
        }

        debug!(event = name, handler = handler.handler_name, "Handler subscribed");
        self.handlers.entry(name.to_string()).or_default().push(handler);

        Ok(first)
    }

    /// Handlers subscribed to `event_name`, in subscription order.
    pub fn handlers(&self, event_name: &str) -> &[HandlerRegistration] {
        self.handlers
            .get(event_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Concrete event type registered under `event_name`.
    pub fn event_type(&self, event_name: &str) -> Option<&EventType> {
        self.event_types.get(event_name)
    }

    /// Subscribed event names, in order of first subscription.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Copy of the registry contents, for inspection.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.handlers
            .iter()
            .map(|(name, handlers)| {
                (
                    name.clone(),
                    handlers.iter().map(|h| h.handler_name).collect(),
                )
            })
            .collect()
    }
}
