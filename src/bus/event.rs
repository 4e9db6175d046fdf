//! Event and handler traits.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error returned by event and command handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A fact broadcast to zero or more handlers through the broker.
///
/// The event name doubles as the broker destination and routing key, so it
/// must be unique per process. Names are derived from the type's simple
/// identifier; override `event_name` when two types share one.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn event_name() -> &'static str {
        simple_type_name(std::any::type_name::<Self>())
    }
}

/// Handles one event type.
///
/// Instances are resolved from a fresh scope for every delivered message.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: &E) -> Result<(), HandlerError>;
}

/// Strip the module path and any generic arguments from a type name.
///
/// `app::orders::OrderCreated` becomes `OrderCreated`, and
/// `app::Envelope<app::Payload>` becomes `Envelope`.
pub fn simple_type_name(type_name: &'static str) -> &'static str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}
