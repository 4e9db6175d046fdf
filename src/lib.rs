//! microbus - broker-backed event bus
//!
//! Events are published to a message broker under their type name and
//! delivered to every handler subscribed to that name, each resolved from a
//! fresh dependency scope. Commands never leave the process: each has exactly
//! one handler, invoked directly with its result handed back to the caller.
//!
//! ```ignore
//! let mut services = ServiceContainer::new();
//! services.add_transient(|_| HandlerA);
//!
//! let mut builder = EventBusBuilder::new(broker, Arc::new(services));
//! builder.subscribe::<OrderCreated, HandlerA>()?;
//! let bus = builder.start().await?;
//!
//! bus.publish(&OrderCreated { order_id: 42 }).await?;
//! ```

pub mod broker;
pub mod bus;
pub mod command;
pub mod config;
pub mod resolve;
pub mod utils;

pub use broker::{init_broker, AckMode, Broker, TransportError};
pub use bus::{
    BusError, Event, EventBus, EventBusBuilder, EventHandler, HandlerError, Publisher,
};
pub use command::{Command, CommandError, CommandHandler, Mediator};
pub use config::Config;
pub use resolve::{ResolutionScope, ServiceContainer, ServiceProvider};
