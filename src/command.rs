//! In-process command dispatch.
//!
//! A command has exactly one handler, bound during startup. Sending a command
//! awaits that handler and hands its result back to the caller; the broker is
//! never involved.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::bus::{simple_type_name, HandlerError};

/// An intent addressed to a single handler.
pub trait Command: Send + 'static {
    type Output: Send + 'static;

    fn command_name() -> &'static str {
        simple_type_name(std::any::type_name::<Self>())
    }
}

/// Handles one command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    async fn handle(&self, command: C) -> Result<C::Output, HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("No handler bound for command '{0}'")]
    NoHandler(&'static str),

    #[error("Command '{0}' already has a bound handler")]
    DuplicateHandler(&'static str),

    #[error("Handler for command '{command}' failed: {source}")]
    Handler {
        command: &'static str,
        #[source]
        source: HandlerError,
    },
}

/// Routes each command type to its single bound handler.
#[derive(Default)]
pub struct Mediator {
    handlers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Mediator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` as the handler for `C`.
    pub fn register<C, H>(&mut self, handler: H) -> Result<&mut Self, CommandError>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        if self.handlers.contains_key(&TypeId::of::<C>()) {
            return Err(CommandError::DuplicateHandler(C::command_name()));
        }

        let handler: Arc<dyn CommandHandler<C>> = Arc::new(handler);
        self.handlers.insert(TypeId::of::<C>(), Box::new(handler));
        debug!(command = C::command_name(), "Command handler bound");
        Ok(self)
    }

    pub fn is_bound<C: Command>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<C>())
    }

    /// Run `command` through its handler and return the handler's output.
    pub async fn send<C: Command>(&self, command: C) -> Result<C::Output, CommandError> {
        let handler = self
            .handlers
            .get(&TypeId::of::<C>())
            .and_then(|handler| handler.downcast_ref::<Arc<dyn CommandHandler<C>>>())
            .map(Arc::clone)
            .ok_or(CommandError::NoHandler(C::command_name()))?;

        handler
            .handle(command)
            .await
            .map_err(|source| CommandError::Handler {
                command: C::command_name(),
                source,
            })
    }
}
