//! Consumer dispatch.
//!
//! `Dispatcher` turns one inbound payload into handler invocations:
//! look up the event type by name, decode, then run every subscribed handler
//! in order, each resolved from a fresh scope. Failures are contained per
//! handler and passed to an `ErrorReporter`; they never reach the broker
//! client.
//!
//! `ConsumerDispatcher` runs the long-lived loop for one event name, feeding
//! broker deliveries into a shared `Dispatcher` and reconnecting when the
//! delivery stream ends.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::{future, FutureExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::codec::CodecError;
use super::event::HandlerError;
use super::registry::Registry;
use crate::broker::{Broker, Delivery, DeliveryStream, TransportError};
use crate::config::ConsumerConfig;
use crate::resolve::ServiceProvider;

/// Problems met while dispatching a single delivery.
///
/// Only `Decode`, `HandlerInvocation` and `HandlerPanicked` are passed to the
/// `ErrorReporter`. The rest are expected conditions, logged at debug level.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No event type registered for '{0}'")]
    UnknownEventType(String),

    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("Handler '{handler}' for '{event}' could not be resolved")]
    HandlerResolution {
        event: String,
        handler: &'static str,
    },

    #[error("Handler '{handler}' failed on '{event}': {source}")]
    HandlerInvocation {
        event: String,
        handler: &'static str,
        #[source]
        source: HandlerError,
    },

    #[error("Handler '{handler}' panicked on '{event}': {message}")]
    HandlerPanicked {
        event: String,
        handler: &'static str,
        message: String,
    },
}

/// Receives every dispatch failure worth reporting.
pub type ErrorReporter = Arc<dyn Fn(&DispatchError) + Send + Sync>;

/// Default reporter: log at error level.
pub fn log_reporter() -> ErrorReporter {
    Arc::new(|err: &DispatchError| {
        error!(error = %err, "Event dispatch failed");
    })
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Unknown event name, or nothing subscribed to it.
    Skipped,
    /// Handlers ran. `failed` of them returned an error or panicked, either
    /// while being resolved or while handling the event.
    Dispatched { invoked: usize, failed: usize },
    /// The payload could not be decoded.
    DecodeFailed,
}

impl DispatchOutcome {
    /// Whether the delivery should be acknowledged (rather than rejected).
    pub fn should_ack(&self) -> bool {
        !matches!(self, DispatchOutcome::DecodeFailed)
    }
}

/// Shared dispatch state for every consumer loop of one event bus.
pub struct Dispatcher {
    registry: Arc<Registry>,
    provider: Arc<dyn ServiceProvider>,
    reporter: ErrorReporter,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        provider: Arc<dyn ServiceProvider>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            registry,
            provider,
            reporter,
        }
    }

    /// Dispatch one encoded event to its handlers.
    pub async fn dispatch(&self, event_name: &str, payload: &[u8]) -> DispatchOutcome {
        let Some(event_type) = self.registry.event_type(event_name) else {
            let err = DispatchError::UnknownEventType(event_name.to_string());
            debug!(error = %err, "Skipping delivery");
            return DispatchOutcome::Skipped;
        };

        let handlers = self.registry.handlers(event_name);
        if handlers.is_empty() {
            debug!(event = %event_name, "No handlers subscribed, skipping delivery");
            return DispatchOutcome::Skipped;
        }

        let event = match event_type.decode(payload) {
            Ok(event) => event,
            Err(err) => {
                (self.reporter)(&DispatchError::Decode(err));
                return DispatchOutcome::DecodeFailed;
            }
        };

        let mut invoked = 0;
        let mut failed = 0;

        for registration in handlers {
            let handler = registration.handler_name();

            // Fresh scope per handler invocation; dropped before the handler runs.
            // Factories are user code: a panic there is contained like one in `handle`.
            let resolved = panic::catch_unwind(AssertUnwindSafe(|| {
                let scope = self.provider.create_scope();
                registration.invoke(scope.as_ref(), Arc::clone(&event))
            }));

            let invocation = match resolved {
                Ok(Some(invocation)) => invocation,
                Ok(None) => {
                    let err = DispatchError::HandlerResolution {
                        event: event_name.to_string(),
                        handler,
                    };
                    debug!(error = %err, "Skipping handler");
                    continue;
                }
                Err(panic) => {
                    failed += 1;
                    (self.reporter)(&DispatchError::HandlerPanicked {
                        event: event_name.to_string(),
                        handler,
                        message: panic_message(panic.as_ref()),
                    });
                    continue;
                }
            };

            invoked += 1;
            let failure = match AssertUnwindSafe(invocation).catch_unwind().await {
                Ok(Ok(())) => {
                    debug!(event = %event_name, handler, "Handler completed");
                    None
                }
                Ok(Err(source)) => Some(DispatchError::HandlerInvocation {
                    event: event_name.to_string(),
                    handler,
                    source,
                }),
                Err(panic) => Some(DispatchError::HandlerPanicked {
                    event: event_name.to_string(),
                    handler,
                    message: panic_message(panic.as_ref()),
                }),
            };

            if let Some(err) = failure {
                failed += 1;
                (self.reporter)(&err);
            }
        }

        DispatchOutcome::Dispatched { invoked, failed }
    }

    /// Dispatch a broker delivery and settle it according to the outcome.
    pub async fn process(&self, delivery: Delivery) {
        let outcome = self.dispatch(&delivery.routing_key, &delivery.body).await;

        let settled = if outcome.should_ack() {
            delivery.ack().await
        } else {
            delivery.reject().await
        };

        if let Err(e) = settled {
            warn!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Failed to settle delivery"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Lifecycle of a consumer dispatcher loop.
///
/// There is no graceful stop: a loop runs until its handle is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Running,
}

/// Owns a running consumer loop. Dropping it aborts the loop.
#[derive(Debug)]
pub struct DispatcherHandle {
    event_name: String,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn state(&self) -> DispatcherState {
        if self.task.is_finished() {
            DispatcherState::Stopped
        } else {
            DispatcherState::Running
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts consumer loops.
pub struct ConsumerDispatcher;

impl ConsumerDispatcher {
    /// Start consuming `event_name` and dispatching its deliveries.
    ///
    /// The first consumer is set up before returning, so an unreachable broker
    /// fails here. Later stream failures are retried inside the loop.
    pub async fn start(
        broker: Arc<dyn Broker>,
        event_name: &str,
        dispatcher: Arc<Dispatcher>,
        config: ConsumerConfig,
    ) -> Result<DispatcherHandle, TransportError> {
        let stream = broker.consume(event_name, config.ack_mode).await?;

        info!(
            event = %event_name,
            ack_mode = ?config.ack_mode,
            concurrency = config.concurrency,
            "Consumer dispatcher started"
        );

        let span = info_span!("bus.consume", event = %event_name);
        let task = tokio::spawn(
            Self::consume_with_reconnect(
                broker,
                event_name.to_string(),
                dispatcher,
                config,
                stream,
            )
            .instrument(span),
        );

        Ok(DispatcherHandle {
            event_name: event_name.to_string(),
            task,
        })
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    async fn consume_with_reconnect(
        broker: Arc<dyn Broker>,
        event_name: String,
        dispatcher: Arc<Dispatcher>,
        config: ConsumerConfig,
        mut stream: DeliveryStream,
    ) {
        let max_delay = config.reconnect_max_delay();
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(config.reconnect_min_delay())
            .with_max_delay(max_delay)
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            Self::drain(&mut stream, &dispatcher, config.concurrency).await;
            info!(event = %event_name, "Consumer stream ended, reconnecting");
            stream.close().await;

            stream = loop {
                let delay: Duration = backoff_iter.next().unwrap_or(max_delay);
                tokio::time::sleep(delay).await;

                match broker.consume(&event_name, config.ack_mode).await {
                    Ok(stream) => {
                        info!(event = %event_name, "Consumer reconnected");
                        backoff_iter = backoff_builder.build();
                        break stream;
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            backoff_ms = %delay.as_millis(),
                            event = %event_name,
                            "Failed to set up consumer, retrying after backoff"
                        );
                    }
                }
            };
        }
    }

    /// Process deliveries until the stream ends or yields an error.
    async fn drain(stream: &mut DeliveryStream, dispatcher: &Arc<Dispatcher>, concurrency: usize) {
        stream
            .take_while(|item| {
                if let Err(e) = item {
                    error!(error = %e, "Consumer delivery error, will reconnect");
                }
                future::ready(item.is_ok())
            })
            .filter_map(|item| future::ready(item.ok()))
            .for_each_concurrent(concurrency.max(1), |delivery| {
                let dispatcher = Arc::clone(dispatcher);
                async move { dispatcher.process(delivery).await }
            })
            .await;
    }
}
