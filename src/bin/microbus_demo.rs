//! microbus-demo: money transfer walkthrough
//!
//! Sends a `CreateTransfer` command in process. Its handler publishes a
//! `TransferCreated` event through the broker, and a transfer-log handler
//! consumes it and stores it in an in-memory repository.
//!
//! ## Architecture
//! ```text
//! send_command(CreateTransfer) --> CreateTransferHandler --publish--> [broker: TransferCreated]
//!                                                                            |
//!                                                                            v
//!                                               TransferLogHandler --> InMemoryTransferRepository
//! ```
//!
//! ## Configuration
//! - MICROBUS_CONFIG: Path to a YAML config file (optional)
//! - MICROBUS__MESSAGING__TYPE: `channel` (default) or `amqp` (needs `--features amqp`)
//! - MICROBUS__MESSAGING__AMQP__URL: Broker URL (default: amqp://localhost:5672)
//! - MICROBUS_LOG: Log filter (default: info)

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use microbus::bus::{Event, EventBusBuilder, EventHandler, HandlerError, Publisher};
use microbus::command::{Command, CommandHandler};
use microbus::config::Config;
use microbus::resolve::ServiceContainer;
use microbus::utils::bootstrap::init_tracing;
use microbus::init_broker;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TransferCreated {
    from: u32,
    to: u32,
    amount: u64,
}
impl Event for TransferCreated {}

#[derive(Debug)]
struct CreateTransfer {
    from: u32,
    to: u32,
    amount: u64,
}
impl Command for CreateTransfer {
    type Output = bool;
}

#[derive(Default)]
struct InMemoryTransferRepository {
    transfers: Mutex<Vec<TransferCreated>>,
}

impl InMemoryTransferRepository {
    fn add(&self, transfer: TransferCreated) {
        self.transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transfer);
    }

    fn all(&self) -> Vec<TransferCreated> {
        self.transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Accepts a transfer and announces it.
struct CreateTransferHandler {
    publisher: Publisher,
}

#[async_trait]
impl CommandHandler<CreateTransfer> for CreateTransferHandler {
    async fn handle(&self, command: CreateTransfer) -> Result<bool, HandlerError> {
        if command.from == command.to || command.amount == 0 {
            return Ok(false);
        }

        self.publisher
            .publish(&TransferCreated {
                from: command.from,
                to: command.to,
                amount: command.amount,
            })
            .await?;
        Ok(true)
    }
}

/// Records every announced transfer.
struct TransferLogHandler {
    repository: Arc<InMemoryTransferRepository>,
}

#[async_trait]
impl EventHandler<TransferCreated> for TransferLogHandler {
    async fn handle(&self, event: &TransferCreated) -> Result<(), HandlerError> {
        info!(from = event.from, to = event.to, amount = event.amount, "Transfer logged");
        self.repository.add(event.clone());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = Config::load(None)?;
    let broker = init_broker(&config.messaging)?;

    let repository = Arc::new(InMemoryTransferRepository::default());
    let mut services = ServiceContainer::new();
    services
        .add_singleton_arc(Arc::clone(&repository))
        .add_transient(|scope| TransferLogHandler {
            repository: scope
                .resolve::<InMemoryTransferRepository>()
                .expect("InMemoryTransferRepository must be registered"),
        });

    let mut builder = EventBusBuilder::new(Arc::clone(&broker), Arc::new(services))
        .with_consumer_config(config.consumer);
    builder.mediator_mut().register::<CreateTransfer, _>(CreateTransferHandler {
        publisher: Publisher::new(broker),
    })?;
    builder.subscribe::<TransferCreated, TransferLogHandler>()?;

    let bus = builder.start().await?;
    info!(subscriptions = ?bus.subscriptions(), "microbus-demo started");

    let accepted = bus
        .send_command(CreateTransfer {
            from: 1,
            to: 2,
            amount: 100,
        })
        .await?;
    info!(accepted, "CreateTransfer handled");

    tokio::time::timeout(DELIVERY_TIMEOUT, async {
        while repository.all().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await?;

    for transfer in repository.all() {
        info!(?transfer, "Repository contents");
    }

    Ok(())
}
