// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Provisioner
//!
//! One-shot idempotent declaration of the catalog: exchanges first, then the
//! dead-letter queue before any other queue (the others reference it as their
//! dead-letter target), then the remaining queues, then the bindings. Any
//! declare failure aborts startup; the bus cannot run on missing topology.

use crate::{
    config::MessageBusConfig,
    connection::ConnectionManager,
    errors::BusError,
    queue::QueueDefinition,
    topology,
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Declares the cross-site topology exactly once per process.
pub struct TopologyProvisioner {
    config: MessageBusConfig,
    connection_manager: Arc<ConnectionManager>,
    installed: Mutex<bool>,
}

impl TopologyProvisioner {
    pub fn new(
        config: MessageBusConfig,
        connection_manager: Arc<ConnectionManager>,
    ) -> TopologyProvisioner {
        TopologyProvisioner {
            config,
            connection_manager,
            installed: Mutex::new(false),
        }
    }

    /// Declares all exchanges, queues, and bindings of the catalog.
    ///
    /// Idempotent under a lock: subsequent calls return immediately once the
    /// topology is installed.
    pub async fn install(&self) -> Result<(), BusError> {
        let mut installed = self.installed.lock().await;
        if *installed {
            return Ok(());
        }

        let channel = self.connection_manager.publish_channel().await?;

        for exchange in topology::all_exchanges() {
            debug!("declaring exchange: {}", exchange.name());

            if let Err(err) = channel
                .exchange_declare(
                    exchange.name(),
                    exchange.kind().into(),
                    ExchangeDeclareOptions {
                        durable: exchange.durable,
                        auto_delete: exchange.auto_delete,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
            {
                error!(
                    error = err.to_string(),
                    name = exchange.name(),
                    "failure to declare exchange"
                );
                return Err(BusError::DeclareExchangeError(exchange.name().to_owned()));
            }
        }

        for queue in declaration_order(topology::all_queues(&self.config)) {
            self.declare_queue(&channel, &queue).await?;
        }

        for binding in topology::all_bindings() {
            debug!(
                "binding queue: {} to exchange: {} with key: {}",
                binding.queue_name(),
                binding.exchange_name(),
                binding.routing_key()
            );

            if let Err(err) = channel
                .queue_bind(
                    binding.queue_name(),
                    binding.exchange_name(),
                    binding.routing_key(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                error!(error = err.to_string(), "failure to bind queue to exchange");
                return Err(BusError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                ));
            }
        }

        *installed = true;
        info!("cross-site topology installed");

        Ok(())
    }

    async fn declare_queue(
        &self,
        channel: &Channel,
        queue: &QueueDefinition,
    ) -> Result<(), BusError> {
        debug!("declaring queue: {}", queue.name());

        if let Err(err) = channel
            .queue_declare(
                queue.name(),
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::from(queue.arguments.clone()),
            )
            .await
        {
            error!(
                error = err.to_string(),
                name = queue.name(),
                "failure to declare queue"
            );
            return Err(BusError::DeclareQueueError(queue.name().to_owned()));
        }

        Ok(())
    }
}

/// Declaration order for the catalog's queues: the dead-letter queue must
/// exist before any queue that names it as its dead-letter target.
fn declaration_order(queues: Vec<QueueDefinition>) -> Vec<QueueDefinition> {
    let (dead_letter, rest): (Vec<_>, Vec<_>) = queues
        .into_iter()
        .partition(|q| q.name() == topology::DEAD_LETTER_QUEUE);

    dead_letter.into_iter().chain(rest).collect()
}
