// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Lifecycle
//!
//! This module owns the single broker connection shared by the whole bus: one
//! cached publish channel, one channel per consumed queue, and the start/stop
//! state machine around them. All state transitions are serialized by a single
//! exclusive lock so concurrent publish and consume callers never race a
//! connect.

use crate::{config::MessageBusConfig, errors::BusError};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, ConfirmSelectOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What to do with a delivery once its processing finished.
///
/// `Requeue` redelivers through the broker; `DeadLetter` rejects without
/// requeue so the queue's dead-letter target receives the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

/// Consume-side contract: invoked once per delivery with the raw body and
/// AMQP headers, returning the acknowledgment disposition.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, body: &[u8], headers: &FieldTable) -> Disposition;
}

struct ConsumerEntry {
    channel: Channel,
    tag: String,
}

#[derive(Default)]
struct ManagerState {
    started: bool,
    connection: Option<Connection>,
    publish_channel: Option<Channel>,
    consumers: HashMap<String, ConsumerEntry>,
}

/// Owns the broker connection and every channel derived from it.
pub struct ConnectionManager {
    config: MessageBusConfig,
    state: Mutex<ManagerState>,
}

impl ConnectionManager {
    pub fn new(config: MessageBusConfig) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager {
            config,
            state: Mutex::new(ManagerState::default()),
        })
    }

    /// Establishes the broker connection. Idempotent: calling while already
    /// started is a no-op.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if state.started {
            return Ok(());
        }

        self.ensure_connection(&mut state).await?;
        state.started = true;

        Ok(())
    }

    /// Cancels every consumer, closes every channel and the connection.
    ///
    /// All steps are best-effort: a failure to close one resource never
    /// blocks closing the rest.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.started = false;

        for (queue, entry) in state.consumers.drain() {
            if let Err(err) = entry
                .channel
                .basic_cancel(&entry.tag, BasicCancelOptions::default())
                .await
            {
                debug!(error = err.to_string(), queue = queue, "failure to cancel consumer");
            }

            if let Err(err) = entry.channel.close(200, "bus stopping").await {
                debug!(error = err.to_string(), queue = queue, "failure to close consumer channel");
            }
        }

        if let Some(channel) = state.publish_channel.take() {
            if let Err(err) = channel.close(200, "bus stopping").await {
                debug!(error = err.to_string(), "failure to close publish channel");
            }
        }

        if let Some(connection) = state.connection.take() {
            if let Err(err) = connection.close(200, "bus stopping").await {
                debug!(error = err.to_string(), "failure to close connection");
            }
        }
    }

    /// Liveness probe: false when stopped or disconnected, otherwise opens
    /// and immediately closes a throwaway channel.
    pub async fn is_healthy(&self) -> bool {
        let state = self.state.lock().await;
        if !state.started {
            return false;
        }

        let Some(connection) = state.connection.as_ref() else {
            return false;
        };

        if !connection.status().connected() {
            return false;
        }

        match connection.create_channel().await {
            Ok(probe) => {
                if let Err(err) = probe.close(200, "health probe").await {
                    debug!(error = err.to_string(), "failure to close probe channel");
                }
                true
            }
            Err(err) => {
                debug!(error = err.to_string(), "health probe channel failed");
                false
            }
        }
    }

    /// Lazily creates and caches the single publish channel, recreating it
    /// if the cached one is closed.
    ///
    /// The channel runs in confirm mode so the publisher can observe
    /// broker-returned (unroutable) messages instead of dropping them.
    pub async fn publish_channel(&self) -> Result<Channel, BusError> {
        let mut state = self.state.lock().await;
        if !state.started {
            return Err(BusError::NotStartedError);
        }

        self.ensure_connection(&mut state).await?;

        if let Some(channel) = state.publish_channel.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let connection = state.connection.as_ref().ok_or(BusError::ConnectionError)?;
        let channel = match connection.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "failure to create publish channel");
                return Err(BusError::ChannelError);
            }
        };

        if let Err(err) = channel.confirm_select(ConfirmSelectOptions::default()).await {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(BusError::ChannelError);
        }

        state.publish_channel = Some(channel.clone());

        Ok(channel)
    }

    /// Registers a consumer on `queue`, feeding every delivery to `handler`.
    ///
    /// No-op when a live consumer already exists for the queue. The channel's
    /// prefetch is set to the configured max-concurrent-handlers clamped to
    /// [1, 1000], bounding in-flight unacknowledged deliveries per queue.
    pub async fn start_consuming(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), BusError> {
        if queue.trim().is_empty() {
            return Err(BusError::ConsumerDeclarationError(queue.to_owned()));
        }

        let mut state = self.state.lock().await;
        if !state.started {
            return Err(BusError::NotStartedError);
        }

        self.ensure_connection(&mut state).await?;

        if let Some(existing) = state.consumers.get(queue) {
            if existing.channel.status().connected() {
                return Ok(());
            }
        }

        let connection = state.connection.as_ref().ok_or(BusError::ConnectionError)?;
        let channel = match connection.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "failure to create consumer channel");
                return Err(BusError::ChannelError);
            }
        };

        let prefetch = self.config.site.max_concurrent_handlers.clamp(1, 1000) as u16;
        if let Err(err) = channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
        {
            error!(error = err.to_string(), queue = queue, "failure to configure qos");
            return Err(BusError::QoSDeclarationError(queue.to_owned()));
        }

        let consumer_tag = format!("{}-{}", self.config.site.site_name.to_lowercase(), queue);
        let mut consumer = match channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "failure to register consumer");
                return Err(BusError::ConsumerDeclarationError(queue.to_owned()));
            }
        };

        let tag = consumer.tag().to_string();
        let queue_name = queue.to_owned();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                let delivery = match result {
                    Ok(d) => d,
                    Err(err) => {
                        error!(error = err.to_string(), queue = queue_name, "failure to receive delivery");
                        continue;
                    }
                };

                let headers = delivery
                    .properties
                    .headers()
                    .clone()
                    .unwrap_or_default();

                let disposition = handler.on_delivery(&delivery.data, &headers).await;

                let ack_result = match disposition {
                    Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
                    Disposition::Requeue => {
                        delivery
                            .nack(BasicNackOptions {
                                multiple: false,
                                requeue: true,
                            })
                            .await
                    }
                    Disposition::DeadLetter => {
                        delivery
                            .nack(BasicNackOptions {
                                multiple: false,
                                requeue: false,
                            })
                            .await
                    }
                };

                if let Err(err) = ack_result {
                    error!(error = err.to_string(), queue = queue_name, "failure to ack/nack delivery");
                }
            }

            debug!(queue = queue_name, "consumer stream ended");
        });

        state.consumers.insert(
            queue.to_owned(),
            ConsumerEntry {
                channel,
                tag: tag.clone(),
            },
        );

        info!(queue = queue, tag = tag, "consumer started");

        Ok(())
    }

    /// Connects if no open connection exists. Caller must hold the state lock.
    async fn ensure_connection(&self, state: &mut ManagerState) -> Result<(), BusError> {
        if let Some(connection) = state.connection.as_ref() {
            if connection.status().connected() {
                return Ok(());
            }

            if !self.config.connection.automatic_recovery {
                error!("connection lost and automatic recovery is disabled");
                return Err(BusError::ConnectionError);
            }
        }

        let conn = &self.config.connection;
        let scheme = if conn.use_tls { "amqps" } else { "amqp" };
        let host = match (&conn.tls_server_name, conn.use_tls) {
            (Some(name), true) => name.clone(),
            _ => conn.host.clone(),
        };

        let uri = format!(
            "{}://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
            scheme,
            conn.username,
            conn.password,
            host,
            conn.port,
            conn.virtual_host.trim_start_matches('/'),
            conn.heartbeat_secs,
            conn.connection_timeout_secs * 1000,
        );

        debug!("creating amqp connection...");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.config.site.site_name.clone()));

        let connection = match Connection::connect(&uri, options).await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(BusError::ConnectionError);
            }
        };

        // Unexpected disconnects are logged, not fatal; the next channel
        // request reconnects when automatic recovery is enabled.
        connection.on_error(|err| {
            warn!(error = err.to_string(), "amqp connection error");
        });

        debug!("amqp connected");

        state.connection = Some(connection);

        Ok(())
    }
}
