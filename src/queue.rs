// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing the queues of the cross-site topology and their bindings.
//! Queue argument tables (TTL, max length, dead-letter target, overflow
//! policy) are built by the topology catalog and attached here.

use lapin::types::{AMQPValue, ShortString};
use std::collections::BTreeMap;

/// Definition of a queue with its declaration parameters.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            arguments: BTreeMap::default(),
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the queue argument table.
    pub fn arguments(mut self, arguments: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.arguments = arguments;
        self
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Binding of a queue to an exchange with a routing key.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub(crate) exchange_name: &'static str,
    pub(crate) queue_name: &'static str,
    pub(crate) routing_key: &'static str,
}

impl QueueBinding {
    pub fn new(
        exchange_name: &'static str,
        queue_name: &'static str,
        routing_key: &'static str,
    ) -> QueueBinding {
        QueueBinding {
            exchange_name,
            queue_name,
            routing_key,
        }
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange_name
    }

    pub fn queue_name(&self) -> &str {
        self.queue_name
    }

    pub fn routing_key(&self) -> &str {
        self.routing_key
    }
}
