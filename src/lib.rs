// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Cross-site message bus over AMQP.
//!
//! One fixed topology is shared by every participating site: topic exchanges
//! for domain and training events, a direct exchange for site-to-site inboxes,
//! and a fanout for broadcasts. [`bus::MessageBus`] is the entry point; it
//! connects, provisions the topology, consumes the site's queue set, and
//! dispatches envelopes to registered typed handlers.

mod otel;

pub mod bus;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod provisioner;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod topology;
