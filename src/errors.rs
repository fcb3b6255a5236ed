// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Cross-Site Message Bus
//!
//! This module provides the error taxonomy for the bus. The `BusError` enum
//! covers configuration validation, broker connection and channel management,
//! topology provisioning, publishing, and consume-side failures. Each variant
//! provides specific context about what operation failed.

use thiserror::Error;

/// Represents errors that can occur during message bus operations.
///
/// Configuration and provisioning errors are fatal at startup. Connection and
/// publish errors are isolated to the operation that triggered them. Parse and
/// handler errors are isolated to a single delivery and never terminate a
/// consumer loop.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BusError {
    /// Invalid configuration detected before any broker I/O
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Operation attempted while the connection manager is stopped
    #[error("connection manager is not started")]
    NotStartedError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing an envelope to its wire form
    #[error("failure to serialize envelope")]
    SerializePayloadError,

    /// Error parsing an inbound message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// A site identifier outside the fixed enumeration
    #[error("unknown site `{0}`")]
    UnknownSiteError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),
}
