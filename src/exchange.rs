// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Types describing the exchanges of the cross-site topology. Exchanges are
//! declared, not owned by any request; they persist for the broker's lifetime
//! and are redeclared idempotently on every provisioning pass.

/// Exchange kinds used by the cross-site topology.
///
/// - Direct: routes on an exact routing-key match (site inboxes)
/// - Fanout: broadcasts to all bound queues (system broadcast)
/// - Topic: routes on pattern-matched routing keys (domain/training events)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of an exchange with its declaration parameters.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition {
    pub(crate) name: &'static str,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// Defaults to a durable direct exchange.
    pub fn new(name: &'static str) -> ExchangeDefinition {
        ExchangeDefinition {
            name,
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
        }
    }

    /// Sets the exchange type to Direct.
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// The exchange name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// The exchange kind.
    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }
}
