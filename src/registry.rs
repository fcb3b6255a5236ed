// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry
//!
//! Maps a message-type name to an ordered list of handler registrations.
//! Handlers are stored type-erased: each registration owns a closure-like
//! adapter that knows how to deserialize the wire envelope into its payload
//! type and invoke the typed handler, so dispatch is a lookup plus a call with
//! no runtime reflection.
//!
//! The registry also owns one long-lived [`HandlerContext`] per handler
//! identity, lazily created and cached for the process lifetime, so repeated
//! dispatches to the same handler reuse consistent dependencies.

use crate::{
    envelope::{HandlerResult, MessageEnvelope},
    errors::BusError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, Mutex, RwLock},
};
use tracing::error;

/// Execution context handed to a handler on every invocation.
///
/// One context exists per handler identity for the process lifetime; the
/// key/value state survives across deliveries to the same handler type.
pub struct HandlerContext {
    handler_name: String,
    created_at: DateTime<Utc>,
    state: Mutex<HashMap<String, serde_json::Value>>,
}

impl HandlerContext {
    fn new(handler_name: &str) -> HandlerContext {
        HandlerContext {
            handler_name: handler_name.to_owned(),
            created_at: Utc::now(),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Reads a value previously stored by this handler.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.get(key).cloned())
    }

    /// Stores a value visible to every later invocation of this handler.
    pub fn set(&self, key: &str, value: serde_json::Value) {
        if let Ok(mut state) = self.state.lock() {
            state.insert(key.to_owned(), value);
        }
    }
}

/// Contract implemented by every message handler.
///
/// The retry flag of the returned [`HandlerResult`] alone decides the
/// delivery's disposition on failure.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope<T>, ctx: &HandlerContext) -> HandlerResult;

    /// Whether this handler accepts the given type name and schema version.
    fn can_handle(&self, _message_type: &str, _version: i32) -> bool {
        true
    }
}

/// Type-erased invocation surface stored in a registration.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn invoke(&self, body: &[u8], ctx: &HandlerContext) -> Result<HandlerResult, BusError>;

    fn accepts(&self, message_type: &str, version: i32) -> bool;
}

struct TypedHandler<T, H> {
    handler: Arc<H>,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H> ErasedHandler for TypedHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    async fn invoke(&self, body: &[u8], ctx: &HandlerContext) -> Result<HandlerResult, BusError> {
        let envelope: MessageEnvelope<T> = match serde_json::from_slice(body) {
            Ok(env) => env,
            Err(err) => {
                error!(error = err.to_string(), "failure to deserialize envelope for handler");
                return Err(BusError::ParsePayloadError);
            }
        };

        Ok(self.handler.handle(envelope, ctx).await)
    }

    fn accepts(&self, message_type: &str, version: i32) -> bool {
        self.handler.can_handle(message_type, version)
    }
}

/// One registered handler: message type, identity, priority, and the erased
/// invoker.
#[derive(Clone)]
pub struct HandlerRegistration {
    pub(crate) message_type: String,
    pub(crate) handler_name: String,
    pub(crate) priority: i32,
    pub(crate) handler: Arc<dyn ErasedHandler>,
}

impl HandlerRegistration {
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}

/// Holds all registrations and the per-handler execution contexts.
///
/// Lookups are read-mostly and safe for concurrent access; context creation
/// is guarded by its own lock.
#[derive(Default)]
pub struct HandlerRegistry {
    registrations: RwLock<Vec<HandlerRegistration>>,
    contexts: Mutex<HashMap<String, Arc<HandlerContext>>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Registers `handler` for `message_type` at the given priority.
    ///
    /// Higher priorities are tried first; ties keep registration order.
    pub fn register<T, H>(&self, message_type: &str, handler_name: &str, priority: i32, handler: H)
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let registration = HandlerRegistration {
            message_type: message_type.to_owned(),
            handler_name: handler_name.to_owned(),
            priority,
            handler: Arc::new(TypedHandler {
                handler: Arc::new(handler),
                _payload: PhantomData,
            }),
        };

        if let Ok(mut registrations) = self.registrations.write() {
            registrations.push(registration);
        }
    }

    /// Registrations matching `message_type`, highest priority first.
    ///
    /// The sort is stable, so equal priorities keep registration order.
    pub fn handlers_for(&self, message_type: &str) -> Vec<HandlerRegistration> {
        let Ok(registrations) = self.registrations.read() else {
            return Vec::new();
        };

        let mut matches: Vec<HandlerRegistration> = registrations
            .iter()
            .filter(|r| r.message_type == message_type)
            .cloned()
            .collect();

        matches.sort_by(|a, b| b.priority.cmp(&a.priority));
        matches
    }

    /// Total number of registered handlers.
    pub fn len(&self) -> usize {
        self.registrations.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cached execution context for a handler identity, created on first
    /// use and reused for the process lifetime.
    pub fn context_for(&self, handler_name: &str) -> Arc<HandlerContext> {
        let mut contexts = match self.contexts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        contexts
            .entry(handler_name.to_owned())
            .or_insert_with(|| Arc::new(HandlerContext::new(handler_name)))
            .clone()
    }
}
