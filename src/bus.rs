// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Cross-Site Message Bus
//!
//! The façade tying the stack together: starts the connection manager and
//! provisioner for a given site, registers one consumer per relevant queue,
//! decodes inbound envelopes, resolves and invokes handlers in priority
//! order, decides each delivery's acknowledgment, and aggregates statistics.
//!
//! Delivery is at-least-once: a requeued or redelivered message runs every
//! matching handler again, including those that already succeeded before a
//! later one failed. Handlers must tolerate re-processing.

use crate::{
    config::MessageBusConfig,
    connection::{ConnectionManager, DeliveryHandler, Disposition},
    envelope::{targets_include, MessageEnvelope, ALL_SITES},
    errors::BusError,
    otel,
    provisioner::TopologyProvisioner,
    publisher::RoutingPublisher,
    registry::{HandlerRegistry, MessageHandler},
    topology::{self, Site},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::types::FieldTable;
use opentelemetry::{global, trace::Span};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, RwLock,
    },
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Point-in-time counters and rates, recomputed on demand.
#[derive(Debug, Clone)]
pub struct MessageBusStatistics {
    pub messages_published: u64,
    pub messages_processed: u64,
    pub processing_errors: u64,
    pub average_processing_time_ms: f64,
    pub messages_per_minute: f64,
    pub is_connection_healthy: bool,
    pub registered_handlers: usize,
    pub collected_at: DateTime<Utc>,
}

/// Fired after an envelope is written to the broker.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub message_id: String,
    pub message_type: String,
    pub target_sites: String,
    pub timestamp: DateTime<Utc>,
}

/// Fired after one handler finishes a delivery successfully.
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub message_id: String,
    pub message_type: String,
    pub handler_name: String,
    pub processing_time: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Fired when a delivery fails to parse or a handler reports failure.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub message_id: String,
    pub message_type: String,
    pub error_message: String,
    pub cause: Option<String>,
    pub timestamp: DateTime<Utc>,
}

type PublishedHook = Box<dyn Fn(&PublishedEvent) + Send + Sync>;
type ProcessedHook = Box<dyn Fn(&ProcessedEvent) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&ErrorEvent) + Send + Sync>;

/// Observer hooks fired synchronously, in-line with processing.
#[derive(Default)]
pub(crate) struct NotificationHooks {
    published: RwLock<Vec<PublishedHook>>,
    processed: RwLock<Vec<ProcessedHook>>,
    errors: RwLock<Vec<ErrorHook>>,
}

impl NotificationHooks {
    fn fire_published(&self, event: &PublishedEvent) {
        if let Ok(hooks) = self.published.read() {
            for hook in hooks.iter() {
                hook(event);
            }
        }
    }

    fn fire_processed(&self, event: &ProcessedEvent) {
        if let Ok(hooks) = self.processed.read() {
            for hook in hooks.iter() {
                hook(event);
            }
        }
    }

    fn fire_error(&self, event: &ErrorEvent) {
        if let Ok(hooks) = self.errors.read() {
            for hook in hooks.iter() {
                hook(event);
            }
        }
    }
}

/// Monotonic counters plus the smoothed processing latency.
#[derive(Default)]
pub(crate) struct BusStats {
    published: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    avg_processing_ms: StdMutex<f64>,
}

impl BusStats {
    fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one processed delivery and folds its latency into the
    /// exponentially-smoothed average: the first sample sets the average,
    /// later samples blend at 5%.
    fn record_processed(&self, elapsed_ms: f64) {
        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;

        if let Ok(mut avg) = self.avg_processing_ms.lock() {
            if processed == 1 {
                *avg = elapsed_ms;
            } else {
                *avg = *avg * 0.95 + elapsed_ms * 0.05;
            }
        }
    }

    /// Counts a processed delivery without a latency sample (deliveries
    /// skipped because this site is not targeted).
    fn record_skipped(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn average_processing_ms(&self) -> f64 {
        self.avg_processing_ms.lock().map(|avg| *avg).unwrap_or(0.0)
    }

    fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Envelope header fields parsed defensively from an inbound body.
struct WireHeader {
    message_id: String,
    message_type: String,
    target_sites: String,
    version: i32,
}

/// Per-delivery processor: decodes, resolves handlers, invokes them in
/// priority order, and returns the delivery's disposition.
pub(crate) struct MessageDispatcher {
    site: Site,
    registry: Arc<HandlerRegistry>,
    stats: Arc<BusStats>,
    hooks: Arc<NotificationHooks>,
}

impl MessageDispatcher {
    pub(crate) fn new(
        site: Site,
        registry: Arc<HandlerRegistry>,
        stats: Arc<BusStats>,
        hooks: Arc<NotificationHooks>,
    ) -> MessageDispatcher {
        MessageDispatcher {
            site,
            registry,
            stats,
            hooks,
        }
    }

    pub(crate) async fn process(&self, body: &[u8]) -> Disposition {
        let started = Instant::now();

        let header = match parse_wire_header(body) {
            Ok(header) => header,
            Err(err) => {
                error!(error = err.to_string(), "failure to parse inbound message");
                self.stats.record_error();
                self.hooks.fire_error(&ErrorEvent {
                    message_id: String::new(),
                    message_type: String::new(),
                    error_message: "failed to parse inbound message body".to_owned(),
                    cause: Some(err.to_string()),
                    timestamp: Utc::now(),
                });
                // Malformed messages would loop forever on requeue; reject
                // them so the queue's dead-letter target receives them.
                return Disposition::DeadLetter;
            }
        };

        if !targets_include(&header.target_sites, self.site.as_str()) {
            self.stats.record_skipped();
            return Disposition::Ack;
        }

        let matching = self.registry.handlers_for(&header.message_type);
        if matching.is_empty() {
            warn!(
                message_type = header.message_type,
                "no handlers registered for message type"
            );
            self.stats
                .record_processed(started.elapsed().as_secs_f64() * 1000.0);
            return Disposition::Ack;
        }

        for registration in &matching {
            if !registration
                .handler
                .accepts(&header.message_type, header.version)
            {
                continue;
            }

            let ctx = self.registry.context_for(registration.handler_name());

            let result = match registration.handler.invoke(body, &ctx).await {
                Ok(result) => result,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        message_type = header.message_type,
                        handler = registration.handler_name(),
                        "failure to decode envelope for handler"
                    );
                    self.stats.record_error();
                    self.hooks.fire_error(&ErrorEvent {
                        message_id: header.message_id.clone(),
                        message_type: header.message_type.clone(),
                        error_message: "failed to deserialize envelope for handler".to_owned(),
                        cause: Some(err.to_string()),
                        timestamp: Utc::now(),
                    });
                    return Disposition::DeadLetter;
                }
            };

            if !result.is_success {
                let error_message = result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "handler failed".to_owned());

                error!(
                    message_type = header.message_type,
                    handler = registration.handler_name(),
                    error = error_message,
                    "handler reported failure"
                );

                self.stats.record_error();
                self.hooks.fire_error(&ErrorEvent {
                    message_id: header.message_id.clone(),
                    message_type: header.message_type.clone(),
                    error_message,
                    cause: None,
                    timestamp: Utc::now(),
                });

                // Remaining handlers are skipped; the handler's own retry
                // request decides the disposition.
                return if result.should_retry {
                    Disposition::Requeue
                } else {
                    Disposition::Ack
                };
            }

            self.hooks.fire_processed(&ProcessedEvent {
                message_id: header.message_id.clone(),
                message_type: header.message_type.clone(),
                handler_name: registration.handler_name().to_owned(),
                processing_time: started.elapsed(),
                timestamp: Utc::now(),
            });
        }

        self.stats
            .record_processed(started.elapsed().as_secs_f64() * 1000.0);

        Disposition::Ack
    }
}

#[async_trait]
impl DeliveryHandler for MessageDispatcher {
    async fn on_delivery(&self, body: &[u8], headers: &FieldTable) -> Disposition {
        let message_type = parse_wire_header(body)
            .map(|h| h.message_type)
            .unwrap_or_default();

        let (_ctx, mut span) =
            otel::consumer_span(headers, &global::tracer("cross-site consumer"), &message_type);

        let disposition = self.process(body).await;
        span.end();

        disposition
    }
}

/// Parses the envelope header fields defensively: missing fields fall back
/// to their defaults, only a body that is not JSON at all is an error.
fn parse_wire_header(body: &[u8]) -> Result<WireHeader, serde_json::Error> {
    let root: serde_json::Value = serde_json::from_slice(body)?;

    Ok(WireHeader {
        message_id: root
            .get("MessageId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned(),
        message_type: root
            .get("MessageType")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned(),
        target_sites: root
            .get("TargetSites")
            .and_then(|v| v.as_str())
            .unwrap_or(ALL_SITES)
            .to_owned(),
        version: root
            .get("Version")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
            .unwrap_or(1),
    })
}

struct BusState {
    started: bool,
    site: Option<Site>,
    started_at: Option<DateTime<Utc>>,
    connection_manager: Option<Arc<ConnectionManager>>,
    publisher: Option<Arc<RoutingPublisher>>,
}

/// The cross-site message bus façade.
pub struct MessageBus {
    config: MessageBusConfig,
    registry: Arc<HandlerRegistry>,
    stats: Arc<BusStats>,
    hooks: Arc<NotificationHooks>,
    state: Mutex<BusState>,
}

impl MessageBus {
    pub fn new(config: MessageBusConfig) -> MessageBus {
        MessageBus {
            config,
            registry: Arc::new(HandlerRegistry::new()),
            stats: Arc::new(BusStats::default()),
            hooks: Arc::new(NotificationHooks::default()),
            state: Mutex::new(BusState {
                started: false,
                site: None,
                started_at: None,
                connection_manager: None,
                publisher: None,
            }),
        }
    }

    /// Registers `handler` for `message_type`. May be called before or after
    /// `start`; higher priorities run first for a delivery.
    pub fn register_handler<T, H>(
        &self,
        message_type: &str,
        handler_name: &str,
        priority: i32,
        handler: H,
    ) where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        self.registry
            .register::<T, H>(message_type, handler_name, priority, handler);
    }

    /// Starts the bus for `site_name`: validates configuration, connects,
    /// provisions topology (unless skipped), and starts one consumer per
    /// relevant queue. Idempotent.
    pub async fn start(&self, site_name: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if state.started {
            return Ok(());
        }

        let site = topology::site_from_name(site_name)?;

        let mut config = self.config.clone();
        config.site.site_name = site.as_str().to_owned();
        config.validate()?;

        let connection_manager = ConnectionManager::new(config.clone());
        connection_manager.start().await?;

        if config.site.skip_queue_setup {
            info!("queue setup skipped, assuming externally managed topology");
        } else {
            let provisioner =
                TopologyProvisioner::new(config.clone(), connection_manager.clone());
            provisioner.install().await?;
        }

        let dispatcher = Arc::new(MessageDispatcher::new(
            site,
            self.registry.clone(),
            self.stats.clone(),
            self.hooks.clone(),
        ));

        for queue in queues_to_consume(site, &config) {
            connection_manager
                .start_consuming(queue, dispatcher.clone())
                .await?;
        }

        state.publisher = Some(RoutingPublisher::new(connection_manager.clone()));
        state.connection_manager = Some(connection_manager);
        state.site = Some(site);
        state.started_at = Some(Utc::now());
        state.started = true;

        info!(site = site.as_str(), "message bus started");

        Ok(())
    }

    /// Stops the bus, closing consumers, channels, and the connection.
    /// Idempotent; in-flight handler execution is not interrupted.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.started {
            return;
        }

        state.started = false;
        state.publisher = None;

        if let Some(connection_manager) = state.connection_manager.take() {
            connection_manager.stop().await;
        }

        info!("message bus stopped");
    }

    /// Probes the broker connection. False before `start` and after `stop`.
    pub async fn is_healthy(&self) -> bool {
        let connection_manager = {
            let state = self.state.lock().await;
            if !state.started {
                return false;
            }
            state.connection_manager.clone()
        };

        match connection_manager {
            Some(manager) => manager.is_healthy().await,
            None => false,
        }
    }

    /// Publishes `payload` wrapped in a fresh envelope, routed by its target
    /// sites. Returns the generated message id.
    pub async fn publish<T>(
        &self,
        message_type: &str,
        payload: T,
        target_sites: &str,
        correlation_id: Option<String>,
    ) -> Result<String, BusError>
    where
        T: Serialize + Send + Sync,
    {
        let (publisher, site) = {
            let state = self.state.lock().await;
            if !state.started {
                return Err(BusError::NotStartedError);
            }
            (
                state.publisher.clone().ok_or(BusError::NotStartedError)?,
                state.site.ok_or(BusError::NotStartedError)?,
            )
        };

        let envelope = MessageEnvelope::new(
            message_type,
            payload,
            site.as_str(),
            target_sites,
            correlation_id,
        );

        publisher.publish(&envelope).await?;

        self.stats.record_published();
        self.hooks.fire_published(&PublishedEvent {
            message_id: envelope.message_id.clone(),
            message_type: envelope.message_type.clone(),
            target_sites: envelope.target_sites.clone(),
            timestamp: envelope.timestamp,
        });

        Ok(envelope.message_id)
    }

    /// Publishes straight to a named queue, bypassing the routing engine.
    pub async fn publish_direct<T>(
        &self,
        message_type: &str,
        payload: T,
        queue_name: &str,
        correlation_id: Option<String>,
    ) -> Result<String, BusError>
    where
        T: Serialize + Send + Sync,
    {
        let (publisher, site) = {
            let state = self.state.lock().await;
            if !state.started {
                return Err(BusError::NotStartedError);
            }
            (
                state.publisher.clone().ok_or(BusError::NotStartedError)?,
                state.site.ok_or(BusError::NotStartedError)?,
            )
        };

        let envelope = MessageEnvelope::new(
            message_type,
            payload,
            site.as_str(),
            site.as_str(),
            correlation_id,
        );

        publisher.publish_direct(&envelope, queue_name).await?;

        self.stats.record_published();
        self.hooks.fire_published(&PublishedEvent {
            message_id: envelope.message_id.clone(),
            message_type: envelope.message_type.clone(),
            target_sites: envelope.target_sites.clone(),
            timestamp: envelope.timestamp,
        });

        Ok(envelope.message_id)
    }

    /// Registers an observer fired synchronously after every publish.
    pub fn on_message_published<F>(&self, hook: F)
    where
        F: Fn(&PublishedEvent) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.hooks.published.write() {
            hooks.push(Box::new(hook));
        }
    }

    /// Registers an observer fired synchronously after each successful
    /// handler invocation.
    pub fn on_message_processed<F>(&self, hook: F)
    where
        F: Fn(&ProcessedEvent) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.hooks.processed.write() {
            hooks.push(Box::new(hook));
        }
    }

    /// Registers an observer fired synchronously on parse or handler errors.
    pub fn on_message_error<F>(&self, hook: F)
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.hooks.errors.write() {
            hooks.push(Box::new(hook));
        }
    }

    /// Snapshot of counters, rates, health, and handler count.
    pub async fn get_statistics(&self) -> MessageBusStatistics {
        let (manager, started_at) = {
            let state = self.state.lock().await;
            (state.connection_manager.clone(), state.started_at)
        };

        let is_connection_healthy = match manager {
            Some(manager) => manager.is_healthy().await,
            None => false,
        };

        let elapsed_minutes = started_at
            .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 60_000.0)
            .unwrap_or(0.0)
            .max(0.0001);

        let processed = self.stats.processed_count();

        MessageBusStatistics {
            messages_published: self.stats.published_count(),
            messages_processed: processed,
            processing_errors: self.stats.error_count(),
            average_processing_time_ms: self.stats.average_processing_ms(),
            messages_per_minute: processed as f64 / elapsed_minutes,
            is_connection_healthy,
            registered_handlers: self.registry.len(),
            collected_at: Utc::now(),
        }
    }
}

/// The queue set this site consumes: the shared event queues, the site's own
/// inbox, and the broadcast queue when the site opts in. De-duplicated.
fn queues_to_consume(site: Site, config: &MessageBusConfig) -> Vec<&'static str> {
    let mut queues = vec![
        topology::MODEL_EVENTS_QUEUE,
        topology::USER_INTERACTION_EVENTS_QUEUE,
        topology::SYSTEM_EVENTS_QUEUE,
        topology::TRAINING_EVENTS_QUEUE,
        site.inbox_queue(),
    ];

    if config.site.process_broadcast_messages {
        queues.push(topology::BROADCAST_QUEUE);
    }

    let mut deduped = Vec::with_capacity(queues.len());
    for queue in queues {
        if !deduped.contains(&queue) {
            deduped.push(queue);
        }
    }

    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::HandlerResult;
    use crate::registry::HandlerContext;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct TestPayload {
        value: i32,
    }

    struct RecordingHandler {
        name: &'static str,
        calls: Arc<StdMutex<Vec<&'static str>>>,
        fail: bool,
        retry: bool,
    }

    #[async_trait]
    impl MessageHandler<TestPayload> for RecordingHandler {
        async fn handle(
            &self,
            _envelope: MessageEnvelope<TestPayload>,
            _ctx: &HandlerContext,
        ) -> HandlerResult {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(self.name);
            }

            if self.fail {
                HandlerResult::failure("boom", self.retry)
            } else {
                HandlerResult::success()
            }
        }
    }

    fn dispatcher_with(registry: Arc<HandlerRegistry>) -> (MessageDispatcher, Arc<BusStats>) {
        let stats = Arc::new(BusStats::default());
        let dispatcher = MessageDispatcher::new(
            Site::Hartsy,
            registry,
            stats.clone(),
            Arc::new(NotificationHooks::default()),
        );
        (dispatcher, stats)
    }

    fn body(message_type: &str, target_sites: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "MessageId": "m-1",
            "MessageType": message_type,
            "SourceSite": "Hawtsy",
            "TargetSites": target_sites,
            "Timestamp": "2026-01-01T00:00:00Z",
            "Version": 1,
            "Payload": { "value": 7 }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn wildcard_deliveries_are_accepted_on_any_site() {
        let registry = Arc::new(HandlerRegistry::new());
        let calls = Arc::new(StdMutex::new(Vec::new()));
        registry.register::<TestPayload, _>(
            "TestPayload",
            "recorder",
            0,
            RecordingHandler {
                name: "recorder",
                calls: calls.clone(),
                fail: false,
                retry: false,
            },
        );

        let (dispatcher, stats) = dispatcher_with(registry);
        let disposition = dispatcher.process(&body("TestPayload", "*")).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(calls.lock().unwrap().as_slice(), ["recorder"]);
        assert_eq!(stats.processed_count(), 1);
        assert_eq!(stats.error_count(), 0);
    }

    #[tokio::test]
    async fn sparse_body_still_reaches_the_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        let calls = Arc::new(StdMutex::new(Vec::new()));
        registry.register::<TestPayload, _>(
            "TestPayload",
            "recorder",
            0,
            RecordingHandler {
                name: "recorder",
                calls: calls.clone(),
                fail: false,
                retry: false,
            },
        );

        // No Version, SourceSite, MessageId, or TargetSites; the envelope
        // falls back to its defensive defaults instead of erroring.
        let body = serde_json::to_vec(&json!({
            "MessageType": "TestPayload",
            "Payload": { "value": 7 }
        }))
        .unwrap();

        let (dispatcher, stats) = dispatcher_with(registry);
        let disposition = dispatcher.process(&body).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(calls.lock().unwrap().as_slice(), ["recorder"]);
        assert_eq!(stats.processed_count(), 1);
        assert_eq!(stats.error_count(), 0);
    }

    #[tokio::test]
    async fn non_matching_target_acks_without_invoking_handlers() {
        let registry = Arc::new(HandlerRegistry::new());
        let calls = Arc::new(StdMutex::new(Vec::new()));
        registry.register::<TestPayload, _>(
            "TestPayload",
            "recorder",
            0,
            RecordingHandler {
                name: "recorder",
                calls: calls.clone(),
                fail: false,
                retry: false,
            },
        );

        let (dispatcher, stats) = dispatcher_with(registry);
        let disposition = dispatcher.process(&body("TestPayload", "Hawtsy,DiscordBot")).await;

        assert_eq!(disposition, Disposition::Ack);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(stats.processed_count(), 1);
    }

    #[tokio::test]
    async fn handlers_run_in_priority_order_and_stop_on_first_failure() {
        let registry = Arc::new(HandlerRegistry::new());
        let calls = Arc::new(StdMutex::new(Vec::new()));

        registry.register::<TestPayload, _>(
            "TestPayload",
            "low",
            0,
            RecordingHandler {
                name: "low",
                calls: calls.clone(),
                fail: false,
                retry: false,
            },
        );
        registry.register::<TestPayload, _>(
            "TestPayload",
            "high",
            10,
            RecordingHandler {
                name: "high",
                calls: calls.clone(),
                fail: true,
                retry: false,
            },
        );
        registry.register::<TestPayload, _>(
            "TestPayload",
            "mid",
            5,
            RecordingHandler {
                name: "mid",
                calls: calls.clone(),
                fail: false,
                retry: false,
            },
        );

        let (dispatcher, stats) = dispatcher_with(registry);
        let disposition = dispatcher.process(&body("TestPayload", "*")).await;

        // priority-10 failed without retry: mid and low never run, ack
        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(calls.lock().unwrap().as_slice(), ["high"]);
        assert_eq!(stats.error_count(), 1);
        assert_eq!(stats.processed_count(), 0);
    }

    #[tokio::test]
    async fn all_handlers_run_in_order_when_each_succeeds() {
        let registry = Arc::new(HandlerRegistry::new());
        let calls = Arc::new(StdMutex::new(Vec::new()));

        for (name, priority) in [("low", 0), ("high", 10), ("mid", 5)] {
            registry.register::<TestPayload, _>(
                "TestPayload",
                name,
                priority,
                RecordingHandler {
                    name,
                    calls: calls.clone(),
                    fail: false,
                    retry: false,
                },
            );
        }

        let (dispatcher, stats) = dispatcher_with(registry);
        let disposition = dispatcher.process(&body("TestPayload", "*")).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(calls.lock().unwrap().as_slice(), ["high", "mid", "low"]);
        assert_eq!(stats.processed_count(), 1);
    }

    #[tokio::test]
    async fn handler_requested_retry_requeues_the_delivery() {
        let registry = Arc::new(HandlerRegistry::new());
        let calls = Arc::new(StdMutex::new(Vec::new()));
        registry.register::<TestPayload, _>(
            "TestPayload",
            "flaky",
            0,
            RecordingHandler {
                name: "flaky",
                calls,
                fail: true,
                retry: true,
            },
        );

        let (dispatcher, stats) = dispatcher_with(registry);
        let disposition = dispatcher.process(&body("TestPayload", "*")).await;

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(stats.error_count(), 1);
    }

    #[tokio::test]
    async fn malformed_body_dead_letters_and_counts_an_error() {
        let registry = Arc::new(HandlerRegistry::new());
        let (dispatcher, stats) = dispatcher_with(registry);

        let disposition = dispatcher.process(b"this is not json").await;

        assert_eq!(disposition, Disposition::DeadLetter);
        assert_eq!(stats.error_count(), 1);
        assert_eq!(stats.processed_count(), 0);
    }

    #[tokio::test]
    async fn unhandled_message_type_is_still_counted_as_processed() {
        let registry = Arc::new(HandlerRegistry::new());
        let (dispatcher, stats) = dispatcher_with(registry);

        let disposition = dispatcher.process(&body("NobodyHandlesThis", "*")).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(stats.processed_count(), 1);
        assert_eq!(stats.error_count(), 0);
    }

    #[tokio::test]
    async fn error_hook_fires_with_message_identity() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register::<TestPayload, _>(
            "TestPayload",
            "failing",
            0,
            RecordingHandler {
                name: "failing",
                calls: Arc::new(StdMutex::new(Vec::new())),
                fail: true,
                retry: false,
            },
        );

        let hooks = Arc::new(NotificationHooks::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = seen.clone();
            if let Ok(mut error_hooks) = hooks.errors.write() {
                error_hooks.push(Box::new(move |event: &ErrorEvent| {
                    if let Ok(mut seen) = seen.lock() {
                        seen.push((event.message_id.clone(), event.error_message.clone()));
                    }
                }));
            }
        }

        let dispatcher = MessageDispatcher::new(
            Site::Hartsy,
            registry,
            Arc::new(BusStats::default()),
            hooks,
        );

        dispatcher.process(&body("TestPayload", "*")).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), [("m-1".to_owned(), "boom".to_owned())]);
    }

    #[tokio::test]
    async fn processed_hook_fires_once_per_successful_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        let calls = Arc::new(StdMutex::new(Vec::new()));
        for name in ["a", "b"] {
            registry.register::<TestPayload, _>(
                "TestPayload",
                name,
                0,
                RecordingHandler {
                    name: "x",
                    calls: calls.clone(),
                    fail: false,
                    retry: false,
                },
            );
        }

        let hooks = Arc::new(NotificationHooks::default());
        let handler_names = Arc::new(StdMutex::new(Vec::new()));
        {
            let handler_names = handler_names.clone();
            if let Ok(mut processed_hooks) = hooks.processed.write() {
                processed_hooks.push(Box::new(move |event: &ProcessedEvent| {
                    if let Ok(mut names) = handler_names.lock() {
                        names.push(event.handler_name.clone());
                    }
                }));
            }
        }

        let dispatcher = MessageDispatcher::new(
            Site::Hartsy,
            registry,
            Arc::new(BusStats::default()),
            hooks,
        );

        dispatcher.process(&body("TestPayload", "*")).await;

        assert_eq!(
            handler_names.lock().unwrap().as_slice(),
            ["a".to_owned(), "b".to_owned()]
        );
    }

    #[test]
    fn first_latency_sample_sets_the_average_directly() {
        let stats = BusStats::default();
        stats.record_processed(40.0);
        assert!((stats.average_processing_ms() - 40.0).abs() < f64::EPSILON);

        stats.record_processed(80.0);
        let expected = 40.0 * 0.95 + 80.0 * 0.05;
        assert!((stats.average_processing_ms() - expected).abs() < 1e-9);
    }

    #[test]
    fn missing_wire_fields_fall_back_to_defaults() {
        let header = parse_wire_header(br#"{"Payload": {}}"#).unwrap();
        assert_eq!(header.message_id, "");
        assert_eq!(header.message_type, "");
        assert_eq!(header.target_sites, ALL_SITES);
        assert_eq!(header.version, 1);
    }

    #[test]
    fn broadcast_opt_out_removes_the_broadcast_queue() {
        let mut config = MessageBusConfig::default();
        config.site.process_broadcast_messages = false;

        let queues = queues_to_consume(Site::Hawtsy, &config);
        assert!(!queues.contains(&topology::BROADCAST_QUEUE));
        assert!(queues.contains(&topology::HAWTSY_INBOX_QUEUE));

        config.site.process_broadcast_messages = true;
        let queues = queues_to_consume(Site::Hawtsy, &config);
        assert!(queues.contains(&topology::BROADCAST_QUEUE));
        assert_eq!(queues.len(), 6);
    }

    #[tokio::test]
    async fn bus_is_unhealthy_before_start() {
        let bus = MessageBus::new(MessageBusConfig::default());
        assert!(!bus.is_healthy().await);

        let stats = bus.get_statistics().await;
        assert!(!stats.is_connection_healthy);
        assert_eq!(stats.messages_processed, 0);
    }

    #[tokio::test]
    async fn publish_before_start_is_rejected() {
        let bus = MessageBus::new(MessageBusConfig::default());
        let result = bus
            .publish("TestPayload", TestPayload { value: 1 }, "*", None)
            .await;
        assert_eq!(result, Err(BusError::NotStartedError));
    }
}
