// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Publisher
//!
//! Publish-side engine: computes the destination for an envelope (broadcast,
//! direct-to-site, or domain topic keyed by message type), stamps the broker
//! message properties and cross-site headers, and writes through the shared
//! publish channel. All publishes are serialized by one lock; broker channels
//! are not safe for concurrent frame writes.

use crate::{
    connection::ConnectionManager,
    envelope::MessageEnvelope,
    errors::BusError,
    otel,
    topology::resolve_route,
};
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongInt, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Content type stamped on every published message
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes envelopes to the broker through the connection manager.
pub struct RoutingPublisher {
    connection_manager: Arc<ConnectionManager>,
    publish_lock: Mutex<()>,
}

impl RoutingPublisher {
    pub fn new(connection_manager: Arc<ConnectionManager>) -> Arc<RoutingPublisher> {
        Arc::new(RoutingPublisher {
            connection_manager,
            publish_lock: Mutex::new(()),
        })
    }

    /// Publishes an envelope to its resolved destination.
    ///
    /// Messages are published with the mandatory flag: an unroutable message
    /// comes back as a broker return, logged as a warning but never surfaced
    /// to the caller as a publish failure.
    pub async fn publish<T>(&self, envelope: &MessageEnvelope<T>) -> Result<(), BusError>
    where
        T: Serialize + Send + Sync,
    {
        let route = resolve_route(&envelope.target_sites, &envelope.message_type)?;
        self.publish_to(envelope, route.exchange, &route.routing_key)
            .await
    }

    /// Bypasses the routing engine and writes straight to a named queue via
    /// the default exchange.
    pub async fn publish_direct<T>(
        &self,
        envelope: &MessageEnvelope<T>,
        queue_name: &str,
    ) -> Result<(), BusError>
    where
        T: Serialize + Send + Sync,
    {
        if queue_name.trim().is_empty() {
            return Err(BusError::PublishingError);
        }

        self.publish_to(envelope, "", queue_name).await
    }

    async fn publish_to<T>(
        &self,
        envelope: &MessageEnvelope<T>,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError>
    where
        T: Serialize + Send + Sync,
    {
        let _guard = self.publish_lock.lock().await;

        let body = serde_json::to_vec(envelope).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize envelope");
            BusError::SerializePayloadError
        })?;

        let channel = self.connection_manager.publish_channel().await?;

        let mut headers = cross_site_headers(envelope);
        otel::inject_context(&Context::current(), &mut headers);

        debug!(
            exchange = exchange,
            routing_key = routing_key,
            message_type = envelope.message_type,
            "publishing message"
        );

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                &body,
                message_properties(envelope).with_headers(FieldTable::from(headers)),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    message_type = envelope.message_type,
                    message_id = envelope.message_id,
                    "failure to publish message"
                );
                BusError::PublishingError
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), "failure to confirm publish");
            BusError::PublishingError
        })?;

        // A returned message means no queue matched the routing key. Known
        // limitation: the caller is not told.
        if let Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) =
            confirmation
        {
            warn!(
                reply_code = returned.reply_code,
                reply_text = returned.reply_text.to_string(),
                exchange = exchange,
                routing_key = routing_key,
                "message returned as unroutable"
            );
        }

        Ok(())
    }
}

/// The broker message properties stamped on every publish.
pub(crate) fn message_properties<T>(envelope: &MessageEnvelope<T>) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_content_encoding(ShortString::from("utf-8"))
        .with_delivery_mode(2)
        .with_message_id(ShortString::from(envelope.message_id.clone()))
        .with_kind(ShortString::from(envelope.message_type.clone()))
        .with_app_id(ShortString::from(envelope.source_site.clone()))
        .with_timestamp(envelope.timestamp.timestamp() as u64);

    if let Some(correlation_id) = &envelope.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id.clone()));
    }

    props
}

/// The cross-site header fields carried beside the JSON body.
pub(crate) fn cross_site_headers<T>(
    envelope: &MessageEnvelope<T>,
) -> BTreeMap<ShortString, AMQPValue> {
    let mut headers = BTreeMap::new();
    headers.insert(
        ShortString::from("x-source-site"),
        AMQPValue::LongString(envelope.source_site.clone().into()),
    );
    headers.insert(
        ShortString::from("x-target-sites"),
        AMQPValue::LongString(envelope.target_sites.clone().into()),
    );
    headers.insert(
        ShortString::from("x-message-type"),
        AMQPValue::LongString(envelope.message_type.clone().into()),
    );
    headers.insert(
        ShortString::from("x-message-version"),
        AMQPValue::LongInt(LongInt::from(envelope.version)),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn envelope() -> MessageEnvelope<Note> {
        MessageEnvelope::new(
            "ModelUploadStarted",
            Note {
                text: "upload".to_owned(),
            },
            "Hartsy",
            "Hawtsy",
            Some("corr-1".to_owned()),
        )
    }

    #[test]
    fn properties_carry_the_envelope_identity() {
        let env = envelope();
        let props = message_properties(&env);

        assert_eq!(
            props.content_type().as_ref().map(|s| s.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(
            props.content_encoding().as_ref().map(|s| s.as_str()),
            Some("utf-8")
        );
        assert_eq!(props.delivery_mode(), &Some(2));
        assert_eq!(
            props.message_id().as_ref().map(|s| s.as_str()),
            Some(env.message_id.as_str())
        );
        assert_eq!(
            props.kind().as_ref().map(|s| s.as_str()),
            Some("ModelUploadStarted")
        );
        assert_eq!(
            props.correlation_id().as_ref().map(|s| s.as_str()),
            Some("corr-1")
        );
        assert_eq!(props.app_id().as_ref().map(|s| s.as_str()), Some("Hartsy"));
        assert_eq!(props.timestamp(), &Some(env.timestamp.timestamp() as u64));
    }

    #[test]
    fn correlation_id_is_omitted_when_absent() {
        let mut env = envelope();
        env.correlation_id = None;
        let props = message_properties(&env);
        assert_eq!(props.correlation_id(), &None);
    }

    #[test]
    fn headers_carry_source_targets_type_and_version() {
        let env = envelope();
        let headers = cross_site_headers(&env);

        assert_eq!(
            headers.get(&ShortString::from("x-source-site")),
            Some(&AMQPValue::LongString("Hartsy".into()))
        );
        assert_eq!(
            headers.get(&ShortString::from("x-target-sites")),
            Some(&AMQPValue::LongString("Hawtsy".into()))
        );
        assert_eq!(
            headers.get(&ShortString::from("x-message-type")),
            Some(&AMQPValue::LongString("ModelUploadStarted".into()))
        );
        assert_eq!(
            headers.get(&ShortString::from("x-message-version")),
            Some(&AMQPValue::LongInt(1))
        );
    }
}
