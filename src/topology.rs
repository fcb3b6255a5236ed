// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Cross-Site Topology Catalog
//!
//! Static description of the exchanges, queues, bindings, and routing keys
//! shared by every site on the bus, plus the routing-key derivation algorithm
//! used for domain-topic publishes. This module holds no runtime state: the
//! provisioner declares what is enumerated here, and the publisher resolves
//! destinations through [`resolve_route`].

use crate::{
    config::MessageBusConfig,
    envelope::ALL_SITES,
    errors::BusError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::types::{AMQPValue, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Header field used to specify the queue overflow policy
pub const AMQP_HEADERS_OVERFLOW: &str = "x-overflow";
/// Header field used to specify the maximum message priority
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";

pub const DOMAIN_EVENTS_EXCHANGE: &str = "domain.events";
pub const TRAINING_EVENTS_EXCHANGE: &str = "training.events";
pub const SITE_ROUTING_EXCHANGE: &str = "site.routing";
pub const BROADCAST_EXCHANGE: &str = "system.broadcast";

pub const MODEL_EVENTS_QUEUE: &str = "model.events";
pub const USER_INTERACTION_EVENTS_QUEUE: &str = "user.interaction.events";
pub const SYSTEM_EVENTS_QUEUE: &str = "system.events";
pub const TRAINING_EVENTS_QUEUE: &str = "training.events";
pub const HARTSY_INBOX_QUEUE: &str = "hartsy.inbox";
pub const HAWTSY_INBOX_QUEUE: &str = "hawtsy.inbox";
pub const DISCORD_BOT_INBOX_QUEUE: &str = "discord.inbox";
pub const BROADCAST_QUEUE: &str = "system.broadcast";
pub const DEAD_LETTER_QUEUE: &str = "hartsy.deadletter.queue";
pub const MONITORING_QUEUE: &str = "monitoring";

pub const MODEL_UPLOAD_ROUTING_KEY: &str = "model.upload";
pub const MODEL_PROGRESS_ROUTING_KEY: &str = "model.progress";
pub const MODEL_COMPLETE_ROUTING_KEY: &str = "model.complete";
pub const USER_INTERACTION_ROUTING_KEY: &str = "user.interaction";
pub const SYSTEM_HEALTH_ROUTING_KEY: &str = "system.health";

pub const TRAINING_STARTED_ROUTING_KEY: &str = "training.started";
pub const TRAINING_PROGRESS_ROUTING_KEY: &str = "training.progress";
pub const TRAINING_COMPLETED_ROUTING_KEY: &str = "training.completed";
pub const TRAINING_FAILED_ROUTING_KEY: &str = "training.failed";
pub const TRAINING_TEST_IMAGE_ROUTING_KEY: &str = "training.testimage";
pub const TRAINING_MODEL_READY_ROUTING_KEY: &str = "training.modelready";

pub const HARTSY_ROUTING_KEY: &str = "hartsy";
pub const HAWTSY_ROUTING_KEY: &str = "hawtsy";
pub const DISCORD_BOT_ROUTING_KEY: &str = "discord";

/// The fixed set of cooperating sites sharing the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Site {
    Hartsy,
    Hawtsy,
    DiscordBot,
}

/// Every known site, in declaration order.
pub const ALL_KNOWN_SITES: [Site; 3] = [Site::Hartsy, Site::Hawtsy, Site::DiscordBot];

impl Site {
    /// Exact-match lookup over the fixed site enumeration.
    pub fn parse(name: &str) -> Option<Site> {
        match name {
            "Hartsy" => Some(Site::Hartsy),
            "Hawtsy" => Some(Site::Hawtsy),
            "DiscordBot" => Some(Site::DiscordBot),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Hartsy => "Hartsy",
            Site::Hawtsy => "Hawtsy",
            Site::DiscordBot => "DiscordBot",
        }
    }

    /// The inbox queue this site consumes direct deliveries from.
    pub fn inbox_queue(&self) -> &'static str {
        match self {
            Site::Hartsy => HARTSY_INBOX_QUEUE,
            Site::Hawtsy => HAWTSY_INBOX_QUEUE,
            Site::DiscordBot => DISCORD_BOT_INBOX_QUEUE,
        }
    }

    /// The direct-exchange routing key that reaches this site's inbox.
    pub fn routing_key(&self) -> &'static str {
        match self {
            Site::Hartsy => HARTSY_ROUTING_KEY,
            Site::Hawtsy => HAWTSY_ROUTING_KEY,
            Site::DiscordBot => DISCORD_BOT_ROUTING_KEY,
        }
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves a site name or fails with `UnknownSiteError`.
///
/// An unknown site identifier is an error, not a fallback.
pub fn site_from_name(name: &str) -> Result<Site, BusError> {
    Site::parse(name.trim()).ok_or_else(|| BusError::UnknownSiteError(name.trim().to_owned()))
}

/// Derives the domain-topic routing key for a message-type name.
///
/// Pure function over the type name, matched case-insensitively in a fixed
/// priority order. Blank type names fall through to the system-health key.
pub fn routing_key_for_message_type(message_type: &str) -> &'static str {
    if message_type.trim().is_empty() {
        return SYSTEM_HEALTH_ROUTING_KEY;
    }

    let lower = message_type.to_lowercase();

    if lower.contains("training") {
        return TRAINING_PROGRESS_ROUTING_KEY;
    }

    if lower.contains("modeluploadstarted") {
        return MODEL_UPLOAD_ROUTING_KEY;
    }

    if lower.contains("modeluploadprogress") {
        return MODEL_PROGRESS_ROUTING_KEY;
    }

    if lower.contains("modeluploadcompleted") || lower.contains("modeluploadcompletion") {
        return MODEL_COMPLETE_ROUTING_KEY;
    }

    if lower.contains("user")
        && (lower.contains("liked") || lower.contains("favorited") || lower.contains("download"))
    {
        return USER_INTERACTION_ROUTING_KEY;
    }

    SYSTEM_HEALTH_ROUTING_KEY
}

/// A resolved publish destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRoute {
    pub exchange: &'static str,
    pub routing_key: String,
}

/// Computes a publish destination purely from the envelope's targets.
///
/// Wildcard targets broadcast through the fanout exchange; exactly one
/// explicit site goes direct to that site's inbox; anything else rides the
/// domain-topic exchange keyed by message type.
pub fn resolve_route(target_sites: &str, message_type: &str) -> Result<PublishRoute, BusError> {
    if target_sites == ALL_SITES {
        return Ok(PublishRoute {
            exchange: BROADCAST_EXCHANGE,
            routing_key: String::new(),
        });
    }

    let targets: Vec<&str> = target_sites
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    if targets.len() == 1 {
        let site = site_from_name(targets[0])?;
        return Ok(PublishRoute {
            exchange: SITE_ROUTING_EXCHANGE,
            routing_key: site.routing_key().to_owned(),
        });
    }

    Ok(PublishRoute {
        exchange: DOMAIN_EVENTS_EXCHANGE,
        routing_key: routing_key_for_message_type(message_type).to_owned(),
    })
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

fn long_int(value: i32) -> AMQPValue {
    AMQPValue::LongInt(LongInt::from(value))
}

/// Standard arguments shared by most queues: default TTL, dead-lettering to
/// the shared dead-letter queue, length cap, reject-publish on overflow.
pub fn standard_queue_arguments(cfg: &MessageBusConfig) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        long_int(cfg.queues.default_message_ttl_ms),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        long_string(""),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        long_string(DEAD_LETTER_QUEUE),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_MAX_LENGTH),
        long_int(cfg.queues.max_queue_length),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_OVERFLOW),
        long_string("reject-publish"),
    );
    args
}

/// Standard arguments plus a priority field, with the TTL quartered so
/// priority traffic never lingers.
pub fn priority_queue_arguments(cfg: &MessageBusConfig) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = standard_queue_arguments(cfg);
    args.insert(
        ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
        long_int(cfg.queues.max_priority),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        long_int(cfg.queues.default_message_ttl_ms / 4),
    );
    args
}

/// Standard arguments with TTL and length replaced by the training overrides.
pub fn training_queue_arguments(cfg: &MessageBusConfig) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = standard_queue_arguments(cfg);
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        long_int(cfg.training_queues.progress_message_ttl_ms),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_MAX_LENGTH),
        long_int(cfg.training_queues.max_training_queue_length),
    );
    args
}

/// Dead-letter queue arguments. No dead-letter-of-dead-letter.
pub fn dead_letter_queue_arguments(cfg: &MessageBusConfig) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        long_int(cfg.queues.dead_letter_ttl_ms),
    );
    args.insert(ShortString::from(AMQP_HEADERS_MAX_LENGTH), long_int(1000));
    args
}

/// Broadcast queue arguments: short TTL, modest cap.
pub fn broadcast_queue_arguments() -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        long_int(10 * 60 * 1000),
    );
    args.insert(ShortString::from(AMQP_HEADERS_MAX_LENGTH), long_int(5000));
    args
}

/// Every exchange of the cross-site topology.
pub fn all_exchanges() -> Vec<ExchangeDefinition> {
    vec![
        ExchangeDefinition::new(DOMAIN_EVENTS_EXCHANGE).topic(),
        ExchangeDefinition::new(TRAINING_EVENTS_EXCHANGE).topic(),
        ExchangeDefinition::new(SITE_ROUTING_EXCHANGE).direct(),
        ExchangeDefinition::new(BROADCAST_EXCHANGE).fanout(),
    ]
}

/// Every queue of the cross-site topology, arguments included.
pub fn all_queues(cfg: &MessageBusConfig) -> Vec<QueueDefinition> {
    let durable = cfg.queues.durable_queues;

    vec![
        QueueDefinition::new(MODEL_EVENTS_QUEUE)
            .durable(durable)
            .arguments(standard_queue_arguments(cfg)),
        QueueDefinition::new(USER_INTERACTION_EVENTS_QUEUE)
            .durable(durable)
            .arguments(standard_queue_arguments(cfg)),
        QueueDefinition::new(SYSTEM_EVENTS_QUEUE)
            .durable(durable)
            .arguments(priority_queue_arguments(cfg)),
        QueueDefinition::new(TRAINING_EVENTS_QUEUE)
            .durable(durable)
            .arguments(training_queue_arguments(cfg)),
        QueueDefinition::new(HARTSY_INBOX_QUEUE)
            .durable(durable)
            .arguments(standard_queue_arguments(cfg)),
        QueueDefinition::new(HAWTSY_INBOX_QUEUE)
            .durable(durable)
            .arguments(standard_queue_arguments(cfg)),
        QueueDefinition::new(DISCORD_BOT_INBOX_QUEUE)
            .durable(durable)
            .arguments(standard_queue_arguments(cfg)),
        QueueDefinition::new(BROADCAST_QUEUE)
            .durable(durable)
            .arguments(broadcast_queue_arguments()),
        QueueDefinition::new(DEAD_LETTER_QUEUE)
            .durable(durable)
            .arguments(dead_letter_queue_arguments(cfg)),
        QueueDefinition::new(MONITORING_QUEUE)
            .durable(durable)
            .arguments(standard_queue_arguments(cfg)),
    ]
}

/// Every queue-to-exchange binding of the cross-site topology.
pub fn all_bindings() -> Vec<QueueBinding> {
    vec![
        QueueBinding::new(DOMAIN_EVENTS_EXCHANGE, MODEL_EVENTS_QUEUE, MODEL_UPLOAD_ROUTING_KEY),
        QueueBinding::new(DOMAIN_EVENTS_EXCHANGE, MODEL_EVENTS_QUEUE, MODEL_PROGRESS_ROUTING_KEY),
        QueueBinding::new(DOMAIN_EVENTS_EXCHANGE, MODEL_EVENTS_QUEUE, MODEL_COMPLETE_ROUTING_KEY),
        QueueBinding::new(
            DOMAIN_EVENTS_EXCHANGE,
            USER_INTERACTION_EVENTS_QUEUE,
            USER_INTERACTION_ROUTING_KEY,
        ),
        QueueBinding::new(DOMAIN_EVENTS_EXCHANGE, SYSTEM_EVENTS_QUEUE, SYSTEM_HEALTH_ROUTING_KEY),
        QueueBinding::new(
            TRAINING_EVENTS_EXCHANGE,
            TRAINING_EVENTS_QUEUE,
            TRAINING_STARTED_ROUTING_KEY,
        ),
        QueueBinding::new(
            TRAINING_EVENTS_EXCHANGE,
            TRAINING_EVENTS_QUEUE,
            TRAINING_PROGRESS_ROUTING_KEY,
        ),
        QueueBinding::new(
            TRAINING_EVENTS_EXCHANGE,
            TRAINING_EVENTS_QUEUE,
            TRAINING_COMPLETED_ROUTING_KEY,
        ),
        QueueBinding::new(
            TRAINING_EVENTS_EXCHANGE,
            TRAINING_EVENTS_QUEUE,
            TRAINING_FAILED_ROUTING_KEY,
        ),
        QueueBinding::new(
            TRAINING_EVENTS_EXCHANGE,
            TRAINING_EVENTS_QUEUE,
            TRAINING_TEST_IMAGE_ROUTING_KEY,
        ),
        QueueBinding::new(
            TRAINING_EVENTS_EXCHANGE,
            TRAINING_EVENTS_QUEUE,
            TRAINING_MODEL_READY_ROUTING_KEY,
        ),
        QueueBinding::new(SITE_ROUTING_EXCHANGE, HARTSY_INBOX_QUEUE, HARTSY_ROUTING_KEY),
        QueueBinding::new(SITE_ROUTING_EXCHANGE, HAWTSY_INBOX_QUEUE, HAWTSY_ROUTING_KEY),
        QueueBinding::new(SITE_ROUTING_EXCHANGE, DISCORD_BOT_INBOX_QUEUE, DISCORD_BOT_ROUTING_KEY),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_derivation_matches_the_fixed_table() {
        let cases = [
            ("TrainingProgress", TRAINING_PROGRESS_ROUTING_KEY),
            ("ModelUploadStarted", MODEL_UPLOAD_ROUTING_KEY),
            ("ModelUploadProgress", MODEL_PROGRESS_ROUTING_KEY),
            ("ModelUploadCompleted", MODEL_COMPLETE_ROUTING_KEY),
            ("UserLikedImage", USER_INTERACTION_ROUTING_KEY),
            ("SomeOtherEvent", SYSTEM_HEALTH_ROUTING_KEY),
        ];

        for (message_type, expected) in cases {
            assert_eq!(routing_key_for_message_type(message_type), expected);
        }
    }

    #[test]
    fn training_wins_over_other_substrings() {
        // "training" is checked first, even when the name would also match
        // the model-upload rules.
        assert_eq!(
            routing_key_for_message_type("TrainingModelUploadStarted"),
            TRAINING_PROGRESS_ROUTING_KEY
        );
    }

    #[test]
    fn blank_message_type_maps_to_system_health() {
        assert_eq!(routing_key_for_message_type(""), SYSTEM_HEALTH_ROUTING_KEY);
        assert_eq!(routing_key_for_message_type("   "), SYSTEM_HEALTH_ROUTING_KEY);
    }

    #[test]
    fn user_interaction_needs_both_substrings() {
        assert_eq!(
            routing_key_for_message_type("UserRegistered"),
            SYSTEM_HEALTH_ROUTING_KEY
        );
        assert_eq!(
            routing_key_for_message_type("UserFavoritedModel"),
            USER_INTERACTION_ROUTING_KEY
        );
        assert_eq!(
            routing_key_for_message_type("UserDownloadRequested"),
            USER_INTERACTION_ROUTING_KEY
        );
    }

    #[test]
    fn wildcard_routes_to_the_broadcast_exchange() {
        let route = resolve_route("*", "SomeOtherEvent").unwrap();
        assert_eq!(route.exchange, BROADCAST_EXCHANGE);
        assert_eq!(route.routing_key, "");
    }

    #[test]
    fn single_site_routes_direct_to_its_inbox() {
        let route = resolve_route("Hawtsy", "ModelUploadStarted").unwrap();
        assert_eq!(route.exchange, SITE_ROUTING_EXCHANGE);
        assert_eq!(route.routing_key, HAWTSY_ROUTING_KEY);
    }

    #[test]
    fn two_sites_route_through_the_domain_topic() {
        let route = resolve_route("Hartsy,Hawtsy", "ModelUploadStarted").unwrap();
        assert_eq!(route.exchange, DOMAIN_EVENTS_EXCHANGE);
        assert_eq!(route.routing_key, MODEL_UPLOAD_ROUTING_KEY);
    }

    #[test]
    fn single_unknown_site_is_an_error_not_a_fallback() {
        assert_eq!(
            resolve_route("Nowhere", "SomeOtherEvent"),
            Err(BusError::UnknownSiteError("Nowhere".to_owned()))
        );
    }

    #[test]
    fn priority_ttl_is_a_quarter_of_the_default() {
        let cfg = MessageBusConfig::default();
        let args = priority_queue_arguments(&cfg);

        let ttl = args
            .get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL))
            .and_then(AMQPValue::as_long_int)
            .unwrap();
        assert_eq!(ttl, cfg.queues.default_message_ttl_ms / 4);

        assert!(args.contains_key(&ShortString::from(AMQP_HEADERS_MAX_PRIORITY)));
    }

    #[test]
    fn standard_arguments_dead_letter_to_the_shared_queue() {
        let cfg = MessageBusConfig::default();
        let args = standard_queue_arguments(&cfg);

        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from(DEAD_LETTER_QUEUE)))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_OVERFLOW)),
            Some(&AMQPValue::LongString(LongString::from("reject-publish")))
        );
    }

    #[test]
    fn dead_letter_queue_has_no_dead_letter_target() {
        let cfg = MessageBusConfig::default();
        let args = dead_letter_queue_arguments(&cfg);
        assert!(!args.contains_key(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)));
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MAX_LENGTH)),
            Some(&AMQPValue::LongInt(1000))
        );
    }

    #[test]
    fn catalog_enumerates_the_fixed_topology() {
        let cfg = MessageBusConfig::default();
        assert_eq!(all_exchanges().len(), 4);
        assert_eq!(all_queues(&cfg).len(), 10);
        assert_eq!(all_bindings().len(), 14);
    }

    #[test]
    fn site_lookups_are_exact_match() {
        assert_eq!(Site::parse("Hawtsy"), Some(Site::Hawtsy));
        assert_eq!(Site::parse("hawtsy"), None);
        assert_eq!(Site::Hawtsy.inbox_queue(), HAWTSY_INBOX_QUEUE);
        assert_eq!(Site::DiscordBot.routing_key(), DISCORD_BOT_ROUTING_KEY);
        assert!(site_from_name("Elsewhere").is_err());
    }
}
