// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! This module defines the versioned wrapper carried on the wire for every
//! cross-site message: routing metadata (source, targets, correlation) plus an
//! opaque business payload. Field names are serialized in PascalCase and
//! null-valued fields are omitted, matching the shared wire contract of every
//! site on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Wildcard target meaning "deliver to every site".
pub const ALL_SITES: &str = "*";

/// The wrapper carrying routing metadata and a business payload.
///
/// A `MessageEnvelope` is created at publish time and never mutated after
/// creation. `target_sites` is either [`ALL_SITES`] or a comma-separated list
/// of site identifiers.
/// Envelopes are read defensively: a missing id, type, or source falls back
/// to empty, missing targets to the wildcard, a missing version to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageEnvelope<T> {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub source_site: String,
    #[serde(default = "default_target_sites")]
    pub target_sites: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

fn default_target_sites() -> String {
    ALL_SITES.to_owned()
}

fn default_version() -> i32 {
    1
}

impl<T> MessageEnvelope<T> {
    /// Creates an envelope around `payload` with a fresh message id, the
    /// current UTC timestamp, and schema version 1.
    pub fn new(
        message_type: &str,
        payload: T,
        source_site: &str,
        target_sites: &str,
        correlation_id: Option<String>,
    ) -> MessageEnvelope<T> {
        MessageEnvelope {
            message_id: Uuid::new_v4().to_string(),
            message_type: message_type.to_owned(),
            source_site: source_site.to_owned(),
            target_sites: target_sites.to_owned(),
            timestamp: Utc::now(),
            version: 1,
            correlation_id,
            payload,
            metadata: None,
        }
    }

    /// Attaches an open key/value metadata map.
    pub fn metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Whether this envelope should be processed by `site_name`.
    ///
    /// The wildcard matches every site; an explicit list is comma-split,
    /// trimmed, and compared case-insensitively. A blank site never matches.
    pub fn is_targeted_at(&self, site_name: &str) -> bool {
        targets_include(&self.target_sites, site_name)
    }

    /// Derives a response envelope from this one.
    ///
    /// The response targets the original source site and carries this
    /// envelope's message id as its correlation id.
    pub fn respond_with<R>(&self, message_type: &str, payload: R, responding_site: &str) -> MessageEnvelope<R> {
        MessageEnvelope::new(
            message_type,
            payload,
            responding_site,
            &self.source_site,
            Some(self.message_id.clone()),
        )
    }
}

/// Whether a target-sites expression includes `site_name`.
///
/// The wildcard matches every site; an explicit list is comma-split, trimmed,
/// and compared case-insensitively. A blank site never matches.
pub(crate) fn targets_include(target_sites: &str, site_name: &str) -> bool {
    if site_name.trim().is_empty() {
        return false;
    }

    if target_sites == ALL_SITES {
        return true;
    }

    target_sites
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .any(|t| t.eq_ignore_ascii_case(site_name))
}

/// Outcome reported by a handler for one delivery.
///
/// The retry flag alone decides the delivery's disposition on failure: the
/// bus never overrides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResult {
    pub is_success: bool,
    pub error_message: Option<String>,
    pub should_retry: bool,
}

impl HandlerResult {
    pub fn success() -> HandlerResult {
        HandlerResult {
            is_success: true,
            error_message: None,
            should_retry: false,
        }
    }

    pub fn failure(error_message: &str, should_retry: bool) -> HandlerResult {
        HandlerResult {
            is_success: false,
            error_message: Some(error_message.to_owned()),
            should_retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Ping {
        note: String,
    }

    fn envelope(target_sites: &str) -> MessageEnvelope<Ping> {
        MessageEnvelope::new(
            "Ping",
            Ping {
                note: "hi".to_owned(),
            },
            "Hartsy",
            target_sites,
            None,
        )
    }

    #[test]
    fn wildcard_targets_every_site() {
        let env = envelope(ALL_SITES);
        assert!(env.is_targeted_at("Hartsy"));
        assert!(env.is_targeted_at("Hawtsy"));
        assert!(env.is_targeted_at("DiscordBot"));
    }

    #[test]
    fn explicit_list_is_trimmed_and_case_insensitive() {
        let env = envelope("Hawtsy, discordbot");
        assert!(env.is_targeted_at("Hawtsy"));
        assert!(env.is_targeted_at("DiscordBot"));
        assert!(!env.is_targeted_at("Hartsy"));
    }

    #[test]
    fn blank_site_never_matches() {
        let env = envelope(ALL_SITES);
        assert!(!env.is_targeted_at(""));
        assert!(!env.is_targeted_at("   "));
    }

    #[test]
    fn wire_form_uses_pascal_case_and_omits_null_fields() {
        let env = envelope("Hawtsy");
        let json: Value = serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();

        assert_eq!(json["MessageType"], "Ping");
        assert_eq!(json["SourceSite"], "Hartsy");
        assert_eq!(json["TargetSites"], "Hawtsy");
        assert_eq!(json["Version"], 1);
        assert!(json.get("CorrelationId").is_none());
        assert!(json.get("Metadata").is_none());
        assert_eq!(json["Payload"]["note"], "hi");
    }

    #[test]
    fn response_swaps_direction_and_links_correlation() {
        let request = envelope("Hawtsy");
        let response = request.respond_with(
            "Pong",
            Ping {
                note: "ack".to_owned(),
            },
            "Hawtsy",
        );

        assert_eq!(response.source_site, "Hawtsy");
        assert_eq!(response.target_sites, "Hartsy");
        assert_eq!(response.correlation_id.as_deref(), Some(request.message_id.as_str()));
        assert_ne!(response.message_id, request.message_id);
    }

    #[test]
    fn missing_optional_wire_fields_use_defaults_on_read() {
        let body = r#"{
            "MessageId": "abc",
            "MessageType": "Ping",
            "SourceSite": "Hawtsy",
            "TargetSites": "*",
            "Timestamp": "2026-01-01T00:00:00Z",
            "Version": 1,
            "Payload": { "note": "hi" }
        }"#;

        let env: MessageEnvelope<Ping> = serde_json::from_str(body).unwrap();
        assert!(env.correlation_id.is_none());
        assert!(env.metadata.is_none());
    }

    #[test]
    fn missing_header_fields_fall_back_to_defensive_defaults() {
        let body = r#"{
            "MessageType": "Ping",
            "Payload": { "note": "hi" }
        }"#;

        let env: MessageEnvelope<Ping> = serde_json::from_str(body).unwrap();
        assert_eq!(env.message_id, "");
        assert_eq!(env.source_site, "");
        assert_eq!(env.target_sites, ALL_SITES);
        assert_eq!(env.version, 1);
        assert_eq!(env.payload.note, "hi");
    }
}
