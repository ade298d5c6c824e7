//! Event types, sources, subscription patterns, and well-known payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PluginError;
use crate::manifest::PluginId;

/// Published when a subscriber queue overflows and its oldest event is dropped.
pub const EVENT_DROPPED: &str = "bus.dropped";
/// Published on every lifecycle transition.
pub const EVENT_STATE_CHANGED: &str = "plugin.state_changed";
/// Published when a plugin enters `Failed`.
pub const EVENT_PLUGIN_FAILED: &str = "plugin.failed";
/// Published when a started plugin provides a UI description.
pub const EVENT_UI_CONFIG: &str = "ui.config";

/// Namespaces only the host may publish into.
pub const RESERVED_NAMESPACES: &[&str] = &["host.", "plugin.", "bus."];

/// Who published an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EventSource {
    Host,
    Plugin(PluginId),
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Plugin(id) => write!(f, "plugin:{id}"),
        }
    }
}

/// An immutable published event. Ordering key is `(source, sequence)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: EventSource,
    pub payload: serde_json::Value,
    pub correlation_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn is_diagnostic(&self) -> bool {
        self.event_type == EVENT_DROPPED
    }

    pub fn reference(&self) -> EventRef {
        EventRef {
            event_type: self.event_type.clone(),
            source: self.source.clone(),
            sequence: self.sequence,
        }
    }
}

/// Whether a plugin may never publish `event_type` regardless of grants.
pub fn is_reserved(event_type: &str) -> bool {
    RESERVED_NAMESPACES.iter().any(|ns| event_type.starts_with(ns))
}

// ─── Patterns ────────────────────────────────────────────────────────

/// An event-type pattern: exact, `prefix.*`, or `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventPattern {
    Any,
    /// Stored with its trailing dot: `twitch.*` becomes `twitch.`.
    Prefix(String),
    Exact(String),
}

impl EventPattern {
    pub fn parse(raw: &str) -> Result<Self, PluginError> {
        if raw.is_empty() {
            return Err(PluginError::HostFunction(
                "event pattern must not be empty".into(),
            ));
        }
        if raw.contains(char::is_whitespace) {
            return Err(PluginError::HostFunction(format!(
                "event pattern must not contain whitespace: '{raw}'"
            )));
        }
        if raw == "*" {
            return Ok(Self::Any);
        }
        if let Some(prefix) = raw.strip_suffix('*') {
            if prefix.ends_with('.') && prefix.len() > 1 && !prefix.contains('*') {
                return Ok(Self::Prefix(prefix.to_string()));
            }
        }
        if raw.contains('*') {
            return Err(PluginError::HostFunction(format!(
                "wildcard is only allowed as a trailing '.*' segment: '{raw}'"
            )));
        }
        Ok(Self::Exact(raw.to_string()))
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => event_type.starts_with(prefix.as_str()),
            Self::Exact(exact) => exact == event_type,
        }
    }

    /// Whether every event matched by `other` is also matched by `self`.
    pub fn covers(&self, other: &EventPattern) -> bool {
        match (self, other) {
            (Self::Any, _) => true,
            (_, Self::Any) => false,
            (Self::Prefix(p), Self::Prefix(q)) => q.starts_with(p.as_str()),
            (Self::Prefix(p), Self::Exact(e)) => e.starts_with(p.as_str()),
            (Self::Exact(_), Self::Prefix(_)) => false,
            (Self::Exact(a), Self::Exact(b)) => a == b,
        }
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Prefix(p) => write!(f, "{p}*"),
            Self::Exact(e) => f.write_str(e),
        }
    }
}

impl TryFrom<String> for EventPattern {
    type Error = PluginError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EventPattern> for String {
    fn from(value: EventPattern) -> Self {
        value.to_string()
    }
}

// ─── Event payload types ─────────────────────────────────────────────

/// Identifies an event without carrying its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRef {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: EventSource,
    pub sequence: u64,
}

/// Payload for `bus.dropped`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroppedPayload {
    pub subscriber: String,
    pub dropped: EventRef,
}

/// Payload for `plugin.state_changed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedPayload {
    pub plugin: PluginId,
    pub from: String,
    pub to: String,
}

/// Payload for `plugin.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginFailedPayload {
    pub plugin: PluginId,
    pub kind: crate::error::ErrorKind,
    pub reason: String,
}

/// Payload for `ui.config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfigPayload {
    pub plugin: PluginId,
    pub config: serde_json::Value,
}

/// Shape connection managers use for normalized inbound chat events,
/// e.g. `twitch.chat.message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMessagePayload {
    pub service: String,
    pub channel: String,
    pub author: String,
    pub text: String,
}
