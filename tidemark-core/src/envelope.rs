//! The durable unit of an event stream.
//!
//! An [`EventEnvelope`] wraps one domain event with everything a store needs
//! to persist it and a reader needs to route it back to a concrete type:
//! owning entity, event-type name, type token, JSON payload and version.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::event::EventSet;

/// Name of one aggregate instance's event stream.
///
/// Derived from the aggregate kind and identifier as `"{kind}:{id}"`.
/// Identifiers may contain `:`; kinds must not, so the first `:` always
/// separates the two.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamName(String);

impl StreamName {
    /// # Panics
    ///
    /// Debug builds panic if `kind` contains `:`.
    #[must_use]
    pub fn for_entity(kind: &str, id: &str) -> Self {
        debug_assert!(!kind.contains(':'), "aggregate kind {kind:?} must not contain ':'");
        Self(format!("{kind}:{id}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StreamName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StreamName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Serialized change event, store-agnostic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    /// Kind of the aggregate that owns the stream.
    pub entity_type: String,
    pub entity_id: String,
    /// Event-type name ([`DomainEvent::KIND`](crate::event::DomainEvent::KIND)).
    pub event_type: String,
    /// Fully-qualified type identity used by the migrator.
    pub type_token: String,
    pub payload: serde_json::Value,
    /// 1-based, contiguous within the stream.
    pub version: u64,
    pub occurred_at: DateTime<Utc>,
    /// Set by the store when the envelope is durably written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_persisted: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    /// Wrap `event` for the entity `(entity_type, entity_id)` at `version`.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the event cannot be serialized.
    pub fn record<E: EventSet>(
        entity_type: &str,
        entity_id: &str,
        event: &E,
        version: u64,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            entity_type: entity_type.to_owned(),
            entity_id: entity_id.to_owned(),
            event_type: event.kind().to_owned(),
            type_token: event.type_token().to_owned(),
            payload: event.to_payload()?,
            version,
            occurred_at,
            last_persisted: None,
        })
    }

    #[must_use]
    pub fn stream(&self) -> StreamName {
        StreamName::for_entity(&self.entity_type, &self.entity_id)
    }

    /// Hex SHA-256 of the envelope's identity and content.
    ///
    /// Covers the event id, owning entity, event type, type token and
    /// payload. Timestamps are excluded. A retry re-sends the buffered
    /// envelope with its original event id, so it hashes identically; a
    /// different command that raised the same payload does not.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.event_id.as_bytes());
        for part in [
            self.entity_type.as_str(),
            self.entity_id.as_str(),
            self.event_type.as_str(),
            self.type_token.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0]);
        }
        // serde_json's default map is ordered, so this rendering is canonical
        hasher.update(self.payload.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}
