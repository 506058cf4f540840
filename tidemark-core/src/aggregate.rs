//! Write-side runtime.
//!
//! An [`Aggregate`] is plain typed state plus a reducer. [`Root`] wraps it with
//! identity, version counters and the buffer of raised-but-unpersisted
//! envelopes. Every mutation goes through a reducer on a scratch copy, so a
//! rejected event or a failed replay never leaves a half-applied root behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    ensure,
    envelope::{EventEnvelope, StreamName},
    error::{ErrorKind, RuleViolation},
    event::EventSet,
    migrate::{EventTypeRegistry, MigrationError},
};

/// Typed aggregate state and its reducer.
///
/// Implementations hold their child entities directly (see
/// [`Children`](crate::entity::Children)) and route child events to them from
/// [`on_state_changed`](Aggregate::on_state_changed).
// ANCHOR: aggregate_trait
pub trait Aggregate: Default + Clone {
    /// Aggregate type name, used as the stream prefix and stored on every
    /// envelope as its entity type. Use lowercase kebab-case.
    const KIND: &'static str;

    type Event: EventSet;

    /// Apply one event to the state.
    ///
    /// Called both when an event is raised and when history is replayed, so it
    /// must be deterministic and must not consult anything but `self` and the
    /// event.
    ///
    /// # Errors
    ///
    /// Returns a [`RuleViolation`] when the event is not acceptable in the
    /// current state.
    fn on_state_changed(&mut self, event: &Self::Event) -> Result<(), RuleViolation>;

    /// Domain invariants that must hold after every applied event.
    ///
    /// # Errors
    ///
    /// Returns a [`RuleViolation`] describing the first broken invariant.
    fn ensure_invariants(&self) -> Result<(), RuleViolation> {
        Ok(())
    }
}
// ANCHOR_END: aggregate_trait

/// Identity, timestamps and version counters of a root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified_at: Option<DateTime<Utc>>,
    pub last_persisted_at: Option<DateTime<Utc>>,
    /// Version of the first applied event; 0 until one is applied.
    pub first_version: u64,
    /// Version of the last applied event, persisted or not.
    pub last_version: u64,
}

impl EntityMeta {
    fn new(id: String) -> Self {
        Self {
            id,
            created_at: None,
            last_modified_at: None,
            last_persisted_at: None,
            first_version: 0,
            last_version: 0,
        }
    }
}

/// A root's identity and serialized properties, without its history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DehydratedEntity {
    pub meta: EntityMeta,
    pub properties: serde_json::Value,
}

/// Error returned by [`Root`] operations.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(transparent)]
    Rule(#[from] RuleViolation),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error("failed to serialize {subject} of {entity_type}: {source}")]
    Encode {
        entity_type: &'static str,
        subject: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("stored properties do not match {entity_type}: {source}")]
    Decode {
        entity_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl AggregateError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Rule(_) | Self::Migration(_) | Self::Decode { .. } => ErrorKind::RuleViolation,
            Self::Encode { .. } => ErrorKind::Unexpected,
        }
    }
}

/// An aggregate instance together with its runtime bookkeeping.
#[derive(Clone, Debug)]
pub struct Root<A: Aggregate> {
    meta: EntityMeta,
    state: A,
    changes: Vec<EventEnvelope>,
}

impl<A: Aggregate> Root<A> {
    /// A brand-new root with no history.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            meta: EntityMeta::new(id.into()),
            state: A::default(),
            changes: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.meta.id
    }

    #[must_use]
    pub const fn state(&self) -> &A {
        &self.state
    }

    #[must_use]
    pub const fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    /// Version of the last applied event (0 for a brand-new root).
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.meta.last_version
    }

    /// Version of the first applied event (0 for a brand-new root).
    #[must_use]
    pub const fn first_version(&self) -> u64 {
        self.meta.first_version
    }

    /// Version the store is expected to hold for this root.
    #[must_use]
    pub fn persisted_version(&self) -> u64 {
        self.meta.last_version - self.changes.len() as u64
    }

    #[must_use]
    pub fn stream(&self) -> StreamName {
        StreamName::for_entity(A::KIND, &self.meta.id)
    }

    /// No event has been applied or buffered yet.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.meta.last_version == 0
    }

    /// Buffered envelopes in raise order.
    #[must_use]
    pub fn changes(&self) -> &[EventEnvelope] {
        &self.changes
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Raise the event that brings this aggregate into existence.
    ///
    /// # Errors
    ///
    /// Fails with a rule violation if the root already has history, if the
    /// reducer rejects the event, or if an invariant breaks.
    pub fn raise_create_event(&mut self, event: impl Into<A::Event>) -> Result<(), AggregateError> {
        ensure!(
            self.is_new(),
            "{} {} is already created",
            A::KIND,
            self.meta.id
        );
        self.raise(event.into(), true)
    }

    /// Raise an event against an existing aggregate.
    ///
    /// # Errors
    ///
    /// Fails with a rule violation if the root was never created, if the
    /// reducer rejects the event, or if an invariant breaks.
    pub fn raise_change_event(&mut self, event: impl Into<A::Event>) -> Result<(), AggregateError> {
        ensure!(!self.is_new(), "{} {} is not created", A::KIND, self.meta.id);
        self.raise(event.into(), false)
    }

    fn raise(&mut self, event: A::Event, creating: bool) -> Result<(), AggregateError> {
        let now = Utc::now();
        let version = self.meta.last_version + 1;
        let envelope = EventEnvelope::record(A::KIND, &self.meta.id, &event, version, now)
            .map_err(|source| AggregateError::Encode {
                entity_type: A::KIND,
                subject: event.kind(),
                source,
            })?;

        let mut next = self.clone();
        next.state.on_state_changed(&event)?;
        next.meta.last_version = version;
        if next.meta.first_version == 0 {
            next.meta.first_version = version;
        }
        if creating {
            next.meta.created_at = Some(now);
        }
        next.meta.last_modified_at = Some(now);
        next.changes.push(envelope);
        next.ensure_invariants()?;

        tracing::trace!(
            entity_type = A::KIND,
            entity_id = %self.meta.id,
            event_type = event.kind(),
            version,
            "event raised"
        );
        *self = next;
        Ok(())
    }

    /// Drop the buffered envelopes after they have been durably stored.
    pub fn clear_changes(&mut self) {
        self.changes.clear();
        self.meta.last_persisted_at = Some(Utc::now());
    }

    /// Rebuild state from stored history.
    ///
    /// Envelopes are sorted by version and must form a gap-free run for this
    /// root's stream. Each is decoded through `registry` and replayed without
    /// being buffered; invariants are checked after every event. On failure
    /// the root is left exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns a rule violation if the root already has history
    /// ("changes already loaded"), if the envelopes belong to another stream
    /// or skip a version, or if replay breaks a rule. Returns
    /// [`AggregateError::Migration`] when an envelope cannot be decoded.
    pub fn load_changes(
        &mut self,
        envelopes: impl IntoIterator<Item = EventEnvelope>,
        registry: &EventTypeRegistry<A::Event>,
    ) -> Result<(), AggregateError> {
        ensure!(
            self.is_new() && self.changes.is_empty(),
            "changes already loaded"
        );

        let mut envelopes: Vec<_> = envelopes.into_iter().collect();
        if envelopes.is_empty() {
            return Ok(());
        }
        envelopes.sort_by_key(|e| e.version);

        let mut next = self.clone();
        for envelope in &envelopes {
            ensure!(
                envelope.entity_type == A::KIND && envelope.entity_id == self.meta.id,
                "event {} belongs to {}:{}, not {}",
                envelope.event_id,
                envelope.entity_type,
                envelope.entity_id,
                self.stream()
            );
            let expected = next.meta.last_version + 1;
            ensure!(
                (next.is_new() && envelope.version >= 1) || envelope.version == expected,
                "missing updates between {} and {}",
                next.meta.last_version,
                envelope.version
            );

            let event = registry.decode(envelope)?;
            next.state.on_state_changed(&event)?;
            if next.is_new() {
                next.meta.first_version = envelope.version;
                next.meta.created_at = Some(envelope.occurred_at);
            }
            next.meta.last_version = envelope.version;
            next.meta.last_modified_at = Some(envelope.occurred_at);
            if envelope.last_persisted.is_some() {
                next.meta.last_persisted_at = envelope.last_persisted;
            }
            next.ensure_invariants()?;
        }

        tracing::debug!(
            entity_type = A::KIND,
            entity_id = %self.meta.id,
            first_version = next.meta.first_version,
            last_version = next.meta.last_version,
            "changes loaded"
        );
        *self = next;
        Ok(())
    }

    /// Check the base invariants, then the aggregate's own.
    ///
    /// A root without history only has to satisfy the base checks.
    ///
    /// # Errors
    ///
    /// Returns the first broken invariant.
    pub fn ensure_invariants(&self) -> Result<(), RuleViolation> {
        ensure!(
            !self.meta.id.trim().is_empty(),
            "{} identifier must not be empty",
            A::KIND
        );
        ensure!(
            self.meta.first_version <= self.meta.last_version,
            "first version {} is after last version {}",
            self.meta.first_version,
            self.meta.last_version
        );
        ensure!(
            (self.meta.first_version == 0) == (self.meta.last_version == 0),
            "version bounds {}..={} are inconsistent",
            self.meta.first_version,
            self.meta.last_version
        );
        let pending_from = self.persisted_version() + 1;
        for (expected, envelope) in (pending_from..).zip(&self.changes) {
            ensure!(
                envelope.version == expected,
                "pending change has version {} where {expected} was expected",
                envelope.version
            );
        }

        if self.is_new() {
            return Ok(());
        }
        self.state.ensure_invariants()
    }

    /// Capture identity and properties without history.
    ///
    /// # Errors
    ///
    /// Returns a rule violation while changes are still buffered, or
    /// [`AggregateError::Encode`] if the state cannot be serialized.
    pub fn dehydrate(&self) -> Result<DehydratedEntity, AggregateError>
    where
        A: Serialize,
    {
        ensure!(
            self.changes.is_empty(),
            "{} {} has unpersisted changes",
            A::KIND,
            self.meta.id
        );
        let properties =
            serde_json::to_value(&self.state).map_err(|source| AggregateError::Encode {
                entity_type: A::KIND,
                subject: "properties",
                source,
            })?;
        Ok(DehydratedEntity {
            meta: self.meta.clone(),
            properties,
        })
    }

    /// Rebuild a root from [`dehydrate`](Self::dehydrate) output.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Decode`] if the properties do not fit `A`, or
    /// a rule violation if the rebuilt root breaks an invariant.
    pub fn rehydrate(dehydrated: DehydratedEntity) -> Result<Self, AggregateError>
    where
        A: DeserializeOwned,
    {
        let state = serde_json::from_value(dehydrated.properties).map_err(|source| {
            AggregateError::Decode {
                entity_type: A::KIND,
                source,
            }
        })?;
        let root = Self {
            meta: dehydrated.meta,
            state,
            changes: Vec::new(),
        };
        root.ensure_invariants()?;
        Ok(root)
    }
}
