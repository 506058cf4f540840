//! Event-type migration and deserialization.
//!
//! Stored envelopes carry a type token and an event-type name. The
//! [`EventTypeRegistry`] is the hand-maintained lookup table that turns those
//! two strings back into a concrete event, tolerating types that have been
//! renamed, relocated or reshaped since the envelope was written.
//!
//! Resolution order for a stored `(event_type, type_token)`:
//!
//! 1. `type_token` is registered as a current type.
//! 2. `type_token` is an obsolete token; follow [`rename`](EventTypeRegistry::rename)
//!    and [`upcast`](EventTypeRegistry::upcast) entries until a current token
//!    is reached, applying payload upcasts in order.
//! 3. Exactly one registered type has `KIND == event_type` (the type moved but
//!    kept its name).
//!
//! Anything else is [`MigrationError::UnknownType`]; unknown events are never
//! dropped or coerced.

use std::{collections::HashMap, fmt};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{envelope::EventEnvelope, error::ErrorKind, event::DomainEvent};

type Factory<E> = Box<dyn Fn(serde_json::Value) -> Result<E, serde_json::Error> + Send + Sync>;
type Upcaster = Box<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

/// Error returned when a stored event cannot be turned back into a type.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("unknown event type `{event_type}` (type token `{type_token}`)")]
    UnknownType {
        event_type: String,
        type_token: String,
    },
    #[error("type token `{type_token}` is part of a rename cycle")]
    RenameCycle { type_token: String },
    #[error("payload does not match registered type `{type_token}`: {source}")]
    Payload {
        type_token: String,
        #[source]
        source: serde_json::Error,
    },
}

impl MigrationError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::RuleViolation
    }
}

struct Registration<E> {
    token: &'static str,
    kind: &'static str,
    factory: Factory<E>,
}

struct Rename {
    current: String,
    upcast: Option<Upcaster>,
}

/// Explicit, versioned table from stored type tokens to event factories.
///
/// Build one per event set at start-up (usually starting from
/// [`EventSet::registry`](crate::event::EventSet::registry)) and pass it by
/// reference to the repository and the projector.
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use tidemark_core::{event::DomainEvent, migrate::EventTypeRegistry};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct Renamed { name: String }
///
/// impl DomainEvent for Renamed {
///     const KIND: &'static str = "renamed";
///     const TYPE_TOKEN: &'static str = "profile.v2.renamed";
/// }
///
/// let registry = EventTypeRegistry::<Renamed>::new()
///     .with::<Renamed>()
///     .rename("profile.v1.renamed", "profile.v2.renamed");
///
/// let event = registry
///     .rehydrate(&serde_json::json!({ "name": "ada" }), "renamed", "profile.v1.renamed")
///     .unwrap();
/// assert_eq!(event, Renamed { name: "ada".into() });
/// ```
pub struct EventTypeRegistry<E> {
    types: HashMap<&'static str, Registration<E>>,
    renames: HashMap<String, Rename>,
}

impl<E> EventTypeRegistry<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
            renames: HashMap::new(),
        }
    }

    /// Register `T` as the current type for `T::TYPE_TOKEN`.
    ///
    /// Registering the same token twice keeps the last registration.
    pub fn register<T>(&mut self) -> &mut Self
    where
        T: DomainEvent + DeserializeOwned + Into<E> + 'static,
    {
        self.types.insert(
            T::TYPE_TOKEN,
            Registration {
                token: T::TYPE_TOKEN,
                kind: T::KIND,
                factory: Box::new(|value| serde_json::from_value::<T>(value).map(Into::into)),
            },
        );
        self
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with<T>(mut self) -> Self
    where
        T: DomainEvent + DeserializeOwned + Into<E> + 'static,
    {
        self.register::<T>();
        self
    }

    /// Route envelopes stored under `obsolete` to the type now registered as
    /// `current`. The payload shape must be unchanged.
    #[must_use]
    pub fn rename(mut self, obsolete: impl Into<String>, current: impl Into<String>) -> Self {
        self.renames.insert(
            obsolete.into(),
            Rename {
                current: current.into(),
                upcast: None,
            },
        );
        self
    }

    /// Like [`rename`](Self::rename), but also rewrites the stored payload
    /// into the shape `current` expects.
    #[must_use]
    pub fn upcast<F>(mut self, obsolete: impl Into<String>, current: impl Into<String>, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.renames.insert(
            obsolete.into(),
            Rename {
                current: current.into(),
                upcast: Some(Box::new(f)),
            },
        );
        self
    }

    #[must_use]
    pub fn is_registered(&self, type_token: &str) -> bool {
        self.types.contains_key(type_token)
    }

    /// The current type token a stored `(event_type, type_token)` resolves to.
    ///
    /// Tried in order: the token itself, its rename chain, then the single
    /// registered type whose `KIND` equals `event_type`. The last step only
    /// applies to tokens with no rename entry.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::UnknownType`] when nothing matches or a
    /// rename chain ends at an unregistered token, or
    /// [`MigrationError::RenameCycle`] when the rename table loops.
    pub fn resolve(&self, event_type: &str, type_token: &str) -> Result<&'static str, MigrationError> {
        self.resolve_chain(event_type, type_token)
            .map(|(registration, _)| registration.token)
    }

    /// Deserialize `payload` into the event type the token resolves to.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] when the token cannot be resolved or the
    /// (upcast) payload does not fit the resolved type.
    pub fn rehydrate(
        &self,
        payload: &serde_json::Value,
        event_type: &str,
        type_token: &str,
    ) -> Result<E, MigrationError> {
        let (registration, upcasts) = self.resolve_chain(event_type, type_token)?;
        let payload = upcasts
            .into_iter()
            .fold(payload.clone(), |payload, upcast| upcast(payload));
        (registration.factory)(payload).map_err(|source| MigrationError::Payload {
            type_token: registration.token.to_owned(),
            source,
        })
    }

    /// [`rehydrate`](Self::rehydrate) the event carried by `envelope`.
    ///
    /// # Errors
    ///
    /// See [`rehydrate`](Self::rehydrate).
    pub fn decode(&self, envelope: &EventEnvelope) -> Result<E, MigrationError> {
        self.rehydrate(&envelope.payload, &envelope.event_type, &envelope.type_token)
    }

    fn resolve_chain(
        &self,
        event_type: &str,
        type_token: &str,
    ) -> Result<(&Registration<E>, Vec<&Upcaster>), MigrationError> {
        let mut token = type_token;
        let mut upcasts = Vec::new();
        let mut hops = 0;

        loop {
            if let Some(registration) = self.types.get(token) {
                return Ok((registration, upcasts));
            }
            let Some(rename) = self.renames.get(token) else {
                break;
            };
            hops += 1;
            if hops > self.renames.len() {
                return Err(MigrationError::RenameCycle {
                    type_token: type_token.to_owned(),
                });
            }
            if let Some(upcast) = &rename.upcast {
                upcasts.push(upcast);
            }
            token = &rename.current;
        }

        // a rename chain that dead-ends is a registration mistake, not a relocation
        if hops > 0 {
            tracing::debug!(type_token, dead_end = token, "rename chain ends at an unregistered token");
            return Err(MigrationError::UnknownType {
                event_type: event_type.to_owned(),
                type_token: type_token.to_owned(),
            });
        }

        let mut by_kind = self.types.values().filter(|r| r.kind == event_type);
        match (by_kind.next(), by_kind.next()) {
            (Some(registration), None) => {
                tracing::debug!(
                    event_type,
                    type_token,
                    resolved = registration.token,
                    "resolved relocated event type by name"
                );
                Ok((registration, upcasts))
            }
            _ => Err(MigrationError::UnknownType {
                event_type: event_type.to_owned(),
                type_token: type_token.to_owned(),
            }),
        }
    }
}

impl<E> Default for EventTypeRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventTypeRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens: Vec<_> = self.types.keys().collect();
        tokens.sort_unstable();
        let mut renames: Vec<_> = self
            .renames
            .iter()
            .map(|(from, to)| (from.as_str(), to.current.as_str()))
            .collect();
        renames.sort_unstable();
        f.debug_struct("EventTypeRegistry")
            .field("types", &tokens)
            .field("renames", &renames)
            .finish()
    }
}
