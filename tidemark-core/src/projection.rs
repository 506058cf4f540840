//! Read-side primitives.
//!
//! A [`Projection`] consumes the events of one aggregate kind and applies them
//! to a read-model it owns. Projections are collected in a
//! [`ProjectionRegistry`] together with the [`EventTypeRegistry`] used to
//! decode their events; the [`ReadModelProjector`] routes each envelope to the
//! projection registered for its entity type.
//!
//! [`ReadModelProjector`]: crate::projector::ReadModelProjector

use std::{collections::HashMap, fmt, future::Future, pin::Pin};

use thiserror::Error;

use crate::{
    envelope::EventEnvelope,
    error::{BoxError, ErrorKind},
    migrate::{EventTypeRegistry, MigrationError},
};

/// A read-model updater for one aggregate kind.
///
/// `project_event` reports whether it recognised the event. Returning
/// `Ok(false)` for an event routed to this projection is treated as a
/// configuration defect and stops the batch.
///
/// ```ignore
/// impl Projection for AvailabilityView {
///     const NAME: &'static str = "availability";
///     const AGGREGATE_KIND: &'static str = "car";
///     type Event = CarEvent;
///     type Error = sqlx::Error;
///
///     async fn project_event(&self, envelope: &EventEnvelope, event: &CarEvent) -> Result<bool, sqlx::Error> {
///         match event {
///             CarEvent::Parked(e) => { /* upsert row */ Ok(true) }
///             _ => Ok(true),
///         }
///     }
/// }
/// ```
// ANCHOR: projection_trait
pub trait Projection: Send + Sync + 'static {
    /// Name used in logs and error messages.
    const NAME: &'static str;

    /// Entity type of the streams this projection consumes.
    const AGGREGATE_KIND: &'static str;

    type Event: Send + Sync + 'static;

    type Error: std::error::Error + Send + Sync + 'static;

    /// Apply one decoded event to the read-model.
    ///
    /// # Errors
    ///
    /// Returns the read-model's own error; the batch is aborted and the
    /// checkpoint is not advanced.
    fn project_event(
        &self,
        envelope: &EventEnvelope,
        event: &Self::Event,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;
}
// ANCHOR_END: projection_trait

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failure while dispatching one envelope to an erased projection.
#[derive(Debug)]
pub(crate) enum DispatchError {
    Decode(MigrationError),
    Projection(BoxError),
}

/// Object-safe view of a registered projection.
pub(crate) trait ErasedProjection: Send + Sync {
    fn name(&self) -> &'static str;

    fn project<'a>(&'a self, envelope: &'a EventEnvelope) -> BoxFuture<'a, Result<bool, DispatchError>>;
}

struct Registered<P: Projection> {
    projection: P,
    events: EventTypeRegistry<P::Event>,
}

impl<P: Projection> ErasedProjection for Registered<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn project<'a>(&'a self, envelope: &'a EventEnvelope) -> BoxFuture<'a, Result<bool, DispatchError>> {
        Box::pin(async move {
            let event = self.events.decode(envelope).map_err(DispatchError::Decode)?;
            self.projection
                .project_event(envelope, &event)
                .await
                .map_err(|e| DispatchError::Projection(Box::new(e)))
        })
    }
}

/// A second projection was registered for an aggregate kind.
///
/// Checkpoints are kept per stream, so each aggregate kind has exactly one
/// projection.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("aggregate kind {aggregate_kind} is already projected by {existing}, cannot add {rejected}")]
pub struct DuplicateProjection {
    pub aggregate_kind: &'static str,
    pub existing: &'static str,
    pub rejected: &'static str,
}

impl DuplicateProjection {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::RuleViolation
    }
}

/// Projections keyed by the aggregate kind they consume.
#[derive(Default)]
pub struct ProjectionRegistry {
    by_kind: HashMap<&'static str, Box<dyn ErasedProjection>>,
}

impl ProjectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `projection`, decoding its events through `events`.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateProjection`] if a projection already consumes
    /// `P::AGGREGATE_KIND`.
    pub fn register<P: Projection>(
        &mut self,
        projection: P,
        events: EventTypeRegistry<P::Event>,
    ) -> Result<&mut Self, DuplicateProjection> {
        if let Some(existing) = self.by_kind.get(P::AGGREGATE_KIND) {
            return Err(DuplicateProjection {
                aggregate_kind: P::AGGREGATE_KIND,
                existing: existing.name(),
                rejected: P::NAME,
            });
        }
        tracing::debug!(
            projection = P::NAME,
            aggregate_kind = P::AGGREGATE_KIND,
            "projection registered"
        );
        self.by_kind.insert(
            P::AGGREGATE_KIND,
            Box::new(Registered { projection, events }),
        );
        Ok(self)
    }

    /// Builder form of [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn with<P: Projection>(
        mut self,
        projection: P,
        events: EventTypeRegistry<P::Event>,
    ) -> Result<Self, DuplicateProjection> {
        self.register(projection, events)?;
        Ok(self)
    }

    /// Name of the projection consuming `aggregate_kind`, if any.
    #[must_use]
    pub fn projection_for(&self, aggregate_kind: &str) -> Option<&'static str> {
        self.by_kind.get(aggregate_kind).map(|p| p.name())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_kind.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    pub(crate) fn resolve(&self, aggregate_kind: &str) -> Option<&dyn ErasedProjection> {
        self.by_kind.get(aggregate_kind).map(AsRef::as_ref)
    }
}

impl fmt::Debug for ProjectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routes: Vec<_> = self
            .by_kind
            .iter()
            .map(|(kind, p)| (*kind, p.name()))
            .collect();
        routes.sort_unstable();
        f.debug_struct("ProjectionRegistry")
            .field("routes", &routes)
            .finish()
    }
}
