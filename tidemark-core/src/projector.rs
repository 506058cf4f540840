//! Checkpointed, idempotent read-model projector.
//!
//! [`ReadModelProjector::write_event_stream`] takes a batch of envelopes for
//! one stream (as published by the store, possibly redelivered or out of
//! order) and applies exactly the envelopes at and after the stream's
//! checkpoint, in version order, advancing the checkpoint only when the whole
//! batch succeeded.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    checkpoint::CheckpointRepository,
    envelope::{EventEnvelope, StreamName},
    error::{BoxError, ErrorKind},
    migrate::MigrationError,
    projection::{DispatchError, ProjectionRegistry},
};

/// Error returned by [`ReadModelProjector::write_event_stream`].
///
/// None of these leave the checkpoint advanced.
#[derive(Debug, Error)]
pub enum ProjectorError<CheckpointError>
where
    CheckpointError: std::error::Error + 'static,
{
    #[error("projection not configured for {entity_type}")]
    NotConfigured { entity_type: String },
    #[error("event {event_id} belongs to stream {actual}, not {stream}")]
    StreamMismatch {
        stream: StreamName,
        event_id: Uuid,
        actual: StreamName,
    },
    #[error("checkpoint error: stream {stream} expected version {expected}, saw {actual}")]
    CheckpointGap {
        stream: StreamName,
        expected: u64,
        actual: u64,
    },
    #[error("failed to decode event {event_id}: {source}")]
    Decode {
        event_id: Uuid,
        #[source]
        source: MigrationError,
    },
    #[error("projection error for {projection}, event {event_id}, type {type_token}")]
    Unhandled {
        projection: &'static str,
        event_id: Uuid,
        type_token: String,
    },
    #[error("projection {projection} failed on event {event_id}: {source}")]
    Projection {
        projection: &'static str,
        event_id: Uuid,
        #[source]
        source: BoxError,
    },
    #[error("checkpoint store error: {0}")]
    Checkpoint(#[source] CheckpointError),
    #[error("projection of stream {stream} was cancelled")]
    Cancelled { stream: StreamName },
}

impl<CheckpointError: std::error::Error + 'static> ProjectorError<CheckpointError> {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConfigured { .. }
            | Self::StreamMismatch { .. }
            | Self::CheckpointGap { .. }
            | Self::Decode { .. } => ErrorKind::RuleViolation,
            Self::Unhandled { .. } => ErrorKind::Unexpected,
            Self::Projection { .. } | Self::Checkpoint(_) => ErrorKind::Store,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

/// Outcome of one successfully projected batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectionReport {
    pub stream: StreamName,
    /// Checkpoint before the batch.
    pub previous: u64,
    /// Checkpoint after the batch.
    pub checkpoint: u64,
    /// Envelopes dispatched to the projection.
    pub projected: usize,
    /// Envelopes below the checkpoint, already projected earlier.
    pub skipped: usize,
}

impl ProjectionReport {
    /// Whether the checkpoint moved.
    #[must_use]
    pub const fn advanced(&self) -> bool {
        self.checkpoint != self.previous
    }
}

/// Routes envelopes to their projections and keeps per-stream checkpoints.
#[derive(Debug)]
pub struct ReadModelProjector<C> {
    projections: ProjectionRegistry,
    checkpoints: C,
}

impl<C: CheckpointRepository> ReadModelProjector<C> {
    pub const fn new(projections: ProjectionRegistry, checkpoints: C) -> Self {
        Self {
            projections,
            checkpoints,
        }
    }

    pub const fn checkpoints(&self) -> &C {
        &self.checkpoints
    }

    pub const fn projections(&self) -> &ProjectionRegistry {
        &self.projections
    }

    /// Project a batch of envelopes belonging to `stream`.
    ///
    /// Returns `Ok(None)` for an empty batch without touching the checkpoint
    /// repository. Otherwise every envelope is routed before any I/O, the
    /// checkpoint is read once, envelopes are applied in version order from
    /// the checkpoint, and the new checkpoint is written once if it moved.
    ///
    /// # Errors
    ///
    /// See [`ProjectorError`]. On any error the checkpoint is left where it
    /// was; envelopes dispatched before the failure will be dispatched again
    /// on redelivery.
    #[tracing::instrument(
        skip(self, stream, envelopes, cancel),
        fields(%stream, event_count = envelopes.len())
    )]
    pub async fn write_event_stream(
        &self,
        stream: &StreamName,
        envelopes: &[EventEnvelope],
        cancel: &CancellationToken,
    ) -> Result<Option<ProjectionReport>, ProjectorError<C::Error>> {
        if envelopes.is_empty() {
            tracing::trace!("empty batch");
            return Ok(None);
        }

        let mut routed = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let Some(projection) = self.projections.resolve(&envelope.entity_type) else {
                return Err(ProjectorError::NotConfigured {
                    entity_type: envelope.entity_type.clone(),
                });
            };
            let actual = envelope.stream();
            if actual != *stream {
                return Err(ProjectorError::StreamMismatch {
                    stream: stream.clone(),
                    event_id: envelope.event_id,
                    actual,
                });
            }
            routed.push((envelope, projection));
        }
        routed.sort_by_key(|(envelope, _)| envelope.version);

        if cancel.is_cancelled() {
            return Err(ProjectorError::Cancelled {
                stream: stream.clone(),
            });
        }
        let previous = self
            .checkpoints
            .load_checkpoint(stream)
            .await
            .map_err(ProjectorError::Checkpoint)?;

        let mut expected = previous;
        let mut projected = 0;
        let mut skipped = 0;

        for (envelope, projection) in routed {
            if envelope.version < expected {
                tracing::trace!(version = envelope.version, expected, "already projected");
                skipped += 1;
                continue;
            }
            if envelope.version > expected {
                tracing::debug!(version = envelope.version, expected, "checkpoint gap");
                return Err(ProjectorError::CheckpointGap {
                    stream: stream.clone(),
                    expected,
                    actual: envelope.version,
                });
            }

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(version = envelope.version, "cancelled during dispatch");
                    return Err(ProjectorError::Cancelled { stream: stream.clone() });
                }
                outcome = projection.project(envelope) => outcome,
            };
            match outcome {
                Ok(true) => {}
                Ok(false) => {
                    return Err(ProjectorError::Unhandled {
                        projection: projection.name(),
                        event_id: envelope.event_id,
                        type_token: envelope.type_token.clone(),
                    });
                }
                Err(DispatchError::Decode(source)) => {
                    return Err(ProjectorError::Decode {
                        event_id: envelope.event_id,
                        source,
                    });
                }
                Err(DispatchError::Projection(source)) => {
                    return Err(ProjectorError::Projection {
                        projection: projection.name(),
                        event_id: envelope.event_id,
                        source,
                    });
                }
            }

            tracing::trace!(
                projection = projection.name(),
                version = envelope.version,
                "event projected"
            );
            expected += 1;
            projected += 1;
        }

        if expected != previous {
            if cancel.is_cancelled() {
                return Err(ProjectorError::Cancelled {
                    stream: stream.clone(),
                });
            }
            self.checkpoints
                .save_checkpoint(stream, expected)
                .await
                .map_err(ProjectorError::Checkpoint)?;
        }

        tracing::debug!(previous, checkpoint = expected, projected, skipped, "batch projected");
        Ok(Some(ProjectionReport {
            stream: stream.clone(),
            previous,
            checkpoint: expected,
            projected,
            skipped,
        }))
    }
}
