//! Optimistic-concurrency guard for stream appends.
//!
//! A stream only accepts an incoming batch whose first version continues
//! exactly where the stored stream ends. [`verify_contiguous`] is the pure
//! decision; [`plan_append`] wraps it with the batch and duplicate checks every
//! store runs inside its atomic append.
//!
//! ```
//! use tidemark_core::{
//!     contiguity::{verify_contiguous, Continuation},
//!     envelope::StreamName,
//! };
//!
//! let stream = StreamName::for_entity("booking", "b-1");
//! assert_eq!(verify_contiguous(&stream, None, 1), Ok(Continuation::NewStream));
//! assert_eq!(verify_contiguous(&stream, Some(4), 5), Ok(Continuation::Contiguous));
//! assert!(verify_contiguous(&stream, Some(4), 7).is_err());
//! ```

use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    envelope::{EventEnvelope, StreamName},
    error::ErrorKind,
};

/// How an incoming batch relates to the stored stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Continuation {
    /// Nothing stored yet; the batch starts the stream at version 1.
    NewStream,
    /// The batch starts right after the last stored version.
    Contiguous,
    /// The batch starts at or below the last stored version (a retry).
    Duplicate,
}

/// The incoming batch does not line up with the stored stream.
///
/// Every variant means the writer's view of the stream is stale or corrupt;
/// reload and retry.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ContiguityError {
    #[error(
        "stream {stream} has no events but the batch starts at version {incoming_first} (hint: \
         the stream was removed or never written; reload and retry)"
    )]
    StreamReset {
        stream: StreamName,
        incoming_first: u64,
    },
    #[error("missing updates between {stored_last} and {incoming_first}")]
    MissingUpdates {
        stream: StreamName,
        stored_last: u64,
        incoming_first: u64,
    },
    #[error("batch for stream {stream} skips from version {expected} to {actual}")]
    BatchGap {
        stream: StreamName,
        expected: u64,
        actual: u64,
    },
    #[error(
        "stream {stream} already holds different content at version {version} (hint: another \
         writer got there first; reload and retry)"
    )]
    ConflictingDuplicate { stream: StreamName, version: u64 },
}

impl ContiguityError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::EntityExists
    }
}

/// Decide whether a batch starting at `incoming_first` may follow
/// `stored_last`.
///
/// # Errors
///
/// [`ContiguityError::StreamReset`] when nothing is stored and the batch does
/// not start at 1, [`ContiguityError::MissingUpdates`] when the batch starts
/// beyond the next expected version.
pub fn verify_contiguous(
    stream: &StreamName,
    stored_last: Option<u64>,
    incoming_first: u64,
) -> Result<Continuation, ContiguityError> {
    match stored_last {
        None if incoming_first == 1 => Ok(Continuation::NewStream),
        None => Err(ContiguityError::StreamReset {
            stream: stream.clone(),
            incoming_first,
        }),
        Some(last) if incoming_first <= last => Ok(Continuation::Duplicate),
        Some(last) if incoming_first == last + 1 => Ok(Continuation::Contiguous),
        Some(last) => Err(ContiguityError::MissingUpdates {
            stream: stream.clone(),
            stored_last: last,
            incoming_first,
        }),
    }
}

/// What a store should do with an incoming batch.
#[derive(Clone, Debug, PartialEq)]
pub struct AppendPlan {
    pub continuation: Continuation,
    /// Envelopes above the stored head, in version order. Empty when the
    /// whole batch was already stored.
    pub to_write: Vec<EventEnvelope>,
}

/// Validate `incoming` against the stored stream and split off what still
/// needs writing.
///
/// `overlap` holds `(version, content_hash)` for every stored version the
/// batch overlaps, i.e. versions in `incoming_first..=stored_last`. Overlapping
/// envelopes must hash identically to what is stored, which includes the
/// event id: only a re-sent envelope counts as a duplicate, never another
/// writer's event with an equal payload.
///
/// # Errors
///
/// [`ContiguityError::BatchGap`] when the batch is not itself gap-free,
/// [`ContiguityError::ConflictingDuplicate`] when an overlapping version holds
/// different content, otherwise whatever [`verify_contiguous`] returns.
pub fn plan_append(
    stream: &StreamName,
    stored_last: Option<u64>,
    overlap: &[(u64, String)],
    incoming: NonEmpty<EventEnvelope>,
) -> Result<AppendPlan, ContiguityError> {
    let incoming_first = incoming.head.version;
    for (expected, envelope) in (incoming_first..).zip(incoming.iter()) {
        if envelope.version != expected {
            return Err(ContiguityError::BatchGap {
                stream: stream.clone(),
                expected,
                actual: envelope.version,
            });
        }
    }

    let continuation = verify_contiguous(stream, stored_last, incoming_first)?;
    let head = stored_last.unwrap_or(0);

    let mut to_write = Vec::with_capacity(incoming.len());
    for envelope in incoming {
        if envelope.version > head {
            to_write.push(envelope);
            continue;
        }
        let stored = overlap
            .iter()
            .find(|(version, _)| *version == envelope.version)
            .map(|(_, hash)| hash.as_str());
        if stored != Some(envelope.content_hash().as_str()) {
            tracing::debug!(%stream, version = envelope.version, "duplicate append with different content");
            return Err(ContiguityError::ConflictingDuplicate {
                stream: stream.clone(),
                version: envelope.version,
            });
        }
    }

    tracing::trace!(%stream, ?continuation, writes = to_write.len(), "append planned");
    Ok(AppendPlan {
        continuation,
        to_write,
    })
}
