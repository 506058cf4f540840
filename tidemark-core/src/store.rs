//! Persistence layer abstractions.
//!
//! This module describes the storage contract ([`EventStore`]), the
//! notification contract for stores that push appended batches
//! ([`PublishingStore`]), and a reference in-memory implementation.
use std::{future::Future, pin::Pin};

use futures_core::Stream;
pub use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    contiguity::{ContiguityError, Continuation},
    envelope::{EventEnvelope, StreamName},
    error::ErrorKind,
};

pub mod inmemory;

/// Error from a contiguity-checked append.
#[derive(Debug, Error)]
pub enum AppendError<StoreError>
where
    StoreError: std::error::Error,
{
    /// The batch does not continue the stored stream.
    #[error(transparent)]
    Contiguity(#[from] ContiguityError),
    /// Underlying store error.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl<StoreError: std::error::Error> AppendError<StoreError> {
    /// Create a store error variant.
    pub const fn store(err: StoreError) -> Self {
        Self::Store(err)
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Contiguity(_) => ErrorKind::EntityExists,
            Self::Store(_) => ErrorKind::Store,
        }
    }
}

/// Result of a successful append.
#[derive(Clone, Debug, PartialEq)]
pub struct AppendResult {
    pub continuation: Continuation,
    /// Head of the stream after the append.
    pub last_version: u64,
    /// Envelopes actually written, stamped with `last_persisted`. Empty when
    /// the whole batch was an identical retry.
    pub appended: Vec<EventEnvelope>,
}

/// Convenience alias for append outcomes returned by event stores.
pub type AppendOutcome<Err> = Result<AppendResult, AppendError<Err>>;

/// Append-only per-stream persistence.
///
/// `append` must run the contiguity check
/// ([`plan_append`](crate::contiguity::plan_append)) and the write as one
/// atomic step, so that concurrent writers on the same stream are arbitrated
/// by the store. Dropping an `append` future before it resolves must leave the
/// stream unchanged.
// ANCHOR: event_store_trait
pub trait EventStore: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Last stored version of `stream`, or `None` if it has no events.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn stream_version<'a>(
        &'a self,
        stream: &'a StreamName,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a;

    /// Append a gap-free batch to `stream`.
    ///
    /// Versions already stored are accepted only when their content matches;
    /// only the new suffix is written.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Contiguity`] if the batch does not line up with
    /// the stored stream, or [`AppendError::Store`] if persistence fails.
    fn append<'a>(
        &'a self,
        stream: &'a StreamName,
        events: NonEmpty<EventEnvelope>,
    ) -> impl Future<Output = AppendOutcome<Self::Error>> + Send + 'a;

    /// Envelopes of `stream` with `version >= from_version`, ascending.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when loading fails.
    fn read_from<'a>(
        &'a self,
        stream: &'a StreamName,
        from_version: u64,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, Self::Error>> + Send + 'a;
}
// ANCHOR_END: event_store_trait

/// Envelopes written to one stream by a single append.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamBatch {
    pub stream: StreamName,
    pub envelopes: NonEmpty<EventEnvelope>,
}

/// Notification yielded by [`PublishingStore::subscribe`].
#[derive(Clone, Debug, PartialEq)]
pub enum Published {
    Batch(StreamBatch),
    /// The subscriber fell behind and this many batches were dropped.
    Lagged(u64),
}

/// Boxed stream returned by [`PublishingStore::subscribe`].
pub type PublishedStream = Pin<Box<dyn Stream<Item = Published> + Send + 'static>>;

/// A store that announces every successful, non-empty append.
///
/// Delivery starts at the moment of subscription; earlier batches are not
/// replayed. Consumers that need history read it with
/// [`EventStore::read_from`].
pub trait PublishingStore: EventStore {
    fn subscribe(&self) -> PublishedStream;
}
