//! In-memory event store implementation for testing.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`EventStore`](super::EventStore) and
//! [`PublishingStore`](super::PublishingStore) suitable for unit tests,
//! examples and single-process deployments.
//!
//! # Example
//!
//! ```
//! use tidemark_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! assert!(store.stream_names().is_empty());
//! ```

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, RwLock},
};

use chrono::Utc;
use nonempty::NonEmpty;
use tokio::sync::broadcast;
use tokio_stream::{
    StreamExt as _,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};

use crate::{
    contiguity::plan_append,
    envelope::{EventEnvelope, StreamName},
    store::{
        AppendOutcome, AppendResult, EventStore, Published, PublishedStream, PublishingStore,
        StreamBatch,
    },
};

/// Batches a slow subscriber may fall behind before it starts lagging.
pub const DEFAULT_PUBLISH_CAPACITY: usize = 1024;

/// In-memory event store that keeps streams in a hash map.
///
/// Clones share the same streams and the same publisher.
#[derive(Clone)]
pub struct Store {
    streams: Arc<RwLock<HashMap<StreamName, Vec<EventEnvelope>>>>,
    publisher: broadcast::Sender<StreamBatch>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::with_publish_capacity(DEFAULT_PUBLISH_CAPACITY)
    }

    /// Create a store whose subscribers lag after `capacity` unread batches.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_publish_capacity(capacity: usize) -> Self {
        let (publisher, _) = broadcast::channel(capacity);
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            publisher,
        }
    }

    /// Names of every stream holding at least one event, sorted.
    #[must_use]
    pub fn stream_names(&self) -> Vec<StreamName> {
        let streams = self.streams.read().expect("in-memory store lock poisoned");
        let mut names: Vec<_> = streams.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("streams", &self.stream_names().len())
            .field("subscribers", &self.publisher.receiver_count())
            .finish()
    }
}

impl EventStore for Store {
    type Error = Infallible;

    #[tracing::instrument(skip(self, stream), fields(%stream))]
    fn stream_version<'a>(
        &'a self,
        stream: &'a StreamName,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a {
        let version = {
            let streams = self.streams.read().expect("in-memory store lock poisoned");
            streams
                .get(stream)
                .and_then(|s| s.last().map(|e| e.version))
        };
        tracing::trace!(?version, "retrieved stream version");
        std::future::ready(Ok(version))
    }

    #[tracing::instrument(skip(self, stream, events), fields(%stream, event_count = events.len()))]
    fn append<'a>(
        &'a self,
        stream: &'a StreamName,
        events: NonEmpty<EventEnvelope>,
    ) -> impl Future<Output = AppendOutcome<Self::Error>> + Send + 'a {
        let result = (|| -> AppendOutcome<Infallible> {
            let incoming_first = events.head.version;
            let mut streams = self.streams.write().expect("in-memory store lock poisoned");

            let existing = streams.get(stream);
            let stored_last = existing.and_then(|s| s.last()).map(|e| e.version);
            let overlap: Vec<_> = existing
                .into_iter()
                .flatten()
                .filter(|e| e.version >= incoming_first)
                .map(|e| (e.version, e.content_hash()))
                .collect();

            let plan = plan_append(stream, stored_last, &overlap, events)?;

            let now = Utc::now();
            let appended: Vec<_> = plan
                .to_write
                .into_iter()
                .map(|mut e| {
                    e.last_persisted = Some(now);
                    e
                })
                .collect();
            let last_version = appended
                .last()
                .map_or(stored_last.unwrap_or(0), |e| e.version);

            if let Some(envelopes) = NonEmpty::from_slice(&appended) {
                streams
                    .entry(stream.clone())
                    .or_default()
                    .extend(appended.iter().cloned());
                // published under the write lock so subscribers see a stream's
                // batches in version order
                let receivers = self
                    .publisher
                    .send(StreamBatch {
                        stream: stream.clone(),
                        envelopes,
                    })
                    .unwrap_or(0);
                tracing::trace!(receivers, "batch published");
            }
            drop(streams);

            tracing::debug!(
                continuation = ?plan.continuation,
                events_appended = appended.len(),
                last_version,
                "events appended to stream"
            );
            Ok(AppendResult {
                continuation: plan.continuation,
                last_version,
                appended,
            })
        })();

        std::future::ready(result)
    }

    #[tracing::instrument(skip(self, stream), fields(%stream))]
    fn read_from<'a>(
        &'a self,
        stream: &'a StreamName,
        from_version: u64,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, Self::Error>> + Send + 'a {
        let envelopes: Vec<_> = {
            let streams = self.streams.read().expect("in-memory store lock poisoned");
            streams
                .get(stream)
                .into_iter()
                .flatten()
                .filter(|e| e.version >= from_version)
                .cloned()
                .collect()
        };
        tracing::trace!(count = envelopes.len(), "read stream");
        std::future::ready(Ok(envelopes))
    }
}

impl PublishingStore for Store {
    fn subscribe(&self) -> PublishedStream {
        let receiver = self.publisher.subscribe();
        Box::pin(BroadcastStream::new(receiver).map(|item| match item {
            Ok(batch) => Published::Batch(batch),
            Err(BroadcastStreamRecvError::Lagged(missed)) => Published::Lagged(missed),
        }))
    }
}
