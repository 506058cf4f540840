//! Test utilities for event-sourced aggregates and projections.
//!
//! This module provides testing utilities for event-sourced systems:
//!
//! - [`TestExecutor`]: given/when/then testing for aggregates in isolation
//! - [`seed_events`] and [`record_events`]: build stored history without going
//!   through aggregate business logic
//! - [`CountingCheckpoints`]: a checkpoint repository wrapper that counts
//!   reads and writes
//!
//! # Unit Testing with [`TestExecutor`]
//!
//! ```ignore
//! use tidemark::test::TestExecutor;
//!
//! #[test]
//! fn a_closed_window_cannot_move() {
//!     TestExecutor::<Window>::given(&[opened().into(), WindowClosed {}.into()])
//!         .when(|root| root.raise_change_event(WindowMoved { start: 1, end: 2 }))
//!         .then_expect_error_message("window is closed");
//! }
//! ```

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use chrono::Utc;
use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    aggregate::{Aggregate, AggregateError, Root},
    checkpoint::CheckpointRepository,
    envelope::{EventEnvelope, StreamName},
    event::EventSet,
    store::{AppendError, AppendResult, EventStore},
};

/// Identifier given to aggregates built by [`TestExecutor`].
pub const TEST_AGGREGATE_ID: &str = "test-aggregate";

// =============================================================================
// Seeding stored history
// =============================================================================

/// Error type for seeding operations.
#[derive(Debug, Error)]
pub enum SeedError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("failed to read stream version: {0}")]
    Store(#[source] StoreError),
    #[error("failed to serialize event: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to persist events: {0}")]
    Append(#[source] AppendError<StoreError>),
}

/// Wrap `events` in envelopes for aggregate `id`, numbered from
/// `first_version`.
///
/// # Errors
///
/// Returns the `serde_json` error if an event cannot be serialized.
pub fn record_events<A: Aggregate>(
    id: &str,
    first_version: u64,
    events: &[A::Event],
) -> Result<Vec<EventEnvelope>, serde_json::Error> {
    let now = Utc::now();
    (first_version..)
        .zip(events)
        .map(|(version, event)| EventEnvelope::record(A::KIND, id, event, version, now))
        .collect()
}

/// Append `events` to the stream of aggregate `id`, bypassing the aggregate's
/// reducer and invariants.
///
/// Versions continue from whatever the stream already holds.
///
/// # Errors
///
/// Returns [`SeedError`] if the store cannot be read or written, or if an
/// event cannot be serialized.
pub async fn seed_events<S, A>(
    store: &S,
    id: &str,
    events: &[A::Event],
) -> Result<Option<AppendResult>, SeedError<S::Error>>
where
    S: EventStore,
    A: Aggregate,
{
    let stream = StreamName::for_entity(A::KIND, id);
    let head = store
        .stream_version(&stream)
        .await
        .map_err(SeedError::Store)?
        .unwrap_or(0);
    let envelopes = record_events::<A>(id, head + 1, events).map_err(SeedError::Encode)?;
    let Some(envelopes) = NonEmpty::from_vec(envelopes) else {
        return Ok(None);
    };
    store
        .append(&stream, envelopes)
        .await
        .map(Some)
        .map_err(SeedError::Append)
}

// =============================================================================
// Checkpoint instrumentation
// =============================================================================

/// Checkpoint repository wrapper that counts calls.
///
/// Clones share the same counters.
#[derive(Clone, Debug, Default)]
pub struct CountingCheckpoints<C> {
    inner: C,
    loads: Arc<AtomicUsize>,
    saves: Arc<AtomicUsize>,
}

impl<C> CountingCheckpoints<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            loads: Arc::new(AtomicUsize::new(0)),
            saves: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub const fn inner(&self) -> &C {
        &self.inner
    }

    #[must_use]
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl<C: CheckpointRepository> CheckpointRepository for CountingCheckpoints<C> {
    type Error = C::Error;

    fn load_checkpoint<'a>(
        &'a self,
        stream: &'a StreamName,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_checkpoint(stream)
    }

    fn save_checkpoint<'a>(
        &'a self,
        stream: &'a StreamName,
        version: u64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_checkpoint(stream, version)
    }
}

// =============================================================================
// Test Framework for Aggregate Unit Testing
// =============================================================================

/// Test executor for aggregate testing using a given-when-then pattern.
///
/// This allows testing aggregate behavior without persistence. The given
/// history is replayed through the aggregate's default event registry, so
/// the events also prove they survive a serialization round trip.
pub struct TestExecutor<A: Aggregate> {
    root: Root<A>,
}

impl<A: Aggregate> TestExecutor<A> {
    /// Start a test scenario with previous events already applied.
    ///
    /// Pass an empty slice `&[]` to test against a brand-new root.
    ///
    /// # Panics
    ///
    /// Panics if the history cannot be serialized or replayed.
    #[must_use]
    #[track_caller]
    pub fn given(events: &[A::Event]) -> Self {
        let mut root = Root::new(TEST_AGGREGATE_ID);
        let envelopes = record_events::<A>(TEST_AGGREGATE_ID, 1, events)
            .unwrap_or_else(|e| panic!("given events failed to serialize: {e}"));
        root.load_changes(envelopes, &A::Event::registry())
            .unwrap_or_else(|e| panic!("given events failed to replay: {e}"));
        Self { root }
    }

    /// Run `command` against the root.
    ///
    /// Returns a `TestResult` that can be used to verify the outcome.
    #[must_use]
    pub fn when<F>(mut self, command: F) -> TestResult<A>
    where
        F: FnOnce(&mut Root<A>) -> Result<(), AggregateError>,
    {
        let result = command(&mut self.root).map(|()| self.root.changes().to_vec());
        TestResult {
            root: self.root,
            result,
        }
    }
}

/// Result of executing a command, ready for assertions.
pub struct TestResult<A: Aggregate> {
    root: Root<A>,
    result: Result<Vec<EventEnvelope>, AggregateError>,
}

impl<A: Aggregate> TestResult<A> {
    /// Assert that the command raised exactly the expected events.
    ///
    /// # Panics
    ///
    /// Panics if:
    /// - The command returned an error
    /// - The events don't match the expected events
    #[track_caller]
    pub fn then_expect_events(self, expected: &[A::Event])
    where
        A::Event: PartialEq + fmt::Debug,
    {
        match self.result {
            Ok(envelopes) => {
                let registry = A::Event::registry();
                let events: Vec<A::Event> = envelopes
                    .iter()
                    .map(|e| {
                        registry
                            .decode(e)
                            .unwrap_or_else(|err| panic!("raised event failed to decode: {err}"))
                    })
                    .collect();
                assert_eq!(
                    events, expected,
                    "Expected events did not match actual events"
                );
            }
            Err(error) => {
                panic!("Expected events but got error: {error}");
            }
        }
    }

    /// Assert that the command raised no events.
    ///
    /// # Panics
    ///
    /// Panics if the command returned an error or raised any events.
    #[track_caller]
    pub fn then_expect_no_events(self) {
        match self.result {
            Ok(envelopes) => {
                assert!(
                    envelopes.is_empty(),
                    "Expected no events but got: {:?}",
                    envelopes.iter().map(|e| &e.event_type).collect::<Vec<_>>()
                );
            }
            Err(error) => {
                panic!("Expected no events but got error: {error}");
            }
        }
    }

    /// Assert that the command returned an error containing the given message.
    ///
    /// # Panics
    ///
    /// Panics if:
    /// - The command succeeded
    /// - The error message doesn't contain the expected substring
    #[track_caller]
    pub fn then_expect_error_message(self, expected_substring: &str) {
        match self.result {
            Ok(envelopes) => {
                panic!("Expected error but got {} events", envelopes.len());
            }
            Err(error) => {
                let error_msg = error.to_string();
                assert!(
                    error_msg.contains(expected_substring),
                    "Expected error message to contain '{expected_substring}' but got: {error_msg}"
                );
            }
        }
    }

    /// The root after the command, for assertions on state.
    #[must_use]
    pub const fn root(&self) -> &Root<A> {
        &self.root
    }

    /// Get the raw result for custom assertions.
    ///
    /// # Errors
    ///
    /// Returns the error produced by the command.
    pub fn inspect_result(self) -> Result<Vec<EventEnvelope>, AggregateError> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        checkpoint::{STARTING_CHECKPOINT, inmemory as checkpoints},
        ensure,
        error::RuleViolation,
        event::DomainEvent,
        event_set,
        store::inmemory,
    };

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct ValueAdded {
        amount: i32,
    }

    impl DomainEvent for ValueAdded {
        const KIND: &'static str = "value-added";
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct ValueSubtracted {
        amount: i32,
    }

    impl DomainEvent for ValueSubtracted {
        const KIND: &'static str = "value-subtracted";
    }

    event_set! {
        #[derive(Clone, Debug, PartialEq, Eq)]
        enum CounterEvent {
            Added(ValueAdded),
            Subtracted(ValueSubtracted),
        }
    }

    #[derive(Clone, Debug, Default)]
    struct Counter {
        value: i32,
    }

    impl Aggregate for Counter {
        const KIND: &'static str = "counter";
        type Event = CounterEvent;

        fn on_state_changed(&mut self, event: &CounterEvent) -> Result<(), RuleViolation> {
            match event {
                CounterEvent::Added(e) => self.value += e.amount,
                CounterEvent::Subtracted(e) => self.value -= e.amount,
            }
            Ok(())
        }

        fn ensure_invariants(&self) -> Result<(), RuleViolation> {
            ensure!(self.value >= 0, "insufficient value");
            Ok(())
        }
    }

    fn subtract(amount: i32) -> impl FnOnce(&mut Root<Counter>) -> Result<(), AggregateError> {
        move |root| root.raise_change_event(ValueSubtracted { amount })
    }

    type CounterTest = TestExecutor<Counter>;

    #[test]
    fn given_no_events_when_create_then_produces_event() {
        CounterTest::given(&[])
            .when(|root| root.raise_create_event(ValueAdded { amount: 10 }))
            .then_expect_events(&[CounterEvent::Added(ValueAdded { amount: 10 })]);
    }

    #[test]
    fn given_history_when_subtract_then_produces_event() {
        let result = CounterTest::given(&[ValueAdded { amount: 10 }.into()]).when(subtract(4));
        assert_eq!(result.root().state().value, 6);
        assert_eq!(result.root().version(), 2);
        result.then_expect_events(&[ValueSubtracted { amount: 4 }.into()]);
    }

    #[test]
    fn given_history_when_overdrawn_then_error() {
        CounterTest::given(&[ValueAdded { amount: 10 }.into()])
            .when(subtract(20))
            .then_expect_error_message("insufficient value");
    }

    #[test]
    fn command_that_raises_nothing_produces_no_events() {
        CounterTest::given(&[ValueAdded { amount: 1 }.into()])
            .when(|_| Ok(()))
            .then_expect_no_events();
    }

    #[test]
    fn record_events_numbers_from_first_version() {
        let envelopes =
            record_events::<Counter>("c-1", 4, &[ValueAdded { amount: 1 }.into()]).unwrap();
        assert_eq!(envelopes[0].version, 4);
        assert_eq!(envelopes[0].entity_type, "counter");
    }

    #[tokio::test]
    async fn seed_events_continues_the_stream() {
        let store = inmemory::Store::new();
        seed_events::<_, Counter>(&store, "c-1", &[ValueAdded { amount: 1 }.into()])
            .await
            .unwrap();
        let result = seed_events::<_, Counter>(&store, "c-1", &[ValueAdded { amount: 2 }.into()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.last_version, 2);
        assert!(
            seed_events::<_, Counter>(&store, "c-1", &[])
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn counting_checkpoints_counts_calls() {
        let counting = CountingCheckpoints::new(checkpoints::Store::new());
        let stream = StreamName::for_entity("counter", "c-1");
        assert_eq!(
            counting.load_checkpoint(&stream).await.unwrap(),
            STARTING_CHECKPOINT
        );
        counting.save_checkpoint(&stream, 3).await.unwrap();
        assert_eq!(counting.loads(), 1);
        assert_eq!(counting.saves(), 1);
        assert_eq!(counting.inner().get(&stream), Some(3));
    }
}
