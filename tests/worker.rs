//! Integration tests for the background projection worker.

#![cfg(feature = "test-util")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tidemark::{
    Aggregate, CancellationToken, DomainEvent, EventEnvelope, EventSet, Projection,
    ProjectionRegistry, ProjectionWorker, ReadModelProjector, Repository, RuleViolation,
    StreamName,
    checkpoint::inmemory as checkpoints,
    event_set,
    store::inmemory,
    test::seed_events,
};
use tokio::time::{Duration, sleep, timeout};

// ============================================================================
// Test Domain: meter readings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ReadingTaken {
    kwh: u64,
}

impl DomainEvent for ReadingTaken {
    const KIND: &'static str = "reading-taken";
}

event_set! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum MeterEvent {
        Reading(ReadingTaken),
    }
}

#[derive(Debug, Clone, Default)]
struct Meter {
    kwh: u64,
}

impl Aggregate for Meter {
    const KIND: &'static str = "meter";
    type Event = MeterEvent;

    fn on_state_changed(&mut self, event: &MeterEvent) -> Result<(), RuleViolation> {
        let MeterEvent::Reading(e) = event;
        self.kwh = e.kwh;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct LatestReadings {
    by_meter: Arc<Mutex<BTreeMap<String, Vec<u64>>>>,
}

impl LatestReadings {
    fn readings(&self, meter: &str) -> Vec<u64> {
        self.by_meter
            .lock()
            .unwrap()
            .get(meter)
            .cloned()
            .unwrap_or_default()
    }
}

impl Projection for LatestReadings {
    const NAME: &'static str = "latest-readings";
    const AGGREGATE_KIND: &'static str = "meter";
    type Event = MeterEvent;
    type Error = std::convert::Infallible;

    async fn project_event(
        &self,
        envelope: &EventEnvelope,
        event: &MeterEvent,
    ) -> Result<bool, Self::Error> {
        let MeterEvent::Reading(e) = event;
        self.by_meter
            .lock()
            .unwrap()
            .entry(envelope.entity_id.clone())
            .or_default()
            .push(e.kwh);
        Ok(true)
    }
}

fn readings(values: &[u64]) -> Vec<MeterEvent> {
    values
        .iter()
        .map(|&kwh| ReadingTaken { kwh }.into())
        .collect()
}

fn worker(
    store: &inmemory::Store,
    view: &LatestReadings,
) -> (
    ProjectionWorker<inmemory::Store, checkpoints::Store>,
    checkpoints::Store,
) {
    let checkpoints = checkpoints::Store::new();
    let projections = ProjectionRegistry::new()
        .with(view.clone(), MeterEvent::registry())
        .unwrap();
    let projector = ReadModelProjector::new(projections, checkpoints.clone());
    (ProjectionWorker::new(store.clone(), projector), checkpoints)
}

async fn wait_for(checkpoints: &checkpoints::Store, meter: &str, checkpoint: u64) {
    let stream = StreamName::for_entity(Meter::KIND, meter);
    timeout(Duration::from_secs(2), async {
        while checkpoints.get(&stream) != Some(checkpoint) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{meter} never reached checkpoint {checkpoint}"));
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn worker_projects_batches_saved_through_the_repository() {
    let store = inmemory::Store::new();
    let view = LatestReadings::default();
    let (worker, checkpoints) = worker(&store, &view);
    let handle = worker.spawn(CancellationToken::new());

    let repo = Repository::new(store);
    let registry = MeterEvent::registry();
    repo.execute::<Meter, _>("m-1", &registry, |meter| {
        meter.raise_create_event(ReadingTaken { kwh: 10 })
    })
    .await
    .unwrap();
    repo.execute::<Meter, _>("m-1", &registry, |meter| {
        meter.raise_change_event(ReadingTaken { kwh: 25 })?;
        meter.raise_change_event(ReadingTaken { kwh: 31 })
    })
    .await
    .unwrap();

    wait_for(&checkpoints, "m-1", 4).await;
    let summary = handle.stop().await.unwrap();

    assert_eq!(view.readings("m-1"), vec![10, 25, 31]);
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.projected, 3);
    assert_eq!(summary.failures, 0);
}

#[tokio::test]
async fn worker_started_late_catches_up_from_the_store() {
    let store = inmemory::Store::new();
    seed_events::<_, Meter>(&store, "m-1", &readings(&[1, 2, 3]))
        .await
        .unwrap();

    let view = LatestReadings::default();
    let (worker, checkpoints) = worker(&store, &view);
    let handle = worker.spawn(CancellationToken::new());

    seed_events::<_, Meter>(&store, "m-1", &readings(&[4]))
        .await
        .unwrap();
    wait_for(&checkpoints, "m-1", 5).await;

    let summary = handle.stop().await.unwrap();
    assert_eq!(view.readings("m-1"), vec![1, 2, 3, 4]);
    assert_eq!(summary.caught_up, 1);
}

#[tokio::test]
async fn lagging_worker_heals_on_the_next_batch() {
    let store = inmemory::Store::with_publish_capacity(1);
    let view = LatestReadings::default();
    let (worker, checkpoints) = worker(&store, &view);
    let handle = worker.spawn(CancellationToken::new());

    // the worker does not get to run until we yield, so the channel overflows
    for reading in 1..=5 {
        seed_events::<_, Meter>(&store, "m-1", &readings(&[reading]))
            .await
            .unwrap();
    }
    wait_for(&checkpoints, "m-1", 6).await;

    let summary = handle.stop().await.unwrap();
    assert_eq!(view.readings("m-1"), vec![1, 2, 3, 4, 5]);
    assert_eq!(summary.lagged, 4);
    assert_eq!(summary.caught_up, 1);
    assert_eq!(summary.failures, 0);
}

#[tokio::test]
async fn streams_are_projected_independently() {
    let store = inmemory::Store::new();
    let view = LatestReadings::default();
    let (worker, checkpoints) = worker(&store, &view);
    let handle = worker.spawn(CancellationToken::new());

    seed_events::<_, Meter>(&store, "m-1", &readings(&[7]))
        .await
        .unwrap();
    seed_events::<_, Meter>(&store, "m-2", &readings(&[8, 9]))
        .await
        .unwrap();

    wait_for(&checkpoints, "m-1", 2).await;
    wait_for(&checkpoints, "m-2", 3).await;
    handle.stop().await.unwrap();

    assert_eq!(view.readings("m-1"), vec![7]);
    assert_eq!(view.readings("m-2"), vec![8, 9]);
}

#[tokio::test]
async fn stopped_worker_ignores_later_batches() {
    let store = inmemory::Store::new();
    let view = LatestReadings::default();
    let (worker, checkpoints) = worker(&store, &view);
    let handle = worker.spawn(CancellationToken::new());
    handle.stop().await.unwrap();

    seed_events::<_, Meter>(&store, "m-1", &readings(&[1]))
        .await
        .unwrap();
    sleep(Duration::from_millis(20)).await;

    assert!(checkpoints.is_empty());
    assert!(view.readings("m-1").is_empty());
}
