//! Background projection driven by store publications.
//!
//! A [`ProjectionWorker`] subscribes to a [`PublishingStore`] and feeds every
//! published batch to a [`ReadModelProjector`]. When the projector reports a
//! checkpoint gap (a batch was missed, the worker lagged, or it started after
//! events were written), the worker reads the stream from the checkpoint and
//! projects the missing history before moving on.
//!
//! # Example
//!
//! ```ignore
//! let handle = ProjectionWorker::new(store.clone(), projector).spawn(shutdown.clone());
//!
//! // Later, shut down gracefully
//! let summary = handle.stop().await?;
//! ```

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::CheckpointRepository,
    envelope::{EventEnvelope, StreamName},
    projector::{ProjectionReport, ProjectorError, ReadModelProjector},
    store::{EventStore, Published, PublishedStream, PublishingStore, StreamBatch},
};

/// Counters describing what a worker did before it stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Published batches received.
    pub batches: u64,
    /// Envelopes dispatched to projections, including catch-up.
    pub projected: u64,
    /// Gaps healed by reading the stream from its checkpoint.
    pub caught_up: u64,
    /// Batches that failed and were left for redelivery.
    pub failures: u64,
    /// Batches the worker missed because it fell behind the publisher.
    pub lagged: u64,
}

impl WorkerSummary {
    fn record(&mut self, report: Option<&ProjectionReport>) {
        if let Some(report) = report {
            self.projected += report.projected as u64;
        }
    }
}

/// Errors that can occur while stopping a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("projection worker task panicked")]
    TaskPanicked,
}

/// Handle to a running worker.
///
/// Dropping the handle does **not** stop the worker. Call [`stop()`] or
/// cancel the token passed to [`ProjectionWorker::spawn`].
///
/// [`stop()`]: WorkerHandle::stop
pub struct WorkerHandle {
    cancel: CancellationToken,
    task: JoinHandle<WorkerSummary>,
}

impl WorkerHandle {
    /// Stop the worker and wait for the batch in flight to finish or abort.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::TaskPanicked`] if the worker task panicked.
    pub async fn stop(self) -> Result<WorkerSummary, WorkerError> {
        self.cancel.cancel();
        self.task.await.map_err(|_| WorkerError::TaskPanicked)
    }

    /// Check if the worker task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Projects every batch a store publishes.
pub struct ProjectionWorker<S, C> {
    store: S,
    projector: ReadModelProjector<C>,
}

impl<S, C> ProjectionWorker<S, C>
where
    S: PublishingStore + 'static,
    C: CheckpointRepository + 'static,
{
    pub const fn new(store: S, projector: ReadModelProjector<C>) -> Self {
        Self { store, projector }
    }

    /// Subscribe now and run the worker on a background task.
    ///
    /// Batches appended after this call returns are guaranteed to reach the
    /// worker (or to be reported as lag). The worker stops when `cancel` is
    /// cancelled, when [`WorkerHandle::stop`] is called, or when the store's
    /// publisher goes away.
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken) -> WorkerHandle {
        let cancel = cancel.child_token();
        let published = self.store.subscribe();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.serve(published, &token).await });
        WorkerHandle { cancel, task }
    }

    /// Subscribe and run the worker on the current task until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> WorkerSummary {
        let published = self.store.subscribe();
        self.serve(published, &cancel).await
    }

    async fn serve(self, mut published: PublishedStream, cancel: &CancellationToken) -> WorkerSummary {
        let mut summary = WorkerSummary::default();
        tracing::debug!("projection worker started");

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!("projection worker stopped");
                    break;
                }
                next = published.next() => next,
            };
            let Some(next) = next else {
                tracing::debug!("publisher closed, projection worker stopping");
                break;
            };

            match next {
                Published::Lagged(missed) => {
                    tracing::warn!(
                        missed,
                        "projection worker lagged; affected streams catch up on their next batch"
                    );
                    summary.lagged += missed;
                }
                Published::Batch(batch) => {
                    summary.batches += 1;
                    self.project_batch(batch, cancel, &mut summary).await;
                }
            }
        }

        summary
    }

    #[tracing::instrument(skip_all, fields(stream = %batch.stream, event_count = batch.envelopes.len()))]
    async fn project_batch(
        &self,
        batch: StreamBatch,
        cancel: &CancellationToken,
        summary: &mut WorkerSummary,
    ) {
        let StreamBatch { stream, envelopes } = batch;
        let envelopes: Vec<EventEnvelope> = envelopes.into();

        match self
            .projector
            .write_event_stream(&stream, &envelopes, cancel)
            .await
        {
            Ok(report) => summary.record(report.as_ref()),
            Err(ProjectorError::CheckpointGap { expected, actual, .. }) => {
                tracing::debug!(expected, actual, "catching up from checkpoint");
                if self.catch_up(&stream, expected, cancel, summary).await {
                    summary.caught_up += 1;
                } else {
                    summary.failures += 1;
                }
            }
            Err(ProjectorError::Cancelled { .. }) => {}
            Err(error) => {
                tracing::error!(%error, kind = ?error.kind(), "projection failed");
                summary.failures += 1;
            }
        }
    }

    async fn catch_up(
        &self,
        stream: &StreamName,
        from_version: u64,
        cancel: &CancellationToken,
        summary: &mut WorkerSummary,
    ) -> bool {
        let history = match self.store.read_from(stream, from_version).await {
            Ok(history) => history,
            Err(error) => {
                tracing::error!(%error, from_version, "failed to read stream for catch-up");
                return false;
            }
        };

        match self
            .projector
            .write_event_stream(stream, &history, cancel)
            .await
        {
            Ok(report) => {
                summary.record(report.as_ref());
                true
            }
            Err(ProjectorError::Cancelled { .. }) => false,
            Err(error) => {
                tracing::error!(%error, kind = ?error.kind(), "catch-up projection failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use nonempty::NonEmpty;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::{
        checkpoint::inmemory as checkpoints,
        event::{DomainEvent, EventSet},
        event_set,
        projection::{Projection, ProjectionRegistry},
        store::inmemory,
    };

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Pinged {}

    impl DomainEvent for Pinged {
        const KIND: &'static str = "pinged";
    }

    event_set! {
        #[derive(Clone, Debug)]
        enum BeaconEvent {
            Pinged(Pinged),
        }
    }

    #[derive(Clone, Default)]
    struct PingLog {
        versions: Arc<Mutex<Vec<u64>>>,
    }

    impl Projection for PingLog {
        const NAME: &'static str = "ping-log";
        const AGGREGATE_KIND: &'static str = "beacon";
        type Event = BeaconEvent;
        type Error = std::convert::Infallible;

        async fn project_event(
            &self,
            envelope: &EventEnvelope,
            _: &BeaconEvent,
        ) -> Result<bool, Self::Error> {
            self.versions.lock().unwrap().push(envelope.version);
            Ok(true)
        }
    }

    fn ping(version: u64) -> EventEnvelope {
        EventEnvelope {
            event_id: Uuid::new_v4(),
            entity_type: "beacon".into(),
            entity_id: "b-1".into(),
            event_type: "pinged".into(),
            type_token: "pinged".into(),
            payload: json!({}),
            version,
            occurred_at: Utc::now(),
            last_persisted: None,
        }
    }

    fn worker(
        store: &inmemory::Store,
        log: &PingLog,
    ) -> (ProjectionWorker<inmemory::Store, checkpoints::Store>, checkpoints::Store) {
        let checkpoints = checkpoints::Store::new();
        let projections = ProjectionRegistry::new()
            .with(log.clone(), BeaconEvent::registry())
            .unwrap();
        let projector = ReadModelProjector::new(projections, checkpoints.clone());
        (ProjectionWorker::new(store.clone(), projector), checkpoints)
    }

    async fn wait_for_checkpoint(checkpoints: &checkpoints::Store, stream: &StreamName, value: u64) {
        for _ in 0..200 {
            if checkpoints.get(stream) == Some(value) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("checkpoint never reached {value}");
    }

    #[tokio::test]
    async fn worker_catches_up_history_written_before_it_started() {
        let store = inmemory::Store::new();
        let log = PingLog::default();
        let stream = StreamName::for_entity("beacon", "b-1");
        store
            .append(&stream, NonEmpty::from_vec(vec![ping(1), ping(2)]).unwrap())
            .await
            .unwrap();

        let (worker, checkpoints) = worker(&store, &log);
        let handle = worker.spawn(CancellationToken::new());
        assert!(handle.is_running());

        store.append(&stream, NonEmpty::new(ping(3))).await.unwrap();
        wait_for_checkpoint(&checkpoints, &stream, 4).await;

        let summary = handle.stop().await.unwrap();
        assert_eq!(*log.versions.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.caught_up, 1);
        assert_eq!(summary.projected, 3);
        assert_eq!(summary.failures, 0);
    }

    #[tokio::test]
    async fn parent_cancellation_stops_the_worker() {
        let store = inmemory::Store::new();
        let (worker, _) = worker(&store, &PingLog::default());
        let shutdown = CancellationToken::new();
        let handle = worker.spawn(shutdown.clone());

        shutdown.cancel();
        let summary = handle.stop().await.unwrap();
        assert_eq!(summary, WorkerSummary::default());
    }
}
