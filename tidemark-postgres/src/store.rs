mod append;
mod load;

use chrono::Utc;
use nonempty::NonEmpty;
use sqlx::PgPool;
use tidemark_core::{
    contiguity::plan_append,
    envelope::{EventEnvelope, StreamName},
    store::{
        AppendError, AppendOutcome, AppendResult, EventStore, Published, PublishedStream,
        PublishingStore, StreamBatch,
    },
};
use tokio::sync::broadcast;
use tokio_stream::{
    StreamExt as _,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};

use crate::{
    Error,
    error::{from_db_version, to_db_version},
};

/// Batches a slow subscriber may fall behind before it starts lagging.
pub const DEFAULT_PUBLISH_CAPACITY: usize = 1024;

/// A PostgreSQL-backed [`EventStore`].
///
/// Each stream has a row in `tm_streams` holding its head version. Appends
/// lock that row (`SELECT ... FOR UPDATE`) so the contiguity check and the
/// insert form one step, and concurrent writers on the same stream are
/// serialized by the database.
///
/// Published batches cover appends made through this handle and its clones.
/// They are sent after commit, so two processes writing the same stream may
/// observe each other's batches out of order; the projector reports that as a
/// checkpoint gap and the worker heals it from the table.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: PgPool,
    publisher: broadcast::Sender<StreamBatch>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("subscribers", &self.publisher.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Construct a `PostgreSQL` event store from a connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::with_publish_capacity(pool, DEFAULT_PUBLISH_CAPACITY)
    }

    /// Construct a store whose subscribers lag after `capacity` unread
    /// batches.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_publish_capacity(pool: PgPool, capacity: usize) -> Self {
        let (publisher, _) = broadcast::channel(capacity);
        Self { pool, publisher }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the initial schema (idempotent).
    ///
    /// This uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Streams track their head version for the contiguity check.
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tm_streams (
                stream       TEXT PRIMARY KEY,
                last_version BIGINT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tm_events (
                stream         TEXT NOT NULL,
                version        BIGINT NOT NULL,
                event_id       UUID NOT NULL,
                entity_type    TEXT NOT NULL,
                entity_id      TEXT NOT NULL,
                event_type     TEXT NOT NULL,
                type_token     TEXT NOT NULL,
                payload        JSONB NOT NULL,
                content_hash   TEXT NOT NULL,
                occurred_at    TIMESTAMPTZ NOT NULL,
                last_persisted TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (stream, version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE UNIQUE INDEX IF NOT EXISTS tm_events_by_event_id ON tm_events(event_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl EventStore for Store {
    type Error = Error;

    #[tracing::instrument(skip(self, stream), fields(%stream))]
    async fn stream_version<'a>(
        &'a self,
        stream: &'a StreamName,
    ) -> Result<Option<u64>, Self::Error> {
        let version: Option<i64> =
            sqlx::query_scalar(r"SELECT last_version FROM tm_streams WHERE stream = $1")
                .bind(stream.as_str())
                .fetch_optional(&self.pool)
                .await?
                .flatten();

        version.map(from_db_version).transpose()
    }

    #[tracing::instrument(skip(self, stream, events), fields(%stream, event_count = events.len()))]
    async fn append<'a>(
        &'a self,
        stream: &'a StreamName,
        events: NonEmpty<EventEnvelope>,
    ) -> AppendOutcome<Self::Error> {
        let incoming_first = events.head.version;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppendError::store(Error::Database(e)))?;

        Self::ensure_stream_row(&mut tx, stream)
            .await
            .map_err(AppendError::store)?;
        let stored_last = Self::lock_stream_head(&mut tx, stream)
            .await
            .map_err(AppendError::store)?;
        let overlap = match stored_last {
            Some(last) if last >= incoming_first => {
                Self::stored_hashes(&mut tx, stream, incoming_first)
                    .await
                    .map_err(AppendError::store)?
            }
            _ => Vec::new(),
        };

        // a contiguity error drops `tx`, which rolls back the stream row
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

        let Some(envelopes) = NonEmpty::from_slice(&appended) else {
            tracing::debug!(continuation = ?plan.continuation, "batch already stored");
            return Ok(AppendResult {
                continuation: plan.continuation,
                last_version: stored_last.unwrap_or(0),
                appended,
            });
        };

        let last_version = Self::insert_envelopes(&mut tx, stream, &envelopes)
            .await
            .map_err(AppendError::store)?;

        tx.commit()
            .await
            .map_err(|e| AppendError::store(Error::Database(e)))?;

        let receivers = self
            .publisher
            .send(StreamBatch {
                stream: stream.clone(),
                envelopes,
            })
            .unwrap_or(0);

        tracing::debug!(
            continuation = ?plan.continuation,
            events_appended = appended.len(),
            last_version,
            receivers,
            "events appended to stream"
        );
        Ok(AppendResult {
            continuation: plan.continuation,
            last_version,
            appended,
        })
    }

    #[tracing::instrument(skip(self, stream), fields(%stream))]
    async fn read_from<'a>(
        &'a self,
        stream: &'a StreamName,
        from_version: u64,
    ) -> Result<Vec<EventEnvelope>, Self::Error> {
        // versions past the column range cannot be stored, so nothing matches
        let Ok(from_version) = to_db_version(from_version) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r"
            SELECT version, event_id, entity_type, entity_id, event_type, type_token,
                   payload, occurred_at, last_persisted
            FROM tm_events
            WHERE stream = $1 AND version >= $2
            ORDER BY version ASC
            ",
        )
        .bind(stream.as_str())
        .bind(from_version)
        .fetch_all(&self.pool)
        .await?;

        let envelopes = Self::decode_rows(rows)?;
        tracing::trace!(count = envelopes.len(), "read stream");
        Ok(envelopes)
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
