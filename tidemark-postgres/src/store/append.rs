use nonempty::NonEmpty;
use sqlx::{Postgres, QueryBuilder};
use tidemark_core::envelope::{EventEnvelope, StreamName};

use super::Store;
use crate::{
    Error,
    error::{from_db_version, to_db_version},
};

type Tx<'c> = sqlx::Transaction<'c, Postgres>;

impl Store {
    /// Insert a `tm_streams` row for `stream`, doing nothing if one already
    /// exists.
    ///
    /// Must be called inside an open transaction before locking the row.
    pub(in crate::store) async fn ensure_stream_row(
        tx: &mut Tx<'_>,
        stream: &StreamName,
    ) -> Result<(), Error> {
        sqlx::query(
            r"
                INSERT INTO tm_streams (stream, last_version)
                VALUES ($1, NULL)
                ON CONFLICT (stream) DO NOTHING
                ",
        )
        .bind(stream.as_str())
        .execute(&mut **tx)
        .await
        .map(|_| ())
        .map_err(Error::from)
    }

    /// Lock the stream row until the transaction ends and return its head.
    pub(in crate::store) async fn lock_stream_head(
        tx: &mut Tx<'_>,
        stream: &StreamName,
    ) -> Result<Option<u64>, Error> {
        let last: Option<i64> = sqlx::query_scalar(
            r"
                SELECT last_version
                FROM tm_streams
                WHERE stream = $1
                FOR UPDATE
                ",
        )
        .bind(stream.as_str())
        .fetch_one(&mut **tx)
        .await?;

        last.map(from_db_version).transpose()
    }

    /// `(version, content_hash)` of every stored version from `from_version`
    /// upwards.
    pub(in crate::store) async fn stored_hashes(
        tx: &mut Tx<'_>,
        stream: &StreamName,
        from_version: u64,
    ) -> Result<Vec<(u64, String)>, Error> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r"
                SELECT version, content_hash
                FROM tm_events
                WHERE stream = $1 AND version >= $2
                ORDER BY version ASC
                ",
        )
        .bind(stream.as_str())
        .bind(to_db_version(from_version)?)
        .fetch_all(&mut **tx)
        .await?;

        rows.into_iter()
            .map(|(version, hash)| Ok((from_db_version(version)?, hash)))
            .collect()
    }

    /// Bulk-insert `envelopes` and move the stream head to the last of them.
    ///
    /// Returns the new head version.
    pub(in crate::store) async fn insert_envelopes(
        tx: &mut Tx<'_>,
        stream: &StreamName,
        envelopes: &NonEmpty<EventEnvelope>,
    ) -> Result<u64, Error> {
        let mut prepared = Vec::with_capacity(envelopes.len());
        for envelope in envelopes.iter() {
            prepared.push((to_db_version(envelope.version)?, envelope.content_hash(), envelope));
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO tm_events (stream, version, event_id, entity_type, entity_id, \
             event_type, type_token, payload, content_hash, occurred_at, last_persisted) ",
        );
        qb.push_values(prepared, |mut b, (version, hash, envelope)| {
            b.push_bind(stream.as_str());
            b.push_bind(version);
            b.push_bind(envelope.event_id);
            b.push_bind(envelope.entity_type.as_str());
            b.push_bind(envelope.entity_id.as_str());
            b.push_bind(envelope.event_type.as_str());
            b.push_bind(envelope.type_token.as_str());
            b.push_bind(sqlx::types::Json(&envelope.payload));
            b.push_bind(hash);
            b.push_bind(envelope.occurred_at);
            b.push_bind(envelope.last_persisted);
        });
        qb.build().execute(&mut **tx).await?;

        let last_version = envelopes.last().version;
        sqlx::query(
            r"
                UPDATE tm_streams
                SET last_version = $1
                WHERE stream = $2
                ",
        )
        .bind(to_db_version(last_version)?)
        .bind(stream.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(last_version)
    }
}
