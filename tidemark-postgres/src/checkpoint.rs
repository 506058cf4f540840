//! PostgreSQL-backed checkpoint repository.
//!
//! This module provides [`Store`], an implementation of
//! [`tidemark_core::checkpoint::CheckpointRepository`] for `PostgreSQL`.

use sqlx::PgPool;
use tidemark_core::{
    checkpoint::{CheckpointRepository, STARTING_CHECKPOINT},
    envelope::StreamName,
};

use crate::{
    Error,
    error::{from_db_version, to_db_version},
};

/// Checkpoints stored one row per stream.
///
/// # Schema
///
/// The store uses the following table schema (created by
/// [`migrate()`](Self::migrate)):
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS tm_checkpoints (
///     stream     TEXT PRIMARY KEY,
///     version    BIGINT NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
/// )
/// ```
///
/// # Example
///
/// ```ignore
/// let pool = PgPool::connect("postgres://...").await?;
/// let events = tidemark_postgres::Store::new(pool.clone());
/// let checkpoints = tidemark_postgres::checkpoint::Store::new(pool);
///
/// events.migrate().await?;
/// checkpoints.migrate().await?;
///
/// let projector = ReadModelProjector::new(projections, checkpoints);
/// ```
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").finish_non_exhaustive()
    }
}

impl Store {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the checkpoint schema (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the schema creation query fails.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tm_checkpoints (
                stream     TEXT PRIMARY KEY,
                version    BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl CheckpointRepository for Store {
    type Error = Error;

    #[tracing::instrument(skip(self, stream), fields(%stream))]
    async fn load_checkpoint<'a>(&'a self, stream: &'a StreamName) -> Result<u64, Self::Error> {
        let stored: Option<i64> =
            sqlx::query_scalar(r"SELECT version FROM tm_checkpoints WHERE stream = $1")
                .bind(stream.as_str())
                .fetch_optional(&self.pool)
                .await?;

        let checkpoint = stored.map_or(Ok(STARTING_CHECKPOINT), from_db_version)?;
        tracing::trace!(checkpoint, "checkpoint loaded");
        Ok(checkpoint)
    }

    #[tracing::instrument(skip(self, stream), fields(%stream))]
    async fn save_checkpoint<'a>(
        &'a self,
        stream: &'a StreamName,
        version: u64,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            r"
            INSERT INTO tm_checkpoints (stream, version, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (stream)
            DO UPDATE SET version = EXCLUDED.version, updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(stream.as_str())
        .bind(to_db_version(version)?)
        .execute(&self.pool)
        .await?;

        tracing::debug!("checkpoint saved");
        Ok(())
    }
}
