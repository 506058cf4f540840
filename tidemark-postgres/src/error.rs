/// Error type for `PostgreSQL` event store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored version does not fit in `u64`.
    #[error("invalid version value from database: {0}")]
    InvalidVersion(i64),
    /// A version supplied by a caller does not fit in a `BIGINT` column.
    #[error("version {0} is out of range for the database")]
    VersionOutOfRange(u64),
}

pub(crate) fn to_db_version(version: u64) -> Result<i64, Error> {
    i64::try_from(version).map_err(|_| Error::VersionOutOfRange(version))
}

pub(crate) fn from_db_version(version: i64) -> Result<u64, Error> {
    u64::try_from(version).map_err(|_| Error::InvalidVersion(version))
}
