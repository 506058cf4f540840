use chrono::{DateTime, Utc};
use sqlx::{Row, postgres::PgRow};
use tidemark_core::envelope::EventEnvelope;

use super::Store;
use crate::{Error, error::from_db_version};

impl Store {
    /// Deserialise `tm_events` rows into [`EventEnvelope`]s.
    pub(in crate::store) fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<EventEnvelope>, Error> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let version: i64 = row.try_get("version")?;
            let payload: sqlx::types::Json<serde_json::Value> = row.try_get("payload")?;
            let last_persisted: DateTime<Utc> = row.try_get("last_persisted")?;

            out.push(EventEnvelope {
                event_id: row.try_get("event_id")?,
                entity_type: row.try_get("entity_type")?,
                entity_id: row.try_get("entity_id")?,
                event_type: row.try_get("event_type")?,
                type_token: row.try_get("type_token")?,
                payload: payload.0,
                version: from_db_version(version)?,
                occurred_at: row.try_get("occurred_at")?,
                last_persisted: Some(last_persisted),
            });
        }

        Ok(out)
    }
}
