//! Postgres-backed storage.
//!
//! ## Ordering
//!
//! Global sequences come from a `BIGSERIAL`. Appending transactions take a
//! transaction-scoped advisory lock before their first insert, so a later
//! sequence can never become visible before an earlier one.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StorageError |
//! |------------|----------------------|--------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Backend` |
//! | Any other | N/A | `Backend` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use keelson_core::{EventId, StreamId, TenantId};
use keelson_events::{StoredEvent, UncommittedEvent};

use super::records::{
    ProjectionState, ProjectionStatusRecord, StreamKey, StreamRecord, SubscriptionCheckpointRecord,
};
use super::{Storage, StorageError, StorageTx};

const SCHEMA: &str = include_str!("schema.sql");

/// Advisory lock key serializing appenders ("keelson" in ASCII).
const APPEND_LOCK_KEY: i64 = 0x006b_6565_6c73_6f6e;

const EVENT_COLUMNS: &str = "sequence, event_id, tenant_id, stream_type, stream_id, version, \
     type_name, type_descriptor, payload, occurred_at";

const STATUS_COLUMNS: &str = "name, version, state, position, total_events, last_processed_at, \
     last_error, failed_event_sequence, rebuild_started_at, rebuild_completed_at";

/// Postgres backend over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables this backend needs (idempotent).
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<PostgresTx, StorageError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTx {
            tx,
            appends_locked: false,
        })
    }
}

/// Transaction over [`PostgresStorage`]. Dropping it rolls back.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
    appends_locked: bool,
}

#[async_trait]
impl StorageTx for PostgresTx {
    async fn load_stream(&mut self, key: &StreamKey) -> Result<Option<StreamRecord>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT version, created_at, updated_at
            FROM keelson_streams
            WHERE tenant_id = $1 AND stream_type = $2 AND stream_id = $3
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(&key.stream_type)
        .bind(key.stream_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        row.map(|row| -> Result<StreamRecord, sqlx::Error> {
            Ok(StreamRecord {
                key: key.clone(),
                version: row.try_get::<i64, _>("version")? as u64,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("load_stream", e))
    }

    #[instrument(skip(self, stream), fields(stream = %stream.key), err)]
    async fn insert_stream(&mut self, stream: &StreamRecord) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO keelson_streams (tenant_id, stream_type, stream_id, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, stream_type, stream_id) DO NOTHING
            "#,
        )
        .bind(stream.key.tenant_id.as_uuid())
        .bind(&stream.key.stream_type)
        .bind(stream.key.stream_id.as_uuid())
        .bind(stream.version as i64)
        .bind(stream.created_at)
        .bind(stream.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_stream", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::DuplicateStream(stream.key.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self, key), fields(stream = %key), err)]
    async fn update_stream_version(
        &mut self,
        key: &StreamKey,
        expected: u64,
        version: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE keelson_streams
            SET version = $5, updated_at = $6
            WHERE tenant_id = $1 AND stream_type = $2 AND stream_id = $3 AND version = $4
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(&key.stream_type)
        .bind(key.stream_id.as_uuid())
        .bind(expected as i64)
        .bind(version as i64)
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_stream_version", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Concurrency(format!(
                "stream {key} is not at version {expected}"
            )));
        }
        Ok(())
    }

    async fn lock_appends(&mut self) -> Result<(), StorageError> {
        if self.appends_locked {
            return Ok(());
        }
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lock_appends", e))?;
        self.appends_locked = true;
        Ok(())
    }

    #[instrument(skip(self, events), fields(event_count = events.len()), err)]
    async fn insert_events(
        &mut self,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        self.lock_appends().await?;

        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            let row = sqlx::query(
                r#"
                INSERT INTO keelson_events (
                    event_id, tenant_id, stream_type, stream_id, version,
                    type_name, type_descriptor, payload, occurred_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING sequence
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(event.tenant_id.as_uuid())
            .bind(&event.stream_type)
            .bind(event.stream_id.as_uuid())
            .bind(event.version as i64)
            .bind(event.type_name.as_deref())
            .bind(&event.type_descriptor)
            .bind(&event.payload)
            .bind(event.timestamp)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_event", e))?;

            let sequence: i64 = row
                .try_get("sequence")
                .map_err(|e| map_sqlx_error("insert_event", e))?;
            stored.push(event.into_stored(sequence as u64));
        }
        Ok(stored)
    }

    async fn load_events(
        &mut self,
        key: &StreamKey,
        up_to_version: Option<u64>,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM keelson_events \
             WHERE tenant_id = $1 AND stream_type = $2 AND stream_id = $3 \
               AND ($4::BIGINT IS NULL OR version <= $4) \
             ORDER BY version ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(key.tenant_id.as_uuid())
            .bind(&key.stream_type)
            .bind(key.stream_id.as_uuid())
            .bind(up_to_version.map(|v| v as i64))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_events", e))?;
        events_from_rows("load_events", rows)
    }

    async fn events_after(&mut self, after: u64, limit: usize) -> Result<Vec<StoredEvent>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM keelson_events \
             WHERE sequence > $1 ORDER BY sequence ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(after as i64)
            .bind(limit as i64)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("events_after", e))?;
        events_from_rows("events_after", rows)
    }

    async fn event_at(&mut self, sequence: u64) -> Result<Option<StoredEvent>, StorageError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM keelson_events WHERE sequence = $1");
        let row = sqlx::query(&sql)
            .bind(sequence as i64)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("event_at", e))?;
        row.as_ref()
            .map(event_from_row)
            .transpose()
            .map_err(|e| map_sqlx_error("event_at", e))
    }

    async fn first_sequence_at_or_after(&mut self, at: DateTime<Utc>) -> Result<Option<u64>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT sequence FROM keelson_events
            WHERE occurred_at >= $1
            ORDER BY sequence ASC
            LIMIT 1
            "#,
        )
        .bind(at)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("first_sequence_at_or_after", e))?;

        row.map(|row| row.try_get::<i64, _>("sequence").map(|s| s as u64))
            .transpose()
            .map_err(|e| map_sqlx_error("first_sequence_at_or_after", e))
    }

    async fn count_events(&mut self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM keelson_events")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("count_events", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| map_sqlx_error("count_events", e))?;
        Ok(total as u64)
    }

    async fn max_sequence(&mut self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS max_sequence FROM keelson_events")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("max_sequence", e))?;
        let max: i64 = row
            .try_get("max_sequence")
            .map_err(|e| map_sqlx_error("max_sequence", e))?;
        Ok(max as u64)
    }

    async fn events_missing_type_name(
        &mut self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM keelson_events \
             WHERE type_name IS NULL AND sequence > $1 ORDER BY sequence ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(after as i64)
            .bind(limit as i64)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("events_missing_type_name", e))?;
        events_from_rows("events_missing_type_name", rows)
    }

    async fn set_event_type_name(&mut self, sequence: u64, type_name: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE keelson_events SET type_name = $2 WHERE sequence = $1 AND type_name IS NULL")
            .bind(sequence as i64)
            .bind(type_name)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("set_event_type_name", e))?;
        Ok(())
    }

    async fn load_projection_status(
        &mut self,
        name: &str,
    ) -> Result<Option<ProjectionStatusRecord>, StorageError> {
        let sql = format!("SELECT {STATUS_COLUMNS} FROM keelson_projection_status WHERE name = $1");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_projection_status", e))?;
        row.as_ref().map(status_from_row).transpose()
    }

    async fn list_projection_statuses(&mut self) -> Result<Vec<ProjectionStatusRecord>, StorageError> {
        let sql = format!("SELECT {STATUS_COLUMNS} FROM keelson_projection_status ORDER BY name");
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_projection_statuses", e))?;
        rows.iter().map(status_from_row).collect()
    }

    #[instrument(skip(self, status), fields(projection = %status.name, state = %status.state), err)]
    async fn save_projection_status(&mut self, status: &ProjectionStatusRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO keelson_projection_status (
                name, version, state, position, total_events, last_processed_at,
                last_error, failed_event_sequence, rebuild_started_at, rebuild_completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (name) DO UPDATE SET
                version = EXCLUDED.version,
                state = EXCLUDED.state,
                position = EXCLUDED.position,
                total_events = EXCLUDED.total_events,
                last_processed_at = EXCLUDED.last_processed_at,
                last_error = EXCLUDED.last_error,
                failed_event_sequence = EXCLUDED.failed_event_sequence,
                rebuild_started_at = EXCLUDED.rebuild_started_at,
                rebuild_completed_at = EXCLUDED.rebuild_completed_at
            "#,
        )
        .bind(&status.name)
        .bind(status.version as i32)
        .bind(status.state.as_str())
        .bind(status.position as i64)
        .bind(status.total_events.map(|t| t as i64))
        .bind(status.last_processed_at)
        .bind(status.last_error.as_deref())
        .bind(status.failed_event_sequence.map(|s| s as i64))
        .bind(status.rebuild_started_at)
        .bind(status.rebuild_completed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_projection_status", e))?;
        Ok(())
    }

    async fn record_inline_progress(
        &mut self,
        name: &str,
        version: u32,
        sequence: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO keelson_projection_status AS s (name, version, state, position, last_processed_at)
            VALUES ($1, $2, 'active', $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                position = GREATEST(s.position, EXCLUDED.position),
                last_processed_at = EXCLUDED.last_processed_at
            WHERE s.state NOT IN ('rebuilding', 'faulted')
              AND NOT (s.rebuild_started_at IS NOT NULL AND s.rebuild_completed_at IS NULL)
              AND s.version = EXCLUDED.version
            "#,
        )
        .bind(name)
        .bind(version as i32)
        .bind(sequence as i64)
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_inline_progress", e))?;
        Ok(())
    }

    async fn load_checkpoint(
        &mut self,
        name: &str,
    ) -> Result<Option<SubscriptionCheckpointRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT name, sequence, updated_at FROM keelson_subscription_checkpoints WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_checkpoint", e))?;
        row.as_ref()
            .map(checkpoint_from_row)
            .transpose()
            .map_err(|e| map_sqlx_error("load_checkpoint", e))
    }

    async fn list_checkpoints(&mut self) -> Result<Vec<SubscriptionCheckpointRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT name, sequence, updated_at FROM keelson_subscription_checkpoints ORDER BY name",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_checkpoints", e))?;
        rows.iter()
            .map(checkpoint_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("list_checkpoints", e))
    }

    async fn save_checkpoint(&mut self, checkpoint: &SubscriptionCheckpointRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO keelson_subscription_checkpoints (name, sequence, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET
                sequence = EXCLUDED.sequence,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&checkpoint.name)
        .bind(checkpoint.sequence as i64)
        .bind(checkpoint.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_checkpoint", e))?;
        Ok(())
    }

    async fn load_snapshot(
        &mut self,
        projection: &str,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<JsonValue>, StorageError> {
        let row = sqlx::query(
            "SELECT state FROM keelson_snapshots WHERE projection = $1 AND tenant_id = $2 AND key = $3",
        )
        .bind(projection)
        .bind(tenant_id.as_uuid())
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_snapshot", e))?;
        row.map(|row| row.try_get("state"))
            .transpose()
            .map_err(|e| map_sqlx_error("load_snapshot", e))
    }

    async fn save_snapshot(
        &mut self,
        projection: &str,
        tenant_id: TenantId,
        key: &str,
        state: &JsonValue,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO keelson_snapshots (projection, tenant_id, key, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (projection, tenant_id, key)
            DO UPDATE SET
                state = EXCLUDED.state,
                updated_at = NOW()
            "#,
        )
        .bind(projection)
        .bind(tenant_id.as_uuid())
        .bind(key)
        .bind(state)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_snapshot", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn clear_snapshots(&mut self, projection: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM keelson_snapshots WHERE projection = $1")
            .bind(projection)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("clear_snapshots", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn event_from_row(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    Ok(StoredEvent {
        event_id: EventId::from_uuid(row.try_get("event_id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        stream_type: row.try_get("stream_type")?,
        stream_id: StreamId::from_uuid(row.try_get("stream_id")?),
        version: row.try_get::<i64, _>("version")? as u64,
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        type_name: row.try_get("type_name")?,
        type_descriptor: row.try_get("type_descriptor")?,
        payload: row.try_get("payload")?,
        timestamp: row.try_get("occurred_at")?,
    })
}

fn events_from_rows(operation: &str, rows: Vec<PgRow>) -> Result<Vec<StoredEvent>, StorageError> {
    rows.iter()
        .map(event_from_row)
        .collect::<Result<_, _>>()
        .map_err(|e| map_sqlx_error(operation, e))
}

fn status_from_row(row: &PgRow) -> Result<ProjectionStatusRecord, StorageError> {
    let read = |e| map_sqlx_error("read_projection_status", e);
    let state: String = row.try_get("state").map_err(read)?;
    let state: ProjectionState = state
        .parse()
        .map_err(|e| StorageError::Backend(format!("{e}")))?;

    Ok(ProjectionStatusRecord {
        name: row.try_get("name").map_err(read)?,
        version: row.try_get::<i32, _>("version").map_err(read)? as u32,
        state,
        position: row.try_get::<i64, _>("position").map_err(read)? as u64,
        total_events: row
            .try_get::<Option<i64>, _>("total_events")
            .map_err(read)?
            .map(|t| t as u64),
        last_processed_at: row.try_get("last_processed_at").map_err(read)?,
        last_error: row.try_get("last_error").map_err(read)?,
        failed_event_sequence: row
            .try_get::<Option<i64>, _>("failed_event_sequence")
            .map_err(read)?
            .map(|s| s as u64),
        rebuild_started_at: row.try_get("rebuild_started_at").map_err(read)?,
        rebuild_completed_at: row.try_get("rebuild_completed_at").map_err(read)?,
    })
}

fn checkpoint_from_row(row: &PgRow) -> Result<SubscriptionCheckpointRecord, sqlx::Error> {
    Ok(SubscriptionCheckpointRecord {
        name: row.try_get("name")?,
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Map SQLx errors to StorageError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.as_ref() == "23505" => StorageError::Conflict(msg),
                _ => StorageError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StorageError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StorageError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
