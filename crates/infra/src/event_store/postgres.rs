//! Postgres-backed storage driver.
//!
//! Tables:
//! - `event_source`: one row per envelope; `sequence` is a `BIGSERIAL`, `(aggregate_id, version)` is unique
//! - `projection_records`: one row per (entity, projection)
//! - `checkpoints`: one row per (subscription, kind)
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StorageError | Scenario |
//! |------------|----------------------|--------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Concurrent append of the same version, duplicate checkpoint insert |
//! | Database (check violation) | `23514` | `Backend` | Invalid data (e.g. `version <= 0`) |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolClosed / other | N/A | `Backend` | Network errors, connection failures, etc. |
//!
//! ## Sequence visibility
//!
//! `BIGSERIAL` values are assigned at insert time but become visible at commit
//! time, so a scan may briefly observe sequence N+1 before N. Catch-up passes
//! that run concurrently with writers can therefore skip a late-committing
//! envelope; a checkpoint `reset` replays it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use eventstorage_core::{AggregateId, CorrelationId, TenantId};
use eventstorage_events::{
    Checkpoint, CheckpointType, EventEnvelope, ProjectionRecord, SourcedEvent, UncommittedEvent,
};

use super::r#trait::{ProjectionSink, StorageDriver, StorageError, UnitOfWork};

/// Key for the transaction-scoped advisory lock taken around schema creation.
const SCHEMA_LOCK_KEY: i64 = 0x6576_656e_7473_7263;

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS event_source (
        sequence        BIGSERIAL PRIMARY KEY,
        tenant_id       UUID NOT NULL,
        aggregate_id    TEXT NOT NULL,
        global_id       UUID NOT NULL,
        aggregate_type  TEXT NOT NULL,
        version         BIGINT NOT NULL CHECK (version > 0),
        event_type      TEXT NOT NULL,
        schema_version  INT NOT NULL,
        correlation_id  UUID NULL,
        occurred_at     TIMESTAMPTZ NOT NULL,
        payload         JSONB NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (aggregate_id, version)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS event_source_global_id_idx ON event_source (global_id)",
    r#"
    CREATE TABLE IF NOT EXISTS projection_records (
        aggregate_id  TEXT NOT NULL,
        projection    TEXT NOT NULL,
        global_id     UUID NOT NULL,
        version       BIGINT NOT NULL,
        data          JSONB NOT NULL,
        updated_at    TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (aggregate_id, projection)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS checkpoints (
        subscription  TEXT NOT NULL,
        kind          TEXT NOT NULL,
        seq           BIGINT NOT NULL DEFAULT 0,
        max_seq       BIGINT NOT NULL DEFAULT 0,
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (subscription, kind),
        CHECK (seq <= max_seq)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS projection_records_projection_idx ON projection_records (projection)",
];

const SELECT_ENVELOPE: &str = r#"
    SELECT
        sequence,
        tenant_id,
        aggregate_id,
        aggregate_type,
        version,
        event_type,
        schema_version,
        correlation_id,
        occurred_at,
        payload
    FROM event_source
"#;

/// Postgres-backed storage driver.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: Arc<PgPool>,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect a pool of at most `max_connections` to `database_url`.
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
}

/// Unit of work backed by one Postgres transaction.
#[derive(Debug)]
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn stream_version(&mut self, aggregate_id: &AggregateId) -> Result<Option<u64>, StorageError> {
        let row = sqlx::query("SELECT MAX(version) AS current_version FROM event_source WHERE aggregate_id = $1")
            .bind(aggregate_id.as_str())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("stream_version", e))?;

        let current: Option<i64> = row
            .try_get("current_version")
            .map_err(|e| StorageError::decode("stream_version", e.to_string()))?;
        Ok(current.map(|v| v as u64))
    }

    #[instrument(skip(self, events), fields(event_count = events.len()), err)]
    async fn append(&mut self, events: Vec<UncommittedEvent>) -> Result<Vec<EventEnvelope>, StorageError> {
        let mut committed = Vec::with_capacity(events.len());

        for event in events {
            let version = event.event.version();
            let row = sqlx::query(
                r#"
                INSERT INTO event_source (
                    tenant_id,
                    aggregate_id,
                    global_id,
                    aggregate_type,
                    version,
                    event_type,
                    schema_version,
                    correlation_id,
                    occurred_at,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING sequence
                "#,
            )
            .bind(event.tenant_id.as_uuid())
            .bind(event.aggregate_id.as_str())
            .bind(event.aggregate_id.global_id())
            .bind(&event.aggregate_type)
            .bind(version as i64)
            .bind(event.event.event_type())
            .bind(event.event.schema_version() as i32)
            .bind(event.event.correlation_id().map(|c| *c.as_uuid()))
            .bind(event.event.occurred_at())
            .bind(event.event.payload())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| {
                // Another transaction appended the same version first.
                if is_unique_violation(&e) {
                    StorageError::conflict(
                        "append",
                        format!("{} version {version} already exists", event.aggregate_id),
                    )
                } else {
                    map_sqlx_error("append", e)
                }
            })?;

            let sequence: i64 = row
                .try_get("sequence")
                .map_err(|e| StorageError::decode("append", e.to_string()))?;
            committed.push(event.into_envelope(sequence as u64));
        }

        Ok(committed)
    }

    async fn load_record(
        &mut self,
        aggregate_id: &AggregateId,
        projection: &str,
    ) -> Result<Option<ProjectionRecord>, StorageError> {
        let row = sqlx::query(SELECT_RECORD)
            .bind(aggregate_id.as_str())
            .bind(projection)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_record", e))?;
        row.map(decode_record).transpose()
    }

    async fn save_record(&mut self, record: &ProjectionRecord) -> Result<(), StorageError> {
        upsert_record_query(record)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("save_record", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

const SELECT_RECORD: &str = r#"
    SELECT aggregate_id, projection, version, data, updated_at
    FROM projection_records
    WHERE aggregate_id = $1 AND projection = $2
"#;

fn upsert_record_query(record: &ProjectionRecord) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO projection_records (aggregate_id, projection, global_id, version, data, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (aggregate_id, projection)
        DO UPDATE SET
            version = EXCLUDED.version,
            data = EXCLUDED.data,
            updated_at = EXCLUDED.updated_at
        WHERE projection_records.version <= EXCLUDED.version
        "#,
    )
    .bind(record.aggregate_id.as_str())
    .bind(&record.projection)
    .bind(record.global_id())
    .bind(record.version as i64)
    .bind(&record.data)
    .bind(record.updated_at)
}

#[async_trait]
impl ProjectionSink for PostgresStorage {
    async fn load_record(
        &self,
        aggregate_id: &AggregateId,
        projection: &str,
    ) -> Result<Option<ProjectionRecord>, StorageError> {
        let row = sqlx::query(SELECT_RECORD)
            .bind(aggregate_id.as_str())
            .bind(projection)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_record", e))?;
        row.map(decode_record).transpose()
    }

    #[instrument(skip(self, record), fields(aggregate_id = %record.aggregate_id, projection = %record.projection), err)]
    async fn save_record(&self, record: &ProjectionRecord) -> Result<(), StorageError> {
        upsert_record_query(record)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("save_record", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn clear_projection(&self, projection: &str) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM projection_records WHERE projection = $1")
            .bind(projection)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear_projection", e))?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl StorageDriver for PostgresStorage {
    #[instrument(skip(self), err)]
    async fn create_if_missing(&self) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Serializes concurrent initializers across processes; released on commit.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advisory_lock", e))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("create_if_missing", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresUnitOfWork { tx }))
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id, event_count = tracing::field::Empty), err)]
    async fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<EventEnvelope>, StorageError> {
        let rows = sqlx::query(&format!("{SELECT_ENVELOPE} WHERE aggregate_id = $1 ORDER BY version ASC"))
            .bind(aggregate_id.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_stream", e))?;

        let envelopes = decode_envelopes("load_stream", rows)?;
        Span::current().record("event_count", envelopes.len());
        Ok(envelopes)
    }

    #[instrument(skip(self), fields(event_count = tracing::field::Empty), err)]
    async fn load_range(&self, after: u64, up_to: u64) -> Result<Vec<EventEnvelope>, StorageError> {
        if up_to <= after {
            return Ok(vec![]);
        }

        let rows = sqlx::query(&format!(
            "{SELECT_ENVELOPE} WHERE sequence > $1 AND sequence <= $2 ORDER BY sequence ASC"
        ))
        .bind(after as i64)
        .bind(up_to as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_range", e))?;

        let envelopes = decode_envelopes("load_range", rows)?;
        Span::current().record("event_count", envelopes.len());
        Ok(envelopes)
    }

    async fn max_sequence(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS max_sequence FROM event_source")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("max_sequence", e))?;

        let max: i64 = row
            .try_get("max_sequence")
            .map_err(|e| StorageError::decode("max_sequence", e.to_string()))?;
        Ok(max as u64)
    }

    async fn load_checkpoint(
        &self,
        subscription: &str,
        kind: CheckpointType,
    ) -> Result<Option<Checkpoint>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT subscription, kind, seq, max_seq
            FROM checkpoints
            WHERE subscription = $1 AND kind = $2
            "#,
        )
        .bind(subscription)
        .bind(kind.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_checkpoint", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let row = CheckpointRow::from_row(&row).map_err(|e| StorageError::decode("load_checkpoint", e.to_string()))?;
        row.try_into().map(Some)
    }

    #[instrument(skip(self, checkpoint), fields(subscription = %checkpoint.subscription(), seq = checkpoint.seq()), err)]
    async fn save_checkpoint(&self, checkpoint: &Checkpoint, insert: bool) -> Result<(), StorageError> {
        if insert {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (subscription, kind, seq, max_seq)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(checkpoint.subscription())
            .bind(checkpoint.kind().as_str())
            .bind(checkpoint.seq() as i64)
            .bind(checkpoint.max_seq() as i64)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_checkpoint", e))?;
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE checkpoints
            SET seq = $3, max_seq = $4, updated_at = NOW()
            WHERE subscription = $1 AND kind = $2 AND seq <= $3
            "#,
        )
        .bind(checkpoint.subscription())
        .bind(checkpoint.kind().as_str())
        .bind(checkpoint.seq() as i64)
        .bind(checkpoint.max_seq() as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_checkpoint", e))?;

        if result.rows_affected() == 0 {
            // Either the row is ahead of this save, or it does not exist.
            let exists = self
                .load_checkpoint(checkpoint.subscription(), checkpoint.kind())
                .await?
                .is_some();
            if !exists {
                return Err(StorageError::missing(
                    "update_checkpoint",
                    format!("checkpoint '{}' does not exist", checkpoint.subscription()),
                ));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, checkpoint), fields(subscription = %checkpoint.subscription()), err)]
    async fn reset_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE checkpoints
            SET seq = $3, max_seq = $4, updated_at = NOW()
            WHERE subscription = $1 AND kind = $2
            "#,
        )
        .bind(checkpoint.subscription())
        .bind(checkpoint.kind().as_str())
        .bind(checkpoint.seq() as i64)
        .bind(checkpoint.max_seq() as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_checkpoint", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::missing(
                "reset_checkpoint",
                format!("checkpoint '{}' does not exist", checkpoint.subscription()),
            ));
        }
        Ok(())
    }
}

fn decode_envelopes(operation: &str, rows: Vec<PgRow>) -> Result<Vec<EventEnvelope>, StorageError> {
    rows.iter()
        .map(|row| {
            EnvelopeRow::from_row(row)
                .map_err(|e| StorageError::decode(operation, e.to_string()))?
                .try_into()
        })
        .collect()
}

fn decode_record(row: PgRow) -> Result<ProjectionRecord, StorageError> {
    let row = RecordRow::from_row(&row).map_err(|e| StorageError::decode("load_record", e.to_string()))?;
    row.try_into()
}

/// Map SQLx errors to StorageError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StorageError::conflict(operation, msg),
                _ => StorageError::backend(operation, msg),
            }
        }
        sqlx::Error::PoolClosed => StorageError::backend(operation, "connection pool closed"),
        sqlx::Error::RowNotFound => StorageError::missing(operation, "unexpected row not found"),
        other => StorageError::backend(operation, other.to_string()),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct EnvelopeRow {
    sequence: i64,
    tenant_id: uuid::Uuid,
    aggregate_id: String,
    aggregate_type: String,
    version: i64,
    event_type: String,
    schema_version: i32,
    correlation_id: Option<uuid::Uuid>,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> FromRow<'r, PgRow> for EnvelopeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EnvelopeRow {
            sequence: row.try_get("sequence")?,
            tenant_id: row.try_get("tenant_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            version: row.try_get("version")?,
            event_type: row.try_get("event_type")?,
            schema_version: row.try_get("schema_version")?,
            correlation_id: row.try_get("correlation_id")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl TryFrom<EnvelopeRow> for EventEnvelope {
    type Error = StorageError;

    fn try_from(row: EnvelopeRow) -> Result<Self, Self::Error> {
        let aggregate_id = AggregateId::parse(row.aggregate_id)
            .map_err(|e| StorageError::decode("envelope_row", e.to_string()))?;
        let event = SourcedEvent::from_parts(
            row.event_type,
            row.schema_version as u32,
            row.version as u64,
            row.occurred_at,
            row.correlation_id.map(CorrelationId::from_uuid),
            row.payload,
        );
        Ok(EventEnvelope::new(
            row.sequence as u64,
            TenantId::from_uuid(row.tenant_id),
            aggregate_id,
            row.aggregate_type,
            event,
        ))
    }
}

#[derive(Debug)]
struct RecordRow {
    aggregate_id: String,
    projection: String,
    version: i64,
    data: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for RecordRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(RecordRow {
            aggregate_id: row.try_get("aggregate_id")?,
            projection: row.try_get("projection")?,
            version: row.try_get("version")?,
            data: row.try_get("data")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<RecordRow> for ProjectionRecord {
    type Error = StorageError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(ProjectionRecord {
            aggregate_id: AggregateId::parse(row.aggregate_id)
                .map_err(|e| StorageError::decode("record_row", e.to_string()))?,
            projection: row.projection,
            version: row.version as u64,
            data: row.data,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct CheckpointRow {
    subscription: String,
    kind: String,
    seq: i64,
    max_seq: i64,
}

impl<'r> FromRow<'r, PgRow> for CheckpointRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CheckpointRow {
            subscription: row.try_get("subscription")?,
            kind: row.try_get("kind")?,
            seq: row.try_get("seq")?,
            max_seq: row.try_get("max_seq")?,
        })
    }
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = StorageError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        let kind = CheckpointType::parse(&row.kind)
            .ok_or_else(|| StorageError::decode("checkpoint_row", format!("unknown checkpoint kind '{}'", row.kind)))?;
        Ok(Checkpoint::from_parts(row.subscription, row.seq as u64, row.max_seq as u64, kind))
    }
}
