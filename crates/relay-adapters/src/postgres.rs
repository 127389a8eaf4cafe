//! PostgreSQL outbox/inbox repositories
//!
//! Rows are keyed by `event_id`; inserts use `ON CONFLICT DO NOTHING` so
//! concurrent writers converge on one row per logical event. The schema is
//! bootstrapped through `ensure_schema`, which is safe to run on every
//! startup.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use relay_domain::records::{InboxRecord, InboxStatus, OutboxRecord, OutboxStatus};
use relay_ports::{
    InboxRepository, NewInboxRecord, NewOutboxRecord, OutboxRepository, RepositoryError,
};

const OUTBOX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS relay_outbox (
    event_id    UUID PRIMARY KEY,
    subject     TEXT NOT NULL,
    payload     BYTEA NOT NULL,
    headers     JSONB NOT NULL DEFAULT '{}'::jsonb,
    status      TEXT NOT NULL DEFAULT 'PENDING',
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    sent_at     TIMESTAMPTZ,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS relay_outbox_pending_idx
    ON relay_outbox (status, enqueued_at);
CREATE INDEX IF NOT EXISTS relay_outbox_sent_idx
    ON relay_outbox (sent_at) WHERE status = 'SENT';
CREATE INDEX IF NOT EXISTS relay_outbox_publishing_idx
    ON relay_outbox (status, updated_at) WHERE status = 'PUBLISHING';
"#;

const INBOX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS relay_inbox (
    event_id     UUID PRIMARY KEY,
    subject      TEXT NOT NULL,
    payload      BYTEA NOT NULL,
    headers      JSONB NOT NULL DEFAULT '{}'::jsonb,
    stream       TEXT,
    stream_seq   BIGINT,
    deliveries   INTEGER NOT NULL DEFAULT 1,
    status       TEXT NOT NULL DEFAULT 'PROCESSING',
    last_error   TEXT,
    received_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    processed_at TIMESTAMPTZ,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE UNIQUE INDEX IF NOT EXISTS relay_inbox_stream_seq_idx
    ON relay_inbox (stream, stream_seq)
    WHERE stream IS NOT NULL AND stream_seq IS NOT NULL;
"#;

type OutboxRow = (
    Uuid,
    String,
    Vec<u8>,
    serde_json::Value,
    String,
    i32,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const OUTBOX_COLUMNS: &str = "event_id, subject, payload, headers, status, attempts, last_error, \
     enqueued_at, sent_at, created_at, updated_at";

type InboxRow = (
    Uuid,
    String,
    Vec<u8>,
    serde_json::Value,
    Option<String>,
    Option<i64>,
    i32,
    String,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const INBOX_COLUMNS: &str = "event_id, subject, payload, headers, stream, stream_seq, deliveries, \
     status, last_error, received_at, processed_at, created_at, updated_at";

fn db_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Database {
        message: e.to_string(),
    }
}

fn headers_to_json(headers: &HashMap<String, String>) -> Result<serde_json::Value, RepositoryError> {
    serde_json::to_value(headers).map_err(|e| RepositoryError::Serialization {
        message: e.to_string(),
    })
}

fn headers_from_json(value: serde_json::Value) -> Result<HashMap<String, String>, RepositoryError> {
    serde_json::from_value(value).map_err(|e| RepositoryError::Serialization {
        message: e.to_string(),
    })
}

fn parse_outbox_status(s: &str) -> Result<OutboxStatus, RepositoryError> {
    OutboxStatus::parse(s).ok_or_else(|| RepositoryError::Serialization {
        message: format!("unknown outbox status: {s}"),
    })
}

fn parse_inbox_status(s: &str) -> Result<InboxStatus, RepositoryError> {
    InboxStatus::parse(s).ok_or_else(|| RepositoryError::Serialization {
        message: format!("unknown inbox status: {s}"),
    })
}

fn outbox_record_from(row: OutboxRow) -> Result<OutboxRecord, RepositoryError> {
    let (
        event_id,
        subject,
        payload,
        headers,
        status,
        attempts,
        last_error,
        enqueued_at,
        sent_at,
        created_at,
        updated_at,
    ) = row;
    Ok(OutboxRecord {
        event_id,
        subject,
        payload,
        headers: headers_from_json(headers)?,
        status: parse_outbox_status(&status)?,
        attempts: attempts.max(0) as u32,
        last_error,
        enqueued_at,
        sent_at,
        created_at,
        updated_at,
    })
}

fn inbox_record_from(row: InboxRow) -> Result<InboxRecord, RepositoryError> {
    let (
        event_id,
        subject,
        payload,
        headers,
        stream,
        stream_seq,
        deliveries,
        status,
        last_error,
        received_at,
        processed_at,
        created_at,
        updated_at,
    ) = row;
    Ok(InboxRecord {
        event_id,
        subject,
        payload,
        headers: headers_from_json(headers)?,
        stream,
        stream_seq: stream_seq.map(|s| s.max(0) as u64),
        deliveries: deliveries.max(0) as u32,
        status: parse_inbox_status(&status)?,
        last_error,
        received_at,
        processed_at,
        created_at,
        updated_at,
    })
}

// ============================================================================
// Outbox repository
// ============================================================================

/// Outbox repository backed by PostgreSQL.
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the outbox table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(OUTBOX_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        info!("Outbox schema ensured");
        Ok(())
    }

    /// Insert an outbox row inside an existing transaction.
    ///
    /// This is the only write a transactional caller performs: insert
    /// business rows, call this, commit. A crash between commit and send
    /// leaves a PENDING row the drain worker retries.
    #[instrument(skip(tx, record), fields(event_id = %record.event_id))]
    pub async fn find_or_create_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: &NewOutboxRecord,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO relay_outbox (event_id, subject, payload, headers, status)
            VALUES ($1, $2, $3, $4, 'PENDING')
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(record.event_id)
        .bind(&record.subject)
        .bind(&record.payload)
        .bind(headers_to_json(&record.headers)?)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;

        debug!(event_id = %record.event_id, subject = %record.subject, "Event written to outbox");
        Ok(())
    }

    async fn fetch(&self, event_id: &Uuid) -> Result<OutboxRecord, RepositoryError> {
        let row = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM relay_outbox WHERE event_id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(RepositoryError::NotFound {
            event_id: *event_id,
        })?;

        outbox_record_from(row)
    }
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    #[instrument(skip(self, record), fields(event_id = %record.event_id))]
    async fn find_or_create(
        &self,
        record: &NewOutboxRecord,
    ) -> Result<OutboxRecord, RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO relay_outbox (event_id, subject, payload, headers, status)
            VALUES ($1, $2, $3, $4, 'PENDING')
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(record.event_id)
        .bind(&record.subject)
        .bind(&record.payload)
        .bind(headers_to_json(&record.headers)?)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        self.fetch(&record.event_id).await
    }

    async fn mark_publishing(&self, event_id: &Uuid) -> Result<OutboxRecord, RepositoryError> {
        let row = sqlx::query_as::<_, OutboxRow>(&format!(
            r#"
            UPDATE relay_outbox
            SET status = 'PUBLISHING', attempts = attempts + 1, updated_at = NOW()
            WHERE event_id = $1
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(RepositoryError::NotFound {
            event_id: *event_id,
        })?;

        outbox_record_from(row)
    }

    async fn mark_sent(&self, event_id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE relay_outbox
            SET status = 'SENT', sent_at = NOW(), updated_at = NOW(), last_error = NULL
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        debug!(event_id = %event_id, "Outbox record marked sent");
        Ok(())
    }

    async fn mark_failed(&self, event_id: &Uuid, error: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE relay_outbox
            SET status = 'FAILED', last_error = $2, updated_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM relay_outbox
            WHERE status = 'PENDING'
            ORDER BY enqueued_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(outbox_record_from).collect()
    }

    #[instrument(skip(self))]
    async fn reset_stale(&self, older_than_minutes: i64) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE relay_outbox
            SET status = 'PENDING', updated_at = NOW()
            WHERE status = 'FAILED'
               OR (status = 'PUBLISHING'
                   AND updated_at < NOW() - INTERVAL '1 minute' * $1)
            "#,
        )
        .bind(older_than_minutes)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let reset = result.rows_affected();
        if reset > 0 {
            info!(reset = reset, "Reset stale publishing outbox records");
        }
        Ok(reset)
    }

    #[instrument(skip(self))]
    async fn delete_sent_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM relay_outbox
            WHERE event_id IN (
                SELECT event_id FROM relay_outbox
                WHERE status = 'SENT' AND sent_at < $1
                ORDER BY sent_at ASC
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted = deleted, "Purged sent outbox records");
        }
        Ok(deleted)
    }

    async fn pending_count(&self) -> Result<u64, RepositoryError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(*) FROM relay_outbox WHERE status = 'PENDING'"#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(count.max(0) as u64)
    }
}

// ============================================================================
// Inbox repository
// ============================================================================

/// Inbox repository backed by PostgreSQL.
pub struct PostgresInboxRepository {
    pool: PgPool,
}

impl PostgresInboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the inbox table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(INBOX_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        info!("Inbox schema ensured");
        Ok(())
    }

    async fn fetch(&self, event_id: &Uuid) -> Result<InboxRecord, RepositoryError> {
        let row = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLUMNS} FROM relay_inbox WHERE event_id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(RepositoryError::NotFound {
            event_id: *event_id,
        })?;

        inbox_record_from(row)
    }

    async fn fetch_by_stream_seq(
        &self,
        stream: &str,
        stream_seq: i64,
    ) -> Result<Option<InboxRecord>, RepositoryError> {
        let row = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLUMNS} FROM relay_inbox WHERE stream = $1 AND stream_seq = $2"
        ))
        .bind(stream)
        .bind(stream_seq)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(inbox_record_from).transpose()
    }
}

#[async_trait]
impl InboxRepository for PostgresInboxRepository {
    #[instrument(skip(self, record), fields(event_id = %record.event_id))]
    async fn find_or_create(
        &self,
        record: &NewInboxRecord,
    ) -> Result<(InboxRecord, bool), RepositoryError> {
        let insert = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO relay_inbox
                (event_id, subject, payload, headers, stream, stream_seq, deliveries, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'PROCESSING')
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(record.event_id)
        .bind(&record.subject)
        .bind(&record.payload)
        .bind(headers_to_json(&record.headers)?)
        .bind(&record.stream)
        .bind(record.stream_seq.map(|s| s as i64))
        .bind(record.deliveries.max(1) as i32)
        .fetch_optional(&self.pool)
        .await;

        match insert {
            Ok(Some(_)) => Ok((self.fetch(&record.event_id).await?, false)),
            Ok(None) => {
                // Same event id seen before: bump the delivery counter.
                sqlx::query(
                    r#"
                    UPDATE relay_inbox
                    SET deliveries = GREATEST(deliveries, $2), updated_at = NOW()
                    WHERE event_id = $1
                    "#,
                )
                .bind(record.event_id)
                .bind(record.deliveries.max(1) as i32)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;

                Ok((self.fetch(&record.event_id).await?, true))
            }
            Err(e) => {
                // A different event id can collide on the secondary
                // (stream, stream_seq) key; that still counts as a duplicate
                // delivery of the same stored message.
                let unique_violation = e
                    .as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false);
                if unique_violation {
                    if let (Some(stream), Some(seq)) = (&record.stream, record.stream_seq) {
                        if let Some(existing) =
                            self.fetch_by_stream_seq(stream, seq as i64).await?
                        {
                            return Ok((existing, true));
                        }
                    }
                }
                Err(db_error(e))
            }
        }
    }

    async fn mark_processing(&self, event_id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE relay_inbox
            SET status = 'PROCESSING', updated_at = NOW()
            WHERE event_id = $1 AND status <> 'PROCESSED'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn mark_processed(&self, event_id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE relay_inbox
            SET status = 'PROCESSED', processed_at = NOW(), updated_at = NOW(), last_error = NULL
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        debug!(event_id = %event_id, "Inbox record marked processed");
        Ok(())
    }

    async fn mark_failed(&self, event_id: &Uuid, error: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE relay_inbox
            SET status = 'FAILED', last_error = $2, updated_at = NOW()
            WHERE event_id = $1 AND status <> 'PROCESSED'
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset_stale(&self, older_than_minutes: i64) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE relay_inbox
            SET status = 'FAILED', last_error = 'stale processing record', updated_at = NOW()
            WHERE status = 'PROCESSING'
              AND updated_at < NOW() - INTERVAL '1 minute' * $1
            "#,
        )
        .bind(older_than_minutes)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let reset = result.rows_affected();
        if reset > 0 {
            info!(reset = reset, "Reset stale processing inbox records");
        }
        Ok(reset)
    }

    #[instrument(skip(self))]
    async fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM relay_inbox
            WHERE event_id IN (
                SELECT event_id FROM relay_inbox
                WHERE status = 'PROCESSED' AND processed_at < $1
                ORDER BY processed_at ASC
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted = deleted, "Purged processed inbox records");
        }
        Ok(deleted)
    }
}
