//! The ordered log table the multiplexer (C6) flushes batches into
//! (spec §4.6 "Batching"): keyed `(run_id, sequence)`, append-only.

use chrono::{DateTime, Utc};
use engine_common::model::{RunId, SequenceNumber};
use serde_json::Value;
use sqlx::PgPool;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunLogStoreError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub run_id: RunId,
    pub sequence: SequenceNumber,
    pub severity: String,
    pub source: String,
    pub message: String,
    pub data: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct LogRow {
    run_id: uuid::Uuid,
    sequence: i64,
    severity: String,
    source: String,
    message: String,
    data: Option<Value>,
    recorded_at: DateTime<Utc>,
}

impl From<LogRow> for LogRecord {
    fn from(row: LogRow) -> Self {
        LogRecord {
            run_id: RunId(row.run_id),
            sequence: SequenceNumber(row.sequence as u64),
            severity: row.severity,
            source: row.source,
            message: row.message,
            data: row.data,
            recorded_at: row.recorded_at,
        }
    }
}

pub struct RunLogStore {
    pool: PgPool,
}

impl RunLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persists a batch in a single round trip. Callers are responsible for
    /// gap-free, strictly-increasing sequence numbers per run id
    /// (spec §3 Log Record invariant) — enforced upstream by the
    /// multiplexer's per-run sequence counter, not by this table.
    pub async fn append_batch(&self, records: &[LogRecord]) -> Result<(), RunLogStoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RunLogStoreError::StorageUnavailable(e.to_string()))?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO run_logs (run_id, sequence, severity, source, message, data)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (run_id, sequence) DO NOTHING
                "#,
            )
            .bind(record.run_id.0)
            .bind(record.sequence.0 as i64)
            .bind(&record.severity)
            .bind(&record.source)
            .bind(&record.message)
            .bind(&record.data)
            .execute(&mut *tx)
            .await
            .map_err(|e| RunLogStoreError::StorageUnavailable(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RunLogStoreError::StorageUnavailable(e.to_string()))
    }

    /// Fetches persisted records from `from_sequence` (inclusive) onward —
    /// the snapshot half of a late subscriber's catch-up (spec §4.6
    /// "Deduplication for subscribers").
    pub async fn fetch_from(
        &self,
        run_id: RunId,
        from_sequence: SequenceNumber,
    ) -> Result<Vec<LogRecord>, RunLogStoreError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"SELECT run_id, sequence, severity, source, message, data, recorded_at
               FROM run_logs WHERE run_id = $1 AND sequence >= $2
               ORDER BY sequence ASC"#,
        )
        .bind(run_id.0)
        .bind(from_sequence.0 as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RunLogStoreError::StorageUnavailable(e.to_string()))?;

        Ok(rows.into_iter().map(LogRecord::from).collect())
    }

    pub async fn latest_sequence(&self, run_id: RunId) -> Result<Option<SequenceNumber>, RunLogStoreError> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(sequence) FROM run_logs WHERE run_id = $1")
            .bind(run_id.0)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RunLogStoreError::StorageUnavailable(e.to_string()))?;

        Ok(row.0.map(|seq| SequenceNumber(seq as u64)))
    }
}
