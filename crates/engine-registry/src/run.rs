//! The `Run` table: one row per run id, mutated only through
//! `transition_status`/`record_outcome` so the status machine in spec §3 is
//! enforced at a single choke point.

use chrono::{DateTime, Utc};
use engine_common::model::{OrgScope, ResourceUsage, RunId, RunStatus, RunTarget};
use engine_common::{EngineError, ErrorKind};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunRegistryError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("run not found")]
    NotFound,
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition { from: RunStatus, to: RunStatus },
    #[error("run {run_id} was concurrently mutated out of the expected status")]
    ConcurrentModification { run_id: RunId },
}

#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: RunId,
    pub org: OrgScope,
    pub target: RunTarget,
    pub requesting_user_id: Option<String>,
    pub inputs: Value,
    pub status: RunStatus,
    pub result: Option<Value>,
    pub error: Option<EngineError>,
    pub cancellation_reason: Option<String>,
    pub resource_usage: ResourceUsage,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    run_id: Uuid,
    org_id: Option<Uuid>,
    target: Value,
    requesting_user_id: Option<String>,
    inputs: Value,
    status: String,
    result: Option<Value>,
    error_kind: Option<String>,
    error_message: Option<String>,
    error_traceback: Option<String>,
    cancellation_reason: Option<String>,
    peak_memory_bytes: i64,
    cpu_seconds: f64,
    duration_ms: i64,
    ai_token_usage: i64,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

fn parse_status(s: &str) -> RunStatus {
    serde_json::from_value(Value::String(s.to_string())).expect("status column always valid")
}

fn status_str(status: RunStatus) -> String {
    match serde_json::to_value(status).expect("status always serializable") {
        Value::String(s) => s,
        _ => unreachable!(),
    }
}

impl TryFrom<RunRow> for Run {
    type Error = serde_json::Error;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let error = match (row.error_kind, row.error_message) {
            (Some(kind_str), Some(message)) => {
                let kind: ErrorKind = serde_json::from_value(Value::String(kind_str))?;
                Some(EngineError {
                    kind,
                    message,
                    traceback: row.error_traceback,
                })
            }
            _ => None,
        };

        Ok(Run {
            run_id: RunId(row.run_id),
            org: match row.org_id {
                Some(id) => OrgScope::Org(id),
                None => OrgScope::Global,
            },
            target: serde_json::from_value(row.target)?,
            requesting_user_id: row.requesting_user_id,
            inputs: row.inputs,
            status: parse_status(&row.status),
            result: row.result,
            error,
            cancellation_reason: row.cancellation_reason,
            resource_usage: ResourceUsage {
                peak_memory_bytes: row.peak_memory_bytes as u64,
                cpu_seconds: row.cpu_seconds,
                duration_ms: row.duration_ms as u64,
                ai_token_usage: row.ai_token_usage as u64,
            },
            enqueued_at: row.enqueued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

pub struct RunRegistry {
    pool: PgPool,
}

impl RunRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), RunRegistryError> {
        sqlx::migrate!("./db/migration/postgres")
            .run(&self.pool)
            .await
            .map_err(|e| RunRegistryError::StorageUnavailable(e.to_string()))
    }

    /// Creates a new `Pending` run. Idempotent at the caller's discretion —
    /// the dispatcher is expected to generate `run_id` itself so retried
    /// enqueues reuse the same id (spec §4.5 "ack and drop" idempotency).
    pub async fn create(
        &self,
        run_id: RunId,
        org: OrgScope,
        target: &RunTarget,
        requesting_user_id: Option<&str>,
        inputs: Value,
    ) -> Result<(), RunRegistryError> {
        let org_id = match org {
            OrgScope::Global => None,
            OrgScope::Org(id) => Some(id),
        };
        let target_json =
            serde_json::to_value(target).map_err(|e| RunRegistryError::StorageUnavailable(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO runs (run_id, org_id, target, requesting_user_id, inputs, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run_id.0)
        .bind(org_id)
        .bind(target_json)
        .bind(requesting_user_id)
        .bind(inputs)
        .execute(&self.pool)
        .await
        .map_err(|e| RunRegistryError::StorageUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn get(&self, run_id: RunId) -> Result<Run, RunRegistryError> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"SELECT run_id, org_id, target, requesting_user_id, inputs, status, result,
                      error_kind, error_message, error_traceback, cancellation_reason,
                      peak_memory_bytes, cpu_seconds, duration_ms, ai_token_usage,
                      enqueued_at, started_at, completed_at
               FROM runs WHERE run_id = $1"#,
        )
        .bind(run_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RunRegistryError::StorageUnavailable(e.to_string()))?
        .ok_or(RunRegistryError::NotFound)?;

        Run::try_from(row).map_err(|e| RunRegistryError::StorageUnavailable(e.to_string()))
    }

    pub async fn list(&self, org: OrgScope, limit: i64) -> Result<Vec<Run>, RunRegistryError> {
        let org_id = match org {
            OrgScope::Global => None,
            OrgScope::Org(id) => Some(id),
        };
        let rows = sqlx::query_as::<_, RunRow>(
            r#"SELECT run_id, org_id, target, requesting_user_id, inputs, status, result,
                      error_kind, error_message, error_traceback, cancellation_reason,
                      peak_memory_bytes, cpu_seconds, duration_ms, ai_token_usage,
                      enqueued_at, started_at, completed_at
               FROM runs WHERE org_id IS NOT DISTINCT FROM $1
               ORDER BY enqueued_at DESC LIMIT $2"#,
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RunRegistryError::StorageUnavailable(e.to_string()))?;

        rows.into_iter()
            .map(|r| Run::try_from(r).map_err(|e| RunRegistryError::StorageUnavailable(e.to_string())))
            .collect()
    }

    /// Lists runs in `status` across every org — used by the scheduler's
    /// stuck-run sweep, which has no single org to scope to.
    pub async fn list_by_status(&self, status: RunStatus, limit: i64) -> Result<Vec<Run>, RunRegistryError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"SELECT run_id, org_id, target, requesting_user_id, inputs, status, result,
                      error_kind, error_message, error_traceback, cancellation_reason,
                      peak_memory_bytes, cpu_seconds, duration_ms, ai_token_usage,
                      enqueued_at, started_at, completed_at
               FROM runs WHERE status = $1
               ORDER BY enqueued_at ASC LIMIT $2"#,
        )
        .bind(status_str(status))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RunRegistryError::StorageUnavailable(e.to_string()))?;

        rows.into_iter()
            .map(|r| Run::try_from(r).map_err(|e| RunRegistryError::StorageUnavailable(e.to_string())))
            .collect()
    }

    /// Enforces the status machine from spec §3: rejects any transition
    /// `RunStatus::can_transition_to` disallows, including any transition
    /// out of an already-terminal state.
    pub async fn transition_status(&self, run_id: RunId, next: RunStatus) -> Result<(), RunRegistryError> {
        let current = self.get(run_id).await?;
        if !current.status.can_transition_to(next) {
            return Err(RunRegistryError::IllegalTransition {
                from: current.status,
                to: next,
            });
        }

        let timestamp_column = match next {
            RunStatus::Running => Some("started_at"),
            s if s.is_terminal() => Some("completed_at"),
            _ => None,
        };

        // The WHERE clause pins the update to the status we just read, so a
        // concurrent writer (the scheduler's stuck-run sweep racing the
        // dispatcher, say) that mutates the row first makes this a no-op
        // instead of clobbering its write.
        let result = match timestamp_column {
            Some("started_at") => {
                sqlx::query(
                    "UPDATE runs SET status = $1, started_at = now() WHERE run_id = $2 AND status = $3",
                )
                .bind(status_str(next))
                .bind(run_id.0)
                .bind(status_str(current.status))
                .execute(&self.pool)
                .await
            }
            Some("completed_at") => {
                sqlx::query(
                    "UPDATE runs SET status = $1, completed_at = now() WHERE run_id = $2 AND status = $3",
                )
                .bind(status_str(next))
                .bind(run_id.0)
                .bind(status_str(current.status))
                .execute(&self.pool)
                .await
            }
            _ => {
                sqlx::query("UPDATE runs SET status = $1 WHERE run_id = $2 AND status = $3")
                    .bind(status_str(next))
                    .bind(run_id.0)
                    .bind(status_str(current.status))
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(|e| RunRegistryError::StorageUnavailable(e.to_string()))?;

        if result.rows_affected() != 1 {
            return Err(RunRegistryError::ConcurrentModification { run_id });
        }

        Ok(())
    }

    /// Writes the terminal result/error and resource accounting in the same
    /// statement as the terminal status transition (spec §4.5 step 6).
    pub async fn record_outcome(
        &self,
        run_id: RunId,
        next: RunStatus,
        result: Option<Value>,
        error: Option<EngineError>,
        resource_usage: ResourceUsage,
    ) -> Result<(), RunRegistryError> {
        let current = self.get(run_id).await?;
        if !current.status.can_transition_to(next) {
            return Err(RunRegistryError::IllegalTransition {
                from: current.status,
                to: next,
            });
        }

        // Same conditional-update guard as `transition_status`: only the
        // writer that observed the pre-outcome status gets to record it.
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = $1,
                result = $2,
                error_kind = $3,
                error_message = $4,
                error_traceback = $5,
                peak_memory_bytes = $6,
                cpu_seconds = $7,
                duration_ms = $8,
                ai_token_usage = $9,
                completed_at = now()
            WHERE run_id = $10 AND status = $11
            "#,
        )
        .bind(status_str(next))
        .bind(result)
        .bind(error.as_ref().map(|e| status_str_for_error_kind(e.kind)))
        .bind(error.as_ref().map(|e| e.message.clone()))
        .bind(error.as_ref().and_then(|e| e.traceback.clone()))
        .bind(resource_usage.peak_memory_bytes as i64)
        .bind(resource_usage.cpu_seconds)
        .bind(resource_usage.duration_ms as i64)
        .bind(resource_usage.ai_token_usage as i64)
        .bind(run_id.0)
        .bind(status_str(current.status))
        .execute(&self.pool)
        .await
        .map_err(|e| RunRegistryError::StorageUnavailable(e.to_string()))?;

        if result.rows_affected() != 1 {
            return Err(RunRegistryError::ConcurrentModification { run_id });
        }

        Ok(())
    }

    /// Requests cancellation: `Pending -> Cancelled` directly, or
    /// `Running -> Cancelling` pending the pool's terminal report
    /// (spec §4.5 "Cancellation handling").
    pub async fn cancel_request(&self, run_id: RunId, reason: &str) -> Result<RunStatus, RunRegistryError> {
        let current = self.get(run_id).await?;
        let next = match current.status {
            RunStatus::Pending => RunStatus::Cancelled,
            RunStatus::Running => RunStatus::Cancelling,
            other => {
                return Err(RunRegistryError::IllegalTransition {
                    from: other,
                    to: RunStatus::Cancelling,
                })
            }
        };

        let result = sqlx::query(
            "UPDATE runs SET status = $1, cancellation_reason = $2 WHERE run_id = $3 AND status = $4",
        )
        .bind(status_str(next))
        .bind(reason)
        .bind(run_id.0)
        .bind(status_str(current.status))
        .execute(&self.pool)
        .await
        .map_err(|e| RunRegistryError::StorageUnavailable(e.to_string()))?;

        if result.rows_affected() != 1 {
            return Err(RunRegistryError::ConcurrentModification { run_id });
        }

        Ok(next)
    }
}

fn status_str_for_error_kind(kind: ErrorKind) -> String {
    kind.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_serde_string() {
        assert_eq!(parse_status(&status_str(RunStatus::Running)), RunStatus::Running);
        assert_eq!(parse_status(&status_str(RunStatus::Cancelled)), RunStatus::Cancelled);
    }
}
