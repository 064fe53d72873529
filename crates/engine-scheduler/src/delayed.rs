//! Durable "run at T" requests (spec §4.7 "Delayed requests").

use chrono::{DateTime, Utc};
use engine_common::model::OrgScope;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DelayedRequestError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

#[derive(Debug, Clone)]
pub struct DueDelayedRequest {
    pub request_id: Uuid,
    pub org: OrgScope,
    pub workflow_path: String,
    pub function_name: String,
    pub inputs: Value,
}

#[derive(Debug, sqlx::FromRow)]
struct DueRow {
    request_id: Uuid,
    org_id: Option<Uuid>,
    workflow_path: String,
    function_name: String,
    inputs: Value,
}

pub struct DelayedRequestStore {
    pool: PgPool,
}

impl DelayedRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn submit(
        &self,
        request_id: Uuid,
        org: OrgScope,
        workflow_path: &str,
        function_name: &str,
        inputs: Value,
        run_at: DateTime<Utc>,
    ) -> Result<(), DelayedRequestError> {
        let org_id = match org {
            OrgScope::Global => None,
            OrgScope::Org(id) => Some(id),
        };
        sqlx::query(
            r#"
            INSERT INTO delayed_requests (request_id, org_id, workflow_path, function_name, inputs, run_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(request_id)
        .bind(org_id)
        .bind(workflow_path)
        .bind(function_name)
        .bind(inputs)
        .bind(run_at)
        .execute(&self.pool)
        .await
        .map_err(|e| DelayedRequestError::StorageUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Sweeps due, not-yet-dispatched entries and marks them dispatched in
    /// the same transaction they're read in, so a crash between "read" and
    /// "enqueue" re-delivers rather than silently dropping the request.
    pub async fn sweep_due(&self, now: DateTime<Utc>) -> Result<Vec<DueDelayedRequest>, DelayedRequestError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DelayedRequestError::StorageUnavailable(e.to_string()))?;

        let rows = sqlx::query_as::<_, DueRow>(
            r#"SELECT request_id, org_id, workflow_path, function_name, inputs
               FROM delayed_requests
               WHERE NOT dispatched AND run_at <= $1
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| DelayedRequestError::StorageUnavailable(e.to_string()))?;

        if !rows.is_empty() {
            let ids: Vec<Uuid> = rows.iter().map(|r| r.request_id).collect();
            sqlx::query("UPDATE delayed_requests SET dispatched = TRUE WHERE request_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| DelayedRequestError::StorageUnavailable(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| DelayedRequestError::StorageUnavailable(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| DueDelayedRequest {
                request_id: r.request_id,
                org: match r.org_id {
                    Some(id) => OrgScope::Org(id),
                    None => OrgScope::Global,
                },
                workflow_path: r.workflow_path,
                function_name: r.function_name,
                inputs: r.inputs,
            })
            .collect())
    }
}
