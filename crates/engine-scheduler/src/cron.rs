//! In-memory cron trigger catalog (spec §4.7 "Cron triggers").

use chrono::{DateTime, Utc};
use croner::Cron;
use engine_common::model::OrgScope;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CronError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("invalid cron expression `{0}`: {1}")]
    InvalidExpression(String, String),
}

#[derive(Debug, Clone)]
pub struct CronTrigger {
    pub trigger_id: Uuid,
    pub org: OrgScope,
    pub workflow_path: String,
    pub function_name: String,
    pub default_inputs: Value,
    schedule: Cron,
    /// The last fire time handed out by `due_as_of`, so a restart doesn't
    /// replay every tick missed while the process was down.
    last_fired: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct TriggerRow {
    trigger_id: Uuid,
    org_id: Option<Uuid>,
    workflow_path: String,
    function_name: String,
    cron_expression: String,
    default_inputs: Value,
}

/// Enqueued instance of a fired cron trigger, ready for the dispatcher's
/// queue.
#[derive(Debug, Clone)]
pub struct CronFiring {
    pub trigger_id: Uuid,
    pub org: OrgScope,
    pub workflow_path: String,
    pub function_name: String,
    pub inputs: Value,
}

pub struct CronCatalog {
    triggers: Vec<CronTrigger>,
}

impl CronCatalog {
    pub fn empty() -> Self {
        Self { triggers: Vec::new() }
    }

    /// Rebuilds the catalog from durable configuration (spec §4.7 "Must
    /// survive restart: on startup, rebuild catalog from durable
    /// configuration"). `now` seeds each trigger's `last_fired` at one tick
    /// before now, so the very next `due_as_of` call only fires triggers
    /// whose schedule lands within that single tick rather than replaying
    /// every historical occurrence.
    pub async fn rebuild(pool: &PgPool, now: DateTime<Utc>, tick: chrono::Duration) -> Result<Self, CronError> {
        let rows = sqlx::query_as::<_, TriggerRow>(
            r#"SELECT trigger_id, org_id, workflow_path, function_name, cron_expression, default_inputs
               FROM cron_triggers WHERE enabled"#,
        )
        .fetch_all(pool)
        .await
        .map_err(|e| CronError::StorageUnavailable(e.to_string()))?;

        let mut triggers = Vec::with_capacity(rows.len());
        for row in rows {
            let schedule = Cron::new(&row.cron_expression)
                .parse()
                .map_err(|e| CronError::InvalidExpression(row.cron_expression.clone(), e.to_string()))?;
            triggers.push(CronTrigger {
                trigger_id: row.trigger_id,
                org: match row.org_id {
                    Some(id) => OrgScope::Org(id),
                    None => OrgScope::Global,
                },
                workflow_path: row.workflow_path,
                function_name: row.function_name,
                default_inputs: row.default_inputs,
                schedule,
                last_fired: Some(now - tick),
            });
        }
        Ok(Self { triggers })
    }

    /// Returns every trigger whose next fire time is `<= now`, advancing
    /// each fired trigger's `last_fired` so the same occurrence is never
    /// returned twice (spec §4.7 "earliest-next-fire algorithm with second
    /// precision").
    pub fn due_as_of(&mut self, now: DateTime<Utc>) -> Vec<CronFiring> {
        let mut due = Vec::new();
        for trigger in &mut self.triggers {
            let after = trigger.last_fired.unwrap_or(now - chrono::Duration::seconds(1));
            let Ok(next) = trigger.schedule.find_next_occurrence(&after, false) else {
                continue;
            };
            if next <= now {
                trigger.last_fired = Some(next);
                due.push(CronFiring {
                    trigger_id: trigger.trigger_id,
                    org: trigger.org,
                    workflow_path: trigger.workflow_path.clone(),
                    function_name: trigger.function_name.clone(),
                    inputs: trigger.default_inputs.clone(),
                });
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_catalog_never_fires() {
        let mut catalog = CronCatalog::empty();
        assert!(catalog.due_as_of(Utc::now()).is_empty());
    }

    fn trigger_firing_at_minute_boundary(boundary: DateTime<Utc>) -> CronTrigger {
        CronTrigger {
            trigger_id: Uuid::now_v7(),
            org: OrgScope::Global,
            workflow_path: "workflows/daily-report".to_string(),
            function_name: "main".to_string(),
            default_inputs: Value::Null,
            schedule: Cron::new("* * * * *").parse().expect("valid cron expression"),
            last_fired: Some(boundary - chrono::Duration::seconds(1)),
        }
    }

    #[test]
    fn trigger_fires_once_at_its_boundary_then_goes_quiet_for_the_same_tick() {
        use chrono::TimeZone;
        let boundary = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let mut catalog = CronCatalog {
            triggers: vec![trigger_firing_at_minute_boundary(boundary)],
        };

        let first = catalog.due_as_of(boundary);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].workflow_path, "workflows/daily-report");

        // Calling again with the same `now` must not replay the occurrence
        // just handed out.
        assert!(catalog.due_as_of(boundary).is_empty());
    }
}
