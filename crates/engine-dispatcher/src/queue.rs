//! The durable work queue the dispatcher consumes from (spec §4.5). Ready
//! requests sit in a Redis list; backed-off retries sit in a delayed set
//! scored by their ready-at timestamp until the scheduler's sweep (C7)
//! promotes them back into the ready list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_common::model::{OrgScope, RunId, RunTarget};
use fred::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),
    #[error("malformed queue payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: RunId,
    pub org: OrgScope,
    pub target: RunTarget,
    pub requesting_user_id: Option<String>,
    pub inputs: Value,
    pub deadline_secs: u64,
    pub memory_limit_bytes: u64,
    /// Delivery attempt, 1-indexed. Incremented by `schedule_retry`.
    pub attempt: u32,
}

const READY_KEY: &str = "dispatch:queue:ready";
const DELAYED_KEY: &str = "dispatch:queue:delayed";

#[async_trait]
pub trait RunQueue: Send + Sync {
    async fn enqueue(&self, request: RunRequest) -> Result<(), QueueError>;
    async fn dequeue(&self) -> Result<Option<RunRequest>, QueueError>;
    async fn schedule_retry(&self, request: RunRequest, ready_at: DateTime<Utc>) -> Result<(), QueueError>;
    /// Moves due delayed requests into the ready list. Called by the
    /// scheduler's periodic sweep (spec §4.7 "durable delayed-request
    /// sweep"), not by the dispatcher itself.
    async fn promote_ready(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Number of ready-to-dispatch requests — feeds the dispatcher's
    /// backpressure gauge.
    async fn depth(&self) -> Result<u64, QueueError>;
}

pub struct RedisRunQueue {
    client: Client,
}

impl RedisRunQueue {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RunQueue for RedisRunQueue {
    async fn enqueue(&self, request: RunRequest) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&request).map_err(|e| QueueError::Malformed(e.to_string()))?;
        let _: i64 = self
            .client
            .lpush(READY_KEY, payload)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<RunRequest>, QueueError> {
        let payload: Option<String> = self
            .client
            .rpop(READY_KEY, None)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        match payload {
            Some(p) => Ok(Some(
                serde_json::from_str(&p).map_err(|e| QueueError::Malformed(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn schedule_retry(&self, request: RunRequest, ready_at: DateTime<Utc>) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&request).map_err(|e| QueueError::Malformed(e.to_string()))?;
        let _: i64 = self
            .client
            .zadd(
                DELAYED_KEY,
                None,
                None,
                false,
                false,
                (ready_at.timestamp_millis() as f64, payload),
            )
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn promote_ready(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let due: Vec<String> = self
            .client
            .zrangebyscore(DELAYED_KEY, f64::MIN, now.timestamp_millis() as f64, None)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        for payload in &due {
            let _: i64 = self
                .client
                .lpush(READY_KEY, payload.clone())
                .await
                .map_err(|e| QueueError::Unavailable(e.to_string()))?;
            let _: i64 = self
                .client
                .zrem(DELAYED_KEY, payload.clone())
                .await
                .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        }
        Ok(due.len())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let len: i64 = self
            .client
            .llen(READY_KEY)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(len.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let request = RunRequest {
            run_id: RunId::new(),
            org: OrgScope::Global,
            target: RunTarget::Module {
                path: "workflows/a".to_string(),
                function_name: "main".to_string(),
            },
            requesting_user_id: None,
            inputs: serde_json::json!({}),
            deadline_secs: 300,
            memory_limit_bytes: 512 * 1024 * 1024,
            attempt: 1,
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: RunRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, request.run_id);
        assert_eq!(back.attempt, 1);
    }
}
