//! Advisory distributed locks: at-most-one holder per key via a
//! compare-and-set on an ephemeral record with a caller-supplied TTL (spec
//! §4.2 "Lock").

use async_trait::async_trait;
use fred::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire(&self, key: &str, ttl: Duration, holder_id: &str) -> Result<bool, LockError>;

    /// No-op (returns `Ok(false)`) if the key is not held by `holder_id` —
    /// makes release idempotent and safe across caller retries.
    async fn release(&self, key: &str, holder_id: &str) -> Result<bool, LockError>;

    async fn extend(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool, LockError>;
}

fn lock_key(key: &str) -> String {
    format!("lock:{key}")
}

/// Compare-and-delete: removes the key only if its value still matches
/// `holder_id`. Evaluated as a single script so the check-then-delete is
/// atomic even under concurrent retries.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

/// Compare-and-extend: resets the TTL only if the key is still held by
/// `holder_id`.
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
  return 0
end
"#;

pub struct RedisLockService {
    client: Client,
}

impl RedisLockService {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, key: &str, ttl: Duration, holder_id: &str) -> Result<bool, LockError> {
        let full_key = lock_key(key);
        let result: Option<String> = self
            .client
            .set(
                &full_key,
                holder_id,
                Some(Expiration::PX(ttl.as_millis() as i64)),
                Some(SetOptions::NX),
                false,
            )
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;
        Ok(result.is_some())
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<bool, LockError> {
        let full_key = lock_key(key);
        let deleted: i64 = self
            .client
            .eval(RELEASE_SCRIPT, vec![full_key], vec![holder_id.to_string()])
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;
        Ok(deleted == 1)
    }

    async fn extend(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<bool, LockError> {
        let full_key = lock_key(key);
        let extended: i64 = self
            .client
            .eval(
                EXTEND_SCRIPT,
                vec![full_key],
                vec![holder_id.to_string(), ttl.as_millis().to_string()],
            )
            .await
            .map_err(|e| LockError::Unavailable(e.to_string()))?;
        Ok(extended == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_namespaced() {
        assert_eq!(lock_key("recompute:wf/a"), "lock:recompute:wf/a");
    }
}
