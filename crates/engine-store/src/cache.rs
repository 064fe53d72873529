//! The shared (distributed) cache half of C1: exactly the key schema from
//! spec §4.1, backed by `fred`.

use async_trait::async_trait;
use fred::prelude::*;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// A cache entry, distinguishing "we know it's absent" (negative entry) from
/// "we haven't checked" so callers can skip a durable-store round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    Present(Vec<u8>),
    Negative,
}

fn scoped_key(org_id: Option<Uuid>, path: &str) -> String {
    match org_id {
        Some(id) => format!("module:{id}:{path}"),
        None => format!("module:global:{path}"),
    }
}

fn index_key(org_id: Option<Uuid>) -> String {
    match org_id {
        Some(id) => format!("module:index:{id}"),
        None => "module:index:global".to_string(),
    }
}

const NEGATIVE_MARKER: &[u8] = b"\0negative";

#[async_trait]
pub trait ModuleCache: Send + Sync {
    async fn get(&self, org_id: Option<Uuid>, path: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn set_present(
        &self,
        org_id: Option<Uuid>,
        path: &str,
        content: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn set_negative(
        &self,
        org_id: Option<Uuid>,
        path: &str,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Invalidates exactly the `(org, path)` key — never the global key, never
    /// another org's key (spec §4.1 "A put MUST invalidate exactly...").
    async fn invalidate(&self, org_id: Option<Uuid>, path: &str) -> Result<(), CacheError>;

    async fn add_to_index(&self, org_id: Option<Uuid>, path: &str) -> Result<(), CacheError>;

    async fn remove_from_index(&self, org_id: Option<Uuid>, path: &str) -> Result<(), CacheError>;

    async fn index_members(&self, org_id: Option<Uuid>) -> Result<Vec<String>, CacheError>;
}

pub struct RedisModuleCache {
    client: Client,
}

impl RedisModuleCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let config =
            Config::from_url(redis_url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let client = Builder::from_config(config)
            .build()
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        client
            .init()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ModuleCache for RedisModuleCache {
    async fn get(&self, org_id: Option<Uuid>, path: &str) -> Result<Option<CacheEntry>, CacheError> {
        let key = scoped_key(org_id, path);
        let value: Option<Vec<u8>> = self
            .client
            .get(&key)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(value.map(|bytes| {
            if bytes == NEGATIVE_MARKER {
                CacheEntry::Negative
            } else {
                CacheEntry::Present(bytes)
            }
        }))
    }

    async fn set_present(
        &self,
        org_id: Option<Uuid>,
        path: &str,
        content: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = scoped_key(org_id, path);
        self.client
            .set(
                &key,
                content,
                Some(Expiration::EX(ttl.as_secs() as i64)),
                None,
                false,
            )
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn set_negative(
        &self,
        org_id: Option<Uuid>,
        path: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = scoped_key(org_id, path);
        self.client
            .set(
                &key,
                NEGATIVE_MARKER,
                Some(Expiration::EX(ttl.as_secs() as i64)),
                None,
                false,
            )
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }

    async fn invalidate(&self, org_id: Option<Uuid>, path: &str) -> Result<(), CacheError> {
        let key = scoped_key(org_id, path);
        let _: i64 = self
            .client
            .del(&key)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn add_to_index(&self, org_id: Option<Uuid>, path: &str) -> Result<(), CacheError> {
        let key = index_key(org_id);
        let _: i64 = self
            .client
            .sadd(&key, path)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn remove_from_index(&self, org_id: Option<Uuid>, path: &str) -> Result<(), CacheError> {
        let key = index_key(org_id);
        let _: i64 = self
            .client
            .srem(&key, path)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn index_members(&self, org_id: Option<Uuid>) -> Result<Vec<String>, CacheError> {
        let key = index_key(org_id);
        self.client
            .smembers(&key)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_schema_matches_contract() {
        let org = Uuid::nil();
        assert_eq!(scoped_key(Some(org), "wf/a"), format!("module:{org}:wf/a"));
        assert_eq!(scoped_key(None, "wf/a"), "module:global:wf/a");
        assert_eq!(index_key(Some(org)), format!("module:index:{org}"));
        assert_eq!(index_key(None), "module:index:global");
    }
}
