//! Ties the durable store and shared cache into the single `ModuleStore`
//! contract from spec §4.1: `put`, `delete`, `get`, `list`, `warm_all`.

use crate::cache::{CacheEntry, ModuleCache};
use crate::durable::{content_hash, DurableModuleStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("durable storage unavailable: {0}")]
    StorageUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub content: Vec<u8>,
    pub content_hash: String,
}

pub struct ModuleStore {
    durable: DurableModuleStore,
    cache: Arc<dyn ModuleCache>,
    cache_ttl: Duration,
    negative_cache_ttl: Duration,
}

impl ModuleStore {
    pub fn new(
        durable: DurableModuleStore,
        cache: Arc<dyn ModuleCache>,
        cache_ttl: Duration,
        negative_cache_ttl: Duration,
    ) -> Self {
        Self {
            durable,
            cache,
            cache_ttl,
            negative_cache_ttl,
        }
    }

    /// Durable write first, cache write second (best-effort), index last
    /// (spec §4.1 "Writes"). Invalidates exactly the `(org, path)` key.
    pub async fn put(
        &self,
        org_id: Option<Uuid>,
        path: &str,
        content: &[u8],
    ) -> Result<String, StoreError> {
        let hash = self
            .durable
            .put(org_id, path, content)
            .await
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;

        if let Err(err) = self.cache.invalidate(org_id, path).await {
            warn!(%err, "cache invalidate failed after put, will be lazily repopulated");
        }
        if let Err(err) = self
            .cache
            .set_present(org_id, path, content, self.cache_ttl)
            .await
        {
            warn!(%err, "cache write failed after put, falling back to lazy fill on read");
        }
        if let Err(err) = self.cache.add_to_index(org_id, path).await {
            warn!(%err, "index update failed after put");
        }

        Ok(hash)
    }

    pub async fn delete(&self, org_id: Option<Uuid>, path: &str) -> Result<(), StoreError> {
        if let Err(err) = self.cache.invalidate(org_id, path).await {
            warn!(%err, "cache invalidate failed during delete");
        }
        if let Err(err) = self.cache.remove_from_index(org_id, path).await {
            warn!(%err, "index removal failed during delete");
        }
        self.durable
            .delete(org_id, path)
            .await
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))
    }

    /// Cascade resolution: `(org, path)` first, then `(global, path)`, then
    /// `none`. At each level the cache is consulted first; on cache miss or
    /// unavailability the read falls through to durable storage and
    /// lazily repopulates the cache (spec §4.1 "Failure semantics").
    pub async fn get(
        &self,
        org_id: Option<Uuid>,
        path: &str,
    ) -> Result<Option<ModuleRecord>, StoreError> {
        if let Some(record) = self.resolve_level(org_id, path).await? {
            return Ok(Some(record));
        }
        if org_id.is_some() {
            if let Some(record) = self.resolve_level(None, path).await? {
                return Ok(Some(record));
            }
        }

        if let Err(err) = self
            .cache
            .set_negative(org_id, path, self.negative_cache_ttl)
            .await
        {
            warn!(%err, "failed to write negative cache entry");
        }
        Ok(None)
    }

    async fn resolve_level(
        &self,
        org_id: Option<Uuid>,
        path: &str,
    ) -> Result<Option<ModuleRecord>, StoreError> {
        match self.cache.get(org_id, path).await {
            Ok(Some(CacheEntry::Present(bytes))) => {
                let hash = content_hash(&bytes);
                return Ok(Some(ModuleRecord {
                    content: bytes,
                    content_hash: hash,
                }));
            }
            Ok(Some(CacheEntry::Negative)) => return Ok(None),
            Ok(None) => {}
            Err(err) => warn!(%err, "cache read failed, falling through to durable storage"),
        }

        let row = self
            .durable
            .get(org_id, path)
            .await
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;

        match row {
            Some(row) => {
                if let Err(err) = self
                    .cache
                    .set_present(org_id, path, &row.content, self.cache_ttl)
                    .await
                {
                    warn!(%err, "lazy cache fill failed");
                }
                Ok(Some(ModuleRecord {
                    content: row.content,
                    content_hash: row.content_hash,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn list(&self, org_id: Option<Uuid>, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.durable
            .list(org_id, prefix)
            .await
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))
    }

    /// Scans live module records and populates both org-scoped and global
    /// cache entries. Missing coverage is tolerated: reads lazily fill on
    /// miss (spec §4.1 "Warm-up").
    pub async fn warm_all(&self) -> Result<usize, StoreError> {
        let rows = self
            .durable
            .all_live()
            .await
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;

        let mut warmed = 0usize;
        for row in &rows {
            if self
                .cache
                .set_present(row.org_id, &row.path, &row.content, self.cache_ttl)
                .await
                .is_ok()
                && self
                    .cache
                    .add_to_index(row.org_id, &row.path)
                    .await
                    .is_ok()
            {
                warmed += 1;
            }
        }
        Ok(warmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryCache {
        entries: Mutex<std::collections::HashMap<String, CacheEntry>>,
        indices: Mutex<std::collections::HashMap<String, Vec<String>>>,
    }

    fn key(org_id: Option<Uuid>, path: &str) -> String {
        match org_id {
            Some(id) => format!("{id}:{path}"),
            None => format!("global:{path}"),
        }
    }

    #[async_trait]
    impl ModuleCache for InMemoryCache {
        async fn get(
            &self,
            org_id: Option<Uuid>,
            path: &str,
        ) -> Result<Option<CacheEntry>, CacheError> {
            Ok(self.entries.lock().unwrap().get(&key(org_id, path)).cloned())
        }

        async fn set_present(
            &self,
            org_id: Option<Uuid>,
            path: &str,
            content: &[u8],
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            self.entries
                .lock()
                .unwrap()
                .insert(key(org_id, path), CacheEntry::Present(content.to_vec()));
            Ok(())
        }

        async fn set_negative(
            &self,
            org_id: Option<Uuid>,
            path: &str,
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            self.entries
                .lock()
                .unwrap()
                .insert(key(org_id, path), CacheEntry::Negative);
            Ok(())
        }

        async fn invalidate(&self, org_id: Option<Uuid>, path: &str) -> Result<(), CacheError> {
            self.entries.lock().unwrap().remove(&key(org_id, path));
            Ok(())
        }

        async fn add_to_index(&self, org_id: Option<Uuid>, path: &str) -> Result<(), CacheError> {
            let idx_key = match org_id {
                Some(id) => id.to_string(),
                None => "global".to_string(),
            };
            self.indices
                .lock()
                .unwrap()
                .entry(idx_key)
                .or_default()
                .push(path.to_string());
            Ok(())
        }

        async fn remove_from_index(&self, _org_id: Option<Uuid>, _path: &str) -> Result<(), CacheError> {
            Ok(())
        }

        async fn index_members(&self, org_id: Option<Uuid>) -> Result<Vec<String>, CacheError> {
            let idx_key = match org_id {
                Some(id) => id.to_string(),
                None => "global".to_string(),
            };
            Ok(self.indices.lock().unwrap().get(&idx_key).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn cascade_prefers_org_cache_entry_over_global() {
        let cache = InMemoryCache::default();
        let org = Uuid::nil();
        cache
            .set_present(Some(org), "wf/a", b"org-version", Duration::from_secs(1))
            .await
            .unwrap();
        cache
            .set_present(None, "wf/a", b"global-version", Duration::from_secs(1))
            .await
            .unwrap();

        let org_hit = cache.get(Some(org), "wf/a").await.unwrap();
        assert_eq!(org_hit, Some(CacheEntry::Present(b"org-version".to_vec())));
    }
}
