//! Postgres-backed durable module records. Content-addressed: every stored
//! blob carries a sha256 hash alongside its bytes (spec §3 Module / Cached
//! Module, §4.1).

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DurableStoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("record not found")]
    NotFound,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ModuleRow {
    pub org_id: Option<Uuid>,
    pub path: String,
    pub content: Vec<u8>,
    pub content_hash: String,
    pub deleted: bool,
}

/// Computes the content-addressing hash used as the cache-consistency token
/// (also reused by `engine-worker`'s bytecode cache key).
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct DurableModuleStore {
    pool: PgPool,
}

impl DurableModuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), DurableStoreError> {
        sqlx::migrate!("./db/migration/postgres")
            .run(&self.pool)
            .await
            .map_err(|e| DurableStoreError::Unavailable(e.to_string()))
    }

    pub async fn put(
        &self,
        org_id: Option<Uuid>,
        path: &str,
        content: &[u8],
    ) -> Result<String, DurableStoreError> {
        let hash = content_hash(content);
        sqlx::query(
            r#"
            INSERT INTO modules (org_id, path, content, content_hash, deleted, updated_at)
            VALUES ($1, $2, $3, $4, false, now())
            ON CONFLICT (org_id, path)
            DO UPDATE SET content = $3, content_hash = $4, deleted = false, updated_at = now()
            "#,
        )
        .bind(org_id)
        .bind(path)
        .bind(content)
        .bind(&hash)
        .execute(&self.pool)
        .await
        .map_err(|e| DurableStoreError::Unavailable(e.to_string()))?;
        Ok(hash)
    }

    pub async fn delete(&self, org_id: Option<Uuid>, path: &str) -> Result<(), DurableStoreError> {
        sqlx::query(
            r#"UPDATE modules SET deleted = true, updated_at = now()
               WHERE org_id IS NOT DISTINCT FROM $1 AND path = $2"#,
        )
        .bind(org_id)
        .bind(path)
        .execute(&self.pool)
        .await
        .map_err(|e| DurableStoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn get(
        &self,
        org_id: Option<Uuid>,
        path: &str,
    ) -> Result<Option<ModuleRow>, DurableStoreError> {
        sqlx::query_as::<_, ModuleRow>(
            r#"SELECT org_id, path, content, content_hash, deleted FROM modules
               WHERE org_id IS NOT DISTINCT FROM $1 AND path = $2 AND deleted = false"#,
        )
        .bind(org_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DurableStoreError::Unavailable(e.to_string()))
    }

    pub async fn list(
        &self,
        org_id: Option<Uuid>,
        prefix: &str,
    ) -> Result<Vec<String>, DurableStoreError> {
        let like_pattern = format!("{prefix}%");
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT path FROM modules
               WHERE org_id IS NOT DISTINCT FROM $1 AND path LIKE $2 AND deleted = false
               ORDER BY path"#,
        )
        .bind(org_id)
        .bind(like_pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DurableStoreError::Unavailable(e.to_string()))?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    /// All live module records, for `warm_all` (spec §4.1).
    pub async fn all_live(&self) -> Result<Vec<ModuleRow>, DurableStoreError> {
        sqlx::query_as::<_, ModuleRow>(
            r#"SELECT org_id, path, content, content_hash, deleted FROM modules
               WHERE deleted = false"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DurableStoreError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_sensitive_to_bytes() {
        let a = content_hash(b"hello");
        let b = content_hash(b"hello");
        let c = content_hash(b"hellp");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
