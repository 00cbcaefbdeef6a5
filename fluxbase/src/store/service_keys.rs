//! Service key repository
//!
//! Long-lived server-to-server credentials. The raw key is returned once
//! at creation; only its Argon2 hash is stored, with a short prefix kept
//! for lookup.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// Prefix length stored in clear for lookup
pub const KEY_PREFIX_LEN: usize = 12;

/// A service key row (hash at rest, never the raw key)
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceKey {
    pub id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ServiceKey {
    /// True when the key may authenticate right now
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }
}

/// Generate a raw service key: `fbk_` + 32 random bytes, base64url
pub fn generate_raw_key() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    format!("fbk_{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Lookup prefix of a raw key
pub fn key_prefix(raw: &str) -> &str {
    &raw[..raw.len().min(KEY_PREFIX_LEN)]
}

/// Service key persistence capability
#[async_trait]
pub trait ServiceKeyStore: Send + Sync {
    async fn create(
        &self,
        name: &str,
        key_hash: &str,
        key_prefix: &str,
        scopes: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ServiceKey>;

    /// Candidates sharing the presented key's prefix (hash verify follows)
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ServiceKey>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ServiceKey>>;

    async fn list(&self) -> Result<Vec<ServiceKey>>;

    /// Swap hash and prefix in place, keeping id, name and scopes
    async fn rotate(&self, id: Uuid, key_hash: &str, key_prefix: &str) -> Result<()>;

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// PostgreSQL-backed service key store
#[derive(Clone)]
pub struct PgServiceKeyStore {
    pool: PgPool,
}

impl PgServiceKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const KEY_COLUMNS: &str =
    "id, name, key_hash, key_prefix, scopes, enabled, expires_at, created_at";

#[async_trait]
impl ServiceKeyStore for PgServiceKeyStore {
    async fn create(
        &self,
        name: &str,
        key_hash: &str,
        key_prefix: &str,
        scopes: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ServiceKey> {
        let key = sqlx::query_as::<_, ServiceKey>(&format!(
            r#"
            INSERT INTO auth.service_keys (name, key_hash, key_prefix, scopes, enabled, expires_at)
            VALUES ($1, $2, $3, $4, true, $5)
            RETURNING {KEY_COLUMNS}
            "#,
        ))
        .bind(name)
        .bind(key_hash)
        .bind(key_prefix)
        .bind(scopes)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(key)
    }

    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ServiceKey>> {
        let keys = sqlx::query_as::<_, ServiceKey>(&format!(
            "SELECT {KEY_COLUMNS} FROM auth.service_keys WHERE key_prefix = $1 AND enabled"
        ))
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ServiceKey>> {
        let key = sqlx::query_as::<_, ServiceKey>(&format!(
            "SELECT {KEY_COLUMNS} FROM auth.service_keys WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }

    async fn list(&self) -> Result<Vec<ServiceKey>> {
        let keys = sqlx::query_as::<_, ServiceKey>(&format!(
            "SELECT {KEY_COLUMNS} FROM auth.service_keys ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn rotate(&self, id: Uuid, key_hash: &str, key_prefix: &str) -> Result<()> {
        sqlx::query(
            "UPDATE auth.service_keys SET key_hash = $2, key_prefix = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(key_hash)
        .bind(key_prefix)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE auth.service_keys SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM auth.service_keys WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key(enabled: bool, expires_at: Option<DateTime<Utc>>) -> ServiceKey {
        ServiceKey {
            id: Uuid::new_v4(),
            name: "ci".into(),
            key_hash: "$argon2id$...".into(),
            key_prefix: "fbk_AbCdEfGh".into(),
            scopes: vec!["tables:read".into()],
            enabled,
            expires_at,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_raw_key_shape() {
        let raw = generate_raw_key();
        assert!(raw.starts_with("fbk_"));
        assert_ne!(raw, generate_raw_key());
        assert_eq!(key_prefix(&raw).len(), KEY_PREFIX_LEN);
    }

    #[test]
    fn test_usability() {
        let now = Utc::now();
        assert!(sample_key(true, None).is_usable(now));
        assert!(!sample_key(false, None).is_usable(now));
        assert!(!sample_key(true, Some(now - chrono::Duration::hours(1))).is_usable(now));
        assert!(sample_key(true, Some(now + chrono::Duration::hours(1))).is_usable(now));
    }

    #[test]
    fn test_scopes() {
        let key = sample_key(true, None);
        assert!(key.has_scope("tables:read"));
        assert!(!key.has_scope("tables:write"));

        let mut wildcard = sample_key(true, None);
        wildcard.scopes = vec!["*".into()];
        assert!(wildcard.has_scope("anything"));
    }
}
