//! Third-party identity repository
//!
//! Binds `(provider, provider_user_id)` pairs to user accounts. Deleting
//! the user cascades its identities.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// A third-party identity binding
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Identity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub identity_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Identity persistence capability
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Create or refresh the binding; unique on `(provider, provider_user_id)`
    async fn link(
        &self,
        user_id: Uuid,
        provider: &str,
        provider_user_id: &str,
        identity_data: serde_json::Value,
    ) -> Result<Identity>;

    async fn find(&self, provider: &str, provider_user_id: &str) -> Result<Option<Identity>>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Identity>>;

    async fn unlink(&self, provider: &str, provider_user_id: &str) -> Result<()>;
}

/// PostgreSQL-backed identity store
#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const IDENTITY_COLUMNS: &str =
    "id, user_id, provider, provider_user_id, identity_data, created_at";

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn link(
        &self,
        user_id: Uuid,
        provider: &str,
        provider_user_id: &str,
        identity_data: serde_json::Value,
    ) -> Result<Identity> {
        let identity = sqlx::query_as::<_, Identity>(&format!(
            r#"
            INSERT INTO auth.identities (user_id, provider, provider_user_id, identity_data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider, provider_user_id)
            DO UPDATE SET identity_data = EXCLUDED.identity_data
            RETURNING {IDENTITY_COLUMNS}
            "#,
        ))
        .bind(user_id)
        .bind(provider)
        .bind(provider_user_id)
        .bind(identity_data)
        .fetch_one(&self.pool)
        .await?;

        Ok(identity)
    }

    async fn find(&self, provider: &str, provider_user_id: &str) -> Result<Option<Identity>> {
        let identity = sqlx::query_as::<_, Identity>(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM auth.identities \
             WHERE provider = $1 AND provider_user_id = $2"
        ))
        .bind(provider)
        .bind(provider_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(identity)
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Identity>> {
        let identities = sqlx::query_as::<_, Identity>(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM auth.identities WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(identities)
    }

    async fn unlink(&self, provider: &str, provider_user_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM auth.identities WHERE provider = $1 AND provider_user_id = $2",
        )
        .bind(provider)
        .bind(provider_user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
