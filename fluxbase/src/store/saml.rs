//! SAML provider and session repository
//!
//! Providers hold IdP metadata (inline XML or URL), the attribute map and
//! group policy. SAML sessions record `(provider, name_id, session_index)`
//! so IdP-initiated logout can find and kill the matching local sessions.
//! Assertion IDs are tracked until `NotOnOrAfter` for replay protection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// A configured identity provider
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SamlProvider {
    pub id: Uuid,
    pub name: String,
    /// Inline metadata XML; empty when `metadata_url` is used
    pub metadata_xml: Option<String>,
    pub metadata_url: Option<String>,
    /// SAML attribute name → local claim name
    pub attribute_map: serde_json::Value,
    pub denied_groups: Vec<String>,
    pub required_groups: Vec<String>,
    pub required_groups_all: Vec<String>,
    pub auto_create_users: bool,
    pub dashboard_login: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// A live IdP session binding
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SamlSession {
    pub id: Uuid,
    pub provider: String,
    pub name_id: String,
    pub session_index: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// SAML persistence capability
#[async_trait]
pub trait SamlStore: Send + Sync {
    async fn upsert_provider(&self, provider: &SamlProvider) -> Result<SamlProvider>;

    async fn find_provider(&self, name: &str) -> Result<Option<SamlProvider>>;

    async fn list_providers(&self) -> Result<Vec<SamlProvider>>;

    async fn set_provider_enabled(&self, name: &str, enabled: bool) -> Result<()>;

    async fn delete_provider(&self, name: &str) -> Result<()>;

    async fn create_session(
        &self,
        provider: &str,
        name_id: &str,
        session_index: &str,
        user_id: Uuid,
    ) -> Result<SamlSession>;

    /// Delete sessions matching an IdP LogoutRequest; returns affected users
    async fn delete_sessions(
        &self,
        provider: &str,
        name_id: &str,
        session_index: Option<&str>,
    ) -> Result<Vec<Uuid>>;

    /// Record an assertion ID; `false` when already seen (replay)
    async fn record_assertion(
        &self,
        assertion_id: &str,
        not_on_or_after: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop replay records past their `NotOnOrAfter`
    async fn sweep_assertions(&self) -> Result<u64>;
}

/// PostgreSQL-backed SAML store
#[derive(Clone)]
pub struct PgSamlStore {
    pool: PgPool,
}

impl PgSamlStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PROVIDER_COLUMNS: &str = "id, name, metadata_xml, metadata_url, attribute_map, \
     denied_groups, required_groups, required_groups_all, auto_create_users, \
     dashboard_login, enabled, created_at";

const SESSION_COLUMNS: &str = "id, provider, name_id, session_index, user_id, created_at";

#[async_trait]
impl SamlStore for PgSamlStore {
    async fn upsert_provider(&self, provider: &SamlProvider) -> Result<SamlProvider> {
        let stored = sqlx::query_as::<_, SamlProvider>(&format!(
            r#"
            INSERT INTO auth.saml_providers
                (name, metadata_xml, metadata_url, attribute_map, denied_groups,
                 required_groups, required_groups_all, auto_create_users, dashboard_login, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (name) DO UPDATE SET
                metadata_xml = EXCLUDED.metadata_xml,
                metadata_url = EXCLUDED.metadata_url,
                attribute_map = EXCLUDED.attribute_map,
                denied_groups = EXCLUDED.denied_groups,
                required_groups = EXCLUDED.required_groups,
                required_groups_all = EXCLUDED.required_groups_all,
                auto_create_users = EXCLUDED.auto_create_users,
                dashboard_login = EXCLUDED.dashboard_login,
                enabled = EXCLUDED.enabled
            RETURNING {PROVIDER_COLUMNS}
            "#,
        ))
        .bind(&provider.name)
        .bind(&provider.metadata_xml)
        .bind(&provider.metadata_url)
        .bind(&provider.attribute_map)
        .bind(&provider.denied_groups)
        .bind(&provider.required_groups)
        .bind(&provider.required_groups_all)
        .bind(provider.auto_create_users)
        .bind(provider.dashboard_login)
        .bind(provider.enabled)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    async fn find_provider(&self, name: &str) -> Result<Option<SamlProvider>> {
        let provider = sqlx::query_as::<_, SamlProvider>(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM auth.saml_providers WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(provider)
    }

    async fn list_providers(&self) -> Result<Vec<SamlProvider>> {
        let providers = sqlx::query_as::<_, SamlProvider>(&format!(
            "SELECT {PROVIDER_COLUMNS} FROM auth.saml_providers ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(providers)
    }

    async fn set_provider_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE auth.saml_providers SET enabled = $2 WHERE name = $1")
            .bind(name)
            .bind(enabled)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_provider(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM auth.saml_providers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_session(
        &self,
        provider: &str,
        name_id: &str,
        session_index: &str,
        user_id: Uuid,
    ) -> Result<SamlSession> {
        let session = sqlx::query_as::<_, SamlSession>(&format!(
            r#"
            INSERT INTO auth.saml_sessions (provider, name_id, session_index, user_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider, name_id, session_index) DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING {SESSION_COLUMNS}
            "#,
        ))
        .bind(provider)
        .bind(name_id)
        .bind(session_index)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(session)
    }

    async fn delete_sessions(
        &self,
        provider: &str,
        name_id: &str,
        session_index: Option<&str>,
    ) -> Result<Vec<Uuid>> {
        let rows = sqlx::query_as::<_, (Uuid,)>(
            r#"
            DELETE FROM auth.saml_sessions
            WHERE provider = $1 AND name_id = $2
              AND ($3::text IS NULL OR session_index = $3)
            RETURNING user_id
            "#,
        )
        .bind(provider)
        .bind(name_id)
        .bind(session_index)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn record_assertion(
        &self,
        assertion_id: &str,
        not_on_or_after: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO auth.saml_assertions (assertion_id, not_on_or_after)
            VALUES ($1, $2)
            ON CONFLICT (assertion_id) DO NOTHING
            "#,
        )
        .bind(assertion_id)
        .bind(not_on_or_after)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn sweep_assertions(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM auth.saml_assertions WHERE not_on_or_after <= now()")
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}
