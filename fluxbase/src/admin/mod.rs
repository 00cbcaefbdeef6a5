//! Admin control plane
//!
//! Administrative operations over the identity, realtime and key
//! subsystems, reachable only by service-role or dashboard-admin
//! principals. Every mutation writes an audit entry. Migration and
//! trigger work runs on the admin pool, whose database user owns the
//! schemas; the runtime user never needs DDL rights.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLogger, AuditOutcome, PgAuditStorage};
use crate::crypto::PasswordHasher;
use crate::error::{Error, Result};
use crate::principal::Principal;
use crate::realtime::{RealtimeRegistry, TablePolicy, ADMIN_CHANNEL};
use crate::store::{
    service_keys, SamlProvider, SamlStore, ServiceKey, ServiceKeyStore, Session, SessionStore,
};
use crate::token::TokenService;

/// Raw key material returned exactly once at creation or rotation
#[derive(Debug, Clone, serde::Serialize)]
pub struct IssuedKey {
    pub id: Uuid,
    pub name: String,
    /// The raw key; not recoverable later
    pub key: String,
    pub key_prefix: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Admin operations service
#[derive(Clone)]
pub struct AdminService {
    admin_pool: PgPool,
    registry: RealtimeRegistry,
    service_keys: Arc<dyn ServiceKeyStore>,
    sessions: Arc<dyn SessionStore>,
    saml: Arc<dyn SamlStore>,
    tokens: TokenService,
    hasher: PasswordHasher,
    audit: AuditLogger,
    audit_store: Arc<PgAuditStorage>,
}

impl AdminService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        admin_pool: PgPool,
        registry: RealtimeRegistry,
        service_keys: Arc<dyn ServiceKeyStore>,
        sessions: Arc<dyn SessionStore>,
        saml: Arc<dyn SamlStore>,
        tokens: TokenService,
        hasher: PasswordHasher,
        audit: AuditLogger,
        audit_store: Arc<PgAuditStorage>,
    ) -> Self {
        Self {
            admin_pool,
            registry,
            service_keys,
            sessions,
            saml,
            tokens,
            hasher,
            audit,
            audit_store,
        }
    }

    /// Guard shared by every admin route
    pub fn require_admin(principal: &Principal) -> Result<()> {
        if principal.is_service_role() {
            return Ok(());
        }
        if let Principal::User { claims, .. } = principal {
            let dashboard_admin = claims
                .app_metadata
                .as_ref()
                .and_then(|m| m.get("dashboard_admin"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if dashboard_admin {
                return Ok(());
            }
        }
        Err(Error::Forbidden("admin access required".into()))
    }

    // Realtime registry ----------------------------------------------------

    pub async fn list_realtime_tables(&self) -> Result<Vec<TablePolicy>> {
        self.registry.list().await
    }

    /// Enable change capture for a table: registry row, trigger install,
    /// cross-instance cache invalidation.
    pub async fn enable_realtime(
        &self,
        actor: &Principal,
        schema: &str,
        table: &str,
        events: Vec<String>,
        excluded_columns: Vec<String>,
    ) -> Result<()> {
        validate_identifier(schema)?;
        validate_identifier(table)?;

        let events = if events.is_empty() {
            vec!["INSERT".into(), "UPDATE".into(), "DELETE".into()]
        } else {
            events
        };

        self.registry
            .upsert(&TablePolicy {
                schema_name: schema.to_string(),
                table_name: table.to_string(),
                enabled: true,
                events,
                excluded_columns,
            })
            .await?;

        self.install_trigger(schema, table).await?;
        self.broadcast_invalidation().await?;

        self.record(actor, "admin.realtime.enable", format!("{}.{}", schema, table));
        Ok(())
    }

    pub async fn disable_realtime(
        &self,
        actor: &Principal,
        schema: &str,
        table: &str,
    ) -> Result<()> {
        validate_identifier(schema)?;
        validate_identifier(table)?;

        let Some(mut policy) = self.registry.policy(schema, table).await? else {
            return Err(Error::NotFound(format!(
                "realtime is not configured for {}.{}",
                schema, table
            )));
        };
        policy.enabled = false;
        self.registry.upsert(&policy).await?;
        self.broadcast_invalidation().await?;

        self.record(actor, "admin.realtime.disable", format!("{}.{}", schema, table));
        Ok(())
    }

    async fn install_trigger(&self, schema: &str, table: &str) -> Result<()> {
        // Identifiers are validated above; quoting keeps odd names safe
        let drop = format!(
            r#"DROP TRIGGER IF EXISTS fluxbase_notify ON "{}"."{}""#,
            schema, table
        );
        let create = format!(
            r#"CREATE TRIGGER fluxbase_notify
               AFTER INSERT OR UPDATE OR DELETE ON "{}"."{}"
               FOR EACH ROW EXECUTE FUNCTION realtime.notify_change()"#,
            schema, table
        );

        sqlx::query(&drop).execute(&self.admin_pool).await?;
        sqlx::query(&create).execute(&self.admin_pool).await?;
        Ok(())
    }

    async fn broadcast_invalidation(&self) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, 'invalidate')")
            .bind(ADMIN_CHANNEL)
            .execute(&self.admin_pool)
            .await?;
        Ok(())
    }

    // Service keys ---------------------------------------------------------

    pub async fn list_service_keys(&self) -> Result<Vec<ServiceKey>> {
        self.service_keys.list().await
    }

    pub async fn create_service_key(
        &self,
        actor: &Principal,
        name: &str,
        scopes: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedKey> {
        let raw = service_keys::generate_raw_key();
        let hash = self.hasher.hash_secret(&raw)?;
        let prefix = service_keys::key_prefix(&raw).to_string();

        let key = self
            .service_keys
            .create(name, &hash, &prefix, &scopes, expires_at)
            .await?;

        self.record(actor, "admin.keys.create", key.id.to_string());

        Ok(IssuedKey {
            id: key.id,
            name: key.name,
            key: raw,
            key_prefix: prefix,
            scopes: key.scopes,
            expires_at: key.expires_at,
        })
    }

    /// Swap the key material; the old raw key stops working immediately
    pub async fn rotate_service_key(&self, actor: &Principal, id: Uuid) -> Result<IssuedKey> {
        let key = self
            .service_keys
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound("service key not found".into()))?;

        let raw = service_keys::generate_raw_key();
        let hash = self.hasher.hash_secret(&raw)?;
        let prefix = service_keys::key_prefix(&raw).to_string();

        self.service_keys.rotate(id, &hash, &prefix).await?;
        self.record(actor, "admin.keys.rotate", id.to_string());

        Ok(IssuedKey {
            id,
            name: key.name,
            key: raw,
            key_prefix: prefix,
            scopes: key.scopes,
            expires_at: key.expires_at,
        })
    }

    pub async fn revoke_service_key(&self, actor: &Principal, id: Uuid) -> Result<()> {
        self.service_keys.set_enabled(id, false).await?;
        self.record(actor, "admin.keys.revoke", id.to_string());
        Ok(())
    }

    // Sessions -------------------------------------------------------------

    pub async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<Session>> {
        self.sessions.list_for_user(user_id).await
    }

    /// Cancel one session: its access token is blacklisted and the row
    /// deleted, exactly like a sign-out.
    pub async fn cancel_session(&self, actor: &Principal, session_id: Uuid) -> Result<()> {
        self.tokens.revoke_session(session_id).await?;
        self.record(actor, "admin.sessions.cancel", session_id.to_string());
        Ok(())
    }

    // SSO providers --------------------------------------------------------

    pub async fn list_sso_providers(&self) -> Result<Vec<SamlProvider>> {
        self.saml.list_providers().await
    }

    /// Create or update a SAML provider. A metadata URL is fetched once
    /// here and stored inline so the ACS never blocks on the IdP.
    pub async fn upsert_sso_provider(
        &self,
        actor: &Principal,
        mut provider: SamlProvider,
    ) -> Result<SamlProvider> {
        if provider.metadata_xml.is_none() {
            let url = provider.metadata_url.as_deref().ok_or_else(|| {
                Error::BadRequest("provider needs metadata_xml or metadata_url".into())
            })?;
            let xml = crate::auth::saml::fetch_idp_metadata(url).await?;
            provider.metadata_xml = Some(xml);
        }

        // Reject metadata the ACS would choke on later
        crate::auth::saml::parse_idp_metadata(provider.metadata_xml.as_deref().unwrap_or(""))?;

        let stored = self.saml.upsert_provider(&provider).await?;
        self.record(actor, "admin.sso.upsert", stored.name.clone());
        Ok(stored)
    }

    pub async fn toggle_sso_provider(
        &self,
        actor: &Principal,
        name: &str,
        enabled: bool,
    ) -> Result<()> {
        self.saml.set_provider_enabled(name, enabled).await?;
        self.record(
            actor,
            if enabled {
                "admin.sso.enable"
            } else {
                "admin.sso.disable"
            },
            name.to_string(),
        );
        Ok(())
    }

    // Audit ----------------------------------------------------------------

    /// Most recent audit entries, newest first
    pub async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        self.audit_store.recent(limit.clamp(1, 1000)).await
    }

    // Migrations -----------------------------------------------------------

    /// Run pending migrations under the admin database user
    pub async fn run_migrations(&self, actor: &Principal) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.admin_pool)
            .await
            .map_err(|e| Error::Database(format!("migration failed: {}", e)))?;

        self.record(actor, "admin.migrations.run", "all".to_string());
        tracing::info!("migrations applied");
        Ok(())
    }

    fn record(&self, actor: &Principal, action: &str, target: String) {
        self.audit.record(
            AuditEntry::new(action)
                .actor(actor.actor_type(), actor.actor_id())
                .target(target)
                .outcome(AuditOutcome::Ok),
        );
    }
}

/// Identifier whitelist for names that end up inside DDL
fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().unwrap_or('0').is_ascii_digit();

    if valid {
        Ok(())
    } else {
        Err(Error::BadRequest(format!("invalid identifier '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Claims;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("tasks").is_ok());
        assert!(validate_identifier("public").is_ok());
        assert!(validate_identifier("my_table_2").is_ok());

        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2fast").is_err());
        assert!(validate_identifier("bad-name").is_err());
        assert!(validate_identifier("x\"; DROP TABLE users; --").is_err());
    }

    fn user_with_app_metadata(metadata: serde_json::Value) -> Principal {
        Principal::User {
            user_id: Uuid::new_v4(),
            role: "authenticated".into(),
            session_id: None,
            claims: Box::new(Claims {
                sub: Uuid::new_v4().to_string(),
                role: "authenticated".into(),
                typ: crate::token::TokenType::Access,
                iat: 0,
                exp: i64::MAX,
                iss: "fluxbase".into(),
                session_id: None,
                user_metadata: None,
                app_metadata: Some(metadata),
            }),
        }
    }

    #[test]
    fn test_admin_guard() {
        let service = Principal::Service {
            key_id: Uuid::new_v4(),
            scopes: vec!["*".into()],
        };
        assert!(AdminService::require_admin(&service).is_ok());

        let anon = Principal::Anonymous { ip: None };
        assert!(AdminService::require_admin(&anon).is_err());

        let dashboard = user_with_app_metadata(serde_json::json!({"dashboard_admin": true}));
        assert!(AdminService::require_admin(&dashboard).is_ok());

        let plain = user_with_app_metadata(serde_json::json!({}));
        assert!(AdminService::require_admin(&plain).is_err());
    }
}
