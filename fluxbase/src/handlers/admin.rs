//! Admin route handlers
//!
//! Every route goes through the service-role / dashboard-admin guard
//! before touching [`crate::admin::AdminService`].

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::admin::AdminService;
use crate::error::Result;
use crate::principal::Principal;
use crate::state::AppState;
use crate::store::SamlProvider;

#[derive(Debug, Deserialize)]
pub struct EnableRealtimeRequest {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub excluded_columns: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertSsoRequest {
    pub name: String,
    #[serde(default)]
    pub metadata_xml: Option<String>,
    #[serde(default)]
    pub metadata_url: Option<String>,
    #[serde(default)]
    pub attribute_map: serde_json::Value,
    #[serde(default)]
    pub denied_groups: Vec<String>,
    #[serde(default)]
    pub required_groups: Vec<String>,
    #[serde(default)]
    pub required_groups_all: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_create_users: bool,
    #[serde(default)]
    pub dashboard_login: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    pub email: String,
    pub password: String,
}

/// First-run bootstrap of the dashboard admin; open only while the users
/// table is empty, and rate limited by its own preset.
pub async fn setup(
    State(state): State<Arc<AppState>>,
    Extension(ip): Extension<crate::principal::ClientIp>,
    Json(body): Json<SetupRequest>,
) -> Result<Json<serde_json::Value>> {
    let (user, session) = state
        .auth
        .bootstrap_admin(&body.email, &body.password, ip.0.clone(), None)
        .await?;

    Ok(Json(serde_json::json!({
        "user": user,
        "session": session,
    })))
}

// Realtime ------------------------------------------------------------------

pub async fn list_realtime(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;
    let tables = state.admin.list_realtime_tables().await?;

    let rows: Vec<_> = tables
        .iter()
        .map(|t| {
            serde_json::json!({
                "schema": t.schema_name,
                "table": t.table_name,
                "enabled": t.enabled,
                "events": t.events,
                "excluded_columns": t.excluded_columns,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "tables": rows })))
}

pub async fn enable_realtime(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<EnableRealtimeRequest>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;
    state
        .admin
        .enable_realtime(
            &principal,
            &body.schema,
            &body.table,
            body.events,
            body.excluded_columns,
        )
        .await?;
    Ok(Json(serde_json::json!({"enabled": format!("{}.{}", body.schema, body.table)})))
}

pub async fn disable_realtime(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path((schema, table)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;
    state
        .admin
        .disable_realtime(&principal, &schema, &table)
        .await?;
    Ok(Json(serde_json::json!({"disabled": format!("{}.{}", schema, table)})))
}

// Service keys --------------------------------------------------------------

pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;
    let keys = state.admin.list_service_keys().await?;

    // Hashes never leave the server; the listing shows prefixes only
    let rows: Vec<_> = keys
        .iter()
        .map(|k| {
            serde_json::json!({
                "id": k.id,
                "name": k.name,
                "key_prefix": k.key_prefix,
                "scopes": k.scopes,
                "enabled": k.enabled,
                "expires_at": k.expires_at,
                "created_at": k.created_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "keys": rows })))
}

pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateKeyRequest>,
) -> Result<Json<crate::admin::IssuedKey>> {
    AdminService::require_admin(&principal)?;
    let issued = state
        .admin
        .create_service_key(&principal, &body.name, body.scopes, body.expires_at)
        .await?;
    Ok(Json(issued))
}

pub async fn rotate_key(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<crate::admin::IssuedKey>> {
    AdminService::require_admin(&principal)?;
    let issued = state.admin.rotate_service_key(&principal, id).await?;
    Ok(Json(issued))
}

pub async fn revoke_key(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;
    state.admin.revoke_service_key(&principal, id).await?;
    Ok(Json(serde_json::json!({"revoked": id})))
}

// Sessions ------------------------------------------------------------------

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;
    let sessions = state.admin.list_sessions(user_id).await?;

    let rows: Vec<_> = sessions
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "user_id": s.user_id,
                "created_at": s.created_at,
                "expires_at": s.expires_at,
                "refresh_expires_at": s.refresh_expires_at,
                "user_agent": s.user_agent,
                "ip": s.ip,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "sessions": rows })))
}

pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;
    state.admin.cancel_session(&principal, session_id).await?;
    Ok(Json(serde_json::json!({"cancelled": session_id})))
}

// SSO providers -------------------------------------------------------------

pub async fn list_sso(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;
    let providers = state.admin.list_sso_providers().await?;

    let rows: Vec<_> = providers
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "enabled": p.enabled,
                "auto_create_users": p.auto_create_users,
                "dashboard_login": p.dashboard_login,
                "denied_groups": p.denied_groups,
                "required_groups": p.required_groups,
                "required_groups_all": p.required_groups_all,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "providers": rows })))
}

pub async fn upsert_sso(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<UpsertSsoRequest>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;

    let provider = SamlProvider {
        id: Uuid::new_v4(),
        name: body.name,
        metadata_xml: body.metadata_xml,
        metadata_url: body.metadata_url,
        attribute_map: body.attribute_map,
        denied_groups: body.denied_groups,
        required_groups: body.required_groups,
        required_groups_all: body.required_groups_all,
        auto_create_users: body.auto_create_users,
        dashboard_login: body.dashboard_login,
        enabled: body.enabled,
        created_at: Utc::now(),
    };

    let stored = state.admin.upsert_sso_provider(&principal, provider).await?;
    Ok(Json(serde_json::json!({"name": stored.name, "enabled": stored.enabled})))
}

pub async fn toggle_sso(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    Json(body): Json<ToggleRequest>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;
    state
        .admin
        .toggle_sso_provider(&principal, &name, body.enabled)
        .await?;
    Ok(Json(serde_json::json!({"name": name, "enabled": body.enabled})))
}

// Audit ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: i64,
}

fn default_audit_limit() -> i64 {
    100
}

pub async fn recent_audit(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    axum::extract::Query(query): axum::extract::Query<AuditQuery>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;
    let entries = state.admin.recent_audit(query.limit).await?;
    Ok(Json(serde_json::json!({ "entries": entries })))
}

// Migrations ----------------------------------------------------------------

pub async fn run_migrations(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>> {
    AdminService::require_admin(&principal)?;
    state.admin.run_migrations(&principal).await?;
    Ok(Json(serde_json::json!({"migrations": "applied"})))
}
