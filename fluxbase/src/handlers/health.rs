//! Liveness and readiness probes

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};

use crate::state::AppState;

/// Liveness: the process is up
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Readiness: the database answers
pub async fn readyz(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
    {
        Ok(_) => Ok(Json(serde_json::json!({
            "status": "ready",
            "realtime_connections": state.hub.connection_count(),
            "audit_dropped": state.audit.dropped_count(),
        }))),
        Err(e) => {
            tracing::warn!(error = %e, "readiness probe failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
