//! OAuth route handlers (browser redirect flow)

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::Deserialize;

use crate::error::Result;
use crate::principal::ClientIp;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    /// Where to send the browser after a successful callback
    #[serde(default)]
    pub redirect_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

/// Enabled provider names (public)
pub async fn providers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "providers": state.oauth.provider_names() }))
}

/// Start the flow: mint state and redirect to the IdP
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Redirect> {
    let url = state
        .oauth
        .start_authorization(&provider, query.redirect_to)
        .await?;
    Ok(Redirect::temporary(&url))
}

/// Handle the IdP callback: the state is consumed exactly once
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Extension(ip): Extension<ClientIp>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Result<Response> {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let result = state
        .oauth
        .handle_callback(&provider, &query.code, &query.state, ip.0.clone(), user_agent)
        .await?;

    // Browser flows bounce back to the app with the pair in the fragment
    // (never the query, so tokens stay out of server logs en route).
    if let Some(redirect_url) = &result.redirect_url {
        let target = format!(
            "{}#access_token={}&refresh_token={}&token_type=bearer",
            redirect_url, result.session.access_token, result.session.refresh_token
        );
        return Ok(Redirect::temporary(&target).into_response());
    }

    Ok(Json(serde_json::json!({
        "user": result.user,
        "session": result.session,
    }))
    .into_response())
}
