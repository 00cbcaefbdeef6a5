//! Authentication route handlers
//!
//! Thin JSON shells over [`crate::auth::AuthService`] and the token
//! service. Response wording is chosen here; in particular, flows that
//! must not disclose account existence return uniform bodies.

use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::principal::{cookie_value, ClientIp, Principal};
use crate::state::AppState;
use crate::store::{User, UserStore};
use crate::token::TokenPair;

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct SigninRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetConfirmRequest {
    pub email: String,
    pub code: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct MagicLinkRequest {
    pub email: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct AcceptInviteRequest {
    pub email: String,
    pub code: String,
    pub password: String,
}

/// `{user, session}` response body, cookies attached when configured
fn session_response(
    state: &AppState,
    user: Option<&User>,
    session: Option<&TokenPair>,
) -> Response {
    let body = serde_json::json!({
        "user": user,
        "session": session,
    });

    let mut response = Json(body).into_response();

    if let Some(pair) = session {
        if state.config.auth.cookies_enabled {
            for cookie in auth_cookies(state, pair) {
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
            }
        }
    }

    response
}

fn auth_cookies(state: &AppState, pair: &TokenPair) -> Vec<String> {
    let domain = state
        .config
        .auth
        .cookie_domain
        .as_deref()
        .map(|d| format!("; Domain={}", d))
        .unwrap_or_default();

    let access_max_age = state.config.auth.access_ttl_secs;
    let refresh_max_age = state.config.auth.refresh_ttl_secs;

    let csrf_token = state.csrf.issue();

    vec![
        format!(
            "access_token={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}{}",
            pair.access_token, access_max_age, domain
        ),
        format!(
            "refresh_token={}; Path=/api/v1/auth; HttpOnly; SameSite=Lax; Max-Age={}{}",
            pair.refresh_token, refresh_max_age, domain
        ),
        state.csrf.cookie(&csrf_token),
    ]
}

fn client_meta(headers: &HeaderMap, ip: &ClientIp) -> (Option<String>, Option<String>) {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    (ip.0.clone(), user_agent)
}

pub async fn signup(
    State(state): State<Arc<AppState>>,
    Extension(ip): Extension<ClientIp>,
    headers: HeaderMap,
    Json(body): Json<SignupRequest>,
) -> Result<Response> {
    let (ip, user_agent) = client_meta(&headers, &ip);

    let result = state
        .auth
        .signup(&body.email, &body.password, body.metadata, ip, user_agent)
        .await?;

    Ok(session_response(
        &state,
        Some(&result.user),
        result.session.as_ref(),
    ))
}

pub async fn signin(
    State(state): State<Arc<AppState>>,
    Extension(ip): Extension<ClientIp>,
    headers: HeaderMap,
    Json(body): Json<SigninRequest>,
) -> Result<Response> {
    let (ip, user_agent) = client_meta(&headers, &ip);

    let (user, session) = state
        .auth
        .signin(&body.email, &body.password, ip, user_agent)
        .await?;

    Ok(session_response(&state, Some(&user), Some(&session)))
}

pub async fn signout(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Response> {
    state.auth.signout(&principal).await?;

    // Clear the auth cookies regardless of how the caller authenticated
    let mut response = Json(serde_json::json!({})).into_response();
    for name in ["access_token", "refresh_token"] {
        let cookie = format!("{}=; Path=/; HttpOnly; Max-Age=0", name);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    Ok(response)
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Response> {
    // Browser clients refresh by cookie with an empty body; API clients
    // send the token in JSON.
    let from_body = serde_json::from_str::<RefreshRequest>(&body)
        .ok()
        .and_then(|request| request.refresh_token);

    let token = from_body
        .or_else(|| cookie_value(&headers, "refresh_token"))
        .ok_or(Error::TokenInvalid)?;

    let session = state.tokens.refresh(&token).await?;

    // The rotated pair belongs to the same user; surface the profile too
    let claims = crate::token::TokenService::peek_sub(&session.access_token);
    let user = match claims.and_then(|sub| sub.parse().ok()) {
        Some(user_id) => state.stores.users.find_by_id(user_id).await?,
        None => None,
    };

    Ok(session_response(&state, user.as_ref(), Some(&session)))
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CodeRequest>,
) -> Result<Json<serde_json::Value>> {
    state.auth.verify_email(&body.email, &body.code).await?;
    Ok(Json(serde_json::json!({"verified": true})))
}

pub async fn reset_request(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EmailRequest>,
) -> Result<Json<serde_json::Value>> {
    state.auth.request_password_reset(&body.email).await?;
    // Uniform response whether or not the account exists
    Ok(Json(
        serde_json::json!({"message": "If the account exists, a reset code has been sent"}),
    ))
}

pub async fn reset_confirm(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResetConfirmRequest>,
) -> Result<Json<serde_json::Value>> {
    state
        .auth
        .confirm_password_reset(&body.email, &body.code, &body.password)
        .await?;
    Ok(Json(serde_json::json!({"message": "Password updated"})))
}

/// One endpoint, two phases: without a code it issues the magic link,
/// with a code it completes the sign-in.
pub async fn magiclink(
    State(state): State<Arc<AppState>>,
    Extension(ip): Extension<ClientIp>,
    headers: HeaderMap,
    Json(body): Json<MagicLinkRequest>,
) -> Result<Response> {
    match body.code {
        None => {
            state.auth.request_magic_link(&body.email).await?;
            Ok(Json(
                serde_json::json!({"message": "If the account exists, a sign-in code has been sent"}),
            )
            .into_response())
        }
        Some(code) => {
            let (ip, user_agent) = client_meta(&headers, &ip);
            let (user, session) = state
                .auth
                .magic_link_signin(&body.email, &code, ip, user_agent)
                .await?;
            Ok(session_response(&state, Some(&user), Some(&session)))
        }
    }
}

pub async fn invite(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<InviteRequest>,
) -> Result<Json<serde_json::Value>> {
    crate::admin::AdminService::require_admin(&principal)?;
    state.auth.invite(&body.email, &principal).await?;
    Ok(Json(serde_json::json!({"invited": body.email})))
}

pub async fn accept_invite(
    State(state): State<Arc<AppState>>,
    Extension(ip): Extension<ClientIp>,
    headers: HeaderMap,
    Json(body): Json<AcceptInviteRequest>,
) -> Result<Response> {
    let (ip, user_agent) = client_meta(&headers, &ip);
    let (user, session) = state
        .auth
        .accept_invite(&body.email, &body.code, &body.password, ip, user_agent)
        .await?;
    Ok(session_response(&state, Some(&user), Some(&session)))
}

/// Public CAPTCHA configuration (site key, provider, protected endpoints)
pub async fn captcha_config(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.captcha.public_config())
}
