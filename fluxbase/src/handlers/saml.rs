//! SAML route handlers
//!
//! Metadata is XML; the ACS accepts the POST binding; SLO accepts POST
//! and GET (HTTP-Redirect binding, deflated).

use std::io::Read;
use std::sync::Arc;

use axum::{
    extract::{Extension, Form, Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::DeflateDecoder;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::principal::{ClientIp, Principal};
use crate::state::AppState;
use crate::store::{SamlStore, UserStore};

#[derive(Debug, Deserialize)]
pub struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: String,
    #[serde(rename = "RelayState", default)]
    pub relay_state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SloForm {
    #[serde(rename = "SAMLRequest")]
    pub saml_request: String,
}

#[derive(Debug, Deserialize)]
pub struct SloQuery {
    #[serde(rename = "SAMLRequest")]
    pub saml_request: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    #[serde(rename = "RelayState", default)]
    pub relay_state: Option<String>,
}

/// Enabled provider names (public)
pub async fn providers(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let providers = state.stores.saml.list_providers().await?;
    let names: Vec<_> = providers
        .iter()
        .filter(|p| p.enabled)
        .map(|p| p.name.clone())
        .collect();
    Ok(Json(serde_json::json!({ "providers": names })))
}

/// SP metadata document
pub async fn metadata(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/samlmetadata+xml")],
        state.saml.sp_metadata_xml(),
    )
        .into_response()
}

/// Start SP-initiated login: redirect to the IdP
pub async fn login(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(query): Query<LoginQuery>,
) -> Result<Redirect> {
    let url = state
        .saml
        .login_url(&provider, query.relay_state.as_deref())
        .await?;
    Ok(Redirect::temporary(&url))
}

/// Assertion consumer service (POST binding)
pub async fn acs(
    State(state): State<Arc<AppState>>,
    Extension(ip): Extension<ClientIp>,
    headers: HeaderMap,
    Form(form): Form<AcsForm>,
) -> Result<Response> {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let result = state
        .saml
        .handle_acs(&form.saml_response, form.relay_state, ip.0.clone(), user_agent)
        .await?;

    if let Some(relay) = &result.relay_state {
        let target = format!(
            "{}#access_token={}&refresh_token={}&token_type=bearer",
            relay, result.session.access_token, result.session.refresh_token
        );
        return Ok(Redirect::temporary(&target).into_response());
    }

    Ok(Json(serde_json::json!({
        "user": result.user,
        "session": result.session,
    }))
    .into_response())
}

/// IdP-initiated SLO, POST binding
pub async fn slo_post(
    State(state): State<Arc<AppState>>,
    Form(form): Form<SloForm>,
) -> Result<Response> {
    let xml_bytes = STANDARD
        .decode(form.saml_request.trim())
        .map_err(|_| Error::BadRequest("SAMLRequest is not base64".into()))?;
    let xml = String::from_utf8(xml_bytes)
        .map_err(|_| Error::BadRequest("SAMLRequest is not UTF-8".into()))?;

    logout_response(&state, &xml).await
}

/// IdP-initiated SLO, HTTP-Redirect binding (deflated request)
pub async fn slo_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SloQuery>,
) -> Result<Response> {
    let compressed = STANDARD
        .decode(query.saml_request.trim())
        .map_err(|_| Error::BadRequest("SAMLRequest is not base64".into()))?;

    let mut decoder = DeflateDecoder::new(&compressed[..]);
    let mut xml = String::new();
    decoder
        .read_to_string(&mut xml)
        .map_err(|_| Error::BadRequest("SAMLRequest is not deflated XML".into()))?;

    logout_response(&state, &xml).await
}

async fn logout_response(state: &AppState, request_xml: &str) -> Result<Response> {
    let response_xml = state.saml.handle_idp_logout(request_xml).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/xml")],
        response_xml,
    )
        .into_response())
}

/// SP-initiated logout: build a signed LogoutRequest redirect
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(provider): Path<String>,
) -> Result<Redirect> {
    let Principal::User { user_id, .. } = &principal else {
        return Err(Error::Forbidden("a signed-in user is required".into()));
    };

    // The NameID the IdP knows this user by is their email
    let user = state
        .stores
        .users
        .find_by_id(*user_id)
        .await?
        .ok_or_else(|| Error::NotFound("user not found".into()))?;

    let url = state
        .saml
        .sp_logout_url(&provider, &user.email, None)
        .await?;

    // Local sessions die immediately; the IdP handles its own side
    state.auth.signout(&principal).await?;

    Ok(Redirect::temporary(&url))
}
