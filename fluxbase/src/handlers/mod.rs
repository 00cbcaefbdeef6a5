//! Route assembly
//!
//! The middleware order is fixed per request: request id and access
//! logging wrap everything in `server.rs`; inside those, the global IP
//! allowlist runs first, then the caller resolver, the CAPTCHA gate, the
//! per-group rate gate and CSRF. Handlers open their database scope
//! through the binder and the error translator maps failures onto the
//! stable taxonomy.

pub mod admin;
pub mod auth;
pub mod health;
pub mod oauth;
pub mod realtime;
pub mod saml;

use std::sync::Arc;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};

use crate::middleware::{CaptchaGate, CsrfProtection, IpAllowlist};
use crate::principal::CallerResolver;
use crate::state::AppState;

/// Build the full application router
pub fn router(state: Arc<AppState>) -> Router {
    let gates = state.gates.clone();

    let auth_routes = Router::new()
        .route(
            "/signup",
            post(auth::signup).layer(from_fn_with_state(
                gates.signup.clone(),
                crate::middleware::RateGate::middleware,
            )),
        )
        .route(
            "/signin",
            post(auth::signin).layer(from_fn_with_state(
                gates.login.clone(),
                crate::middleware::RateGate::middleware,
            )),
        )
        .route("/signout", post(auth::signout))
        .route(
            "/refresh",
            post(auth::refresh).layer(from_fn_with_state(
                gates.refresh.clone(),
                crate::middleware::RateGate::middleware,
            )),
        )
        .route("/verify", post(auth::verify))
        .route(
            "/reset/request",
            post(auth::reset_request).layer(from_fn_with_state(
                gates.password_reset.clone(),
                crate::middleware::RateGate::middleware,
            )),
        )
        .route("/reset/confirm", post(auth::reset_confirm))
        .route(
            "/magiclink",
            post(auth::magiclink).layer(from_fn_with_state(
                gates.magic_link.clone(),
                crate::middleware::RateGate::middleware,
            )),
        )
        .route("/invite", post(auth::invite))
        .route("/invite/accept", post(auth::accept_invite))
        .route("/captcha/config", get(auth::captcha_config))
        .route("/oauth/providers", get(oauth::providers))
        .route("/oauth/{provider}/authorize", get(oauth::authorize))
        .route("/oauth/{provider}/callback", get(oauth::callback))
        .route("/saml/providers", get(saml::providers))
        .route("/saml/metadata", get(saml::metadata))
        .route("/saml/metadata/{provider}", get(saml::metadata))
        .route("/saml/login/{provider}", get(saml::login))
        .route("/saml/acs", post(saml::acs))
        .route("/saml/slo", post(saml::slo_post).get(saml::slo_get))
        .route("/saml/logout/{provider}", get(saml::logout));

    let admin_routes = Router::new()
        .route(
            "/setup",
            post(admin::setup).layer(from_fn_with_state(
                gates.admin_setup.clone(),
                crate::middleware::RateGate::middleware,
            )),
        )
        .route(
            "/realtime/tables",
            get(admin::list_realtime).post(admin::enable_realtime),
        )
        .route(
            "/realtime/tables/{schema}/{table}",
            delete(admin::disable_realtime),
        )
        .route("/keys", get(admin::list_keys).post(admin::create_key))
        .route("/keys/{id}/rotate", post(admin::rotate_key))
        .route("/keys/{id}", delete(admin::revoke_key))
        .route("/users/{user_id}/sessions", get(admin::list_sessions))
        .route("/sessions/{session_id}", delete(admin::cancel_session))
        .route("/sso/providers", get(admin::list_sso).post(admin::upsert_sso))
        .route("/sso/providers/{name}/toggle", post(admin::toggle_sso))
        .route("/audit", get(admin::recent_audit))
        .route("/migrations/run", post(admin::run_migrations))
        // Migration and admin surfaces honour their own allowlist
        .layer(from_fn_with_state(
            state.admin_allowlist.clone(),
            IpAllowlist::middleware,
        ));

    let api = Router::new()
        .nest("/auth", auth_routes)
        .nest("/admin", admin_routes)
        .route("/realtime", get(realtime::upgrade))
        // CSRF applies to cookie-authenticated state changes
        .layer(from_fn_with_state(
            state.csrf.clone(),
            CsrfProtection::middleware,
        ))
        // Global API rate limit, keyed by principal
        .layer(from_fn_with_state(
            gates.global.clone(),
            crate::middleware::RateGate::middleware,
        ))
        // CAPTCHA gate for listed endpoints (before the rate gates in
        // request order: layers run outermost-last-added first)
        .layer(from_fn_with_state(
            state.captcha.clone(),
            CaptchaGate::middleware,
        ))
        // Caller resolver: everything below sees a Principal
        .layer(from_fn_with_state(
            state.resolver.clone(),
            CallerResolver::middleware,
        ))
        // Global IP allowlist, when configured
        .layer(from_fn_with_state(
            state.global_allowlist.clone(),
            IpAllowlist::middleware,
        ));

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .nest("/api/v1", api)
        .with_state(state)
}
