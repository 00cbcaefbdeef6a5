//! Tiered rate limiting
//!
//! Fixed windows with atomic increment-and-compare over a swappable
//! counter backend (process-local map, PostgreSQL UPSERT or Redis).
//! Presets exist per route group; keys come from the client IP, the
//! authenticated principal, a refresh-token prefix or (inside credential
//! flows) an email address. The service-role principal bypasses limits.
//!
//! Preset defaults live in [`RateLimitSettings::default`]; configuration
//! is the authoritative source and overrides them.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::principal::{cookie_value, ClientIp, Principal};

/// Preset numbers for every limited route group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Master switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Global API: requests per minute per caller
    #[serde(default = "default_global_per_minute")]
    pub global_per_minute: u32,

    /// Login attempts per window per IP
    #[serde(default = "default_login_max")]
    pub login_max: u32,
    #[serde(default = "default_login_window")]
    pub login_window_secs: u64,

    /// Sign-ups per hour per IP
    #[serde(default = "default_signup_per_hour")]
    pub signup_per_hour: u32,

    /// Password reset requests per hour per email
    #[serde(default = "default_reset_per_hour")]
    pub reset_per_hour: u32,

    /// Magic-link requests per hour per email
    #[serde(default = "default_magic_link_per_hour")]
    pub magic_link_per_hour: u32,

    /// Refreshes per minute per token prefix
    #[serde(default = "default_refresh_per_minute")]
    pub refresh_per_minute: u32,

    /// Admin bootstrap attempts per hour per IP
    #[serde(default = "default_admin_setup_per_hour")]
    pub admin_setup_per_hour: u32,

    /// Admin logins per window per IP
    #[serde(default = "default_admin_login_max")]
    pub admin_login_max: u32,
    #[serde(default = "default_login_window")]
    pub admin_login_window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            global_per_minute: default_global_per_minute(),
            login_max: default_login_max(),
            login_window_secs: default_login_window(),
            signup_per_hour: default_signup_per_hour(),
            reset_per_hour: default_reset_per_hour(),
            magic_link_per_hour: default_magic_link_per_hour(),
            refresh_per_minute: default_refresh_per_minute(),
            admin_setup_per_hour: default_admin_setup_per_hour(),
            admin_login_max: default_admin_login_max(),
            admin_login_window_secs: default_login_window(),
        }
    }
}

fn default_global_per_minute() -> u32 {
    300
}
fn default_login_max() -> u32 {
    5
}
fn default_login_window() -> u64 {
    900
}
fn default_signup_per_hour() -> u32 {
    10
}
fn default_reset_per_hour() -> u32 {
    3
}
fn default_magic_link_per_hour() -> u32 {
    5
}
fn default_refresh_per_minute() -> u32 {
    30
}
fn default_admin_setup_per_hour() -> u32 {
    5
}
fn default_admin_login_max() -> u32 {
    5
}
fn default_true() -> bool {
    true
}

/// Counter backend: atomic fixed-window increment
#[async_trait]
pub trait RateCounter: Send + Sync {
    /// Increment `(scope, key, window_start)` and return the new count
    async fn incr(&self, scope: &str, key: &str, window_start: i64, window_secs: u64)
        -> Result<u64>;
}

/// Process-local counter for single-instance deployments
#[derive(Default)]
pub struct MemoryCounter {
    counts: DashMap<(String, String, i64), u64>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateCounter for MemoryCounter {
    async fn incr(
        &self,
        scope: &str,
        key: &str,
        window_start: i64,
        _window_secs: u64,
    ) -> Result<u64> {
        // Old windows pile up slowly; prune opportunistically
        if self.counts.len() > 100_000 {
            self.counts.retain(|(_, _, start), _| *start >= window_start);
        }

        let mut entry = self
            .counts
            .entry((scope.to_string(), key.to_string(), window_start))
            .or_insert(0);
        *entry += 1;
        Ok(*entry)
    }
}

/// PostgreSQL counter: one UPSERT per check, usable across instances
pub struct PgCounter {
    pool: sqlx::PgPool,
}

impl PgCounter {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateCounter for PgCounter {
    async fn incr(
        &self,
        scope: &str,
        key: &str,
        window_start: i64,
        _window_secs: u64,
    ) -> Result<u64> {
        let window = Utc
            .timestamp_opt(window_start, 0)
            .single()
            .ok_or_else(|| Error::Internal("invalid window timestamp".into()))?;

        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO auth.rate_limits (scope, key, window_start, count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (scope, key, window_start)
            DO UPDATE SET count = auth.rate_limits.count + 1
            RETURNING count
            "#,
        )
        .bind(scope)
        .bind(key)
        .bind(window)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }
}

/// Redis counter: INCR + first-writer EXPIRE
pub struct RedisCounter {
    pool: deadpool_redis::Pool,
}

impl RedisCounter {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateCounter for RedisCounter {
    async fn incr(
        &self,
        scope: &str,
        key: &str,
        window_start: i64,
        window_secs: u64,
    ) -> Result<u64> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::Internal(format!("failed to get Redis connection: {}", e)))?;

        let redis_key = format!("rl:{}:{}:{}", scope, key, window_start);
        let count: u64 = conn
            .incr(&redis_key, 1)
            .await
            .map_err(|e| Error::Internal(format!("rate counter INCR failed: {}", e)))?;

        if count == 1 {
            // Entry dies with its window (plus slack for clock skew)
            let _: std::result::Result<(), _> =
                conn.expire(&redis_key, window_secs as i64 + 60).await;
        }

        Ok(count)
    }
}

/// Outcome of a limit check, with everything the headers need
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds when the current window ends
    pub reset_at: i64,
}

impl RateDecision {
    pub fn retry_after(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now.timestamp()).max(1) as u64
    }
}

/// Fixed-window limiter over a counter backend
#[derive(Clone)]
pub struct RateLimiter {
    counter: Arc<dyn RateCounter>,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(counter: Arc<dyn RateCounter>, enabled: bool) -> Self {
        Self { counter, enabled }
    }

    /// Check one key against `max` per `window_secs`.
    ///
    /// Windows are aligned to the epoch, so a request at `window_end + ε`
    /// always lands in the next window and is charged against the next
    /// quota.
    pub async fn check(
        &self,
        scope: &str,
        key: &str,
        max: u32,
        window_secs: u64,
    ) -> Result<RateDecision> {
        let now = Utc::now().timestamp();
        let window_start = now - now.rem_euclid(window_secs as i64);
        let reset_at = window_start + window_secs as i64;

        if !self.enabled {
            return Ok(RateDecision {
                allowed: true,
                limit: max,
                remaining: max,
                reset_at,
            });
        }

        let count = self
            .counter
            .incr(scope, key, window_start, window_secs)
            .await?;

        Ok(RateDecision {
            allowed: count <= max as u64,
            limit: max,
            remaining: (max as u64).saturating_sub(count) as u32,
            reset_at,
        })
    }
}

/// What a preset keys its counters by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateKey {
    /// Client IP (proxy-aware via the caller resolver)
    Ip,
    /// Authenticated principal: user id or service-key id, IP when anonymous
    Principal,
    /// Refresh-token prefix from the cookie, IP otherwise
    RefreshPrefix,
}

/// A named preset bound to a limiter: used as middleware state
#[derive(Clone)]
pub struct RateGate {
    limiter: RateLimiter,
    scope: &'static str,
    key: RateKey,
    max: u32,
    window_secs: u64,
}

impl RateGate {
    pub fn new(
        limiter: RateLimiter,
        scope: &'static str,
        key: RateKey,
        max: u32,
        window_secs: u64,
    ) -> Self {
        Self {
            limiter,
            scope,
            key,
            max,
            window_secs,
        }
    }

    /// Middleware enforcing this preset
    pub async fn middleware(
        State(gate): State<Self>,
        request: Request<Body>,
        next: Next,
    ) -> Result<Response> {
        let principal = request.extensions().get::<Principal>();

        // Service-role callers bypass rate limits entirely
        if principal.map(|p| p.is_service_role()).unwrap_or(false) {
            return Ok(next.run(request).await);
        }

        let key = gate.extract_key(&request);
        let decision = gate
            .limiter
            .check(gate.scope, &key, gate.max, gate.window_secs)
            .await?;

        if !decision.allowed {
            let retry_after = decision.retry_after(Utc::now());
            tracing::debug!(scope = gate.scope, key = %key, "rate limit exceeded");

            let mut response = Error::RateLimited { retry_after }.into_response();
            apply_headers(&mut response, &decision);
            return Ok(response);
        }

        let mut response = next.run(request).await;
        apply_headers(&mut response, &decision);
        Ok(response)
    }

    fn extract_key(&self, request: &Request<Body>) -> String {
        let ip = request
            .extensions()
            .get::<ClientIp>()
            .and_then(|c| c.0.clone())
            .unwrap_or_else(|| "unknown".to_string());

        match self.key {
            RateKey::Ip => ip,
            RateKey::Principal => match request.extensions().get::<Principal>() {
                Some(Principal::User { user_id, .. }) => user_id.to_string(),
                Some(Principal::Service { key_id, .. }) => key_id.to_string(),
                _ => ip,
            },
            RateKey::RefreshPrefix => cookie_value(request.headers(), "refresh_token")
                .map(|token| token.chars().take(16).collect())
                .unwrap_or(ip),
        }
    }
}

fn apply_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_at.to_string()) {
        headers.insert("X-RateLimit-Reset", value);
    }
}

/// The full preset set wired from settings
#[derive(Clone)]
pub struct RateGates {
    pub global: RateGate,
    pub login: RateGate,
    pub signup: RateGate,
    pub password_reset: RateGate,
    pub magic_link: RateGate,
    pub refresh: RateGate,
    pub admin_setup: RateGate,
    pub admin_login: RateGate,
    /// For email-keyed checks inside credential flows
    pub limiter: RateLimiter,
    pub settings: RateLimitSettings,
}

impl RateGates {
    pub fn new(settings: RateLimitSettings, counter: Arc<dyn RateCounter>) -> Self {
        let limiter = RateLimiter::new(counter, settings.enabled);

        Self {
            global: RateGate::new(
                limiter.clone(),
                "global",
                RateKey::Principal,
                settings.global_per_minute,
                60,
            ),
            login: RateGate::new(
                limiter.clone(),
                "login",
                RateKey::Ip,
                settings.login_max,
                settings.login_window_secs,
            ),
            signup: RateGate::new(
                limiter.clone(),
                "signup",
                RateKey::Ip,
                settings.signup_per_hour,
                3600,
            ),
            password_reset: RateGate::new(
                limiter.clone(),
                "password_reset",
                RateKey::Ip,
                settings.reset_per_hour,
                3600,
            ),
            magic_link: RateGate::new(
                limiter.clone(),
                "magic_link",
                RateKey::Ip,
                settings.magic_link_per_hour,
                3600,
            ),
            refresh: RateGate::new(
                limiter.clone(),
                "refresh",
                RateKey::RefreshPrefix,
                settings.refresh_per_minute,
                60,
            ),
            admin_setup: RateGate::new(
                limiter.clone(),
                "admin_setup",
                RateKey::Ip,
                settings.admin_setup_per_hour,
                3600,
            ),
            admin_login: RateGate::new(
                limiter.clone(),
                "admin_login",
                RateKey::Ip,
                settings.admin_login_max,
                settings.admin_login_window_secs,
            ),
            limiter,
            settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCounter::new()), true)
    }

    #[tokio::test]
    async fn test_allows_up_to_max() {
        let limiter = limiter();
        for i in 1..=5 {
            let decision = limiter.check("login", "203.0.113.9", 5, 900).await.unwrap();
            assert!(decision.allowed, "request {} should pass", i);
            assert_eq!(decision.remaining, 5 - i);
        }

        let sixth = limiter.check("login", "203.0.113.9", 5, 900).await.unwrap();
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
        assert!(sixth.retry_after(Utc::now()) >= 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.check("login", "203.0.113.9", 5, 900).await.unwrap();
        }
        assert!(!limiter.check("login", "203.0.113.9", 5, 900).await.unwrap().allowed);

        // A different IP is unaffected
        let other = limiter.check("login", "198.51.100.7", 5, 900).await.unwrap();
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter.check("login", "203.0.113.9", 5, 900).await.unwrap();
        }
        let signup = limiter.check("signup", "203.0.113.9", 10, 3600).await.unwrap();
        assert!(signup.allowed);
    }

    #[tokio::test]
    async fn test_disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(Arc::new(MemoryCounter::new()), false);
        for _ in 0..100 {
            assert!(limiter.check("login", "k", 1, 60).await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_window_boundary_resets_quota() {
        // Distinct window_start values count separately, which is exactly
        // what happens when the clock crosses a boundary.
        let counter = MemoryCounter::new();
        assert_eq!(counter.incr("s", "k", 0, 60).await.unwrap(), 1);
        assert_eq!(counter.incr("s", "k", 0, 60).await.unwrap(), 2);
        assert_eq!(counter.incr("s", "k", 60, 60).await.unwrap(), 1);
    }

    #[test]
    fn test_default_presets() {
        let settings = RateLimitSettings::default();
        assert_eq!(settings.global_per_minute, 300);
        assert_eq!(settings.login_max, 5);
        assert_eq!(settings.login_window_secs, 900);
        assert_eq!(settings.reset_per_hour, 3);
    }

    #[test]
    fn test_reset_at_is_window_end() {
        let decision = RateDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: Utc::now().timestamp() + 30,
        };
        let retry = decision.retry_after(Utc::now());
        assert!((29..=31).contains(&retry));
    }
}
