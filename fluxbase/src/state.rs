//! Application state assembly
//!
//! Wires pools, stores, services and background tasks together. The
//! resulting `AppState` is cheap to clone pieces out of; handlers receive
//! it as `State<Arc<AppState>>`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

use crate::admin::AdminService;
use crate::audit::{AuditLogger, PgAuditStorage};
use crate::auth::oauth::OAuthService;
use crate::auth::saml::SamlService;
use crate::auth::{AuthService, FlowConfig};
use crate::config::Config;
use crate::crypto::{FieldCipher, PasswordHasher};
use crate::database;
use crate::error::{Error, Result};
use crate::mailer::{LogMailer, Mailer, SmtpMailer};
use crate::middleware::rate_limit::{MemoryCounter, PgCounter, RateCounter, RedisCounter};
use crate::middleware::{CaptchaGate, CsrfProtection, IpAllowlist, RateGates};
use crate::principal::CallerResolver;
use crate::realtime::{
    listener, LocalBroadcast, PgBroadcast, RealtimeRegistry, RedisBroadcast, SubscriptionHub,
};
use crate::scope::ScopeBinder;
use crate::store::{OtpStore, SamlStore, SessionStore, Stores};
use crate::token::{blacklist, MemoryBlacklist, PgBlacklist, TokenBlacklist, TokenService};

/// Interval for the expiry sweepers (sessions, OTP, SAML assertions)
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Audit channel capacity and backpressure grace
const AUDIT_QUEUE_CAPACITY: usize = 4096;
const AUDIT_GRACE: Duration = Duration::from_secs(2);

/// Everything a request handler can reach
pub struct AppState {
    pub config: Config,
    pub pool: sqlx::PgPool,
    pub admin_pool: sqlx::PgPool,
    pub read_pool: Option<sqlx::PgPool>,
    pub stores: Stores,
    pub tokens: TokenService,
    pub auth: AuthService,
    pub oauth: OAuthService,
    pub saml: SamlService,
    pub admin: AdminService,
    pub resolver: CallerResolver,
    pub binder: ScopeBinder,
    pub registry: RealtimeRegistry,
    pub hub: Arc<SubscriptionHub>,
    pub gates: RateGates,
    pub captcha: CaptchaGate,
    pub csrf: CsrfProtection,
    pub global_allowlist: IpAllowlist,
    pub admin_allowlist: IpAllowlist,
    pub cipher: FieldCipher,
    pub audit: AuditLogger,
}

impl AppState {
    /// Build the full state and spawn the background tasks
    pub async fn build(config: Config) -> Result<Arc<Self>> {
        let pool = database::runtime_pool(&config.database).await?;
        let admin_pool = database::admin_pool(&config.database).await?;
        let read_pool = database::read_pool(&config.database).await?;

        let redis_pool = match (&config.security.scaling_backend[..], &config.redis) {
            ("redis", Some(redis_config)) => {
                let cfg = deadpool_redis::Config::from_url(&redis_config.url);
                let pool = cfg
                    .create_pool(Some(deadpool_redis::Runtime::Tokio1))
                    .map_err(|e| Error::Config(format!("failed to create Redis pool: {}", e)))?;
                Some(pool)
            }
            _ => None,
        };

        let audit_store = Arc::new(PgAuditStorage::new(pool.clone()));
        let audit = AuditLogger::spawn(audit_store.clone(), AUDIT_QUEUE_CAPACITY, AUDIT_GRACE);

        let stores = Stores::postgres(pool.clone());
        let hasher = PasswordHasher::new(&config.auth.password)?;
        let cipher = FieldCipher::new(&config.aead_key()?);

        // Blacklist backend follows the scaling backend: in-process for a
        // single instance, the shared table otherwise.
        let token_blacklist: Arc<dyn TokenBlacklist> =
            if config.security.scaling_backend == "memory" {
                Arc::new(MemoryBlacklist::new())
            } else {
                Arc::new(PgBlacklist::new(pool.clone()))
            };
        blacklist::spawn_sweeper(token_blacklist.clone(), SWEEP_INTERVAL);

        let tokens = TokenService::new(
            config.auth.jwt_secret.as_bytes(),
            config.token_issuer().to_string(),
            config.accepted_issuers(),
            ChronoDuration::seconds(config.auth.access_ttl_secs as i64),
            ChronoDuration::seconds(config.auth.refresh_ttl_secs as i64),
            token_blacklist,
            stores.sessions.clone(),
            audit.clone(),
        );

        let resolver = CallerResolver::new(
            tokens.clone(),
            stores.service_keys.clone(),
            hasher.clone(),
            config.service.trust_proxy,
        );

        let binder = ScopeBinder::new(pool.clone());

        let counter: Arc<dyn RateCounter> = match config.security.scaling_backend.as_str() {
            "postgres" => Arc::new(PgCounter::new(pool.clone())),
            "redis" => Arc::new(RedisCounter::new(
                redis_pool
                    .clone()
                    .ok_or_else(|| Error::Config("redis backend without redis pool".into()))?,
            )),
            _ => Arc::new(MemoryCounter::new()),
        };
        let gates = RateGates::new(config.security.rate_limit.clone(), counter);

        let captcha = CaptchaGate::new(config.security.captcha.clone());
        let csrf = CsrfProtection::new(
            config.auth.jwt_secret.as_bytes(),
            config.security.csrf.clone(),
        );
        let global_allowlist =
            IpAllowlist::new(&config.security.ip_allowlist, config.service.trust_proxy)?;
        let admin_allowlist =
            IpAllowlist::new(&config.security.admin_ip_allowlist, config.service.trust_proxy)?;

        let mailer: Arc<dyn Mailer> = if config.email.enabled {
            Arc::new(SmtpMailer::new(&config.email)?)
        } else {
            Arc::new(LogMailer)
        };

        let auth = AuthService::new(
            stores.users.clone(),
            stores.otp.clone(),
            tokens.clone(),
            hasher.clone(),
            mailer,
            gates.limiter.clone(),
            audit.clone(),
            FlowConfig::from_auth(
                &config.auth,
                config.security.rate_limit.reset_per_hour,
                config.security.rate_limit.magic_link_per_hour,
            ),
        );

        let oauth = OAuthService::new(
            &config.auth,
            stores.oauth_state.clone(),
            stores.users.clone(),
            stores.identities.clone(),
            tokens.clone(),
            audit.clone(),
        )?;

        let saml = SamlService::new(
            stores.saml.clone(),
            stores.users.clone(),
            tokens.clone(),
            audit.clone(),
            config.auth.saml.clone(),
        );

        let registry = RealtimeRegistry::new(
            pool.clone(),
            Duration::from_secs(config.realtime.registry_ttl_secs),
        );

        let broadcaster: Arc<dyn crate::realtime::BroadcastBackend> =
            match config.security.scaling_backend.as_str() {
                "postgres" => Arc::new(PgBroadcast::new(
                    pool.clone(),
                    config.realtime.broadcast_channel.clone(),
                )),
                "redis" => Arc::new(RedisBroadcast::new(
                    redis_pool
                        .clone()
                        .ok_or_else(|| Error::Config("redis backend without redis pool".into()))?,
                    config.realtime.broadcast_channel.clone(),
                )),
                _ => Arc::new(LocalBroadcast),
            };

        let hub = Arc::new(SubscriptionHub::new(
            binder.clone(),
            registry.clone(),
            broadcaster,
            pool.clone(),
            config.realtime.send_queue_depth,
            Duration::from_secs(config.realtime.slow_client_grace_secs),
        ));

        let admin = AdminService::new(
            admin_pool.clone(),
            registry.clone(),
            stores.service_keys.clone(),
            stores.sessions.clone(),
            stores.saml.clone(),
            tokens.clone(),
            hasher,
            audit.clone(),
            audit_store,
        );

        let state = Arc::new(Self {
            config,
            pool,
            admin_pool,
            read_pool,
            stores,
            tokens,
            auth,
            oauth,
            saml,
            admin,
            resolver,
            binder,
            registry,
            hub,
            gates,
            captcha,
            csrf,
            global_allowlist,
            admin_allowlist,
            cipher,
            audit,
        });

        state.spawn_background_tasks(redis_pool.is_some());
        Ok(state)
    }

    fn spawn_background_tasks(&self, redis_backend: bool) {
        listener::spawn_listener(
            self.pool.clone(),
            listener::ListenerConfig {
                change_channel: self.config.realtime.change_channel.clone(),
                broadcast_channel: self.config.realtime.broadcast_channel.clone(),
            },
            self.registry.clone(),
            self.hub.clone(),
        );

        // With Redis scaling, broadcasts arrive over pub/sub instead of
        // the pg broadcast channel.
        if redis_backend {
            if let Some(redis_config) = &self.config.redis {
                let hub = self.hub.clone();
                crate::realtime::RedisBroadcast::spawn_subscriber(
                    redis_config.url.clone(),
                    self.config.realtime.broadcast_channel.clone(),
                    move |envelope| hub.deliver_remote_broadcast(envelope),
                );
            }
        }

        let stores = self.stores.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match stores.sessions.sweep_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "expired sessions swept"),
                    Err(e) => tracing::warn!(error = %e, "session sweep failed"),
                }
                if let Err(e) = stores.otp.sweep_expired().await {
                    tracing::warn!(error = %e, "otp sweep failed");
                }
                if let Err(e) = stores.saml.sweep_assertions().await {
                    tracing::warn!(error = %e, "saml assertion sweep failed");
                }
            }
        });
    }
}
