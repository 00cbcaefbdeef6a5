//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: FLUXBASE_, `__` as section separator)
//! 2. Current working directory: ./fluxbase.toml
//! 3. Default values
//!
//! Misconfiguration is fatal: [`Config::validate`] runs at startup and the
//! process refuses to boot on missing secrets, short keys or unknown
//! backend names.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::middleware::rate_limit::RateLimitSettings;

/// Minimum length of the JWT/HMAC signing secret, in bytes
pub const MIN_SECRET_LEN: usize = 32;

/// Required length of the AEAD master key after base64 decoding, in bytes
pub const AEAD_KEY_LEN: usize = 32;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Service-level settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// PostgreSQL connection settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Redis settings (required when `security.scaling_backend = "redis"`)
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Authentication settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Security settings (CSRF, CAPTCHA, allowlists, rate limits)
    #[serde(default)]
    pub security: SecurityConfig,

    /// Realtime change-feed settings
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Outbound email settings
    #[serde(default)]
    pub email: EmailConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name, used as default token issuer
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Bind address, e.g. `0.0.0.0:8090`
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Allowed CORS origins; empty means same-origin only
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Trust `X-Forwarded-For` for client IPs (behind a configured proxy)
    #[serde(default)]
    pub trust_proxy: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
            environment: default_environment(),
            timeout_secs: default_timeout(),
            cors_origins: Vec::new(),
            trust_proxy: false,
        }
    }
}

/// PostgreSQL configuration
///
/// Two URLs: the runtime user (lesser privileges, RLS enforced) and the
/// admin user (owns schemas, runs migrations, installs triggers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Runtime connection URL
    pub url: String,

    /// Admin connection URL (migrations, trigger installation)
    pub admin_url: String,

    /// Optional read-only pool URL for read-heavy routes
    #[serde(default)]
    pub read_url: Option<String>,

    /// Maximum connections in the runtime pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Retry attempts when opening the pool at startup
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between retries in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            admin_url: String::new(),
            read_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_secs: default_connection_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Maximum connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret (>= 32 bytes)
    #[serde(default)]
    pub jwt_secret: String,

    /// Token issuer; defaults to the service name when empty
    #[serde(default)]
    pub issuer: String,

    /// Additional accepted issuers (compatible deployments)
    #[serde(default)]
    pub accepted_issuers: Vec<String>,

    /// Access token lifetime in seconds
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,

    /// Refresh token lifetime in seconds
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: u64,

    /// Allow self-service sign-up
    #[serde(default = "default_true")]
    pub signup_enabled: bool,

    /// Require email verification before sign-in
    #[serde(default = "default_true")]
    pub require_email_verification: bool,

    /// Set auth cookies on browser responses
    #[serde(default)]
    pub cookies_enabled: bool,

    /// Cookie domain attribute
    #[serde(default)]
    pub cookie_domain: Option<String>,

    /// Failed sign-ins before lockout
    #[serde(default = "default_lockout_threshold")]
    pub lockout_threshold: i32,

    /// Lockout duration in seconds
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,

    /// OTP code lifetime in seconds
    #[serde(default = "default_otp_ttl")]
    pub otp_ttl_secs: u64,

    /// Verification attempts before an OTP is invalidated
    #[serde(default = "default_otp_max_attempts")]
    pub otp_max_attempts: i32,

    /// Single-use OAuth state lifetime in seconds
    #[serde(default = "default_oauth_state_ttl")]
    pub oauth_state_ttl_secs: u64,

    /// Enabled OAuth providers keyed by name (google, github, ...)
    #[serde(default)]
    pub oauth_providers: HashMap<String, OAuthProviderConfig>,

    /// Password hashing and strength policy
    #[serde(default)]
    pub password: PasswordConfig,

    /// SAML service-provider settings
    #[serde(default)]
    pub saml: SamlSpConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: String::new(),
            accepted_issuers: Vec::new(),
            access_ttl_secs: default_access_ttl(),
            refresh_ttl_secs: default_refresh_ttl(),
            signup_enabled: true,
            require_email_verification: true,
            cookies_enabled: false,
            cookie_domain: None,
            lockout_threshold: default_lockout_threshold(),
            lockout_secs: default_lockout_secs(),
            otp_ttl_secs: default_otp_ttl(),
            otp_max_attempts: default_otp_max_attempts(),
            oauth_state_ttl_secs: default_oauth_state_ttl(),
            oauth_providers: HashMap::new(),
            password: PasswordConfig::default(),
            saml: SamlSpConfig::default(),
        }
    }
}

/// OAuth provider credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    /// Client ID issued by the provider
    pub client_id: String,

    /// Client secret issued by the provider
    pub client_secret: String,

    /// Redirect URI registered with the provider
    pub redirect_uri: String,

    /// Requested scopes; empty uses provider defaults
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Custom endpoints, for the generic provider
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,

    /// Create an account on first sign-in when no user matches the email
    #[serde(default = "default_true")]
    pub auto_create_users: bool,
}

/// Password hashing configuration (Argon2id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordConfig {
    /// Memory cost in KiB
    #[serde(default = "default_memory_cost")]
    pub memory_cost_kib: u32,

    /// Iteration count
    #[serde(default = "default_time_cost")]
    pub time_cost: u32,

    /// Parallelism degree
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,

    /// Minimum password length
    #[serde(default = "default_min_password_length")]
    pub min_length: usize,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_cost_kib: default_memory_cost(),
            time_cost: default_time_cost(),
            parallelism: default_parallelism(),
            min_length: default_min_password_length(),
        }
    }
}

/// SAML service-provider identity
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SamlSpConfig {
    /// SP entity ID; audience restriction must equal this value
    #[serde(default)]
    pub entity_id: String,

    /// Assertion consumer service URL (POST binding)
    #[serde(default)]
    pub acs_url: String,

    /// Single logout URL
    #[serde(default)]
    pub slo_url: String,

    /// SP signing key (PKCS#8 PEM), required for SP-initiated SLO
    #[serde(default)]
    pub sp_private_key_pem: Option<String>,

    /// SP certificate (PEM) published in SP metadata
    #[serde(default)]
    pub sp_certificate_pem: Option<String>,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Base64-encoded 32-byte AEAD master key
    #[serde(default)]
    pub aead_master_key: String,

    /// Which backend serialises cross-instance state: memory, postgres, redis
    #[serde(default = "default_scaling_backend")]
    pub scaling_backend: String,

    /// Global CIDR allowlist; empty allows all
    #[serde(default)]
    pub ip_allowlist: Vec<String>,

    /// CIDR allowlist for migration/sync/admin-setup endpoints
    #[serde(default)]
    pub admin_ip_allowlist: Vec<String>,

    /// CSRF double-submit cookie settings
    #[serde(default)]
    pub csrf: CsrfConfig,

    /// CAPTCHA settings
    #[serde(default)]
    pub captcha: CaptchaConfig,

    /// Rate limit presets; configuration is the authoritative source
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            aead_master_key: String::new(),
            scaling_backend: default_scaling_backend(),
            ip_allowlist: Vec::new(),
            admin_ip_allowlist: Vec::new(),
            csrf: CsrfConfig::default(),
            captcha: CaptchaConfig::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

/// CSRF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfConfig {
    /// Enforce CSRF for cookie-authenticated state-changing requests
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Header the client echoes the token in
    #[serde(default = "default_csrf_header")]
    pub header_name: String,

    /// Cookie the signed token is issued in
    #[serde(default = "default_csrf_cookie")]
    pub cookie_name: String,

    /// Token lifetime in seconds
    #[serde(default = "default_csrf_ttl")]
    pub ttl_secs: u64,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header_name: default_csrf_header(),
            cookie_name: default_csrf_cookie(),
            ttl_secs: default_csrf_ttl(),
        }
    }
}

/// CAPTCHA configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CaptchaConfig {
    /// Enable CAPTCHA verification
    #[serde(default)]
    pub enabled: bool,

    /// Provider: turnstile, hcaptcha or recaptcha
    #[serde(default)]
    pub provider: String,

    /// Public site key, exposed at /api/v1/auth/captcha/config
    #[serde(default)]
    pub site_key: String,

    /// Secret used for server-side verification
    #[serde(default)]
    pub secret: String,

    /// Endpoints (path suffixes) requiring a CAPTCHA token
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Minimum score for score-based providers (recaptcha v3)
    #[serde(default = "default_captcha_min_score")]
    pub min_score: f64,
}

/// Realtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// NOTIFY channel carrying row-change payloads
    #[serde(default = "default_change_channel")]
    pub change_channel: String,

    /// NOTIFY channel carrying cross-instance application broadcasts
    #[serde(default = "default_broadcast_channel")]
    pub broadcast_channel: String,

    /// Registry cache TTL in seconds
    #[serde(default = "default_registry_ttl")]
    pub registry_ttl_secs: u64,

    /// Per-connection send queue depth
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,

    /// How long a saturated queue is tolerated before the client is slow
    #[serde(default = "default_slow_client_grace")]
    pub slow_client_grace_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            change_channel: default_change_channel(),
            broadcast_channel: default_broadcast_channel(),
            registry_ttl_secs: default_registry_ttl(),
            send_queue_depth: default_send_queue_depth(),
            slow_client_grace_secs: default_slow_client_grace(),
        }
    }
}

/// Outbound email configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmailConfig {
    /// Enable SMTP delivery; disabled logs instead of sending
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub smtp_username: String,

    #[serde(default)]
    pub smtp_password: String,

    /// From address for OTP and invitation mail
    #[serde(default)]
    pub from_address: String,
}

impl Config {
    /// Load configuration from TOML file, environment and defaults
    pub fn load() -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("fluxbase.toml"))
            .merge(Env::prefixed("FLUXBASE_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration; any failure here is fatal at startup
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(Error::Config("database.url is required".into()));
        }
        if self.database.admin_url.is_empty() {
            return Err(Error::Config("database.admin_url is required".into()));
        }

        if self.auth.jwt_secret.len() < MIN_SECRET_LEN {
            return Err(Error::Config(format!(
                "auth.jwt_secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }

        use base64::{engine::general_purpose::STANDARD, Engine};
        let key = STANDARD
            .decode(&self.security.aead_master_key)
            .map_err(|_| Error::Config("security.aead_master_key must be base64".into()))?;
        if key.len() != AEAD_KEY_LEN {
            return Err(Error::Config(format!(
                "security.aead_master_key must decode to exactly {} bytes",
                AEAD_KEY_LEN
            )));
        }

        match self.security.scaling_backend.as_str() {
            "memory" | "postgres" => {}
            "redis" => {
                if self.redis.is_none() {
                    return Err(Error::Config(
                        "scaling_backend = redis requires a [redis] section".into(),
                    ));
                }
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown scaling backend '{}' (expected memory, postgres or redis)",
                    other
                )));
            }
        }

        // Argon2 cost parameters are range-checked up front so a bad value
        // fails the boot instead of the first sign-up.
        crate::crypto::password::validate_params(&self.auth.password)?;

        for cidr in self
            .security
            .ip_allowlist
            .iter()
            .chain(self.security.admin_ip_allowlist.iter())
        {
            cidr.parse::<ipnetwork::IpNetwork>()
                .map_err(|_| Error::Config(format!("invalid CIDR '{}' in allowlist", cidr)))?;
        }

        if self.security.captcha.enabled {
            match self.security.captcha.provider.as_str() {
                "turnstile" | "hcaptcha" | "recaptcha" => {}
                other => {
                    return Err(Error::Config(format!(
                        "unknown CAPTCHA provider '{}'",
                        other
                    )));
                }
            }
            if self.security.captcha.secret.is_empty() {
                return Err(Error::Config("captcha.secret is required".into()));
            }
        }

        Ok(())
    }

    /// The issuer placed into signed tokens
    pub fn token_issuer(&self) -> &str {
        if self.auth.issuer.is_empty() {
            &self.service.name
        } else {
            &self.auth.issuer
        }
    }

    /// The full set of issuers accepted during verification
    pub fn accepted_issuers(&self) -> Vec<String> {
        let mut issuers = vec![self.token_issuer().to_string()];
        issuers.extend(self.auth.accepted_issuers.iter().cloned());
        issuers
    }

    /// Decoded AEAD master key; assumes [`Config::validate`] has run
    pub fn aead_key(&self) -> Result<[u8; AEAD_KEY_LEN]> {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let bytes = STANDARD
            .decode(&self.security.aead_master_key)
            .map_err(|_| Error::Config("security.aead_master_key must be base64".into()))?;
        bytes
            .try_into()
            .map_err(|_| Error::Config("security.aead_master_key has wrong length".into()))
    }
}

fn default_service_name() -> String {
    "fluxbase".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_redis_max_connections() -> usize {
    16
}

fn default_access_ttl() -> u64 {
    3600
}

fn default_refresh_ttl() -> u64 {
    30 * 24 * 3600
}

fn default_lockout_threshold() -> i32 {
    5
}

fn default_lockout_secs() -> u64 {
    900
}

fn default_otp_ttl() -> u64 {
    600
}

fn default_otp_max_attempts() -> i32 {
    3
}

fn default_oauth_state_ttl() -> u64 {
    600
}

fn default_memory_cost() -> u32 {
    19_456
}

fn default_time_cost() -> u32 {
    2
}

fn default_parallelism() -> u32 {
    1
}

fn default_min_password_length() -> usize {
    8
}

fn default_scaling_backend() -> String {
    "memory".to_string()
}

fn default_csrf_header() -> String {
    "X-CSRF-Token".to_string()
}

fn default_csrf_cookie() -> String {
    "csrf_token".to_string()
}

fn default_csrf_ttl() -> u64 {
    4 * 3600
}

fn default_captcha_min_score() -> f64 {
    0.5
}

fn default_change_channel() -> String {
    "fluxbase_changes".to_string()
}

fn default_broadcast_channel() -> String {
    "fluxbase_broadcast".to_string()
}

fn default_registry_ttl() -> u64 {
    30
}

fn default_send_queue_depth() -> usize {
    256
}

fn default_slow_client_grace() -> u64 {
    10
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.database.url = "postgres://runtime:pw@localhost/fluxbase".into();
        config.database.admin_url = "postgres://admin:pw@localhost/fluxbase".into();
        config.auth.jwt_secret = "0123456789abcdef0123456789abcdef".into();
        // 32 zero bytes
        config.security.aead_master_key =
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".into();
        config
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_short_jwt_secret_rejected() {
        let mut config = valid_config();
        config.auth.jwt_secret = "short".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_wrong_aead_key_length_rejected() {
        let mut config = valid_config();
        config.security.aead_master_key = "AAAA".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_scaling_backend_rejected() {
        let mut config = valid_config();
        config.security.scaling_backend = "etcd".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_backend_requires_redis_section() {
        let mut config = valid_config();
        config.security.scaling_backend = "redis".into();
        assert!(config.validate().is_err());

        config.redis = Some(RedisConfig {
            url: "redis://localhost:6379".into(),
            max_connections: 16,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let mut config = valid_config();
        config.security.ip_allowlist = vec!["not-a-cidr".into()];
        assert!(config.validate().is_err());

        config.security.ip_allowlist = vec!["10.0.0.0/8".into(), "::1/128".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_issuer_defaults_to_service_name() {
        let config = valid_config();
        assert_eq!(config.token_issuer(), "fluxbase");
        assert_eq!(config.accepted_issuers(), vec!["fluxbase".to_string()]);
    }

    #[test]
    fn test_captcha_provider_validated() {
        let mut config = valid_config();
        config.security.captcha.enabled = true;
        config.security.captcha.provider = "turnstile".into();
        config.security.captcha.secret = "s3cret".into();
        assert!(config.validate().is_ok());

        config.security.captcha.provider = "imaginary".into();
        assert!(config.validate().is_err());
    }
}
