//! Middleware components
//!
//! The request coordinator composes these in a fixed order: request id,
//! access logging, global IP allowlist, caller resolver, CAPTCHA gate,
//! rate gate, CSRF, then the handler inside its database scope.

pub mod captcha;
pub mod csrf;
pub mod ip_allowlist;
pub mod rate_limit;
pub mod request_tracking;

pub use captcha::CaptchaGate;
pub use csrf::CsrfProtection;
pub use ip_allowlist::IpAllowlist;
pub use rate_limit::{
    MemoryCounter, PgCounter, RateCounter, RateGate, RateGates, RateLimiter, RateLimitSettings,
    RedisCounter,
};
pub use request_tracking::{
    request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
};
