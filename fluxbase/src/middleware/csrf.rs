//! CSRF protection (double-submit cookie)
//!
//! A random token is HMAC-signed together with its expiry and issued as a
//! cookie. State-changing requests authenticated via cookies must echo the
//! token in `X-CSRF-Token`; header- and key-authenticated callers are
//! exempt because they cannot be ridden cross-site.

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::Rng;

use crate::config::CsrfConfig;
use crate::crypto::{constant_time_eq, hmac_sign, hmac_verify};
use crate::error::{Error, Result};
use crate::principal::{cookie_value, CredentialSource};

const SAFE_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS"];

/// Token format: `<nonce>.<expiry-unix>.<mac>` where the MAC covers
/// `<nonce>.<expiry-unix>`.
#[derive(Clone)]
pub struct CsrfProtection {
    secret: Vec<u8>,
    config: CsrfConfig,
}

impl CsrfProtection {
    pub fn new(secret: &[u8], config: CsrfConfig) -> Self {
        Self {
            secret: secret.to_vec(),
            config,
        }
    }

    /// Mint a fresh signed token
    pub fn issue(&self) -> String {
        let nonce: [u8; 16] = rand::rng().random();
        let nonce = URL_SAFE_NO_PAD.encode(nonce);
        let expiry = Utc::now().timestamp() + self.config.ttl_secs as i64;

        let payload = format!("{}.{}", nonce, expiry);
        let mac = hmac_sign(&self.secret, payload.as_bytes());
        format!("{}.{}", payload, mac)
    }

    /// Validate signature and expiry of a presented token
    pub fn validate(&self, token: &str) -> Result<()> {
        let mut parts = token.rsplitn(2, '.');
        let mac = parts.next().ok_or(Error::CsrfInvalid)?;
        let payload = parts.next().ok_or(Error::CsrfInvalid)?;

        if !hmac_verify(&self.secret, payload.as_bytes(), mac) {
            return Err(Error::CsrfInvalid);
        }

        let expiry: i64 = payload
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(Error::CsrfInvalid)?;

        if Utc::now().timestamp() >= expiry {
            return Err(Error::CsrfInvalid);
        }

        Ok(())
    }

    /// `Set-Cookie` header value issuing the token
    pub fn cookie(&self, token: &str) -> String {
        // Not HttpOnly: the client script must read it to echo the header
        format!(
            "{}={}; Path=/; SameSite=Lax; Max-Age={}",
            self.config.cookie_name, token, self.config.ttl_secs
        )
    }

    /// Middleware: enforce the double-submit check for cookie-authenticated
    /// state-changing requests.
    pub async fn middleware(
        State(csrf): State<Self>,
        request: Request<Body>,
        next: Next,
    ) -> Result<Response> {
        if !csrf.config.enabled {
            return Ok(next.run(request).await);
        }

        if SAFE_METHODS
            .iter()
            .any(|m| request.method().as_str().eq_ignore_ascii_case(m))
        {
            return Ok(next.run(request).await);
        }

        // Only browser (cookie) authentication is CSRF-able
        let via_cookie = matches!(
            request.extensions().get::<CredentialSource>(),
            Some(CredentialSource::Cookie)
        );
        if !via_cookie {
            return Ok(next.run(request).await);
        }

        let cookie_token = cookie_value(request.headers(), &csrf.config.cookie_name)
            .ok_or(Error::CsrfInvalid)?;
        let header_token = request
            .headers()
            .get(&csrf.config.header_name)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::CsrfInvalid)?;

        if !constant_time_eq(cookie_token.as_bytes(), header_token.as_bytes()) {
            tracing::warn!("CSRF token mismatch between cookie and header");
            return Err(Error::CsrfInvalid);
        }

        csrf.validate(&cookie_token)?;

        Ok(next.run(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protection() -> CsrfProtection {
        CsrfProtection::new(b"0123456789abcdef0123456789abcdef", CsrfConfig::default())
    }

    #[test]
    fn test_issue_and_validate() {
        let csrf = protection();
        let token = csrf.issue();
        assert!(csrf.validate(&token).is_ok());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let csrf = protection();
        let token = csrf.issue();

        let mut tampered = token.clone();
        tampered.replace_range(0..1, if token.starts_with('A') { "B" } else { "A" });
        assert!(matches!(csrf.validate(&tampered), Err(Error::CsrfInvalid)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let config = CsrfConfig {
            ttl_secs: 0,
            ..Default::default()
        };
        let csrf = CsrfProtection::new(b"0123456789abcdef0123456789abcdef", config);
        let token = csrf.issue();
        assert!(matches!(csrf.validate(&token), Err(Error::CsrfInvalid)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = protection().issue();
        let other = CsrfProtection::new(b"ffffffffffffffffffffffffffffffff", CsrfConfig::default());
        assert!(matches!(other.validate(&token), Err(Error::CsrfInvalid)));
    }

    #[test]
    fn test_garbage_rejected() {
        let csrf = protection();
        assert!(csrf.validate("").is_err());
        assert!(csrf.validate("no-dots-here").is_err());
        assert!(csrf.validate("a.b.c").is_err());
    }

    #[test]
    fn test_cookie_attributes() {
        let csrf = protection();
        let cookie = csrf.cookie("tok");
        assert!(cookie.starts_with("csrf_token=tok"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(!cookie.contains("HttpOnly"));
    }
}
