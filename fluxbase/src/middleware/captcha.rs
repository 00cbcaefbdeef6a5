//! CAPTCHA verification gate
//!
//! Runs before the rate gate on configured endpoints. The token arrives in
//! the `X-Captcha-Token` header and is verified against the provider's
//! endpoint; score-based providers are additionally checked against the
//! configured threshold. Service-role callers bypass the gate.

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

use crate::config::CaptchaConfig;
use crate::error::{Error, Result};
use crate::principal::{ClientIp, Principal};

const TOKEN_HEADER: &str = "x-captcha-token";

/// Provider verification response (shared shape across providers)
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    success: bool,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// CAPTCHA verifier bound to one provider
#[derive(Clone)]
pub struct CaptchaGate {
    config: CaptchaConfig,
    http: reqwest::Client,
}

impl CaptchaGate {
    pub fn new(config: CaptchaConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Provider verification endpoint
    fn verify_url(&self) -> &'static str {
        match self.config.provider.as_str() {
            "turnstile" => "https://challenges.cloudflare.com/turnstile/v0/siteverify",
            "hcaptcha" => "https://api.hcaptcha.com/siteverify",
            _ => "https://www.google.com/recaptcha/api/siteverify",
        }
    }

    /// Whether this request path is protected
    pub fn protects(&self, path: &str) -> bool {
        self.config.enabled
            && self
                .config
                .endpoints
                .iter()
                .any(|suffix| path.ends_with(suffix.as_str()))
    }

    /// Call the provider and apply the score threshold
    pub async fn verify(&self, token: &str, remote_ip: Option<&str>) -> Result<()> {
        let mut form = vec![
            ("secret", self.config.secret.clone()),
            ("response", token.to_string()),
        ];
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip.to_string()));
        }

        let response = self
            .http
            .post(self.verify_url())
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::External(format!("CAPTCHA verification failed: {}", e)))?;

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| Error::External(format!("CAPTCHA response unreadable: {}", e)))?;

        if !body.success {
            if body
                .error_codes
                .iter()
                .any(|c| c == "timeout-or-duplicate" || c == "expired-input-response")
            {
                return Err(Error::CaptchaExpired);
            }
            return Err(Error::CaptchaInvalid);
        }

        if let Some(score) = body.score {
            if score < self.config.min_score {
                tracing::debug!(score, threshold = self.config.min_score, "CAPTCHA score too low");
                return Err(Error::CaptchaScoreTooLow);
            }
        }

        Ok(())
    }

    /// Middleware gating configured endpoints
    pub async fn middleware(
        State(gate): State<Self>,
        request: Request<Body>,
        next: Next,
    ) -> Result<Response> {
        if !gate.protects(request.uri().path()) {
            return Ok(next.run(request).await);
        }

        if request
            .extensions()
            .get::<Principal>()
            .map(|p| p.is_service_role())
            .unwrap_or(false)
        {
            return Ok(next.run(request).await);
        }

        let token = request
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::CaptchaRequired)?
            .to_string();

        let ip = request
            .extensions()
            .get::<ClientIp>()
            .and_then(|c| c.0.clone());

        gate.verify(&token, ip.as_deref()).await?;

        Ok(next.run(request).await)
    }

    /// Public configuration exposed to clients
    pub fn public_config(&self) -> serde_json::Value {
        serde_json::json!({
            "enabled": self.config.enabled,
            "provider": self.config.provider,
            "site_key": self.config.site_key,
            "endpoints": self.config.endpoints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(enabled: bool) -> CaptchaGate {
        CaptchaGate::new(CaptchaConfig {
            enabled,
            provider: "turnstile".into(),
            site_key: "site".into(),
            secret: "secret".into(),
            endpoints: vec!["/signup".into(), "/signin".into()],
            min_score: 0.5,
        })
    }

    #[test]
    fn test_protected_paths() {
        let gate = gate(true);
        assert!(gate.protects("/api/v1/auth/signup"));
        assert!(gate.protects("/api/v1/auth/signin"));
        assert!(!gate.protects("/api/v1/auth/refresh"));
    }

    #[test]
    fn test_disabled_protects_nothing() {
        let gate = gate(false);
        assert!(!gate.protects("/api/v1/auth/signup"));
    }

    #[test]
    fn test_verify_urls() {
        assert_eq!(
            gate(true).verify_url(),
            "https://challenges.cloudflare.com/turnstile/v0/siteverify"
        );

        let mut config = CaptchaConfig {
            provider: "recaptcha".into(),
            ..Default::default()
        };
        assert!(CaptchaGate::new(config.clone()).verify_url().contains("google"));
        config.provider = "hcaptcha".into();
        assert!(CaptchaGate::new(config).verify_url().contains("hcaptcha"));
    }

    #[test]
    fn test_public_config_hides_secret() {
        let json = gate(true).public_config();
        assert_eq!(json["site_key"], "site");
        assert!(json.get("secret").is_none());
    }

    #[test]
    fn test_score_shape_parses() {
        let body: VerifyResponse = serde_json::from_str(
            r#"{"success": true, "score": 0.3, "error-codes": []}"#,
        )
        .unwrap();
        assert!(body.success);
        assert_eq!(body.score, Some(0.3));

        let body: VerifyResponse = serde_json::from_str(
            r#"{"success": false, "error-codes": ["timeout-or-duplicate"]}"#,
        )
        .unwrap();
        assert!(!body.success);
        assert_eq!(body.error_codes, vec!["timeout-or-duplicate"]);
    }
}
