//! Generic OAuth provider with configured endpoints
//!
//! Covers any OIDC-ish provider: authorization, token and userinfo
//! endpoints come from configuration, and the extractor follows the
//! standard claim names with common fallbacks.

use async_trait::async_trait;
use oauth2::{
    AuthUrl, AuthorizationCode, Client, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use reqwest::Client as HttpClient;

use super::google::ConfiguredClient;
use crate::auth::oauth::provider::{OAuthProvider, OAuthTokens, OAuthUserInfo};
use crate::config::OAuthProviderConfig;
use crate::error::{Error, Result};

/// Configured-endpoint OAuth provider
#[derive(Clone)]
pub struct CustomProvider {
    name: String,
    client: ConfiguredClient,
    http_client: HttpClient,
    userinfo_endpoint: String,
    scopes: Vec<String>,
    auto_create: bool,
}

impl CustomProvider {
    pub fn new(name: &str, config: &OAuthProviderConfig) -> Result<Self> {
        let authorization_endpoint = config
            .authorization_endpoint
            .clone()
            .ok_or_else(|| Error::Config(format!("provider '{}' needs authorization_endpoint", name)))?;
        let token_endpoint = config
            .token_endpoint
            .clone()
            .ok_or_else(|| Error::Config(format!("provider '{}' needs token_endpoint", name)))?;
        let userinfo_endpoint = config
            .userinfo_endpoint
            .clone()
            .ok_or_else(|| Error::Config(format!("provider '{}' needs userinfo_endpoint", name)))?;

        let client = Client::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(authorization_endpoint)
                    .map_err(|e| Error::Config(format!("invalid authorization endpoint: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(token_endpoint)
                    .map_err(|e| Error::Config(format!("invalid token endpoint: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_uri.clone())
                    .map_err(|e| Error::Config(format!("invalid redirect URI: {}", e)))?,
            );

        let http_client = HttpClient::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            client,
            http_client,
            userinfo_endpoint,
            scopes: config.scopes.clone(),
            auto_create: config.auto_create_users,
        })
    }
}

#[async_trait]
impl OAuthProvider for CustomProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorization_url(&self, state: &str, pkce_verifier: Option<&str>) -> String {
        let mut request = self
            .client
            .authorize_url(|| CsrfToken::new(state.to_string()));

        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }

        if let Some(verifier) = pkce_verifier {
            let challenge = PkceCodeChallenge::from_code_verifier_sha256(&PkceCodeVerifier::new(
                verifier.to_string(),
            ));
            request = request.set_pkce_challenge(challenge);
        }

        let (url, _) = request.url();
        url.to_string()
    }

    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<OAuthTokens> {
        let mut request = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()));

        if let Some(verifier) = pkce_verifier {
            request = request.set_pkce_verifier(PkceCodeVerifier::new(verifier.to_string()));
        }

        let response = request
            .request_async(&self.http_client)
            .await
            .map_err(|e| Error::External(format!("{} token exchange failed: {}", self.name, e)))?;

        Ok(OAuthTokens {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_in: response.expires_in().map(|d| d.as_secs() as i64),
            token_type: "Bearer".to_string(),
        })
    }

    async fn get_user_info(&self, access_token: &str) -> Result<OAuthUserInfo> {
        let response = self
            .http_client
            .get(&self.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::External(format!("failed to fetch {} user info: {}", self.name, e)))?;

        if !response.status().is_success() {
            return Err(Error::External(format!(
                "{} user info request failed: {}",
                self.name,
                response.status()
            )));
        }

        let info: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::External(format!("failed to parse {} user info: {}", self.name, e)))?;

        // Standard OIDC claims with common fallbacks
        let provider_user_id = info["sub"]
            .as_str()
            .map(|s| s.to_string())
            .or_else(|| info["id"].as_str().map(|s| s.to_string()))
            .or_else(|| info["id"].as_i64().map(|id| id.to_string()))
            .ok_or_else(|| Error::External(format!("{} userinfo has no subject", self.name)))?;

        Ok(OAuthUserInfo {
            provider: self.name.clone(),
            provider_user_id,
            email: info["email"].as_str().map(|s| s.to_string()),
            email_verified: info["email_verified"].as_bool().unwrap_or(false),
            name: info["name"]
                .as_str()
                .or_else(|| info["preferred_username"].as_str())
                .map(|s| s.to_string()),
            raw: info,
        })
    }

    fn auto_create_users(&self) -> bool {
        self.auto_create
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_endpoints() {
        let config = OAuthProviderConfig {
            client_id: "c".into(),
            client_secret: "s".into(),
            redirect_uri: "https://example.com/cb".into(),
            scopes: vec![],
            authorization_endpoint: None,
            token_endpoint: None,
            userinfo_endpoint: None,
            auto_create_users: true,
        };
        assert!(matches!(
            CustomProvider::new("acme", &config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_authorization_url_with_custom_endpoints() {
        let config = OAuthProviderConfig {
            client_id: "c".into(),
            client_secret: "s".into(),
            redirect_uri: "https://example.com/cb".into(),
            scopes: vec!["openid".into()],
            authorization_endpoint: Some("https://idp.acme.io/authorize".into()),
            token_endpoint: Some("https://idp.acme.io/token".into()),
            userinfo_endpoint: Some("https://idp.acme.io/userinfo".into()),
            auto_create_users: false,
        };
        let provider = CustomProvider::new("acme", &config).unwrap();
        assert_eq!(provider.name(), "acme");

        let url = provider.authorization_url("st", None);
        assert!(url.starts_with("https://idp.acme.io/authorize"));
        assert!(url.contains("scope=openid"));
    }
}
