//! Google OAuth provider

use async_trait::async_trait;
use oauth2::{
    basic::BasicErrorResponse, AuthUrl, AuthorizationCode, Client, ClientId, ClientSecret,
    CsrfToken, EmptyExtraTokenFields, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope,
    StandardRevocableToken, StandardTokenIntrospectionResponse, StandardTokenResponse,
    TokenResponse, TokenUrl,
};
use reqwest::Client as HttpClient;

use crate::auth::oauth::provider::{OAuthProvider, OAuthTokens, OAuthUserInfo};
use crate::config::OAuthProviderConfig;
use crate::error::{Error, Result};

/// Type alias for the configured OAuth client
pub(crate) type ConfiguredClient = Client<
    BasicErrorResponse,
    StandardTokenResponse<EmptyExtraTokenFields, oauth2::basic::BasicTokenType>,
    StandardTokenIntrospectionResponse<EmptyExtraTokenFields, oauth2::basic::BasicTokenType>,
    StandardRevocableToken,
    BasicErrorResponse,
    oauth2::EndpointSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointSet,
>;

/// Google OAuth provider
#[derive(Clone)]
pub struct GoogleProvider {
    client: ConfiguredClient,
    http_client: HttpClient,
    scopes: Vec<String>,
    auto_create: bool,
}

impl GoogleProvider {
    pub fn new(config: &OAuthProviderConfig) -> Result<Self> {
        let client = Client::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new("https://accounts.google.com/o/oauth2/v2/auth".to_string())
                    .map_err(|e| Error::Internal(format!("invalid Google auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new("https://oauth2.googleapis.com/token".to_string())
                    .map_err(|e| Error::Internal(format!("invalid Google token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_uri.clone())
                    .map_err(|e| Error::Internal(format!("invalid redirect URI: {}", e)))?,
            );

        let http_client = HttpClient::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {}", e)))?;

        let scopes = if config.scopes.is_empty() {
            vec!["openid".into(), "email".into(), "profile".into()]
        } else {
            config.scopes.clone()
        };

        Ok(Self {
            client,
            http_client,
            scopes,
            auto_create: config.auto_create_users,
        })
    }
}

#[async_trait]
impl OAuthProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
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
            .map_err(|e| Error::External(format!("Google token exchange failed: {}", e)))?;

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
            .get("https://www.googleapis.com/oauth2/v3/userinfo")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::External(format!("failed to fetch Google user info: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::External(format!(
                "Google user info request failed: {}",
                response.status()
            )));
        }

        let info: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::External(format!("failed to parse Google user info: {}", e)))?;

        Ok(OAuthUserInfo {
            provider: "google".to_string(),
            provider_user_id: info["sub"]
                .as_str()
                .ok_or_else(|| Error::External("missing sub in Google response".into()))?
                .to_string(),
            email: info["email"].as_str().map(|s| s.to_string()),
            email_verified: info["email_verified"].as_bool().unwrap_or(false),
            name: info["name"].as_str().map(|s| s.to_string()),
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

    fn config() -> OAuthProviderConfig {
        OAuthProviderConfig {
            client_id: "test-client-id".into(),
            client_secret: "test-secret".into(),
            redirect_uri: "https://example.com/callback".into(),
            scopes: vec![],
            authorization_endpoint: None,
            token_endpoint: None,
            userinfo_endpoint: None,
            auto_create_users: true,
        }
    }

    #[test]
    fn test_authorization_url() {
        let provider = GoogleProvider::new(&config()).unwrap();
        let url = provider.authorization_url("test-state", None);

        assert!(url.contains("accounts.google.com"));
        assert!(url.contains("client_id=test-client-id"));
        assert!(url.contains("state=test-state"));
        assert!(!url.contains("code_challenge"));
    }

    #[test]
    fn test_authorization_url_with_pkce() {
        let provider = GoogleProvider::new(&config()).unwrap();
        let url = provider.authorization_url(
            "test-state",
            Some("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
        );
        assert!(url.contains("code_challenge="));
        assert!(url.contains("code_challenge_method=S256"));
    }
}
