//! GitHub OAuth provider

use async_trait::async_trait;
use oauth2::{
    AuthUrl, AuthorizationCode, Client, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope,
    TokenResponse, TokenUrl,
};
use reqwest::Client as HttpClient;

use super::google::ConfiguredClient;
use crate::auth::oauth::provider::{OAuthProvider, OAuthTokens, OAuthUserInfo};
use crate::config::OAuthProviderConfig;
use crate::error::{Error, Result};

/// GitHub OAuth provider
///
/// GitHub hides primary emails behind a second endpoint, so the extractor
/// falls back to `/user/emails` when the profile carries none.
#[derive(Clone)]
pub struct GitHubProvider {
    client: ConfiguredClient,
    http_client: HttpClient,
    scopes: Vec<String>,
    auto_create: bool,
}

impl GitHubProvider {
    pub fn new(config: &OAuthProviderConfig) -> Result<Self> {
        let client = Client::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new("https://github.com/login/oauth/authorize".to_string())
                    .map_err(|e| Error::Internal(format!("invalid GitHub auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new("https://github.com/login/oauth/access_token".to_string())
                    .map_err(|e| Error::Internal(format!("invalid GitHub token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_uri.clone())
                    .map_err(|e| Error::Internal(format!("invalid redirect URI: {}", e)))?,
            );

        let http_client = HttpClient::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent("fluxbase")
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {}", e)))?;

        let scopes = if config.scopes.is_empty() {
            vec!["read:user".into(), "user:email".into()]
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

    async fn primary_email(&self, access_token: &str) -> Result<Option<(String, bool)>> {
        let response = self
            .http_client
            .get("https://api.github.com/user/emails")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::External(format!("failed to fetch GitHub emails: {}", e)))?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let emails: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| Error::External(format!("failed to parse GitHub emails: {}", e)))?;

        Ok(emails
            .iter()
            .find(|e| e["primary"].as_bool().unwrap_or(false))
            .or_else(|| emails.first())
            .and_then(|e| {
                e["email"].as_str().map(|addr| {
                    (
                        addr.to_string(),
                        e["verified"].as_bool().unwrap_or(false),
                    )
                })
            }))
    }
}

#[async_trait]
impl OAuthProvider for GitHubProvider {
    fn name(&self) -> &str {
        "github"
    }

    fn authorization_url(&self, state: &str, _pkce_verifier: Option<&str>) -> String {
        let mut request = self
            .client
            .authorize_url(|| CsrfToken::new(state.to_string()));

        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }

        let (url, _) = request.url();
        url.to_string()
    }

    async fn exchange_code(
        &self,
        code: &str,
        _pkce_verifier: Option<&str>,
    ) -> Result<OAuthTokens> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http_client)
            .await
            .map_err(|e| Error::External(format!("GitHub token exchange failed: {}", e)))?;

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
            .get("https://api.github.com/user")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::External(format!("failed to fetch GitHub user: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::External(format!(
                "GitHub user request failed: {}",
                response.status()
            )));
        }

        let info: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::External(format!("failed to parse GitHub user: {}", e)))?;

        let provider_user_id = info["id"]
            .as_i64()
            .map(|id| id.to_string())
            .ok_or_else(|| Error::External("missing id in GitHub response".into()))?;

        let (email, email_verified) = match info["email"].as_str() {
            Some(email) => (Some(email.to_string()), true),
            None => match self.primary_email(access_token).await? {
                Some((email, verified)) => (Some(email), verified),
                None => (None, false),
            },
        };

        Ok(OAuthUserInfo {
            provider: "github".to_string(),
            provider_user_id,
            email,
            email_verified,
            name: info["name"]
                .as_str()
                .or_else(|| info["login"].as_str())
                .map(|s| s.to_string()),
            raw: info,
        })
    }

    fn auto_create_users(&self) -> bool {
        self.auto_create
    }
}
