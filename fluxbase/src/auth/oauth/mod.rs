//! OAuth bridging
//!
//! `StartAuthorization` mints a single-use state (with a PKCE verifier
//! where the provider supports it) and returns the IdP URL;
//! `HandleCallback` consumes the state, exchanges the code, extracts the
//! normalized identity, links or creates the local account and starts a
//! session.

pub mod provider;
pub mod providers;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;

use crate::audit::{ActorType, AuditEntry, AuditLogger};
use crate::config::{AuthConfig, OAuthProviderConfig};
use crate::error::{Error, Result};
use crate::store::oauth_state::OAuthState;
use crate::store::{IdentityStore, NewUser, OAuthStateStore, User, UserStore};
use crate::token::{TokenPair, TokenService};

pub use provider::{OAuthProvider, OAuthTokens, OAuthUserInfo};
pub use providers::{CustomProvider, GitHubProvider, GoogleProvider};

/// Construct configured providers by name
pub fn build_providers(
    configs: &HashMap<String, OAuthProviderConfig>,
) -> Result<HashMap<String, Arc<dyn OAuthProvider>>> {
    let mut providers: HashMap<String, Arc<dyn OAuthProvider>> = HashMap::new();

    for (name, config) in configs {
        let provider: Arc<dyn OAuthProvider> = match name.as_str() {
            "google" => Arc::new(GoogleProvider::new(config)?),
            "github" => Arc::new(GitHubProvider::new(config)?),
            other => Arc::new(CustomProvider::new(other, config)?),
        };
        providers.insert(name.clone(), provider);
    }

    Ok(providers)
}

/// Completed callback: the local session plus the post-auth redirect
#[derive(Debug, Clone)]
pub struct CallbackResult {
    pub user: User,
    pub session: TokenPair,
    pub redirect_url: Option<String>,
}

/// OAuth flow service
#[derive(Clone)]
pub struct OAuthService {
    providers: Arc<HashMap<String, Arc<dyn OAuthProvider>>>,
    state_store: Arc<dyn OAuthStateStore>,
    users: Arc<dyn UserStore>,
    identities: Arc<dyn IdentityStore>,
    tokens: TokenService,
    audit: AuditLogger,
    state_ttl: Duration,
}

impl OAuthService {
    pub fn new(
        auth_config: &AuthConfig,
        state_store: Arc<dyn OAuthStateStore>,
        users: Arc<dyn UserStore>,
        identities: Arc<dyn IdentityStore>,
        tokens: TokenService,
        audit: AuditLogger,
    ) -> Result<Self> {
        Ok(Self {
            providers: Arc::new(build_providers(&auth_config.oauth_providers)?),
            state_store,
            users,
            identities,
            tokens,
            audit,
            state_ttl: Duration::seconds(auth_config.oauth_state_ttl_secs as i64),
        })
    }

    fn provider(&self, name: &str) -> Result<&Arc<dyn OAuthProvider>> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("unknown OAuth provider '{}'", name)))
    }

    /// Enabled provider names, for the public configuration endpoint
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start the authorization flow; returns the IdP URL to redirect to
    pub async fn start_authorization(
        &self,
        provider_name: &str,
        redirect_url: Option<String>,
    ) -> Result<String> {
        let provider = self.provider(provider_name)?;

        let pkce_verifier = generate_pkce_verifier();
        let state = self
            .state_store
            .put(
                OAuthState {
                    provider: provider_name.to_string(),
                    redirect_url,
                    pkce_verifier: Some(pkce_verifier.clone()),
                    created_at: chrono::Utc::now(),
                },
                self.state_ttl,
            )
            .await?;

        Ok(provider.authorization_url(&state, Some(&pkce_verifier)))
    }

    /// Handle the provider callback: consume state, exchange the code,
    /// resolve the local account and start a session.
    pub async fn handle_callback(
        &self,
        provider_name: &str,
        code: &str,
        state: &str,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<CallbackResult> {
        let stored = self.state_store.take(state).await?;
        if stored.provider != provider_name {
            return Err(Error::BadRequest("OAuth state/provider mismatch".into()));
        }

        let provider = self.provider(provider_name)?;
        let tokens = provider
            .exchange_code(code, stored.pkce_verifier.as_deref())
            .await?;
        let info = provider.get_user_info(&tokens.access_token).await?;

        let user = self.resolve_user(provider.as_ref(), &info).await?;

        self.identities
            .link(
                user.id,
                &info.provider,
                &info.provider_user_id,
                info.raw.clone(),
            )
            .await?;

        self.users.record_successful_login(user.id).await?;
        let session = self
            .tokens
            .start_session(&user, user_agent, ip.clone())
            .await?;

        self.audit.record(
            AuditEntry::new("auth.oauth.callback")
                .actor(ActorType::User, Some(user.id))
                .ip(ip.unwrap_or_default())
                .target(format!("{}:{}", info.provider, info.provider_user_id)),
        );

        Ok(CallbackResult {
            user,
            session,
            redirect_url: stored.redirect_url,
        })
    }

    /// Existing identity → its user; else link by email; else auto-create
    async fn resolve_user(
        &self,
        provider: &dyn OAuthProvider,
        info: &OAuthUserInfo,
    ) -> Result<User> {
        if let Some(identity) = self
            .identities
            .find(&info.provider, &info.provider_user_id)
            .await?
        {
            return self
                .users
                .find_by_id(identity.user_id)
                .await?
                .ok_or_else(|| Error::Internal("identity points at a missing user".into()));
        }

        let email = info
            .email
            .as_deref()
            .ok_or_else(|| Error::BadRequest("provider returned no email address".into()))?;

        if let Some(user) = self.users.find_by_email(email).await? {
            return Ok(user);
        }

        if !provider.auto_create_users() {
            return Err(Error::Forbidden(
                "no account matches this identity".into(),
            ));
        }

        self.users
            .create(NewUser {
                email: email.to_string(),
                encrypted_password: None,
                email_verified: info.email_verified,
                role: "authenticated".to_string(),
                user_metadata: serde_json::json!({ "name": info.name }),
                app_metadata: serde_json::json!({ "provider": info.provider }),
            })
            .await
    }
}

/// RFC 7636 verifier: 43..128 chars from the unreserved set
fn generate_pkce_verifier() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;
    let bytes: [u8; 48] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkce_verifier_length() {
        let verifier = generate_pkce_verifier();
        assert!(verifier.len() >= 43 && verifier.len() <= 128);
    }

    #[test]
    fn test_build_providers_unknown_name_uses_custom() {
        let mut configs = HashMap::new();
        configs.insert(
            "acme".to_string(),
            OAuthProviderConfig {
                client_id: "c".into(),
                client_secret: "s".into(),
                redirect_uri: "https://example.com/cb".into(),
                scopes: vec![],
                authorization_endpoint: Some("https://idp.acme.io/auth".into()),
                token_endpoint: Some("https://idp.acme.io/token".into()),
                userinfo_endpoint: Some("https://idp.acme.io/userinfo".into()),
                auto_create_users: true,
            },
        );

        let providers = build_providers(&configs).unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers["acme"].name(), "acme");
    }

    #[test]
    fn test_build_providers_requires_custom_endpoints() {
        let mut configs = HashMap::new();
        configs.insert(
            "acme".to_string(),
            OAuthProviderConfig {
                client_id: "c".into(),
                client_secret: "s".into(),
                redirect_uri: "https://example.com/cb".into(),
                scopes: vec![],
                authorization_endpoint: None,
                token_endpoint: None,
                userinfo_endpoint: None,
                auto_create_users: true,
            },
        );
        assert!(build_providers(&configs).is_err());
    }
}
