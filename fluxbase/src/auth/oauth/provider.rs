//! OAuth provider trait and types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tokens received from a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub token_type: String,
}

/// Normalized user info, produced by each provider's extractor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthUserInfo {
    /// Provider name (e.g. "google", "github")
    pub provider: String,

    /// Stable user id at the provider
    pub provider_user_id: String,

    pub email: Option<String>,

    /// Whether the provider vouches for the email
    pub email_verified: bool,

    pub name: Option<String>,

    /// Raw provider payload, stored as `identity_data`
    pub raw: serde_json::Value,
}

/// OAuth provider capability
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Provider name as used in routes and identity rows
    fn name(&self) -> &str;

    /// Build the IdP authorization URL.
    ///
    /// When a PKCE verifier is supplied the S256 challenge derived from it
    /// is included in the request.
    fn authorization_url(&self, state: &str, pkce_verifier: Option<&str>) -> String;

    /// Exchange an authorization code for tokens
    async fn exchange_code(&self, code: &str, pkce_verifier: Option<&str>)
        -> Result<OAuthTokens>;

    /// Fetch and normalize user info with the provider access token
    async fn get_user_info(&self, access_token: &str) -> Result<OAuthUserInfo>;

    /// Whether accounts may be created on first sign-in
    fn auto_create_users(&self) -> bool;
}
