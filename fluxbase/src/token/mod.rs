//! Token service
//!
//! Signs and verifies HS256 bearer tokens and owns the refresh-rotation
//! protocol. Sessions store only SHA-256 hashes of the tokens they issued;
//! a token whose hash no longer matches its session's current hash is
//! rejected, which keeps exactly one access token valid per session.

pub mod blacklist;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{ActorType, AuditEntry, AuditLogger, AuditOutcome};
use crate::crypto::token_hash;
use crate::error::{Error, Result};
use crate::store::sessions::{NewSession, RotateOutcome};
use crate::store::{SessionStore, User};

pub use blacklist::{MemoryBlacklist, PgBlacklist, TokenBlacklist};

/// Reuse of a superseded refresh token inside this window is treated as a
/// concurrent-refresh loser; past it, as compromise.
const REFRESH_REUSE_GRACE_SECS: i64 = 10;

/// Token kind, carried in the `typ` claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Bearer token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id or service-key id
    pub sub: String,

    /// Application role string (kept out of the DB role mapping)
    pub role: String,

    /// Token kind
    pub typ: TokenType,

    /// Issued at (unix seconds)
    pub iat: i64,

    /// Expiry (unix seconds)
    pub exp: i64,

    /// Issuer
    pub iss: String,

    /// Owning session; absent for static api-key tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_metadata: Option<serde_json::Value>,
}

impl Claims {
    /// Parse the subject as a user id
    pub fn user_id(&self) -> Option<Uuid> {
        self.sub.parse().ok()
    }
}

/// Access + refresh pair returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

/// Token issue/verify service
#[derive(Clone)]
pub struct TokenService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    blacklist: Arc<dyn TokenBlacklist>,
    sessions: Arc<dyn SessionStore>,
    audit: AuditLogger,
}

impl TokenService {
    pub fn new(
        secret: &[u8],
        issuer: String,
        accepted_issuers: Vec<String>,
        access_ttl: Duration,
        refresh_ttl: Duration,
        blacklist: Arc<dyn TokenBlacklist>,
        sessions: Arc<dyn SessionStore>,
        audit: AuditLogger,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&accepted_issuers);
        validation.leeway = 0;

        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            validation,
            issuer,
            access_ttl,
            refresh_ttl,
            blacklist,
            sessions,
            audit,
        }
    }

    /// Sign a token; returns the string and its SHA-256 hash
    pub fn issue(
        &self,
        sub: &str,
        role: &str,
        typ: TokenType,
        session_id: Option<Uuid>,
        ttl: Duration,
        user_metadata: Option<serde_json::Value>,
        app_metadata: Option<serde_json::Value>,
    ) -> Result<(String, String)> {
        let now = Utc::now();
        let claims = Claims {
            sub: sub.to_string(),
            role: role.to_string(),
            typ,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            iss: self.issuer.clone(),
            session_id,
            user_metadata,
            app_metadata,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        let hash = token_hash(&token);
        Ok((token, hash))
    }

    /// Sign a long-lived sessionless token (anon / service-role api keys)
    pub fn issue_static(&self, sub: &str, role: &str, ttl: Duration) -> Result<String> {
        let (token, _) = self.issue(sub, role, TokenType::Access, None, ttl, None, None)?;
        Ok(token)
    }

    /// Create a session for a user and issue its first token pair
    pub async fn start_session(
        &self,
        user: &User,
        user_agent: Option<String>,
        ip: Option<String>,
    ) -> Result<TokenPair> {
        let session_id = Uuid::new_v4();
        let now = Utc::now();
        let expires_at = now + self.access_ttl;
        let refresh_expires_at = now + self.refresh_ttl;

        let (access, access_hash) = self.issue(
            &user.id.to_string(),
            &user.role,
            TokenType::Access,
            Some(session_id),
            self.access_ttl,
            Some(user.user_metadata.clone()),
            Some(user.app_metadata.clone()),
        )?;
        let (refresh, refresh_hash) = self.issue(
            &user.id.to_string(),
            &user.role,
            TokenType::Refresh,
            Some(session_id),
            self.refresh_ttl,
            None,
            None,
        )?;

        self.sessions
            .create(NewSession {
                id: session_id,
                user_id: user.id,
                refresh_token_hash: refresh_hash,
                access_token_hash: access_hash,
                expires_at,
                refresh_expires_at,
                user_agent,
                ip,
            })
            .await?;

        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
            token_type: "bearer".to_string(),
            expires_at,
        })
    }

    /// Verify a bearer token.
    ///
    /// Signature, expiry and issuer come from the JWT layer; revocation is
    /// the hash comparison against the blacklist and, for session-bound
    /// access tokens, against the session's current `access_token_hash`.
    pub async fn verify(&self, token: &str) -> Result<Claims> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)?.claims;
        let hash = token_hash(token);

        if self.blacklist.contains(&hash).await? {
            return Err(Error::TokenRevoked);
        }

        if claims.typ == TokenType::Access {
            if let Some(session_id) = claims.session_id {
                let session = self
                    .sessions
                    .find_by_id(session_id)
                    .await?
                    .ok_or(Error::TokenRevoked)?;

                if session.access_token_hash != hash {
                    return Err(Error::TokenRevoked);
                }
            }
        }

        Ok(claims)
    }

    /// Rotate a refresh token.
    ///
    /// Exactly one of any set of concurrent callers wins; the rest see
    /// `token_invalid`. Replay of a superseded token past the grace window
    /// is compromise: the session is revoked entirely and audited.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = decode::<Claims>(refresh_token, &self.decoding_key, &self.validation)?.claims;
        if claims.typ != TokenType::Refresh {
            return Err(Error::TokenInvalid);
        }

        let presented_hash = token_hash(refresh_token);

        // Captured before the swap so the superseded access token can be
        // blacklisted after we win.
        let prior = self.sessions.find_by_refresh_hash(&presented_hash).await?;

        let now = Utc::now();
        let expires_at = now + self.access_ttl;
        let refresh_expires_at = now + self.refresh_ttl;

        let (access, access_hash) = self.issue(
            &claims.sub,
            &claims.role,
            TokenType::Access,
            claims.session_id,
            self.access_ttl,
            claims.user_metadata.clone(),
            claims.app_metadata.clone(),
        )?;
        let (refresh, refresh_hash) = self.issue(
            &claims.sub,
            &claims.role,
            TokenType::Refresh,
            claims.session_id,
            self.refresh_ttl,
            None,
            None,
        )?;

        let outcome = self
            .sessions
            .rotate(
                &presented_hash,
                &refresh_hash,
                &access_hash,
                expires_at,
                refresh_expires_at,
            )
            .await?;

        match outcome {
            RotateOutcome::Rotated { session } => {
                if let Some(prior) = prior {
                    // Retention outlives the dead token by one access TTL
                    self.blacklist
                        .insert(&prior.access_token_hash, prior.expires_at + self.access_ttl)
                        .await?;
                }

                self.audit.record(
                    AuditEntry::new("auth.token.refresh")
                        .actor(ActorType::User, Some(session.user_id))
                        .target(session.id.to_string()),
                );

                Ok(TokenPair {
                    access_token: access,
                    refresh_token: refresh,
                    token_type: "bearer".to_string(),
                    expires_at,
                })
            }
            RotateOutcome::ReuseDetected {
                session_id,
                user_id,
                superseded_at,
            } => {
                let grace = Duration::seconds(REFRESH_REUSE_GRACE_SECS);
                if now - superseded_at <= grace {
                    // Concurrent-refresh loser; the winner's pair stays valid
                    return Err(Error::TokenInvalid);
                }

                if let Some(session) = self.sessions.find_by_id(session_id).await? {
                    self.blacklist
                        .insert(&session.access_token_hash, session.expires_at + self.access_ttl)
                        .await?;
                }
                self.sessions.delete(session_id).await?;

                self.audit.record(
                    AuditEntry::new("auth.token.reuse_detected")
                        .actor(ActorType::User, Some(user_id))
                        .target(session_id.to_string())
                        .outcome(AuditOutcome::Denied)
                        .detail(serde_json::json!({"revoked_session": session_id})),
                );
                tracing::warn!(%session_id, "refresh token reuse detected, session revoked");

                Err(Error::TokenRevoked)
            }
            RotateOutcome::Unknown => Err(Error::TokenInvalid),
        }
    }

    /// Read the subject out of a token without verifying it.
    ///
    /// Only for enriching responses with data derived from a token this
    /// service itself just issued; never an authentication path.
    pub fn peek_sub(token: &str) -> Option<String> {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

        let payload = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        value["sub"].as_str().map(String::from)
    }

    /// Revoke every session a user holds (password reset, full logout)
    pub async fn revoke_all_sessions(&self, user_id: Uuid) -> Result<u64> {
        let sessions = self.sessions.list_for_user(user_id).await?;
        for session in &sessions {
            self.blacklist
                .insert(&session.access_token_hash, session.expires_at + self.access_ttl)
                .await?;
        }
        self.sessions.delete_all_for_user(user_id).await
    }

    /// Blacklist the session's current access token and delete the session
    pub async fn revoke_session(&self, session_id: Uuid) -> Result<()> {
        if let Some(session) = self.sessions.find_by_id(session_id).await? {
            self.blacklist
                .insert(&session.access_token_hash, session.expires_at + self.access_ttl)
                .await?;
            self.sessions.delete(session_id).await?;
        }
        Ok(())
    }

    /// Access token lifetime
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::MemorySessionStore;

    fn sample_user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "a@b.co".into(),
            encrypted_password: None,
            email_verified_at: Some(Utc::now()),
            last_sign_in_at: None,
            failed_login_count: 0,
            locked_until: None,
            role: "authenticated".into(),
            user_metadata: serde_json::json!({}),
            app_metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    fn service() -> TokenService {
        TokenService::new(
            b"0123456789abcdef0123456789abcdef",
            "fluxbase".into(),
            vec!["fluxbase".into()],
            Duration::hours(1),
            Duration::days(30),
            Arc::new(MemoryBlacklist::new()),
            Arc::new(MemorySessionStore::new()),
            AuditLogger::disabled(),
        )
    }

    #[tokio::test]
    async fn test_issue_and_verify_access_token() {
        let svc = service();
        let user = sample_user();
        let pair = svc.start_session(&user, None, None).await.unwrap();

        let claims = svc.verify(&pair.access_token).await.unwrap();
        assert_eq!(claims.sub, user.id.to_string());
        assert_eq!(claims.role, "authenticated");
        assert_eq!(claims.typ, TokenType::Access);
        assert!(claims.session_id.is_some());
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_secret() {
        let svc = service();
        let other = TokenService::new(
            b"ffffffffffffffffffffffffffffffff",
            "fluxbase".into(),
            vec!["fluxbase".into()],
            Duration::hours(1),
            Duration::days(30),
            Arc::new(MemoryBlacklist::new()),
            Arc::new(MemorySessionStore::new()),
            AuditLogger::disabled(),
        );
        let user = sample_user();
        let pair = other.start_session(&user, None, None).await.unwrap();

        assert!(matches!(
            svc.verify(&pair.access_token).await,
            Err(Error::TokenInvalid)
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_revokes_old_access() {
        let svc = service();
        let user = sample_user();
        let pair0 = svc.start_session(&user, None, None).await.unwrap();

        let pair1 = svc.refresh(&pair0.refresh_token).await.unwrap();
        assert_ne!(pair0.access_token, pair1.access_token);
        assert_ne!(pair0.refresh_token, pair1.refresh_token);

        // The new access token verifies; the superseded one is revoked
        assert!(svc.verify(&pair1.access_token).await.is_ok());
        assert!(matches!(
            svc.verify(&pair0.access_token).await,
            Err(Error::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn test_refresh_replay_inside_grace_is_invalid_not_revoking() {
        let svc = service();
        let user = sample_user();
        let pair0 = svc.start_session(&user, None, None).await.unwrap();

        let pair1 = svc.refresh(&pair0.refresh_token).await.unwrap();

        // Immediate replay of the old refresh token: concurrent loser
        assert!(matches!(
            svc.refresh(&pair0.refresh_token).await,
            Err(Error::TokenInvalid)
        ));

        // The winner's pair survives the race
        assert!(svc.verify(&pair1.access_token).await.is_ok());
        let pair2 = svc.refresh(&pair1.refresh_token).await.unwrap();
        assert!(svc.verify(&pair2.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_replay_past_grace_revokes_whole_session() {
        let sessions = Arc::new(MemorySessionStore::new());
        let svc = TokenService::new(
            b"0123456789abcdef0123456789abcdef",
            "fluxbase".into(),
            vec!["fluxbase".into()],
            Duration::hours(1),
            Duration::days(30),
            Arc::new(MemoryBlacklist::new()),
            sessions.clone(),
            AuditLogger::disabled(),
        );
        let user = sample_user();
        let pair0 = svc.start_session(&user, None, None).await.unwrap();
        let pair1 = svc.refresh(&pair0.refresh_token).await.unwrap();

        // Make the rotation look older than the reuse grace window
        sessions.age_history(Duration::seconds(REFRESH_REUSE_GRACE_SECS + 20));

        // Replay is treated as compromise: the session is revoked entirely
        assert!(matches!(
            svc.refresh(&pair0.refresh_token).await,
            Err(Error::TokenRevoked)
        ));
        assert!(svc.verify(&pair1.access_token).await.is_err());
        assert!(svc.refresh(&pair1.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_signout_revokes_current_access_token() {
        let svc = service();
        let user = sample_user();
        let pair = svc.start_session(&user, None, None).await.unwrap();
        let claims = svc.verify(&pair.access_token).await.unwrap();

        svc.revoke_session(claims.session_id.unwrap()).await.unwrap();

        assert!(matches!(
            svc.verify(&pair.access_token).await,
            Err(Error::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn test_access_token_rejected_for_refresh() {
        let svc = service();
        let user = sample_user();
        let pair = svc.start_session(&user, None, None).await.unwrap();

        assert!(matches!(
            svc.refresh(&pair.access_token).await,
            Err(Error::TokenInvalid)
        ));
    }

    #[tokio::test]
    async fn test_static_token_skips_session_binding() {
        let svc = service();
        let token = svc.issue_static("anon", "anon", Duration::days(365)).unwrap();
        let claims = svc.verify(&token).await.unwrap();
        assert_eq!(claims.role, "anon");
        assert!(claims.session_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_refresh_token_invalid() {
        let svc = service();
        let user = sample_user();
        // A refresh-shaped token that no session row knows about
        let (token, _) = svc
            .issue(
                &user.id.to_string(),
                "authenticated",
                TokenType::Refresh,
                Some(Uuid::new_v4()),
                Duration::days(30),
                None,
                None,
            )
            .unwrap();

        assert!(matches!(svc.refresh(&token).await, Err(Error::TokenInvalid)));
    }
}
