//! Password, OTP and magic-link flows
//!
//! The handler layer owns response wording; this service owns the rules.
//! Credential failures are uniform (`invalid_credentials`) whether the
//! account exists or not, and lockout state is tracked on the user row.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLogger, AuditOutcome};
use crate::config::AuthConfig;
use crate::crypto::PasswordHasher;
use crate::error::{Error, Result};
use crate::mailer::Mailer;
use crate::middleware::rate_limit::RateLimiter;
use crate::principal::Principal;
use crate::store::{NewUser, OtpPurpose, OtpStore, User, UserStore};
use crate::token::{TokenPair, TokenService};

/// Flow-level configuration distilled from [`AuthConfig`]
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub signup_enabled: bool,
    pub require_email_verification: bool,
    pub lockout_threshold: i32,
    pub lockout_secs: u64,
    pub otp_ttl_secs: u64,
    pub otp_max_attempts: i32,
    /// Email-keyed limits enforced inside the flows
    pub reset_per_hour: u32,
    pub magic_link_per_hour: u32,
}

impl FlowConfig {
    pub fn from_auth(auth: &AuthConfig, reset_per_hour: u32, magic_link_per_hour: u32) -> Self {
        Self {
            signup_enabled: auth.signup_enabled,
            require_email_verification: auth.require_email_verification,
            lockout_threshold: auth.lockout_threshold,
            lockout_secs: auth.lockout_secs,
            otp_ttl_secs: auth.otp_ttl_secs,
            otp_max_attempts: auth.otp_max_attempts,
            reset_per_hour,
            magic_link_per_hour,
        }
    }
}

/// Result of a sign-up: a session only when verification is not required
#[derive(Debug, Clone)]
pub struct SignupResult {
    pub user: User,
    pub session: Option<TokenPair>,
}

/// Credential flow service
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    otp: Arc<dyn OtpStore>,
    tokens: TokenService,
    hasher: PasswordHasher,
    mailer: Arc<dyn Mailer>,
    limiter: RateLimiter,
    audit: AuditLogger,
    config: FlowConfig,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: Arc<dyn UserStore>,
        otp: Arc<dyn OtpStore>,
        tokens: TokenService,
        hasher: PasswordHasher,
        mailer: Arc<dyn Mailer>,
        limiter: RateLimiter,
        audit: AuditLogger,
        config: FlowConfig,
    ) -> Self {
        Self {
            users,
            otp,
            tokens,
            hasher,
            mailer,
            limiter,
            audit,
            config,
        }
    }

    /// Sign up with email and password.
    ///
    /// When verification is required the account starts unverified and a
    /// signup code goes out by email; no session is issued yet.
    pub async fn signup(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<SignupResult> {
        if !self.config.signup_enabled {
            return Err(Error::Forbidden("sign-up is disabled".into()));
        }
        validate_email(email)?;

        let encrypted = self.hasher.hash(password)?;

        if self.users.find_by_email(email).await?.is_some() {
            // Wording that avoids disclosing existence is the handler's
            // concern; the kind is precise here.
            return Err(Error::EmailTaken);
        }

        let user = self
            .users
            .create(NewUser {
                email: email.to_string(),
                encrypted_password: Some(encrypted),
                email_verified: !self.config.require_email_verification,
                role: "authenticated".to_string(),
                user_metadata: metadata,
                app_metadata: serde_json::json!({}),
            })
            .await
            .map_err(|err| match err {
                // Lost a race against a concurrent signup for the same email
                Error::Conflict(_) => Error::EmailTaken,
                other => other,
            })?;

        self.audit.record(
            AuditEntry::new("auth.signup")
                .actor(crate::audit::ActorType::User, Some(user.id))
                .ip(ip.clone().unwrap_or_default())
                .target(user.email.clone()),
        );

        if self.config.require_email_verification {
            self.send_code(Some(user.id), email, OtpPurpose::Signup, "Confirm your email")
                .await?;
            return Ok(SignupResult {
                user,
                session: None,
            });
        }

        let session = self.tokens.start_session(&user, user_agent, ip).await?;
        Ok(SignupResult {
            user,
            session: Some(session),
        })
    }

    /// Confirm a signup verification code
    pub async fn verify_email(&self, email: &str, code: &str) -> Result<()> {
        let otp = self
            .otp
            .consume(email, OtpPurpose::Signup, code, self.config.otp_max_attempts)
            .await?;

        let user = match otp.user_id {
            Some(id) => self.users.find_by_id(id).await?,
            None => self.users.find_by_email(email).await?,
        }
        .ok_or(Error::InvalidCredentials)?;

        self.users.mark_email_verified(user.id).await?;

        self.audit.record(
            AuditEntry::new("auth.email.verified")
                .actor(crate::audit::ActorType::User, Some(user.id))
                .target(user.email),
        );
        Ok(())
    }

    /// Sign in with email and password
    pub async fn signin(
        &self,
        email: &str,
        password: &str,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<(User, TokenPair)> {
        let now = Utc::now();
        let user = self.users.find_by_email(email).await?;

        let Some(user) = user else {
            // Burn a verification anyway so absent and present accounts
            // cost the same wall time.
            let _ = self.hasher.verify(password, DUMMY_HASH);
            self.audit_denied(None, email, &ip, "unknown_account");
            return Err(Error::InvalidCredentials);
        };

        if user.is_locked(now) {
            self.audit_denied(Some(user.id), email, &ip, "locked");
            return Err(Error::AccountLocked);
        }

        let stored = user.encrypted_password.as_deref().unwrap_or(DUMMY_HASH);
        let password_ok = self.hasher.verify(password, stored).unwrap_or(false);

        if !password_ok || user.encrypted_password.is_none() {
            let locked_until = now + Duration::seconds(self.config.lockout_secs as i64);
            self.users
                .record_failed_login(user.id, self.config.lockout_threshold, locked_until)
                .await?;
            self.audit_denied(Some(user.id), email, &ip, "bad_password");
            return Err(Error::InvalidCredentials);
        }

        if self.config.require_email_verification && user.email_verified_at.is_none() {
            self.audit_denied(Some(user.id), email, &ip, "unverified");
            return Err(Error::EmailNotVerified);
        }

        self.users.record_successful_login(user.id).await?;
        let session = self.tokens.start_session(&user, user_agent, ip.clone()).await?;

        self.audit.record(
            AuditEntry::new("auth.signin")
                .actor(crate::audit::ActorType::User, Some(user.id))
                .ip(ip.unwrap_or_default())
                .target(user.email.clone()),
        );

        Ok((user, session))
    }

    /// Sign out: blacklist the current access token, delete the session
    pub async fn signout(&self, principal: &Principal) -> Result<()> {
        if let Principal::User {
            session_id: Some(session_id),
            user_id,
            ..
        } = principal
        {
            self.tokens.revoke_session(*session_id).await?;
            self.audit.record(
                AuditEntry::new("auth.signout")
                    .actor(crate::audit::ActorType::User, Some(*user_id))
                    .target(session_id.to_string()),
            );
        }
        Ok(())
    }

    /// Request a password reset code
    pub async fn request_password_reset(&self, email: &str) -> Result<()> {
        self.check_email_rate("password_reset_email", email, self.config.reset_per_hour)
            .await?;

        // Whether the account exists is not disclosed; the request
        // succeeds either way and mail goes out only when it does.
        if let Some(user) = self.users.find_by_email(email).await? {
            self.send_code(
                Some(user.id),
                email,
                OtpPurpose::Recovery,
                "Reset your password",
            )
            .await?;
        }
        Ok(())
    }

    /// Confirm a password reset: consume the code, set the new password,
    /// delete every session for the user.
    pub async fn confirm_password_reset(
        &self,
        email: &str,
        code: &str,
        new_password: &str,
    ) -> Result<()> {
        let encrypted = self.hasher.hash(new_password)?;

        let otp = self
            .otp
            .consume(email, OtpPurpose::Recovery, code, self.config.otp_max_attempts)
            .await?;

        let user = match otp.user_id {
            Some(id) => self.users.find_by_id(id).await?,
            None => self.users.find_by_email(email).await?,
        }
        .ok_or(Error::InvalidCredentials)?;

        self.users.set_password(user.id, &encrypted).await?;
        self.tokens.revoke_all_sessions(user.id).await?;

        self.audit.record(
            AuditEntry::new("auth.password.reset")
                .actor(crate::audit::ActorType::User, Some(user.id))
                .target(user.email),
        );
        Ok(())
    }

    /// Request a magic-link / OTP sign-in code
    pub async fn request_magic_link(&self, email: &str) -> Result<()> {
        self.check_email_rate("magic_link_email", email, self.config.magic_link_per_hour)
            .await?;
        validate_email(email)?;

        let user = match self.users.find_by_email(email).await? {
            Some(user) => Some(user),
            None if self.config.signup_enabled => Some(
                self.users
                    .create(NewUser::with_email(email))
                    .await?,
            ),
            None => None,
        };

        if let Some(user) = user {
            self.send_code(Some(user.id), email, OtpPurpose::Signin, "Your sign-in code")
                .await?;
        }
        Ok(())
    }

    /// Complete a magic-link / OTP sign-in.
    ///
    /// A correct code proves ownership of the mailbox, so it also verifies
    /// the email and promotes straight to a full session.
    pub async fn magic_link_signin(
        &self,
        email: &str,
        code: &str,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<(User, TokenPair)> {
        let otp = self
            .otp
            .consume(email, OtpPurpose::Signin, code, self.config.otp_max_attempts)
            .await?;

        let user = match otp.user_id {
            Some(id) => self.users.find_by_id(id).await?,
            None => self.users.find_by_email(email).await?,
        }
        .ok_or(Error::InvalidCredentials)?;

        if user.email_verified_at.is_none() {
            self.users.mark_email_verified(user.id).await?;
        }
        self.users.record_successful_login(user.id).await?;

        let session = self.tokens.start_session(&user, user_agent, ip).await?;
        self.audit.record(
            AuditEntry::new("auth.magiclink.signin")
                .actor(crate::audit::ActorType::User, Some(user.id))
                .target(user.email.clone()),
        );
        Ok((user, session))
    }

    /// Issue an invitation code (admin initiated)
    pub async fn invite(&self, email: &str, inviter: &Principal) -> Result<()> {
        validate_email(email)?;
        if self.users.find_by_email(email).await?.is_some() {
            return Err(Error::EmailTaken);
        }

        self.send_code(None, email, OtpPurpose::Invite, "You have been invited")
            .await?;

        self.audit.record(
            AuditEntry::new("auth.invite")
                .actor(inviter.actor_type(), inviter.actor_id())
                .target(email.to_string()),
        );
        Ok(())
    }

    /// Accept an invitation: consume the code, create a verified account
    pub async fn accept_invite(
        &self,
        email: &str,
        code: &str,
        password: &str,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<(User, TokenPair)> {
        let encrypted = self.hasher.hash(password)?;

        self.otp
            .consume(email, OtpPurpose::Invite, code, self.config.otp_max_attempts)
            .await?;

        let user = self
            .users
            .create(NewUser {
                email: email.to_string(),
                encrypted_password: Some(encrypted),
                email_verified: true,
                role: "authenticated".to_string(),
                user_metadata: serde_json::json!({}),
                app_metadata: serde_json::json!({}),
            })
            .await?;

        let session = self.tokens.start_session(&user, user_agent, ip).await?;
        Ok((user, session))
    }

    /// First-run bootstrap: create the dashboard admin account.
    ///
    /// Only works while no account exists at all; afterwards the endpoint
    /// is dead regardless of credentials.
    pub async fn bootstrap_admin(
        &self,
        email: &str,
        password: &str,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<(User, TokenPair)> {
        if !self.users.list(1, 0).await?.is_empty() {
            return Err(Error::Forbidden("setup has already been completed".into()));
        }
        validate_email(email)?;
        let encrypted = self.hasher.hash(password)?;

        let user = self
            .users
            .create(NewUser {
                email: email.to_string(),
                encrypted_password: Some(encrypted),
                email_verified: true,
                role: "authenticated".to_string(),
                user_metadata: serde_json::json!({}),
                app_metadata: serde_json::json!({ "dashboard_admin": true }),
            })
            .await?;

        self.audit.record(
            AuditEntry::new("admin.setup")
                .actor(crate::audit::ActorType::User, Some(user.id))
                .ip(ip.clone().unwrap_or_default())
                .target(user.email.clone()),
        );

        let session = self.tokens.start_session(&user, user_agent, ip).await?;
        Ok((user, session))
    }

    /// The underlying token service (refresh and verification live there)
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    async fn send_code(
        &self,
        user_id: Option<Uuid>,
        email: &str,
        purpose: OtpPurpose,
        subject: &str,
    ) -> Result<()> {
        let code = generate_code();
        self.otp
            .issue(
                user_id,
                email,
                purpose,
                &code,
                Duration::seconds(self.config.otp_ttl_secs as i64),
            )
            .await?;

        self.mailer
            .send(email, subject, &format!("Your code is: {}", code))
            .await?;
        Ok(())
    }

    async fn check_email_rate(&self, scope: &str, email: &str, per_hour: u32) -> Result<()> {
        let decision = self
            .limiter
            .check(scope, &crate::store::normalize_email(email), per_hour, 3600)
            .await?;
        if !decision.allowed {
            return Err(Error::RateLimited {
                retry_after: decision.retry_after(Utc::now()),
            });
        }
        Ok(())
    }

    fn audit_denied(&self, user_id: Option<Uuid>, email: &str, ip: &Option<String>, why: &str) {
        self.audit.record(
            AuditEntry::new("auth.signin")
                .actor(
                    user_id
                        .map(|_| crate::audit::ActorType::User)
                        .unwrap_or(crate::audit::ActorType::Anonymous),
                    user_id,
                )
                .ip(ip.clone().unwrap_or_default())
                .target(email.to_string())
                .outcome(AuditOutcome::Denied)
                .detail(serde_json::json!({ "reason": why })),
        );
    }
}

/// A real Argon2id hash of an unknowable value, verified against when no
/// account (or no password) exists so both paths cost the same.
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$obF5nB3SVdeH/4A6rtt8Sw$dyKbCVRb1I5yaIibrUCzNcNJ9rjprCl7qbJiUCfCg6c";

/// Six-digit numeric one-time code
fn generate_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000u32))
}

/// Minimal structural email validation; real verification is the OTP
fn validate_email(email: &str) -> Result<()> {
    let trimmed = email.trim();
    let Some((local, domain)) = trimmed.split_once('@') else {
        return Err(Error::BadRequest("invalid email address".into()));
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') || trimmed.contains(' ') {
        return Err(Error::BadRequest("invalid email address".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::rate_limit::MemoryCounter;
    use crate::store::testutil::{MemoryOtpStore, MemorySessionStore, MemoryUserStore};
    use crate::token::MemoryBlacklist;

    struct Harness {
        auth: AuthService,
        mailer: Arc<crate::mailer::CapturingMailer>,
        users: Arc<MemoryUserStore>,
    }

    fn harness(require_verification: bool) -> Harness {
        let users = Arc::new(MemoryUserStore::new());
        let otp = Arc::new(MemoryOtpStore::new());
        let sessions = Arc::new(MemorySessionStore::new());
        let mailer = Arc::new(crate::mailer::CapturingMailer::new());

        let tokens = TokenService::new(
            b"0123456789abcdef0123456789abcdef",
            "fluxbase".into(),
            vec!["fluxbase".into()],
            Duration::hours(1),
            Duration::days(30),
            Arc::new(MemoryBlacklist::new()),
            sessions,
            AuditLogger::disabled(),
        );

        let config = FlowConfig {
            signup_enabled: true,
            require_email_verification: require_verification,
            lockout_threshold: 3,
            lockout_secs: 900,
            otp_ttl_secs: 600,
            otp_max_attempts: 3,
            reset_per_hour: 3,
            magic_link_per_hour: 5,
        };

        let auth = AuthService::new(
            users.clone(),
            otp,
            tokens,
            PasswordHasher::default(),
            mailer.clone(),
            RateLimiter::new(Arc::new(MemoryCounter::new()), true),
            AuditLogger::disabled(),
            config,
        );

        Harness {
            auth,
            mailer,
            users,
        }
    }

    fn mailed_code(harness: &Harness, email: &str) -> String {
        let (_, body) = harness.mailer.last_to(email).expect("a code was mailed");
        body.rsplit(' ').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_signup_verify_signin_roundtrip() {
        let h = harness(true);

        let result = h
            .auth
            .signup("a@b.co", "Passw0rd!", serde_json::json!({}), None, None)
            .await
            .unwrap();
        assert!(result.session.is_none());
        assert!(result.user.email_verified_at.is_none());

        // Sign-in before verification is refused
        assert!(matches!(
            h.auth.signin("a@b.co", "Passw0rd!", None, None).await,
            Err(Error::EmailNotVerified)
        ));

        let code = mailed_code(&h, "a@b.co");
        h.auth.verify_email("a@b.co", &code).await.unwrap();

        let (user, pair) = h.auth.signin("a@b.co", "Passw0rd!", None, None).await.unwrap();
        assert_eq!(user.email, "a@b.co");
        assert!(!pair.access_token.is_empty());
    }

    #[tokio::test]
    async fn test_signup_without_verification_issues_session() {
        let h = harness(false);
        let result = h
            .auth
            .signup("a@b.co", "Passw0rd!", serde_json::json!({}), None, None)
            .await
            .unwrap();
        assert!(result.session.is_some());
        assert!(result.user.email_verified_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_email() {
        let h = harness(false);
        h.auth
            .signup("a@b.co", "Passw0rd!", serde_json::json!({}), None, None)
            .await
            .unwrap();

        // Case-insensitive: A@B.CO is the same account
        assert!(matches!(
            h.auth
                .signup("A@B.CO", "Passw0rd!", serde_json::json!({}), None, None)
                .await,
            Err(Error::EmailTaken)
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_and_wrong_password_are_uniform() {
        let h = harness(false);
        h.auth
            .signup("a@b.co", "Passw0rd!", serde_json::json!({}), None, None)
            .await
            .unwrap();

        let absent = h.auth.signin("ghost@b.co", "whatever1", None, None).await;
        let wrong = h.auth.signin("a@b.co", "Wrong-pass1", None, None).await;
        assert!(matches!(absent, Err(Error::InvalidCredentials)));
        assert!(matches!(wrong, Err(Error::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_lockout_after_threshold_and_reset_on_success() {
        let h = harness(false);
        h.auth
            .signup("a@b.co", "Passw0rd!", serde_json::json!({}), None, None)
            .await
            .unwrap();

        // Two failures stay under the threshold of three
        for _ in 0..2 {
            let _ = h.auth.signin("a@b.co", "bad-pass1", None, None).await;
        }

        // Success at threshold-1 resets the counter to zero
        h.auth.signin("a@b.co", "Passw0rd!", None, None).await.unwrap();
        let user = h.users.find_by_email("a@b.co").await.unwrap().unwrap();
        assert_eq!(user.failed_login_count, 0);

        // Three fresh failures cross the threshold and lock the account
        for _ in 0..3 {
            let _ = h.auth.signin("a@b.co", "bad-pass1", None, None).await;
        }
        assert!(matches!(
            h.auth.signin("a@b.co", "Passw0rd!", None, None).await,
            Err(Error::AccountLocked)
        ));
    }

    #[tokio::test]
    async fn test_password_reset_invalidates_sessions() {
        let h = harness(false);
        let signup = h
            .auth
            .signup("a@b.co", "Passw0rd!", serde_json::json!({}), None, None)
            .await
            .unwrap();
        let old_pair = signup.session.unwrap();

        h.auth.request_password_reset("a@b.co").await.unwrap();
        let code = mailed_code(&h, "a@b.co");
        h.auth
            .confirm_password_reset("a@b.co", &code, "NewPassw0rd!")
            .await
            .unwrap();

        // Old credentials and old sessions are both dead
        assert!(h.auth.signin("a@b.co", "Passw0rd!", None, None).await.is_err());
        h.auth.signin("a@b.co", "NewPassw0rd!", None, None).await.unwrap();
        assert!(h.auth.tokens().verify(&old_pair.access_token).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_requests_are_email_rate_limited() {
        let h = harness(false);
        h.auth
            .signup("a@b.co", "Passw0rd!", serde_json::json!({}), None, None)
            .await
            .unwrap();

        for _ in 0..3 {
            h.auth.request_password_reset("a@b.co").await.unwrap();
        }
        assert!(matches!(
            h.auth.request_password_reset("a@b.co").await,
            Err(Error::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_magic_link_signin_creates_and_verifies() {
        let h = harness(true);

        h.auth.request_magic_link("new@b.co").await.unwrap();
        let code = mailed_code(&h, "new@b.co");

        let (user, pair) = h
            .auth
            .magic_link_signin("new@b.co", &code, None, None)
            .await
            .unwrap();
        assert!(user.email_verified_at.is_some());
        assert!(!pair.access_token.is_empty());

        // Codes are single-use
        assert!(h
            .auth
            .magic_link_signin("new@b.co", &code, None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_otp_attempt_exhaustion() {
        let h = harness(true);
        h.auth
            .signup("a@b.co", "Passw0rd!", serde_json::json!({}), None, None)
            .await
            .unwrap();
        let code = mailed_code(&h, "a@b.co");

        for _ in 0..3 {
            assert!(h.auth.verify_email("a@b.co", "000000").await.is_err());
        }
        // The right code no longer works: attempts exhausted it
        assert!(h.auth.verify_email("a@b.co", &code).await.is_err());
    }

    #[tokio::test]
    async fn test_invite_flow() {
        let h = harness(true);
        let admin = Principal::Service {
            key_id: Uuid::new_v4(),
            scopes: vec!["*".into()],
        };

        h.auth.invite("guest@b.co", &admin).await.unwrap();
        let code = mailed_code(&h, "guest@b.co");

        let (user, _pair) = h
            .auth
            .accept_invite("guest@b.co", &code, "Passw0rd!", None, None)
            .await
            .unwrap();
        assert!(user.email_verified_at.is_some());
    }

    #[test]
    fn test_email_validation() {
        assert!(validate_email("a@b.co").is_ok());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("@missing-local.co").is_err());
        assert!(validate_email("x@nodot").is_err());
        assert!(validate_email("a b@c.co").is_err());
    }

    #[test]
    fn test_generated_codes_are_six_digits() {
        for _ in 0..32 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
