//! In-memory store doubles for unit tests
//!
//! Mirror the semantics the PostgreSQL implementations get from SQL
//! (conditional rotation, single-use consumes, lockout counters) closely
//! enough to exercise the services above them.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::normalize_email;
use super::otp::{OtpCode, OtpPurpose, OtpStore};
use super::sessions::{NewSession, RotateOutcome, Session, SessionStore};
use super::users::{NewUser, User, UserStore};
use crate::crypto::token_hash;
use crate::error::{Error, Result};

/// In-memory session store with history-based reuse detection
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<Vec<Session>>,
    history: Mutex<Vec<(Uuid, String, DateTime<Utc>)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdate a history row to simulate an old rotation
    pub fn age_history(&self, by: Duration) {
        for entry in self.history.lock().unwrap().iter_mut() {
            entry.2 -= by;
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, new: NewSession) -> Result<Session> {
        let session = Session {
            id: new.id,
            user_id: new.user_id,
            refresh_token_hash: new.refresh_token_hash,
            access_token_hash: new.access_token_hash,
            expires_at: new.expires_at,
            refresh_expires_at: new.refresh_expires_at,
            created_at: Utc::now(),
            user_agent: new.user_agent,
            ip: new.ip,
        };
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn find_by_refresh_hash(&self, hash: &str) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.refresh_token_hash == hash && s.refresh_expires_at > Utc::now())
            .cloned())
    }

    async fn rotate(
        &self,
        presented: &str,
        new_refresh: &str,
        new_access: &str,
        expires_at: DateTime<Utc>,
        refresh_expires_at: DateTime<Utc>,
    ) -> Result<RotateOutcome> {
        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(session) = sessions.iter_mut().find(|s| {
                s.refresh_token_hash == presented && s.refresh_expires_at > Utc::now()
            }) {
                self.history.lock().unwrap().push((
                    session.id,
                    presented.to_string(),
                    Utc::now(),
                ));
                session.refresh_token_hash = new_refresh.to_string();
                session.access_token_hash = new_access.to_string();
                session.expires_at = expires_at;
                session.refresh_expires_at = refresh_expires_at;
                return Ok(RotateOutcome::Rotated {
                    session: session.clone(),
                });
            }
        }

        let history = self.history.lock().unwrap();
        if let Some((session_id, _, superseded_at)) =
            history.iter().find(|(_, h, _)| h == presented)
        {
            let user_id = self
                .sessions
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.id == *session_id)
                .map(|s| s.user_id)
                .unwrap_or(Uuid::nil());
            return Ok(RotateOutcome::ReuseDetected {
                session_id: *session_id,
                user_id,
                superseded_at: *superseded_at,
            });
        }
        Ok(RotateOutcome::Unknown)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.sessions.lock().unwrap().retain(|s| s.id != id);
        Ok(())
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|s| s.user_id != user_id);
        Ok((before - sessions.len()) as u64)
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|s| s.refresh_expires_at > Utc::now());
        Ok((before - sessions.len()) as u64)
    }
}

/// In-memory user store
#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<Vec<User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, new: NewUser) -> Result<User> {
        let email = normalize_email(&new.email);
        let mut users = self.users.lock().unwrap();
        if users.iter().any(|u| u.email == email) {
            return Err(Error::Conflict("duplicate key".into()));
        }

        let user = User {
            id: Uuid::new_v4(),
            email,
            encrypted_password: new.encrypted_password,
            email_verified_at: new.email_verified.then(Utc::now),
            last_sign_in_at: None,
            failed_login_count: 0,
            locked_until: None,
            role: new.role,
            user_metadata: new.user_metadata,
            app_metadata: new.app_metadata,
            created_at: Utc::now(),
        };
        users.push(user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.users.lock().unwrap().iter().find(|u| u.id == id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = normalize_email(email);
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn record_failed_login(
        &self,
        id: Uuid,
        threshold: i32,
        locked_until: DateTime<Utc>,
    ) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.iter_mut().find(|u| u.id == id) {
            user.failed_login_count += 1;
            if user.failed_login_count >= threshold {
                user.locked_until = Some(locked_until);
            }
        }
        Ok(())
    }

    async fn record_successful_login(&self, id: Uuid) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.iter_mut().find(|u| u.id == id) {
            user.failed_login_count = 0;
            user.locked_until = None;
            user.last_sign_in_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_email_verified(&self, id: Uuid) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.iter_mut().find(|u| u.id == id) {
            user.email_verified_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_password(&self, id: Uuid, encrypted_password: &str) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.iter_mut().find(|u| u.id == id) {
            user.encrypted_password = Some(encrypted_password.to_string());
        }
        Ok(())
    }

    async fn update_metadata(&self, id: Uuid, user_metadata: serde_json::Value) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.iter_mut().find(|u| u.id == id) {
            user.user_metadata = user_metadata;
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.users.lock().unwrap().retain(|u| u.id != id);
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<User>> {
        let users = self.users.lock().unwrap();
        Ok(users
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

/// In-memory OTP store with attempt accounting
#[derive(Default)]
pub struct MemoryOtpStore {
    codes: Mutex<Vec<OtpCode>>,
}

impl MemoryOtpStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OtpStore for MemoryOtpStore {
    async fn issue(
        &self,
        user_id: Option<Uuid>,
        email: &str,
        purpose: OtpPurpose,
        code: &str,
        ttl: Duration,
    ) -> Result<OtpCode> {
        let email = normalize_email(email);
        let mut codes = self.codes.lock().unwrap();
        codes.retain(|c| !(c.email == email && c.purpose == purpose.as_str()));

        let otp = OtpCode {
            id: Uuid::new_v4(),
            user_id,
            email,
            purpose: purpose.as_str().to_string(),
            code_hash: token_hash(code),
            expires_at: Utc::now() + ttl,
            attempt_count: 0,
            created_at: Utc::now(),
        };
        codes.push(otp.clone());
        Ok(otp)
    }

    async fn consume(
        &self,
        email: &str,
        purpose: OtpPurpose,
        code: &str,
        max_attempts: i32,
    ) -> Result<OtpCode> {
        let email = normalize_email(email);
        let hash = token_hash(code);
        let mut codes = self.codes.lock().unwrap();

        if let Some(pos) = codes.iter().position(|c| {
            c.email == email
                && c.purpose == purpose.as_str()
                && c.code_hash == hash
                && c.expires_at > Utc::now()
                && c.attempt_count < max_attempts
        }) {
            return Ok(codes.remove(pos));
        }

        for c in codes.iter_mut() {
            if c.email == email && c.purpose == purpose.as_str() && c.expires_at > Utc::now() {
                c.attempt_count += 1;
            }
        }
        Err(Error::InvalidCredentials)
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let mut codes = self.codes.lock().unwrap();
        let before = codes.len();
        codes.retain(|c| c.expires_at > Utc::now());
        Ok((before - codes.len()) as u64)
    }
}
