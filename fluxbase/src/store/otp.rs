//! One-time code repository
//!
//! Codes back email verification, passwordless sign-in, password recovery,
//! invitations and email changes. Only the SHA-256 of the code is stored.
//! Consumption is single-use: the winning consume deletes the row in the
//! same statement, and attempts beyond the configured threshold invalidate
//! the code.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::normalize_email;
use crate::crypto::token_hash;
use crate::error::{Error, Result};

/// What an OTP authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    Signup,
    Signin,
    Recovery,
    Invite,
    EmailChange,
}

impl OtpPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signup => "signup",
            Self::Signin => "signin",
            Self::Recovery => "recovery",
            Self::Invite => "invite",
            Self::EmailChange => "email_change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signup" => Some(Self::Signup),
            "signin" => Some(Self::Signin),
            "recovery" => Some(Self::Recovery),
            "invite" => Some(Self::Invite),
            "email_change" => Some(Self::EmailChange),
            _ => None,
        }
    }
}

/// An issued one-time code
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OtpCode {
    pub id: Uuid,
    /// Null for signup/reset flows where no account exists yet
    pub user_id: Option<Uuid>,
    pub email: String,
    pub purpose: String,
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
}

/// OTP persistence capability
#[async_trait]
pub trait OtpStore: Send + Sync {
    /// Issue a code, replacing any live code for the same email+purpose
    async fn issue(
        &self,
        user_id: Option<Uuid>,
        email: &str,
        purpose: OtpPurpose,
        code: &str,
        ttl: Duration,
    ) -> Result<OtpCode>;

    /// Consume a code: exactly-once on success.
    ///
    /// A wrong code bumps `attempt_count`; past `max_attempts` the code is
    /// invalidated regardless of later correct guesses.
    async fn consume(
        &self,
        email: &str,
        purpose: OtpPurpose,
        code: &str,
        max_attempts: i32,
    ) -> Result<OtpCode>;

    /// Remove expired and exhausted codes
    async fn sweep_expired(&self) -> Result<u64>;
}

/// PostgreSQL-backed OTP store
#[derive(Clone)]
pub struct PgOtpStore {
    pool: PgPool,
}

impl PgOtpStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const OTP_COLUMNS: &str =
    "id, user_id, email, purpose, code_hash, expires_at, attempt_count, created_at";

#[async_trait]
impl OtpStore for PgOtpStore {
    async fn issue(
        &self,
        user_id: Option<Uuid>,
        email: &str,
        purpose: OtpPurpose,
        code: &str,
        ttl: Duration,
    ) -> Result<OtpCode> {
        let email = normalize_email(email);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM auth.otp_codes WHERE email = $1 AND purpose = $2")
            .bind(&email)
            .bind(purpose.as_str())
            .execute(&mut *tx)
            .await?;

        let issued = sqlx::query_as::<_, OtpCode>(&format!(
            r#"
            INSERT INTO auth.otp_codes (user_id, email, purpose, code_hash, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {OTP_COLUMNS}
            "#,
        ))
        .bind(user_id)
        .bind(&email)
        .bind(purpose.as_str())
        .bind(token_hash(code))
        .bind(Utc::now() + ttl)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(issued)
    }

    async fn consume(
        &self,
        email: &str,
        purpose: OtpPurpose,
        code: &str,
        max_attempts: i32,
    ) -> Result<OtpCode> {
        let email = normalize_email(email);
        let code_hash = token_hash(code);

        // DELETE ... RETURNING is what guarantees at-most-once: of two
        // concurrent consumers only one sees the row.
        let consumed = sqlx::query_as::<_, OtpCode>(&format!(
            r#"
            DELETE FROM auth.otp_codes
            WHERE email = $1 AND purpose = $2 AND code_hash = $3
              AND expires_at > now() AND attempt_count < $4
            RETURNING {OTP_COLUMNS}
            "#,
        ))
        .bind(&email)
        .bind(purpose.as_str())
        .bind(&code_hash)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(otp) = consumed {
            return Ok(otp);
        }

        // Wrong guess: charge an attempt against whatever live code exists
        sqlx::query(
            r#"
            UPDATE auth.otp_codes
            SET attempt_count = attempt_count + 1
            WHERE email = $1 AND purpose = $2 AND expires_at > now()
            "#,
        )
        .bind(&email)
        .bind(purpose.as_str())
        .execute(&self.pool)
        .await?;

        Err(Error::InvalidCredentials)
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM auth.otp_codes WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purpose_roundtrip() {
        for purpose in [
            OtpPurpose::Signup,
            OtpPurpose::Signin,
            OtpPurpose::Recovery,
            OtpPurpose::Invite,
            OtpPurpose::EmailChange,
        ] {
            assert_eq!(OtpPurpose::parse(purpose.as_str()), Some(purpose));
        }
        assert_eq!(OtpPurpose::parse("bogus"), None);
    }
}
