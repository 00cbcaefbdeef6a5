//! User repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::normalize_email;
use crate::error::Result;

/// A user account row
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    /// Empty for SSO-only accounts
    #[serde(skip_serializing)]
    pub encrypted_password: Option<String>,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub last_sign_in_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub failed_login_count: i32,
    #[serde(skip_serializing)]
    pub locked_until: Option<DateTime<Utc>>,
    pub role: String,
    pub user_metadata: serde_json::Value,
    pub app_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// True while the lockout window is still open
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map(|until| until > now).unwrap_or(false)
    }
}

/// Fields for account creation
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    /// None for SSO-only accounts
    pub encrypted_password: Option<String>,
    /// Verified immediately (SSO with verified email, invites)
    pub email_verified: bool,
    pub role: String,
    pub user_metadata: serde_json::Value,
    pub app_metadata: serde_json::Value,
}

impl NewUser {
    pub fn with_email(email: &str) -> Self {
        Self {
            email: email.to_string(),
            encrypted_password: None,
            email_verified: false,
            role: "authenticated".to_string(),
            user_metadata: serde_json::json!({}),
            app_metadata: serde_json::json!({}),
        }
    }
}

/// User persistence capability
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create(&self, user: NewUser) -> Result<User>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Record a failed sign-in; applies the lockout once the threshold is hit
    async fn record_failed_login(
        &self,
        id: Uuid,
        threshold: i32,
        locked_until: DateTime<Utc>,
    ) -> Result<()>;

    /// Record a successful sign-in: clears counters and the lockout
    async fn record_successful_login(&self, id: Uuid) -> Result<()>;

    async fn mark_email_verified(&self, id: Uuid) -> Result<()>;

    async fn set_password(&self, id: Uuid, encrypted_password: &str) -> Result<()>;

    async fn update_metadata(&self, id: Uuid, user_metadata: serde_json::Value) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<User>>;
}

/// PostgreSQL-backed user store
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = "id, email, encrypted_password, email_verified_at, last_sign_in_at, \
     failed_login_count, locked_until, role, user_metadata, app_metadata, created_at";

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, user: NewUser) -> Result<User> {
        let verified_at = if user.email_verified {
            Some(Utc::now())
        } else {
            None
        };

        let created = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO auth.users (email, encrypted_password, email_verified_at, role, user_metadata, app_metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#,
        ))
        .bind(normalize_email(&user.email))
        .bind(&user.encrypted_password)
        .bind(verified_at)
        .bind(&user.role)
        .bind(&user.user_metadata)
        .bind(&user.app_metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM auth.users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM auth.users WHERE lower(email) = $1"
        ))
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn record_failed_login(
        &self,
        id: Uuid,
        threshold: i32,
        locked_until: DateTime<Utc>,
    ) -> Result<()> {
        // One statement so the increment and the conditional lockout are
        // serialised at the row.
        sqlx::query(
            r#"
            UPDATE auth.users
            SET failed_login_count = failed_login_count + 1,
                locked_until = CASE
                    WHEN failed_login_count + 1 >= $2 THEN $3
                    ELSE locked_until
                END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(threshold)
        .bind(locked_until)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_successful_login(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE auth.users
            SET failed_login_count = 0,
                locked_until = NULL,
                last_sign_in_at = now(),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_email_verified(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE auth.users SET email_verified_at = now(), updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_password(&self, id: Uuid, encrypted_password: &str) -> Result<()> {
        sqlx::query(
            "UPDATE auth.users SET encrypted_password = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(encrypted_password)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_metadata(&self, id: Uuid, user_metadata: serde_json::Value) -> Result<()> {
        sqlx::query(
            "UPDATE auth.users SET user_metadata = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(user_metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        // Identities and sessions cascade via foreign keys
        sqlx::query("DELETE FROM auth.users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM auth.users ORDER BY created_at DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user(locked_until: Option<DateTime<Utc>>) -> User {
        User {
            id: Uuid::new_v4(),
            email: "a@b.co".into(),
            encrypted_password: Some("$argon2id$...".into()),
            email_verified_at: None,
            last_sign_in_at: None,
            failed_login_count: 0,
            locked_until,
            role: "authenticated".into(),
            user_metadata: serde_json::json!({}),
            app_metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_lockout_window() {
        let now = Utc::now();
        assert!(!sample_user(None).is_locked(now));
        assert!(sample_user(Some(now + chrono::Duration::minutes(5))).is_locked(now));
        assert!(!sample_user(Some(now - chrono::Duration::minutes(5))).is_locked(now));
    }

    #[test]
    fn test_password_hash_never_serialized() {
        let user = sample_user(None);
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("argon2id"));
        assert!(!json.contains("failed_login_count"));
    }

    #[test]
    fn test_new_user_defaults() {
        let new_user = NewUser::with_email("x@y.z");
        assert_eq!(new_user.role, "authenticated");
        assert!(!new_user.email_verified);
        assert!(new_user.encrypted_password.is_none());
    }
}
