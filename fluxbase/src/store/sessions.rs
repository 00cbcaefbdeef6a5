//! Session repository
//!
//! A session strongly owns its refresh token: only the SHA-256 hashes of
//! the current access and refresh tokens are stored, and rotation is a
//! conditional update on `refresh_token_hash` so concurrent refreshes
//! resolve with exactly one winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

/// A session row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token_hash: String,
    pub access_token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
}

/// Fields for session creation
///
/// The id is chosen by the caller: tokens embed the session id, so it must
/// exist before the row does.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token_hash: String,
    pub access_token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
}

/// Outcome of a rotation attempt
#[derive(Debug, Clone)]
pub enum RotateOutcome {
    /// This caller won; hashes were swapped atomically
    Rotated { session: Session },
    /// The presented hash is no longer current for an existing session:
    /// refresh-token reuse. `superseded_at` lets the caller distinguish a
    /// concurrent-refresh loser (inside the reuse grace window) from a
    /// genuine replay.
    ReuseDetected {
        session_id: Uuid,
        user_id: Uuid,
        superseded_at: DateTime<Utc>,
    },
    /// No session knows this refresh token (expired and swept, or bogus)
    Unknown,
}

/// Session persistence capability
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: NewSession) -> Result<Session>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>>;

    /// Look up the live session holding this refresh-token hash.
    ///
    /// Expiry is strict: a token presented exactly at `refresh_expires_at`
    /// is already dead.
    async fn find_by_refresh_hash(&self, refresh_token_hash: &str) -> Result<Option<Session>>;

    /// Atomically swap both token hashes, conditional on the presented
    /// refresh hash still being current.
    async fn rotate(
        &self,
        presented_refresh_hash: &str,
        new_refresh_hash: &str,
        new_access_hash: &str,
        expires_at: DateTime<Utc>,
        refresh_expires_at: DateTime<Utc>,
    ) -> Result<RotateOutcome>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<u64>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>>;

    /// Remove sessions whose refresh window has closed
    async fn sweep_expired(&self) -> Result<u64>;
}

/// PostgreSQL-backed session store
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SESSION_COLUMNS: &str = "id, user_id, refresh_token_hash, access_token_hash, \
     expires_at, refresh_expires_at, created_at, user_agent, ip";

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: NewSession) -> Result<Session> {
        let created = sqlx::query_as::<_, Session>(&format!(
            r#"
            INSERT INTO auth.sessions
                (id, user_id, refresh_token_hash, access_token_hash, expires_at, refresh_expires_at, user_agent, ip)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {SESSION_COLUMNS}
            "#,
        ))
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.refresh_token_hash)
        .bind(&session.access_token_hash)
        .bind(session.expires_at)
        .bind(session.refresh_expires_at)
        .bind(&session.user_agent)
        .bind(&session.ip)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM auth.sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    async fn find_by_refresh_hash(&self, refresh_token_hash: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM auth.sessions \
             WHERE refresh_token_hash = $1 AND refresh_expires_at > now()"
        ))
        .bind(refresh_token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    async fn rotate(
        &self,
        presented_refresh_hash: &str,
        new_refresh_hash: &str,
        new_access_hash: &str,
        expires_at: DateTime<Utc>,
        refresh_expires_at: DateTime<Utc>,
    ) -> Result<RotateOutcome> {
        // The WHERE clause is the whole concurrency story: two racing
        // refreshes both match the row, but only the first UPDATE to commit
        // still sees the presented hash.
        let mut tx = self.pool.begin().await?;

        let rotated = sqlx::query_as::<_, Session>(&format!(
            r#"
            UPDATE auth.sessions
            SET refresh_token_hash = $2,
                access_token_hash = $3,
                expires_at = $4,
                refresh_expires_at = $5
            WHERE refresh_token_hash = $1 AND refresh_expires_at > now()
            RETURNING {SESSION_COLUMNS}
            "#,
        ))
        .bind(presented_refresh_hash)
        .bind(new_refresh_hash)
        .bind(new_access_hash)
        .bind(expires_at)
        .bind(refresh_expires_at)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(session) = rotated {
            // Trail of superseded hashes; a later presentation of one of
            // these is reuse, not an unknown token.
            sqlx::query(
                r#"
                INSERT INTO auth.session_refresh_history (session_id, refresh_token_hash)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(session.id)
            .bind(presented_refresh_hash)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            return Ok(RotateOutcome::Rotated { session });
        }

        tx.commit().await?;

        // Distinguish a replayed (superseded) token from an unknown one:
        // replay means some live session once issued this hash and has
        // moved past it. We keep a short trail of prior hashes for that.
        let reused = sqlx::query_as::<_, (Uuid, Uuid, DateTime<Utc>)>(
            r#"
            SELECT s.id, s.user_id, h.superseded_at
            FROM auth.sessions s
            JOIN auth.session_refresh_history h ON h.session_id = s.id
            WHERE h.refresh_token_hash = $1
            "#,
        )
        .bind(presented_refresh_hash)
        .fetch_optional(&self.pool)
        .await?;

        match reused {
            Some((session_id, user_id, superseded_at)) => Ok(RotateOutcome::ReuseDetected {
                session_id,
                user_id,
                superseded_at,
            }),
            None => Ok(RotateOutcome::Unknown),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM auth.sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM auth.sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM auth.sessions WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(sessions)
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM auth.sessions WHERE refresh_expires_at <= now()")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_outcome_variants() {
        assert!(matches!(RotateOutcome::Unknown, RotateOutcome::Unknown));

        let reuse = RotateOutcome::ReuseDetected {
            session_id: Uuid::nil(),
            user_id: Uuid::nil(),
            superseded_at: Utc::now(),
        };
        assert!(matches!(reuse, RotateOutcome::ReuseDetected { .. }));
    }
}
