//! OAuth state store
//!
//! Random state values issued at the start of the authorization flow and
//! consumed exactly once at the callback. TTL-bounded; consumption is
//! get-and-delete.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::{Error, Result};

/// Data persisted under a state value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    /// Provider the flow was started for
    pub provider: String,

    /// Where to send the browser after the callback
    pub redirect_url: Option<String>,

    /// PKCE code verifier, when the provider flow uses PKCE
    pub pkce_verifier: Option<String>,

    /// When this state was created
    pub created_at: DateTime<Utc>,
}

/// Generate a cryptographically random state value
pub fn generate_state() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// OAuth state persistence capability
#[async_trait]
pub trait OAuthStateStore: Send + Sync {
    /// Store state data; returns the opaque state string for the URL
    async fn put(&self, data: OAuthState, ttl: Duration) -> Result<String>;

    /// Consume a state value: strictly single-use, TTL-enforced
    async fn take(&self, state: &str) -> Result<OAuthState>;
}

/// PostgreSQL-backed state store
#[derive(Clone)]
pub struct PgOAuthStateStore {
    pool: PgPool,
}

impl PgOAuthStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OAuthStateStore for PgOAuthStateStore {
    async fn put(&self, data: OAuthState, ttl: Duration) -> Result<String> {
        let state = generate_state();

        sqlx::query(
            r#"
            INSERT INTO auth.oauth_states (state, payload, expires_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&state)
        .bind(serde_json::to_value(&data)?)
        .bind(Utc::now() + ttl)
        .execute(&self.pool)
        .await?;

        Ok(state)
    }

    async fn take(&self, state: &str) -> Result<OAuthState> {
        // DELETE ... RETURNING guarantees single use under concurrency
        let row = sqlx::query_as::<_, (serde_json::Value,)>(
            r#"
            DELETE FROM auth.oauth_states
            WHERE state = $1 AND expires_at > now()
            RETURNING payload
            "#,
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((payload,)) => Ok(serde_json::from_value(payload)?),
            None => Err(Error::BadRequest("invalid or expired OAuth state".into())),
        }
    }
}

/// In-process state store for single-instance deployments and tests
#[derive(Default)]
pub struct MemoryOAuthStateStore {
    states: DashMap<String, (OAuthState, DateTime<Utc>)>,
}

impl MemoryOAuthStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OAuthStateStore for MemoryOAuthStateStore {
    async fn put(&self, data: OAuthState, ttl: Duration) -> Result<String> {
        let state = generate_state();
        self.states.insert(state.clone(), (data, Utc::now() + ttl));
        Ok(state)
    }

    async fn take(&self, state: &str) -> Result<OAuthState> {
        match self.states.remove(state) {
            Some((_, (data, expires_at))) if expires_at > Utc::now() => Ok(data),
            _ => Err(Error::BadRequest("invalid or expired OAuth state".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> OAuthState {
        OAuthState {
            provider: "google".into(),
            redirect_url: Some("https://app.example.com/done".into()),
            pkce_verifier: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_generate_state_is_random() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        // 32 bytes base64url without padding
        assert_eq!(a.len(), 43);
    }

    #[tokio::test]
    async fn test_memory_store_single_use() {
        let store = MemoryOAuthStateStore::new();
        let state = store
            .put(sample_state(), Duration::minutes(10))
            .await
            .unwrap();

        let taken = store.take(&state).await.unwrap();
        assert_eq!(taken.provider, "google");

        // Second take fails: the state self-deleted on consume
        assert!(store.take(&state).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_ttl() {
        let store = MemoryOAuthStateStore::new();
        let state = store
            .put(sample_state(), Duration::seconds(-1))
            .await
            .unwrap();
        assert!(store.take(&state).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_state_rejected() {
        let store = MemoryOAuthStateStore::new();
        assert!(store.take("never-issued").await.is_err());
    }
}
