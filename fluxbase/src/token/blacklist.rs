//! Token blacklist
//!
//! Revoked access-token hashes, kept until shortly after the token would
//! have expired anyway and then swept. Two backends: an in-process TTL map
//! for single-instance deployments and a PostgreSQL table for multi-
//! instance, with a short-TTL per-instance read cache in front.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;

use crate::error::Result;

/// How long negative lookups may be served from the per-instance cache
const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(5);

/// Blacklist capability
#[async_trait]
pub trait TokenBlacklist: Send + Sync {
    /// Insert a token hash, retained until `expires_at`
    async fn insert(&self, token_hash: &str, expires_at: DateTime<Utc>) -> Result<()>;

    async fn contains(&self, token_hash: &str) -> Result<bool>;

    /// Remove entries past their retention time
    async fn sweep(&self) -> Result<u64>;
}

/// Spawn the periodic sweeper shared by all backends
pub fn spawn_sweeper(blacklist: Arc<dyn TokenBlacklist>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // skip the immediate tick
        loop {
            interval.tick().await;
            match blacklist.sweep().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "swept expired blacklist entries"),
                Err(e) => tracing::warn!(error = %e, "blacklist sweep failed"),
            }
        }
    });
}

/// In-process blacklist for single-instance deployments
#[derive(Default)]
pub struct MemoryBlacklist {
    entries: DashMap<String, DateTime<Utc>>,
}

impl MemoryBlacklist {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenBlacklist for MemoryBlacklist {
    async fn insert(&self, token_hash: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.entries.insert(token_hash.to_string(), expires_at);
        Ok(())
    }

    async fn contains(&self, token_hash: &str) -> Result<bool> {
        match self.entries.get(token_hash) {
            Some(expires_at) => Ok(*expires_at > Utc::now()),
            None => Ok(false),
        }
    }

    async fn sweep(&self) -> Result<u64> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        Ok((before - self.entries.len()) as u64)
    }
}

/// PostgreSQL-backed blacklist for multi-instance deployments
///
/// Positive hits are cached until the entry's own expiry (an entry never
/// un-revokes); negative lookups are cached only briefly so revocations
/// from other instances become visible quickly.
pub struct PgBlacklist {
    pool: PgPool,
    positive: DashMap<String, DateTime<Utc>>,
    negative: DashMap<String, Instant>,
}

impl PgBlacklist {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            positive: DashMap::new(),
            negative: DashMap::new(),
        }
    }
}

#[async_trait]
impl TokenBlacklist for PgBlacklist {
    async fn insert(&self, token_hash: &str, expires_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO auth.token_blacklist (token_hash, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (token_hash) DO UPDATE SET expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(token_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        self.positive.insert(token_hash.to_string(), expires_at);
        self.negative.remove(token_hash);
        Ok(())
    }

    async fn contains(&self, token_hash: &str) -> Result<bool> {
        if let Some(expires_at) = self.positive.get(token_hash) {
            if *expires_at > Utc::now() {
                return Ok(true);
            }
        }
        if let Some(checked_at) = self.negative.get(token_hash) {
            if checked_at.elapsed() < NEGATIVE_CACHE_TTL {
                return Ok(false);
            }
        }

        let row = sqlx::query_as::<_, (DateTime<Utc>,)>(
            "SELECT expires_at FROM auth.token_blacklist WHERE token_hash = $1 AND expires_at > now()",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((expires_at,)) => {
                self.positive.insert(token_hash.to_string(), expires_at);
                Ok(true)
            }
            None => {
                self.negative.insert(token_hash.to_string(), Instant::now());
                Ok(false)
            }
        }
    }

    async fn sweep(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM auth.token_blacklist WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;

        let now = Utc::now();
        self.positive.retain(|_, expires_at| *expires_at > now);
        self.negative
            .retain(|_, checked_at| checked_at.elapsed() < NEGATIVE_CACHE_TTL);

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_memory_insert_and_lookup() {
        let blacklist = MemoryBlacklist::new();
        let exp = Utc::now() + ChronoDuration::hours(1);

        blacklist.insert("hash-a", exp).await.unwrap();
        assert!(blacklist.contains("hash-a").await.unwrap());
        assert!(!blacklist.contains("hash-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_expired_entries_do_not_match() {
        let blacklist = MemoryBlacklist::new();
        let past = Utc::now() - ChronoDuration::seconds(1);

        blacklist.insert("old", past).await.unwrap();
        assert!(!blacklist.contains("old").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_sweep() {
        let blacklist = MemoryBlacklist::new();
        blacklist
            .insert("dead", Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();
        blacklist
            .insert("live", Utc::now() + ChronoDuration::hours(1))
            .await
            .unwrap();

        assert_eq!(blacklist.sweep().await.unwrap(), 1);
        assert!(blacklist.contains("live").await.unwrap());
    }
}
