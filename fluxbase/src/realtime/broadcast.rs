//! Cross-instance broadcast fan-out
//!
//! Database change events need no cross-instance help (PostgreSQL sends
//! NOTIFY to every listening connection), but application broadcasts do.
//! The backend is chosen by `security.scaling_backend`: pg_notify on a
//! second channel, Redis publish/subscribe, or nothing for a single
//! instance.

use async_trait::async_trait;

use super::messages::BroadcastEnvelope;
use crate::error::{Error, Result};

/// Publish side of the cross-instance pipe
#[async_trait]
pub trait BroadcastBackend: Send + Sync {
    async fn publish(&self, envelope: &BroadcastEnvelope) -> Result<()>;
}

/// Single-instance backend: local dispatch already happened, nothing to do
pub struct LocalBroadcast;

#[async_trait]
impl BroadcastBackend for LocalBroadcast {
    async fn publish(&self, _envelope: &BroadcastEnvelope) -> Result<()> {
        Ok(())
    }
}

/// PostgreSQL backend: pg_notify on the broadcast channel; every
/// instance's listener receives it.
pub struct PgBroadcast {
    pool: sqlx::PgPool,
    channel: String,
}

impl PgBroadcast {
    pub fn new(pool: sqlx::PgPool, channel: String) -> Self {
        Self { pool, channel }
    }
}

#[async_trait]
impl BroadcastBackend for PgBroadcast {
    async fn publish(&self, envelope: &BroadcastEnvelope) -> Result<()> {
        let payload = serde_json::to_string(envelope)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Redis backend: PUBLISH; a companion subscriber task feeds the hub
pub struct RedisBroadcast {
    pool: deadpool_redis::Pool,
    channel: String,
}

impl RedisBroadcast {
    pub fn new(pool: deadpool_redis::Pool, channel: String) -> Self {
        Self { pool, channel }
    }

    /// Spawn the subscriber side, forwarding foreign envelopes to `deliver`
    pub fn spawn_subscriber<F>(redis_url: String, channel: String, deliver: F)
    where
        F: Fn(BroadcastEnvelope) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut backoff = std::time::Duration::from_secs(1);
            loop {
                match subscribe_loop(&redis_url, &channel, &deliver).await {
                    Ok(()) => backoff = std::time::Duration::from_secs(1),
                    Err(e) => {
                        tracing::warn!(error = %e, "redis broadcast subscriber failed; retrying");
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(std::time::Duration::from_secs(60));
            }
        });
    }
}

async fn subscribe_loop<F>(redis_url: &str, channel: &str, deliver: &F) -> Result<()>
where
    F: Fn(BroadcastEnvelope) + Send + Sync,
{
    use futures::StreamExt;

    let client = redis::Client::open(redis_url)
        .map_err(|e| Error::Internal(format!("invalid Redis URL: {}", e)))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| Error::External(format!("Redis pubsub connect failed: {}", e)))?;
    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| Error::External(format!("Redis subscribe failed: {}", e)))?;

    tracing::info!(channel, "redis broadcast subscriber active");

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable broadcast payload dropped");
                continue;
            }
        };
        match serde_json::from_str::<BroadcastEnvelope>(&payload) {
            Ok(envelope) => deliver(envelope),
            Err(e) => tracing::warn!(error = %e, "undecodable broadcast envelope dropped"),
        }
    }

    Err(Error::External("redis pubsub stream ended".into()))
}

#[async_trait]
impl BroadcastBackend for RedisBroadcast {
    async fn publish(&self, envelope: &BroadcastEnvelope) -> Result<()> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::Internal(format!("failed to get Redis connection: {}", e)))?;

        let payload = serde_json::to_string(envelope)?;
        conn.publish::<_, _, ()>(&self.channel, payload)
            .await
            .map_err(|e| Error::External(format!("Redis publish failed: {}", e)))?;
        Ok(())
    }
}
