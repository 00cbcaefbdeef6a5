//! Change listener
//!
//! One task holds one LISTEN connection for the change channel, the
//! cross-instance broadcast channel and the admin invalidation channel.
//! Notifications are decoded, checked against the realtime registry and
//! forwarded to the subscription hub. On connection loss it reconnects
//! with exponential backoff and jitter; there is no backlog replay, so
//! delivery is at-most-once and clients re-read state after a gap.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::postgres::PgListener;
use sqlx::PgPool;

use super::hub::SubscriptionHub;
use super::messages::{BroadcastEnvelope, ChangeEvent};
use super::registry::RealtimeRegistry;

/// Admin channel carrying registry invalidation pings
pub const ADMIN_CHANNEL: &str = "fluxbase_admin";

/// Configuration for the listener task
#[derive(Clone)]
pub struct ListenerConfig {
    pub change_channel: String,
    pub broadcast_channel: String,
}

/// Spawn the listener task
pub fn spawn_listener(
    pool: PgPool,
    config: ListenerConfig,
    registry: RealtimeRegistry,
    hub: Arc<SubscriptionHub>,
) {
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        loop {
            match listen_loop(&pool, &config, &registry, &hub).await {
                Ok(()) => {
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "change listener disconnected; will retry");
                }
            }

            // Jitter avoids a thundering herd of reconnecting instances
            let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
            tokio::time::sleep(backoff + jitter).await;
            backoff = (backoff * 2).min(Duration::from_secs(60));
        }
    });
}

async fn listen_loop(
    pool: &PgPool,
    config: &ListenerConfig,
    registry: &RealtimeRegistry,
    hub: &Arc<SubscriptionHub>,
) -> sqlx::Result<()> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener
        .listen_all([
            config.change_channel.as_str(),
            config.broadcast_channel.as_str(),
            ADMIN_CHANNEL,
        ])
        .await?;

    tracing::info!(
        change = %config.change_channel,
        broadcast = %config.broadcast_channel,
        "change listener active"
    );

    loop {
        let notification = listener.recv().await?;
        let channel = notification.channel();
        let payload = notification.payload();

        if channel == config.change_channel {
            handle_change(payload, registry, hub).await;
        } else if channel == config.broadcast_channel {
            handle_broadcast(payload, hub);
        } else if channel == ADMIN_CHANNEL {
            tracing::debug!("registry invalidation received");
            registry.invalidate().await;
        }
    }
}

async fn handle_change(payload: &str, registry: &RealtimeRegistry, hub: &Arc<SubscriptionHub>) {
    let event: ChangeEvent = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(e) => {
            // Undecodable payloads are logged and dropped
            tracing::warn!(error = %e, "undecodable change notification dropped");
            return;
        }
    };

    match registry.allows(&event.schema, &event.table, &event.kind).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(
                schema = %event.schema,
                table = %event.table,
                kind = %event.kind,
                "change for unregistered table dropped"
            );
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "registry lookup failed, change dropped");
            return;
        }
    }

    hub.dispatch_change(event).await;
}

fn handle_broadcast(payload: &str, hub: &Arc<SubscriptionHub>) {
    match serde_json::from_str::<BroadcastEnvelope>(payload) {
        Ok(envelope) => hub.deliver_remote_broadcast(envelope),
        Err(e) => {
            tracing::warn!(error = %e, "undecodable broadcast notification dropped");
        }
    }
}
