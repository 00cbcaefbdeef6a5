//! Subscription hub
//!
//! Owns per-connection state and the channel registry, fans row-change
//! events out to matching subscribers and handles slow clients. Delivery
//! of a change is gated three times: the table's registry policy (already
//! applied by the listener), the subscriber's own row filter, and a
//! row-level security re-check executed under the subscriber's Principal
//! at the moment of delivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::FutureExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::broadcast::BroadcastBackend;
use super::connection::{ConnectionId, ConnectionState};
use super::filter::RowFilter;
use super::messages::{
    BroadcastEnvelope, Channel, ChangeEvent, ServerMessage, CLOSE_SLOW_CLIENT,
};
use super::registry::RealtimeRegistry;
use crate::error::{Error, Result};
use crate::principal::Principal;
use crate::scope::ScopeBinder;

/// Subscription hub shared by every WebSocket connection
pub struct SubscriptionHub {
    connections: DashMap<ConnectionId, Arc<ConnectionState>>,
    /// channel name → subscribed connections
    channels: DashMap<String, HashSet<ConnectionId>>,
    binder: ScopeBinder,
    registry: RealtimeRegistry,
    broadcaster: Arc<dyn BroadcastBackend>,
    /// This instance's identity, to skip echoes of its own broadcasts
    instance_id: Uuid,
    /// Primary key columns per (schema, table), for the visibility probe
    pk_cache: DashMap<(String, String), Vec<String>>,
    pool: sqlx::PgPool,
    send_queue_depth: usize,
    slow_grace: Duration,
}

impl SubscriptionHub {
    pub fn new(
        binder: ScopeBinder,
        registry: RealtimeRegistry,
        broadcaster: Arc<dyn BroadcastBackend>,
        pool: sqlx::PgPool,
        send_queue_depth: usize,
        slow_grace: Duration,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            channels: DashMap::new(),
            binder,
            registry,
            broadcaster,
            instance_id: Uuid::new_v4(),
            pk_cache: DashMap::new(),
            pool,
            send_queue_depth,
            slow_grace,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Register a connection; returns its state plus the receiving ends
    /// for the writer task (outbound frames and the close signal).
    pub fn register(
        &self,
        principal: Principal,
    ) -> (
        Arc<ConnectionState>,
        mpsc::Receiver<ServerMessage>,
        mpsc::Receiver<u16>,
    ) {
        let (tx, rx) = mpsc::channel(self.send_queue_depth);
        let (close_tx, close_rx) = mpsc::channel(1);

        let state = Arc::new(ConnectionState::new(principal, tx, close_tx));
        self.connections.insert(state.id, state.clone());

        tracing::debug!(connection = %state.id, total = self.connections.len(), "connection registered");
        (state, rx, close_rx)
    }

    /// Remove a connection and release all of its subscriptions
    pub fn unregister(&self, id: ConnectionId) {
        if let Some((_, state)) = self.connections.remove(&id) {
            for channel in state.channels() {
                if let Some(mut subscribers) = self.channels.get_mut(&channel) {
                    subscribers.remove(&id);
                }
            }
            // Drop empty channel entries
            self.channels.retain(|_, subscribers| !subscribers.is_empty());
            tracing::debug!(connection = %id, "connection unregistered");
        }
    }

    /// Handle a subscribe frame.
    ///
    /// Table channels are validated against the realtime registry, the
    /// filter is parsed and its columns checked against the table, and
    /// the subscriber's role must be able to SELECT from the table.
    pub async fn subscribe(
        &self,
        conn: &Arc<ConnectionState>,
        channel_name: &str,
        filter_source: Option<&str>,
    ) -> Result<()> {
        let channel = Channel::parse(channel_name)
            .map_err(|_| Error::NotFound(format!("unknown channel '{}'", channel_name)))?;

        let filter = match filter_source {
            Some(source) => Some(RowFilter::parse(source)?),
            None => None,
        };

        if let Channel::Table { schema, table } = &channel {
            let policy = self
                .registry
                .policy(schema, table)
                .await?
                .filter(|policy| policy.enabled)
                .ok_or_else(|| {
                    Error::NotFound(format!("channel '{}' is not enabled", channel_name))
                })?;

            let columns = self.accessible_columns(&conn.principal, schema, table).await?;
            if columns.is_empty() {
                return Err(Error::Forbidden("table is not readable".into()));
            }

            if let Some(filter) = &filter {
                for column in filter.columns() {
                    if policy.excluded_columns.iter().any(|c| c == column)
                        || !columns.iter().any(|c| c == column)
                    {
                        return Err(Error::BadRequest(format!(
                            "filter references unknown column '{}'",
                            column
                        )));
                    }
                }
            }
        }

        conn.filters
            .lock()
            .expect("connection filters poisoned")
            .insert(channel.to_string(), filter);
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn.id);

        tracing::debug!(connection = %conn.id, channel = %channel, "subscribed");
        Ok(())
    }

    /// Handle an unsubscribe frame; unknown channels are a no-op, so
    /// subscribe-then-unsubscribe always leaves the hub unchanged.
    pub fn unsubscribe(&self, conn: &Arc<ConnectionState>, channel_name: &str) {
        conn.filters
            .lock()
            .expect("connection filters poisoned")
            .remove(channel_name);
        if let Some(mut subscribers) = self.channels.get_mut(channel_name) {
            subscribers.remove(&conn.id);
        }
        self.channels.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Handle a client broadcast frame: deliver locally and publish for
    /// the other instances. Only broadcast and presence channels accept
    /// client publishes.
    pub async fn client_broadcast(
        &self,
        conn: &Arc<ConnectionState>,
        channel_name: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let channel = Channel::parse(channel_name)?;
        if matches!(channel, Channel::Table { .. }) {
            return Err(Error::Forbidden(
                "table channels do not accept broadcasts".into(),
            ));
        }

        let subscribed = conn
            .filters
            .lock()
            .expect("connection filters poisoned")
            .contains_key(channel_name);
        if !subscribed {
            return Err(Error::Forbidden("not subscribed to this channel".into()));
        }

        let envelope = BroadcastEnvelope {
            channel: channel_name.to_string(),
            event: event.to_string(),
            payload,
            origin: self.instance_id,
        };

        self.deliver_broadcast(&envelope);
        self.broadcaster.publish(&envelope).await?;
        Ok(())
    }

    /// Deliver a broadcast envelope to local subscribers.
    ///
    /// `remote` envelopes originating from this instance are skipped:
    /// local delivery already happened at publish time.
    pub fn deliver_remote_broadcast(&self, envelope: BroadcastEnvelope) {
        if envelope.origin == self.instance_id {
            return;
        }
        self.deliver_broadcast(&envelope);
    }

    fn deliver_broadcast(&self, envelope: &BroadcastEnvelope) {
        let message = match Channel::parse(&envelope.channel) {
            Ok(Channel::Presence(_)) => ServerMessage::Presence {
                channel: envelope.channel.clone(),
                payload: envelope.payload.clone(),
            },
            _ => ServerMessage::Broadcast {
                channel: envelope.channel.clone(),
                event: envelope.event.clone(),
                payload: envelope.payload.clone(),
            },
        };

        // Collect targets first so no map guard is held while enqueueing
        // (enqueue may evict a slow connection).
        let targets: Vec<Arc<ConnectionState>> = self
            .subscribers_of(&envelope.channel)
            .into_iter()
            .filter_map(|id| self.connections.get(&id).map(|conn| conn.clone()))
            .collect();

        for conn in targets {
            self.enqueue(&conn, message.clone());
        }
    }

    /// Fan a row-change event out to matching subscribers.
    ///
    /// Called by the change listener for every accepted notification.
    pub async fn dispatch_change(&self, event: ChangeEvent) {
        let channel_name = Channel::for_table(&event.schema, &event.table).to_string();

        for id in self.subscribers_of(&channel_name) {
            let Some(conn) = self.connections.get(&id).map(|c| c.clone()) else {
                continue;
            };

            // Client-side filter, on the new record (old for DELETE).
            // Truncated payloads carry no row to evaluate, so a filtered
            // subscription cannot match them; unfiltered ones still do.
            let filter_passes = {
                let filters = conn.filters.lock().expect("connection filters poisoned");
                match filters.get(&channel_name) {
                    Some(Some(filter)) => event
                        .filter_record()
                        .map(|record| filter.matches(record))
                        .unwrap_or(false),
                    Some(None) => true,
                    None => false,
                }
            };
            if !filter_passes {
                continue;
            }

            // RLS re-check under the subscriber's Principal at delivery
            // time, so permissions narrowed since subscribe still hold.
            // Deleted rows cannot be re-queried; their old record already
            // went through the trigger's column policy. Truncated payloads
            // carry no row data to probe (or leak) and are still forwarded:
            // delivery rests on the subscribe-time SELECT check.
            if event.kind != "DELETE" && !event.truncated {
                match self.row_visible(&conn.principal, &event).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "visibility re-check failed, event withheld");
                        continue;
                    }
                }
            }

            self.enqueue(
                &conn,
                ServerMessage::Change {
                    channel: channel_name.clone(),
                    payload: event.clone(),
                },
            );
        }
    }

    /// Ask the database whether the changed row is visible to the
    /// principal under current RLS policies.
    ///
    /// Only called with events that carry a new record; truncated stubs
    /// never reach this probe.
    async fn row_visible(&self, principal: &Principal, event: &ChangeEvent) -> Result<bool> {
        let Some(record) = event.new_record.as_ref() else {
            return Ok(false);
        };

        let pk_columns = self.primary_key_columns(&event.schema, &event.table).await?;
        if pk_columns.is_empty() {
            // Without a key there is nothing safe to probe by
            return Ok(false);
        }

        let mut clauses = Vec::with_capacity(pk_columns.len());
        let mut values = Vec::with_capacity(pk_columns.len());
        for (index, column) in pk_columns.iter().enumerate() {
            let value = match record.get(column) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                Some(serde_json::Value::Bool(b)) => b.to_string(),
                _ => return Ok(false),
            };
            clauses.push(format!(r#""{}"::text = ${}"#, column, index + 1));
            values.push(value);
        }

        let sql = format!(
            r#"SELECT 1 FROM "{}"."{}" WHERE {} LIMIT 1"#,
            event.schema,
            event.table,
            clauses.join(" AND ")
        );

        self.binder
            .run(principal, move |conn| {
                let sql = sql.clone();
                let values = values.clone();
                async move {
                    let mut query = sqlx::query_scalar::<_, i32>(&sql);
                    for value in &values {
                        query = query.bind(value);
                    }
                    let row = query.fetch_optional(conn).await?;
                    Ok(row.is_some())
                }
                .boxed()
            })
            .await
    }

    async fn primary_key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let key = (schema.to_string(), table.to_string());
        if let Some(columns) = self.pk_cache.get(&key) {
            return Ok(columns.clone());
        }

        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT a.attname
            FROM pg_index i
            JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
            WHERE i.indrelid = format('%I.%I', $1::text, $2::text)::regclass
              AND i.indisprimary
            ORDER BY a.attnum
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let columns: Vec<String> = rows.into_iter().map(|(name,)| name).collect();
        self.pk_cache.insert(key, columns.clone());
        Ok(columns)
    }

    /// Columns of the table visible to the principal's role
    async fn accessible_columns(
        &self,
        principal: &Principal,
        schema: &str,
        table: &str,
    ) -> Result<Vec<String>> {
        let schema = schema.to_string();
        let table = table.to_string();

        self.binder
            .run(principal, move |conn| {
                let schema = schema.clone();
                let table = table.clone();
                async move {
                    let rows = sqlx::query_as::<_, (String,)>(
                        "SELECT column_name::text FROM information_schema.columns \
                         WHERE table_schema = $1 AND table_name = $2",
                    )
                    .bind(schema)
                    .bind(table)
                    .fetch_all(conn)
                    .await?;
                    Ok(rows.into_iter().map(|(name,)| name).collect::<Vec<_>>())
                }
                .boxed()
            })
            .await
    }

    fn subscribers_of(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .get(channel)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Non-blocking enqueue with slow-client handling.
    ///
    /// A full queue does not block the dispatcher. If it stays full past
    /// the grace period, the connection is classified as slow: closed with
    /// code 4004 and its subscriptions released.
    fn enqueue(&self, conn: &Arc<ConnectionState>, message: ServerMessage) {
        match conn.sender.try_send(message) {
            Ok(()) => {
                *conn.slow_since.lock().expect("slow marker poisoned") = None;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(conn.id);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let mut slow_since = conn.slow_since.lock().expect("slow marker poisoned");
                match *slow_since {
                    None => *slow_since = Some(Instant::now()),
                    Some(since) if since.elapsed() >= self.slow_grace => {
                        drop(slow_since);
                        tracing::info!(connection = %conn.id, "slow client evicted");
                        let _ = conn.close_tx.try_send(CLOSE_SLOW_CLIENT);
                        self.unregister(conn.id);
                    }
                    Some(_) => {}
                }
            }
        }
    }

    /// Counts for health/metrics
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Test-only subscription that bypasses registry and DB validation
    #[cfg(test)]
    pub(crate) fn subscribe_unchecked(
        &self,
        conn: &Arc<ConnectionState>,
        channel_name: &str,
        filter: Option<RowFilter>,
    ) {
        conn.filters
            .lock()
            .unwrap()
            .insert(channel_name.to_string(), filter);
        self.channels
            .entry(channel_name.to_string())
            .or_default()
            .insert(conn.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::broadcast::LocalBroadcast;
    use chrono::Utc;
    use std::time::Duration;

    fn hub(queue_depth: usize, grace: Duration) -> SubscriptionHub {
        let pool = sqlx::PgPool::connect_lazy("postgres://unused@localhost/unused").unwrap();
        SubscriptionHub::new(
            ScopeBinder::new(pool.clone()),
            RealtimeRegistry::new(pool.clone(), Duration::from_secs(3600)),
            Arc::new(LocalBroadcast),
            pool,
            queue_depth,
            grace,
        )
    }

    fn delete_event(id: i64) -> ChangeEvent {
        ChangeEvent {
            schema: "public".into(),
            table: "tasks".into(),
            kind: "DELETE".into(),
            new_record: None,
            old_record: Some(serde_json::json!({"id": id, "status": "open"})),
            timestamp: Utc::now(),
            truncated: false,
        }
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let hub = hub(8, Duration::from_secs(5));
        let (conn, _rx, _close) = hub.register(Principal::Anonymous { ip: None });
        assert_eq!(hub.connection_count(), 1);

        hub.unregister(conn.id);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_leaves_hub_unchanged() {
        let hub = hub(8, Duration::from_secs(5));
        let (conn, _rx, _close) = hub.register(Principal::Anonymous { ip: None });

        hub.subscribe(&conn, "broadcast:lobby", None).await.unwrap();
        assert_eq!(hub.channel_count(), 1);

        hub.unsubscribe(&conn, "broadcast:lobby");
        assert_eq!(hub.channel_count(), 0);
        assert!(conn.channels().is_empty());
    }

    #[tokio::test]
    async fn test_change_dispatch_respects_filters() {
        let hub = hub(8, Duration::from_secs(5));

        let (matching, mut rx_match, _c1) = hub.register(Principal::Anonymous { ip: None });
        let (filtered, mut rx_filtered, _c2) = hub.register(Principal::Anonymous { ip: None });

        hub.subscribe_unchecked(&matching, "table:public.tasks", None);
        hub.subscribe_unchecked(
            &filtered,
            "table:public.tasks",
            Some(RowFilter::parse("status eq 'closed'").unwrap()),
        );

        hub.dispatch_change(delete_event(7)).await;

        let delivered = rx_match.try_recv().unwrap();
        assert!(matches!(delivered, ServerMessage::Change { .. }));
        assert!(rx_filtered.try_recv().is_err());
    }

    fn truncated_event(kind: &str) -> ChangeEvent {
        ChangeEvent {
            schema: "public".into(),
            table: "tasks".into(),
            kind: kind.into(),
            new_record: None,
            old_record: None,
            timestamp: Utc::now(),
            truncated: true,
        }
    }

    #[tokio::test]
    async fn test_truncated_events_are_still_delivered() {
        let hub = hub(8, Duration::from_secs(5));

        let (unfiltered, mut rx_unfiltered, _c1) = hub.register(Principal::Anonymous { ip: None });
        let (filtered, mut rx_filtered, _c2) = hub.register(Principal::Anonymous { ip: None });

        hub.subscribe_unchecked(&unfiltered, "table:public.tasks", None);
        hub.subscribe_unchecked(
            &filtered,
            "table:public.tasks",
            Some(RowFilter::parse("status eq 'open'").unwrap()),
        );

        for kind in ["INSERT", "UPDATE"] {
            hub.dispatch_change(truncated_event(kind)).await;

            // The oversized payload is forwarded as a stub, not dropped
            match rx_unfiltered.try_recv().unwrap() {
                ServerMessage::Change { payload, .. } => {
                    assert_eq!(payload.kind, kind);
                    assert!(payload.truncated);
                    assert!(payload.new_record.is_none());
                }
                other => panic!("unexpected message: {:?}", other),
            }

            // A row filter has nothing to evaluate against a stub
            assert!(rx_filtered.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_unsubscribed_channels_receive_nothing() {
        let hub = hub(8, Duration::from_secs(5));
        let (conn, mut rx, _close) = hub.register(Principal::Anonymous { ip: None });
        hub.subscribe_unchecked(&conn, "table:public.other", None);

        hub.dispatch_change(delete_event(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_client_evicted_after_grace() {
        let hub = hub(1, Duration::from_millis(20));
        let (conn, _rx, mut close_rx) = hub.register(Principal::Anonymous { ip: None });
        hub.subscribe_unchecked(&conn, "table:public.tasks", None);

        // First event fills the queue (the reader never drains it)
        hub.dispatch_change(delete_event(1)).await;
        // Second marks the connection as saturated
        hub.dispatch_change(delete_event(2)).await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Past the grace period, the next full queue evicts
        hub.dispatch_change(delete_event(3)).await;

        assert_eq!(close_rx.try_recv().unwrap(), CLOSE_SLOW_CLIENT);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_requires_subscription() {
        let hub = hub(8, Duration::from_secs(5));
        let (conn, _rx, _close) = hub.register(Principal::Anonymous { ip: None });

        let result = hub
            .client_broadcast(&conn, "broadcast:lobby", "wave", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(Error::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_other_subscribers() {
        let hub = hub(8, Duration::from_secs(5));
        let (sender, mut sender_rx, _c1) = hub.register(Principal::Anonymous { ip: None });
        let (receiver, mut receiver_rx, _c2) = hub.register(Principal::Anonymous { ip: None });

        hub.subscribe(&sender, "broadcast:lobby", None).await.unwrap();
        hub.subscribe(&receiver, "broadcast:lobby", None).await.unwrap();

        hub.client_broadcast(&sender, "broadcast:lobby", "wave", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        // Both subscribers see it, sender included
        assert!(matches!(
            receiver_rx.try_recv().unwrap(),
            ServerMessage::Broadcast { .. }
        ));
        assert!(sender_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_broadcasts_rejected_on_table_channels() {
        let hub = hub(8, Duration::from_secs(5));
        let (conn, _rx, _close) = hub.register(Principal::Anonymous { ip: None });
        hub.subscribe_unchecked(&conn, "table:public.tasks", None);

        let result = hub
            .client_broadcast(&conn, "table:public.tasks", "evil", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(Error::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_own_remote_echo_is_skipped() {
        let hub = hub(8, Duration::from_secs(5));
        let (conn, mut rx, _close) = hub.register(Principal::Anonymous { ip: None });
        hub.subscribe_unchecked(&conn, "broadcast:lobby", None);

        hub.deliver_remote_broadcast(BroadcastEnvelope {
            channel: "broadcast:lobby".into(),
            event: "wave".into(),
            payload: serde_json::json!({}),
            origin: hub.instance_id(),
        });
        assert!(rx.try_recv().is_err());

        hub.deliver_remote_broadcast(BroadcastEnvelope {
            channel: "broadcast:lobby".into(),
            event: "wave".into(),
            payload: serde_json::json!({}),
            origin: Uuid::new_v4(),
        });
        assert!(rx.try_recv().is_ok());
    }
}
