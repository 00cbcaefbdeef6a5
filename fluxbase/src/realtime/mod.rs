//! Realtime change-feed
//!
//! Row changes in registered tables flow: trigger → pg_notify → the one
//! LISTEN task → the subscription hub → matching WebSocket subscribers,
//! with the client's row filter evaluated in process and row visibility
//! re-validated under the subscriber's Principal at delivery time.

pub mod broadcast;
pub mod connection;
pub mod filter;
pub mod hub;
pub mod listener;
pub mod messages;
pub mod registry;

pub use broadcast::{BroadcastBackend, LocalBroadcast, PgBroadcast, RedisBroadcast};
pub use connection::{ConnectionId, ConnectionState};
pub use filter::RowFilter;
pub use hub::SubscriptionHub;
pub use listener::{spawn_listener, ListenerConfig, ADMIN_CHANNEL};
pub use messages::{
    BroadcastEnvelope, Channel, ChangeEvent, ClientMessage, ServerMessage, CLOSE_FORBIDDEN,
    CLOSE_POLICY, CLOSE_SLOW_CLIENT, CLOSE_UNAUTHORIZED,
};
pub use registry::{RealtimeRegistry, TablePolicy};
