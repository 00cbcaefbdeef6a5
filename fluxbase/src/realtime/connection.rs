//! WebSocket connection state

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::filter::RowFilter;
use super::messages::ServerMessage;
use crate::principal::Principal;

/// Unique identifier for a WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hub-side state for one connection
///
/// The Principal is captured at handshake time and bound for the life of
/// the socket; per-event authorization re-checks use it. Outbound frames
/// go through a bounded queue, the writer task drains it, and a close
/// signal carries the WebSocket close code when the hub ejects the
/// connection.
pub struct ConnectionState {
    pub id: ConnectionId,
    pub principal: Principal,
    pub(super) sender: mpsc::Sender<ServerMessage>,
    pub(super) close_tx: mpsc::Sender<u16>,
    /// Active channel name → optional row filter
    pub(super) filters: Mutex<HashMap<String, Option<RowFilter>>>,
    /// Set while the send queue has been continuously full
    pub(super) slow_since: Mutex<Option<Instant>>,
}

impl ConnectionState {
    pub(super) fn new(
        principal: Principal,
        sender: mpsc::Sender<ServerMessage>,
        close_tx: mpsc::Sender<u16>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            principal,
            sender,
            close_tx,
            filters: Mutex::new(HashMap::new()),
            slow_since: Mutex::new(None),
        }
    }

    /// Queue a frame for this connection, waiting for space.
    ///
    /// Handler-originated frames (status replies) use this; the hub's
    /// fan-out path uses non-blocking enqueue with slow-client handling
    /// instead.
    pub async fn send(
        &self,
        message: ServerMessage,
    ) -> Result<(), mpsc::error::SendError<ServerMessage>> {
        self.sender.send(message).await
    }

    /// Channels this connection is subscribed to
    pub fn channels(&self) -> Vec<String> {
        self.filters
            .lock()
            .expect("connection filters poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_uniqueness() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_connection_state_starts_empty() {
        let (tx, _rx) = mpsc::channel(8);
        let (close_tx, _close_rx) = mpsc::channel(1);
        let state = ConnectionState::new(Principal::Anonymous { ip: None }, tx, close_tx);
        assert!(state.channels().is_empty());
    }
}
