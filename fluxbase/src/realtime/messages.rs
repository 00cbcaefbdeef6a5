//! WebSocket frame types and channel naming
//!
//! Frames are UTF-8 JSON. Channels follow the convention
//! `table:{schema}.{table}` for database changes, `broadcast:{name}` for
//! application broadcasts and `presence:{name}` for presence sets.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Server close codes
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_FORBIDDEN: u16 = 4003;
pub const CLOSE_SLOW_CLIENT: u16 = 4004;
pub const CLOSE_POLICY: u16 = 4008;

/// A parsed channel name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Table { schema: String, table: String },
    Broadcast(String),
    Presence(String),
}

impl Channel {
    pub fn parse(name: &str) -> Result<Self> {
        if let Some(rest) = name.strip_prefix("table:") {
            let (schema, table) = rest
                .split_once('.')
                .ok_or_else(|| Error::BadRequest("table channel needs schema.table".into()))?;
            if schema.is_empty() || table.is_empty() {
                return Err(Error::BadRequest("table channel needs schema.table".into()));
            }
            return Ok(Self::Table {
                schema: schema.to_string(),
                table: table.to_string(),
            });
        }
        if let Some(rest) = name.strip_prefix("broadcast:") {
            if rest.is_empty() {
                return Err(Error::BadRequest("broadcast channel needs a name".into()));
            }
            return Ok(Self::Broadcast(rest.to_string()));
        }
        if let Some(rest) = name.strip_prefix("presence:") {
            if rest.is_empty() {
                return Err(Error::BadRequest("presence channel needs a name".into()));
            }
            return Ok(Self::Presence(rest.to_string()));
        }
        Err(Error::BadRequest(format!("unknown channel '{}'", name)))
    }

    pub fn for_table(schema: &str, table: &str) -> Self {
        Self::Table {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table { schema, table } => write!(f, "table:{}.{}", schema, table),
            Self::Broadcast(name) => write!(f, "broadcast:{}", name),
            Self::Presence(name) => write!(f, "presence:{}", name),
        }
    }
}

/// Row-change event as emitted by the trigger and NOTIFY
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    /// INSERT, UPDATE or DELETE
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_record: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    /// Set when the payload was cut down to fit the NOTIFY limit
    #[serde(rename = "_truncated", default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl ChangeEvent {
    /// The record a subscriber's filter should see: the new state, or the
    /// old one for deletes.
    pub fn filter_record(&self) -> Option<&serde_json::Value> {
        match self.kind.as_str() {
            "DELETE" => self.old_record.as_ref(),
            _ => self.new_record.as_ref(),
        }
    }
}

/// Client → server frames
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        channel: String,
        #[serde(default)]
        filter: Option<String>,
    },
    Unsubscribe {
        channel: String,
    },
    Broadcast {
        channel: String,
        event: String,
        payload: serde_json::Value,
    },
}

/// Server → client frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Change {
        channel: String,
        payload: ChangeEvent,
    },
    Broadcast {
        channel: String,
        event: String,
        payload: serde_json::Value,
    },
    Presence {
        channel: String,
        payload: serde_json::Value,
    },
    Status {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ServerMessage {
    pub fn status(status: &str, channel: Option<&Channel>, reason: Option<String>) -> Self {
        Self::Status {
            status: status.to_string(),
            channel: channel.map(|c| c.to_string()),
            reason,
        }
    }
}

/// Cross-instance broadcast envelope (second NOTIFY channel / Redis)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub channel: String,
    pub event: String,
    pub payload: serde_json::Value,
    /// Originating instance, so the sender can skip its own echo
    pub origin: uuid::Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parsing() {
        assert_eq!(
            Channel::parse("table:public.tasks").unwrap(),
            Channel::for_table("public", "tasks")
        );
        assert_eq!(
            Channel::parse("broadcast:lobby").unwrap(),
            Channel::Broadcast("lobby".into())
        );
        assert_eq!(
            Channel::parse("presence:room-1").unwrap(),
            Channel::Presence("room-1".into())
        );

        assert!(Channel::parse("table:notasplit").is_err());
        assert!(Channel::parse("table:.x").is_err());
        assert!(Channel::parse("broadcast:").is_err());
        assert!(Channel::parse("mystery:thing").is_err());
    }

    #[test]
    fn test_channel_display_roundtrip() {
        for name in ["table:public.tasks", "broadcast:lobby", "presence:room-1"] {
            assert_eq!(Channel::parse(name).unwrap().to_string(), name);
        }
    }

    #[test]
    fn test_client_message_decoding() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "subscribe", "channel": "table:public.tasks", "filter": "status eq 'open'"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Subscribe { channel, filter } => {
                assert_eq!(channel, "table:public.tasks");
                assert_eq!(filter.as_deref(), Some("status eq 'open'"));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "dance"}"#).is_err());
    }

    #[test]
    fn test_change_event_decoding() {
        let event: ChangeEvent = serde_json::from_str(
            r#"{"schema": "public", "table": "tasks", "type": "INSERT",
                "new_record": {"id": 1}, "timestamp": "2026-03-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(event.kind, "INSERT");
        assert!(!event.truncated);
        assert_eq!(event.filter_record().unwrap()["id"], 1);
    }

    #[test]
    fn test_truncated_flag_roundtrip() {
        let event: ChangeEvent = serde_json::from_str(
            r#"{"schema": "public", "table": "tasks", "type": "UPDATE",
                "timestamp": "2026-03-01T12:00:00Z", "_truncated": true}"#,
        )
        .unwrap();
        assert!(event.truncated);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"_truncated\":true"));
    }

    #[test]
    fn test_delete_filters_on_old_record() {
        let event = ChangeEvent {
            schema: "public".into(),
            table: "tasks".into(),
            kind: "DELETE".into(),
            new_record: None,
            old_record: Some(serde_json::json!({"id": 7})),
            timestamp: Utc::now(),
            truncated: false,
        };
        assert_eq!(event.filter_record().unwrap()["id"], 7);
    }

    #[test]
    fn test_server_message_wire_shape() {
        let json = serde_json::to_string(&ServerMessage::status("subscribed", None, None)).unwrap();
        assert!(json.contains("\"type\":\"status\""));
        assert!(!json.contains("reason"));
    }
}
